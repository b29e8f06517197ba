//! IO 外设仿真（测试用）
//!
//! 按行协议逐条解析命令并维护引脚状态。真实外设的脉冲由固件轮询
//! 周期结束；这里用显式的 [`MockIoBoard::finish_pulses`] 模拟一个
//! 轮询周期的到来。

use crate::{DI_COUNT, DO_COUNT, IoError, LineTransport};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinInterrupt {
    None,
    Rising,
    Falling,
    Both,
    LevelLow,
    LevelHigh,
}

struct BoardState {
    di: [bool; DI_COUNT],
    dout: [bool; DO_COUNT],
    int_modes: [PinInterrupt; DI_COUNT],
    int_flags: [bool; DI_COUNT],
    pulsing: [bool; DO_COUNT],
    command_log: Vec<String>,
}

/// 虚拟 IO 板
#[derive(Clone)]
pub struct MockIoBoard {
    state: Arc<Mutex<BoardState>>,
}

impl Default for MockIoBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIoBoard {
    /// 创建虚拟板（全部引脚低电平）
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                di: [false; DI_COUNT],
                dout: [false; DO_COUNT],
                int_modes: [PinInterrupt::None; DI_COUNT],
                int_flags: [false; DI_COUNT],
                pulsing: [false; DO_COUNT],
                command_log: Vec::new(),
            })),
        }
    }

    /// 取一个挂在本板上的行传输
    pub fn transport(&self) -> MockLineTransport {
        MockLineTransport {
            state: self.state.clone(),
        }
    }

    /// 驱动输入引脚电平（沿/电平检测在此发生）
    pub fn set_input(&self, pin: usize, level: bool) {
        let mut s = self.state.lock().expect("mock board lock");
        let prev = s.di[pin];
        s.di[pin] = level;
        let triggered = match s.int_modes[pin] {
            PinInterrupt::None => false,
            PinInterrupt::Rising => !prev && level,
            PinInterrupt::Falling => prev && !level,
            PinInterrupt::Both => prev != level,
            PinInterrupt::LevelLow => !level,
            PinInterrupt::LevelHigh => level,
        };
        if triggered {
            s.int_flags[pin] = true;
        }
    }

    /// 模拟固件轮询周期到来：所有进行中的脉冲结束
    pub fn finish_pulses(&self) {
        let mut s = self.state.lock().expect("mock board lock");
        for pin in 0..DO_COUNT {
            if s.pulsing[pin] {
                s.pulsing[pin] = false;
                s.dout[pin] = false;
            }
        }
    }

    /// 已收到的命令行
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().expect("mock board lock").command_log.clone()
    }
}

/// 虚拟板的行传输端
pub struct MockLineTransport {
    state: Arc<Mutex<BoardState>>,
}

impl LineTransport for MockLineTransport {
    fn send_line(&mut self, line: &str) -> Result<String, IoError> {
        let mut s = self.state.lock().expect("mock board lock");
        s.command_log.push(line.to_string());
        Ok(execute(&mut s, line))
    }
}

fn execute(s: &mut BoardState, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return "ERR?".to_string();
    };

    match verb {
        "PING" => "PONG".to_string(),
        "VER?" => "VER 1.4.2".to_string(),
        "DI?" => format!("DI {}", bits(&s.di)),
        "DO?" => format!("DO {}", bits(&s.dout)),
        "DO" => {
            let (Some(pin), Some(val)) = (parse_pin(parts.next(), DO_COUNT), parts.next()) else {
                return "ERR?".to_string();
            };
            match val {
                "0" => s.dout[pin] = false,
                "1" => s.dout[pin] = true,
                _ => return "ERR?".to_string(),
            }
            s.pulsing[pin] = false;
            "OK".to_string()
        }
        "DOALL" => {
            let Some(pattern) = parts.next() else {
                return "ERR?".to_string();
            };
            let bytes = pattern.as_bytes();
            if bytes.len() != DO_COUNT || !bytes.iter().all(|b| *b == b'0' || *b == b'1') {
                return "ERR?".to_string();
            }
            for (pin, b) in bytes.iter().enumerate() {
                s.dout[pin] = *b == b'1';
                s.pulsing[pin] = false;
            }
            "OK".to_string()
        }
        "PULSE" => {
            let (Some(pin), Some(ms)) = (parse_pin(parts.next(), DO_COUNT), parts.next()) else {
                return "ERR?".to_string();
            };
            if ms.parse::<u32>().is_err() {
                return "ERR?".to_string();
            }
            s.dout[pin] = true;
            s.pulsing[pin] = true;
            "OK".to_string()
        }
        "INT" => {
            let (Some(pin), Some(mode)) = (parse_pin(parts.next(), DI_COUNT), parts.next()) else {
                return "ERR?".to_string();
            };
            s.int_modes[pin] = match mode {
                "RISING" => PinInterrupt::Rising,
                "FALLING" => PinInterrupt::Falling,
                "BOTH" => PinInterrupt::Both,
                "LOW" => PinInterrupt::LevelLow,
                "HIGH" => PinInterrupt::LevelHigh,
                "NONE" => PinInterrupt::None,
                _ => return "ERR?".to_string(),
            };
            "OK".to_string()
        }
        "INT?" => format!("INT {}", bits(&s.int_flags)),
        "INTCLR" => match parts.next() {
            Some("ALL") => {
                s.int_flags = [false; DI_COUNT];
                "OK".to_string()
            }
            other => {
                let Some(pin) = parse_pin(other, DI_COUNT) else {
                    return "ERR?".to_string();
                };
                s.int_flags[pin] = false;
                "OK".to_string()
            }
        },
        _ => "ERR?".to_string(),
    }
}

fn parse_pin(token: Option<&str>, count: usize) -> Option<usize> {
    token?.parse::<usize>().ok().filter(|p| *p < count)
}

fn bits(states: &[bool]) -> String {
    states.iter().map(|&b| if b { '1' } else { '0' }).collect()
}
