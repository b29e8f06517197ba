//! # Helix IO
//!
//! 数字量外设（独立嵌入式控制器）的主机侧客户端。
//!
//! 外设走一条独立串口，协议是行式 ASCII 命令/响应：每条命令恰好
//! 换来一行响应，畸形命令得到统一的 `ERR?` 行而不是结构化错误。
//! 脉冲输出由外设固件在每个轮询周期对单调时钟做检查来计时（不是
//! 硬件定时器），因此脉冲时长精度受固件轮询间隔限制。
//!
//! | 命令 | 响应 |
//! |---|---|
//! | `PING` | `PONG` |
//! | `VER?` | `VER <版本>` |
//! | `DI?` | `DI <8 位比特串，引脚 0 在前>` |
//! | `DO?` | `DO <8 位比特串>` |
//! | `DO <pin> <0\|1>` | `OK` |
//! | `DOALL <比特串>` | `OK` |
//! | `PULSE <pin> <ms>` | `OK` |
//! | `INT <pin> <RISING\|FALLING\|BOTH\|LOW\|HIGH\|NONE>` | `OK` |
//! | `INT?` | `INT <8 位标志串>` |
//! | `INTCLR <pin>` / `INTCLR ALL` | `OK` |

use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

#[cfg(feature = "serialport-backend")]
mod serial_line;

#[cfg(feature = "serialport-backend")]
pub use serial_line::UsbLineTransport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// 输入引脚数
pub const DI_COUNT: usize = 8;

/// 输出引脚数
pub const DO_COUNT: usize = 8;

/// IO 外设客户端错误
#[derive(Error, Debug)]
pub enum IoError {
    /// 串口无法打开
    #[error("IO peripheral unavailable: {port}: {reason}")]
    Unavailable { port: String, reason: String },

    /// 超时窗口内没有收到响应行
    #[error("IO peripheral timed out")]
    Timeout,

    /// 外设回了统一的"不认识"行（`ERR?`）
    #[error("Peripheral did not recognize command `{command}`")]
    Unrecognized { command: String },

    /// 响应行的格式与命令不匹配
    #[error("Malformed response `{response}` to command `{command}`")]
    MalformedResponse { command: String, response: String },

    /// 引脚号越界
    #[error("Pin {pin} out of range (0-{max})")]
    InvalidPin { pin: u8, max: u8 },

    /// 底层 I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 行传输抽象：写一行命令，读一行响应
pub trait LineTransport: Send {
    /// 发送一条命令行（不含换行符），返回响应行（已去换行）
    fn send_line(&mut self, line: &str) -> Result<String, IoError>;
}

/// 输入中断触发模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// 上升沿
    Rising,
    /// 下降沿
    Falling,
    /// 双沿
    Both,
    /// 低电平
    LevelLow,
    /// 高电平
    LevelHigh,
    /// 关闭
    Disabled,
}

impl fmt::Display for InterruptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterruptMode::Rising => "RISING",
            InterruptMode::Falling => "FALLING",
            InterruptMode::Both => "BOTH",
            InterruptMode::LevelLow => "LOW",
            InterruptMode::LevelHigh => "HIGH",
            InterruptMode::Disabled => "NONE",
        };
        f.write_str(s)
    }
}

/// IO 外设客户端
pub struct IoController {
    transport: Box<dyn LineTransport>,
}

impl IoController {
    /// 创建客户端
    pub fn new(transport: Box<dyn LineTransport>) -> Self {
        Self { transport }
    }

    /// 连通性探测
    pub fn probe(&mut self) -> Result<(), IoError> {
        let resp = self.command("PING")?;
        if resp == "PONG" {
            Ok(())
        } else {
            Err(malformed("PING", resp))
        }
    }

    /// 固件版本
    pub fn firmware_version(&mut self) -> Result<String, IoError> {
        let resp = self.command("VER?")?;
        match resp.strip_prefix("VER ") {
            Some(ver) if !ver.is_empty() => Ok(ver.to_string()),
            _ => Err(malformed("VER?", resp)),
        }
    }

    /// 批量读取全部输入（引脚 0 在前）
    pub fn read_inputs(&mut self) -> Result<[bool; DI_COUNT], IoError> {
        let resp = self.command("DI?")?;
        match resp.strip_prefix("DI ") {
            Some(bits) => parse_bits("DI?", &resp, bits),
            None => Err(malformed("DI?", resp)),
        }
    }

    /// 批量读取全部输出状态
    pub fn read_outputs(&mut self) -> Result<[bool; DO_COUNT], IoError> {
        let resp = self.command("DO?")?;
        match resp.strip_prefix("DO ") {
            Some(bits) => parse_bits("DO?", &resp, bits),
            None => Err(malformed("DO?", resp)),
        }
    }

    /// 写单个输出
    pub fn set_output(&mut self, pin: u8, state: bool) -> Result<(), IoError> {
        check_pin(pin, DO_COUNT)?;
        let cmd = format!("DO {} {}", pin, state as u8);
        self.expect_ok(&cmd)
    }

    /// 批量写全部输出
    pub fn set_outputs(&mut self, states: [bool; DO_COUNT]) -> Result<(), IoError> {
        let cmd = format!("DOALL {}", format_bits(&states));
        self.expect_ok(&cmd)
    }

    /// 定时脉冲输出
    ///
    /// 外设按轮询周期检查单调时钟来结束脉冲，实际脉宽误差以固件的
    /// 轮询间隔为界。
    pub fn pulse_output(&mut self, pin: u8, duration_ms: u32) -> Result<(), IoError> {
        check_pin(pin, DO_COUNT)?;
        let cmd = format!("PULSE {pin} {duration_ms}");
        self.expect_ok(&cmd)
    }

    /// 配置某输入引脚的中断触发模式（沿/电平，软件轮询式）
    pub fn configure_interrupt(&mut self, pin: u8, mode: InterruptMode) -> Result<(), IoError> {
        check_pin(pin, DI_COUNT)?;
        let cmd = format!("INT {pin} {mode}");
        self.expect_ok(&cmd)
    }

    /// 读取中断标志（引脚 0 在前）
    pub fn read_interrupt_flags(&mut self) -> Result<[bool; DI_COUNT], IoError> {
        let resp = self.command("INT?")?;
        match resp.strip_prefix("INT ") {
            Some(bits) => parse_bits("INT?", &resp, bits),
            None => Err(malformed("INT?", resp)),
        }
    }

    /// 清除单个引脚的中断标志
    pub fn clear_interrupt(&mut self, pin: u8) -> Result<(), IoError> {
        check_pin(pin, DI_COUNT)?;
        let cmd = format!("INTCLR {pin}");
        self.expect_ok(&cmd)
    }

    /// 清除全部中断标志
    pub fn clear_all_interrupts(&mut self) -> Result<(), IoError> {
        self.expect_ok("INTCLR ALL")
    }

    fn command(&mut self, line: &str) -> Result<String, IoError> {
        trace!(command = line, "io tx");
        let resp = self.transport.send_line(line)?;
        trace!(response = %resp, "io rx");
        if resp == "ERR?" {
            debug!(command = line, "peripheral did not recognize command");
            return Err(IoError::Unrecognized {
                command: line.to_string(),
            });
        }
        Ok(resp)
    }

    fn expect_ok(&mut self, line: &str) -> Result<(), IoError> {
        let resp = self.command(line)?;
        if resp == "OK" {
            Ok(())
        } else {
            Err(malformed(line, resp))
        }
    }
}

fn check_pin(pin: u8, count: usize) -> Result<(), IoError> {
    if (pin as usize) < count {
        Ok(())
    } else {
        Err(IoError::InvalidPin {
            pin,
            max: count as u8 - 1,
        })
    }
}

fn malformed(command: &str, response: String) -> IoError {
    IoError::MalformedResponse {
        command: command.to_string(),
        response,
    }
}

fn parse_bits<const N: usize>(
    command: &str,
    full_response: &str,
    bits: &str,
) -> Result<[bool; N], IoError> {
    let bytes = bits.as_bytes();
    if bytes.len() != N || !bytes.iter().all(|b| *b == b'0' || *b == b'1') {
        return Err(malformed(command, full_response.to_string()));
    }
    let mut out = [false; N];
    for (i, b) in bytes.iter().enumerate() {
        out[i] = *b == b'1';
    }
    Ok(out)
}

fn format_bits(states: &[bool]) -> String {
    states.iter().map(|&s| if s { '1' } else { '0' }).collect()
}
