//! 基于 `serialport` crate 的行传输

use crate::{IoError, LineTransport};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

/// 真实串口上的行传输
///
/// 命令以 `\n` 结尾写出；响应读到 `\n` 为止（忽略 `\r`）。
pub struct UsbLineTransport {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl UsbLineTransport {
    /// 打开外设串口
    pub fn open(port_name: &str, baud: u32, timeout: Duration) -> Result<Self, IoError> {
        let port = serialport::new(port_name, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(20))
            .open()
            .map_err(|e| IoError::Unavailable {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(port = port_name, baud, "io peripheral port opened");
        Ok(Self { port, timeout })
    }
}

impl LineTransport for UsbLineTransport {
    fn send_line(&mut self, line: &str) -> Result<String, IoError> {
        self.port.clear(serialport::ClearBuffer::Input).map_err(|e| IoError::Io(e.into()))?;
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;

        let deadline = Instant::now() + self.timeout;
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if Instant::now() >= deadline {
                return Err(IoError::Timeout);
            }
            match self.port.read(&mut byte) {
                Ok(1) => match byte[0] {
                    b'\n' => {
                        return Ok(String::from_utf8_lossy(&response).trim_end_matches('\r').to_string());
                    }
                    b => response.push(b),
                },
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(IoError::Io(e)),
            }
        }
    }
}
