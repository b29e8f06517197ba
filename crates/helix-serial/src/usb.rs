//! 基于 `serialport` crate 的真实串口后端
//!
//! 网关通常以 USB CDC 虚拟串口或 UART 形式出现。为兼容两类端口，
//! 打开时显式设置全部串口参数（8-N-1，禁用软硬件流控）。

use crate::{SerialAdapter, SerialError};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// USB CDC / UART 串口适配器
pub struct UsbSerialAdapter {
    port: Box<dyn SerialPort>,
}

impl UsbSerialAdapter {
    /// 打开串口
    ///
    /// 端口被占用、设备不存在或权限不足时返回
    /// [`SerialError::Unavailable`]。
    pub fn open(port_name: &str, baud: u32) -> Result<Self, SerialError> {
        let port = serialport::new(port_name, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(20))
            .open()
            .map_err(|e| SerialError::Unavailable {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(port = port_name, baud, "serial port opened");
        Ok(Self { port })
    }

    /// 列出系统可用串口名
    pub fn list_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }
}

impl SerialAdapter for UsbSerialAdapter {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        self.port.set_timeout(timeout).map_err(|e| SerialError::Io(e.into()))?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(SerialError::Io(e)),
        }
    }

    fn clear_input(&mut self) -> Result<(), SerialError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| SerialError::Io(e.into()))
    }
}
