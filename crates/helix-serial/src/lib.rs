//! # Helix Serial Transport
//!
//! 串口传输层：一条物理串口连接由多个电机会话共享，本层保证任意
//! 时刻线上只有一个未决的请求/响应循环。交错的帧在共享串口上与
//! 数据损坏无法区分，严格串行化是整条安全链路的根基。
//!
//! ## 模块
//!
//! - `transport`: 引用计数的共享 [`Transport`] 与独占 `exchange()` 循环
//! - `usb`: 基于 `serialport` crate 的真实后端（feature `serialport-backend`）
//! - `mock`: 协议感知的虚拟驱动板仿真（feature `mock`，测试用）

use std::time::Duration;
use thiserror::Error;

pub mod transport;

#[cfg(feature = "serialport-backend")]
pub mod usb;

#[cfg(feature = "serialport-backend")]
pub use usb::UsbSerialAdapter;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use transport::Transport;

use helix_protocol::ProtocolError;

/// 传输层错误类型
#[derive(Error, Debug)]
pub enum SerialError {
    /// 串口无法打开（被占用、设备不存在、权限不足）
    #[error("Transport unavailable: {port}: {reason}")]
    Unavailable { port: String, reason: String },

    /// 超时窗口内未收到完整响应帧
    ///
    /// 永远由调用方决定是否重试：运动类命令自动重试可能造成位移
    /// 重复施加，核心层绝不自动重发。
    #[error("Communication timeout after {0:?}")]
    Timeout(Duration),

    /// 句柄引用计数已归零后仍被调用
    #[error("Transport closed")]
    Closed,

    /// 协议完整性错误（CRC 不匹配、响应方不符）
    ///
    /// 对单次交换致命，对会话不致命。
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 底层 I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 串口适配器抽象
///
/// 一个适配器独占一条 OS 级串口；共享与互斥由上层 [`Transport`]
/// 负责，适配器本身只做字节搬运。
pub trait SerialAdapter: Send {
    /// 写出全部字节
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError>;

    /// 读取可用字节
    ///
    /// 最多阻塞 `timeout`，返回实际读到的字节数；窗口内无数据返回 0，
    /// 不视为错误（完整帧的超时判定在 [`Transport`] 的交换循环里）。
    fn read_available(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError>;

    /// 丢弃输入缓冲区的残留字节
    ///
    /// 每次交换开始前调用：历史噪声或半包会让解码器长时间在垃圾里
    /// 找帧头，表现为整条链路周期性卡顿。
    fn clear_input(&mut self) -> Result<(), SerialError>;
}
