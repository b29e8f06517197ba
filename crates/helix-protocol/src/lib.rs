//! # Helix Protocol
//!
//! 网关命令协议定义（无硬件依赖）
//!
//! 机械臂的每个关节是一块独立的闭环步进驱动板，所有驱动板挂在同一条
//! 专有现场总线上，主机只能通过串口网关与它们通信。本 crate 只定义
//! **主机侧契约**：请求/响应帧格式、TLV 载荷、操作码、驱动板原生参数
//! 编码以及多电机聚合帧。网关内部的现场总线编码对主机不可见，不在
//! 本层范围内。
//!
//! ## 模块
//!
//! - `crc`: CRC-16/IBM 校验
//! - `frame`: 请求/响应帧的构建与增量解码
//! - `opcodes`: 操作码与网关状态码
//! - `status`: 电机状态标志位域与设备故障分类
//! - `command`: 驱动板原生参数编码与读数解析
//! - `aggregate`: 多电机聚合（同步组）帧构建
//!
//! ## 字节序
//!
//! 网关帧头与 TLV 使用小端序；驱动板原生子命令（聚合帧内部）使用
//! 大端序，这是驱动板固件的既有约定。

pub mod aggregate;
pub mod command;
pub mod crc;
pub mod frame;
pub mod opcodes;
pub mod status;

pub use aggregate::*;
pub use command::*;
pub use frame::*;
pub use opcodes::*;
pub use status::*;

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// 帧校验失败（CRC 不匹配）
    #[error("Frame corrupt: CRC mismatch (expected 0x{expected:04X}, got 0x{actual:04X})")]
    FrameCorrupt { expected: u16, actual: u16 },

    /// 响应与未决请求不匹配（类型、序号或电机 ID 回显错误）
    #[error("Unexpected responder: {reason}")]
    UnexpectedResponder { reason: String },

    /// 数据长度不足
    #[error("Invalid payload length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// 字段取值非法
    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u32 },

    /// 参数超出协议可表示范围
    #[error("Value out of range for {field}: {value}")]
    OutOfRange { field: String, value: f64 },
}
