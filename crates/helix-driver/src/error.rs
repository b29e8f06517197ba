//! 驱动层错误分类
//!
//! 四类相互正交的失败：
//! - 协议层（超时、坏帧、响应方不符）——包在 [`SerialError`] 里；
//! - 前置条件（地址冲突、编码器未就绪、同步组校验）——尽可能在
//!   任何线上 I/O 之前报告；
//! - 设备上报（堵转、堵转保护、位置误差、回零失败）——既作为错误
//!   返回，也持久化在会话状态里供独立轮询方观测；
//! - 传输生命周期（端口不可用、已关闭）——同样包在 [`SerialError`]。
//!
//! 核心层从不对影响运动的命令做自动重试：超时后重发一条位移命令
//! 可能让位移被施加两次。

use crate::session::MotorState;
use helix_protocol::{DeviceFault, GatewayStatus, ProtocolError};
use helix_serial::SerialError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 传输层错误（超时、坏帧、端口不可用/已关闭）
    #[error("Transport error: {0}")]
    Transport(#[from] SerialError),

    /// 协议编解码错误（数据解析阶段）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 同一传输上的单播地址冲突
    #[error("Duplicate address {addr} on port {port}")]
    DuplicateAddress { addr: u8, port: String },

    /// 编码器尚未完成上电自校准，无法回零
    #[error("Encoder not ready on motor {addr}")]
    EncoderNotReady { addr: u8 },

    /// 同步组校验失败或聚合派发失败
    ///
    /// 派发失败时所有成员的会话状态都不会推进；但广播部分是否已被
    /// 部分电机物理接收，主机侧无法区分（见 `SyncGroup::dispatch_verified`
    /// 的补救轮询）。
    #[error("Sync dispatch failed: {reason}")]
    SyncDispatchFailed { reason: String },

    /// 设备上报故障
    #[error("Device fault on motor {addr}: {fault}")]
    Device { addr: u8, fault: DeviceFault },

    /// 设备瞬态忙（高频下发时常见，下一周期重发即可）
    #[error("Motor {addr} busy (transient)")]
    DeviceBusy { addr: u8 },

    /// 网关拒绝请求
    #[error("Gateway rejected request for motor {addr}: {status:?} (err=0x{err_code:04X})")]
    Gateway {
        addr: u8,
        status: GatewayStatus,
        err_code: u16,
    },

    /// 操作与当前会话状态不兼容
    #[error("Operation `{op}` not allowed in state {state}")]
    InvalidState { op: &'static str, state: MotorState },

    /// 参数校验失败
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// 配置错误（标定文件等）
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// 是否为调用方可安全重试的错误
    ///
    /// 只有通信超时与设备瞬态忙可重试；运动命令是否重试由调用方
    /// 自行判断（重试可能重复施加位移）。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Transport(SerialError::Timeout(_)) | DriverError::DeviceBusy { .. }
        )
    }
}
