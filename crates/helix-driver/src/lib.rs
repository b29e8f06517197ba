//! # Helix Driver
//!
//! 驱动层：在共享串口传输之上提供逐电机的逻辑会话、多电机同步派发
//! 与回零控制。
//!
//! ## 模块
//!
//! - `session`: 电机会话 [`MotorSession`] 与运行时状态机
//! - `sync`: 同步组 [`SyncGroup`]（一帧聚合派发，N 台电机同瞬间启动）
//! - `homing`: 回零控制器 [`HomingController`] 状态机
//! - `calibration`: 关节标定系数（减速比 + 方向符号）与 TOML 配置
//! - `params`: 驱动参数扩展（按驱动板类型的参数 schema 校验）
//! - `error`: 驱动层错误分类
//!
//! ## 安全策略
//!
//! 本层刻意**不提供**"停止并断电"的一键操作：对没有机械抱闸的
//! 关节，失能会移除对抗重力的唯一力矩。[`MotorSession::stop`]
//! （停止运动、保持力矩）与 [`MotorSession::disconnect`]（释放通信
//! 资源、保持力矩）是正常与异常终止的两条路径；
//! [`MotorSession::disable`]（断电）必须由调用方显式调用，任何其他
//! 操作——包括错误路径与 Drop——都不会隐式触发它。

pub mod calibration;
pub mod error;
pub mod homing;
pub mod params;
pub mod session;
pub mod sync;

pub use calibration::{ArmConfig, JointCalibration};
pub use error::DriverError;
pub use homing::{HomingController, HomingFailure, HomingState};
pub use params::{ExtensionParams, ParamSchema};
pub use session::{MotorReadings, MotorSession, MotorState, MotorWatch};
pub use sync::{MotionProfile, SyncGroup, SyncOutcome};

// 常用上游类型，调用方无需直接依赖底层 crate
pub use helix_protocol::{DeviceFault, DriveParameters, HomingMode, MotorStatusFlags, VersionInfo};
pub use helix_serial::{SerialError, Transport};
