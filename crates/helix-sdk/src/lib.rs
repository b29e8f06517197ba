//! Helix SDK - 多关节机械臂步进驱动控制 SDK
//!
//! 机械臂的每个关节是一块独立的闭环步进驱动板，全部挂在同一条专有
//! 现场总线上，主机通过串口网关与它们通信。本 SDK 是主机侧的控制
//! 核心：共享传输的命令/响应协议、逐电机会话状态、回零状态机，以及
//! 让多台独立驱动板同瞬间启动的聚合同步派发。
//!
//! # 架构设计
//!
//! 分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): 网关帧编解码、操作码、聚合帧（无 I/O）
//! - **传输层** (`serial`): 共享串口与独占 exchange 循环
//! - **驱动层** (`driver`): 电机会话、同步组、回零控制、标定
//! - **IO 外设** (`io`): 数字量外设的行式 ASCII 客户端（独立串口）
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use helix_sdk::{MotorSession, SyncGroup, MotionProfile, Transport, UsbSerialAdapter};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = UsbSerialAdapter::open("/dev/ttyUSB0", 115200)?;
//!     let transport = Transport::open("/dev/ttyUSB0", 115200, Box::new(adapter));
//!
//!     let mut j1 = MotorSession::connect(&transport, 1)?;
//!     let mut j2 = MotorSession::connect(&transport, 2)?;
//!     j1.enable()?;
//!     j2.enable()?;
//!
//!     // 两个关节同瞬间启动
//!     SyncGroup::position(MotionProfile { speed_rpm: 500.0, ..Default::default() })
//!         .push(&mut j1, 90.0)
//!         .push(&mut j2, -45.0)
//!         .dispatch()?;
//!
//!     j1.wait_for_in_position(Duration::from_secs(10), Duration::from_millis(100))?;
//!     // 停住（保持力矩）——注意 stop 与 disable 是两种截然不同的操作
//!     j1.stop()?;
//!     j2.stop()?;
//!     Ok(())
//! }
//! ```

// 内部模块结构（按层划分）
pub use helix_driver as driver;
pub use helix_io as io;
pub use helix_protocol as protocol;
pub use helix_serial as serial;

// --- 用户以此为界：Facade 导出 ---

// 协议层常用类型
pub use helix_protocol::{
    DeviceFault, DriveParameters, GatewayStatus, HomingMode, MotorStatusFlags, ProtocolError,
    VersionInfo,
};

// 传输层
pub use helix_serial::{SerialAdapter, SerialError, Transport};

#[cfg(feature = "serialport-backend")]
pub use helix_serial::UsbSerialAdapter;

// 驱动层（推荐入口）
pub use helix_driver::{
    ArmConfig, DriverError, ExtensionParams, HomingController, HomingFailure, HomingState,
    JointCalibration, MotionProfile, MotorReadings, MotorSession, MotorState, MotorWatch,
    SyncGroup, SyncOutcome,
};

// IO 外设
pub use helix_io::{InterruptMode, IoController, IoError, LineTransport};

/// 初始化日志（tracing + env-filter，并桥接 `log` 宏）
///
/// 可选调用；宿主程序已有自己的 subscriber 时不要调用。重复调用
/// 返回 `Err`，忽略即可。
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
