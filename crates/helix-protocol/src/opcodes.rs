//! 操作码与网关状态码定义
//!
//! 所有操作码与网关固件对齐。

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 网关操作码
///
/// 分段约定：
/// - 0x01-0x0F 基础控制
/// - 0x10-0x1F 运动控制
/// - 0x2F-0x3F 版本 / 参数 / 聚合
/// - 0x40-0x5F 回零与维护
/// - 0x60-0x6F 标准化读取（小端 float32/uint32）
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// 电机使能/失能
    Enable = 0x01,
    /// 电机停止（保持力矩）
    Stop = 0x02,

    /// 速度模式
    SpeedMode = 0x10,
    /// 力矩/电流模式
    TorqueMode = 0x11,
    /// 位置直通模式（限速位置）
    PositionDirect = 0x12,
    /// 位置梯形曲线模式
    PositionTrapezoid = 0x13,

    /// 读取版本信息（固件/硬件，大端 u16 x2）
    ReadVersion = 0x2F,
    /// 多电机聚合命令（同步启动）
    AggregateMotion = 0x30,
    /// 读取驱动参数块
    ReadDriveParameters = 0x38,

    /// 设置当前位置为零点
    SetZeroPosition = 0x40,
    /// 触发回零
    TriggerHoming = 0x41,
    /// 强制停止回零
    ForceStopHoming = 0x42,
    /// 清零位置计数
    ClearPosition = 0x44,
    /// 解除堵转保护
    ReleaseStallProtection = 0x45,
    /// 修改驱动参数块
    ModifyDriveParameters = 0x51,

    /// 读取实时位置（度）
    ReadPosition = 0x60,
    /// 读取实时转速（RPM）
    ReadSpeed = 0x61,
    /// 读取温度（摄氏度）
    ReadTemperature = 0x62,
    /// 读取总线电压（V）
    ReadBusVoltage = 0x63,
    /// 读取相电流（A）
    ReadCurrent = 0x64,
    /// 读取位置误差（度）
    ReadPositionError = 0x66,
    /// 读取状态标志位（u32 位域）
    ReadStatusFlags = 0x69,
}

impl Opcode {
    /// 是否属于读取类操作
    ///
    /// 聚合帧只允许控制类操作，读取类与控制类禁止混用。
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Opcode::ReadVersion
                | Opcode::ReadDriveParameters
                | Opcode::ReadPosition
                | Opcode::ReadSpeed
                | Opcode::ReadTemperature
                | Opcode::ReadBusVoltage
                | Opcode::ReadCurrent
                | Opcode::ReadPositionError
                | Opcode::ReadStatusFlags
        )
    }
}

/// 网关响应状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GatewayStatus {
    /// 成功
    Ok = 0,
    /// 请求非法（TLV 缺失或参数格式错误）
    InvalidRequest = 1,
    /// 操作码不被目标驱动板支持
    Unsupported = 2,
    /// 下游总线超时（命令可能已送达但 ACK 缺失）
    DownstreamTimeout = 3,
    /// 设备忙（瞬态，可在下一周期重发）
    Busy = 4,
}

/// 下游 ACK 缺失的错误码
///
/// 与 [`GatewayStatus::DownstreamTimeout`] 搭配出现。
pub const ERR_DOWNSTREAM_ACK_MISSING: u16 = 0x4034;

/// 设备瞬态忙的错误码
///
/// 与 [`GatewayStatus::Busy`] 搭配出现，高频下发实时命令时常见。
pub const ERR_DEVICE_BUSY: u16 = 0x0101;

/// 驱动板类型
///
/// 网关按类型把操作码翻译为具体驱动板的原生命令。当前只有闭环步进
/// 一种，保留枚举以便接入其他厂商的驱动板。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DriverKind {
    /// 闭环步进驱动板
    #[default]
    ClosedLoopStepper = 0x01,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        let op = Opcode::try_from(0x12u8).unwrap();
        assert_eq!(op, Opcode::PositionDirect);
        assert_eq!(u8::from(op), 0x12);
    }

    #[test]
    fn test_opcode_unknown_rejected() {
        assert!(Opcode::try_from(0xEEu8).is_err());
    }

    #[test]
    fn test_read_class_split() {
        assert!(Opcode::ReadPosition.is_read());
        assert!(Opcode::ReadStatusFlags.is_read());
        assert!(!Opcode::PositionDirect.is_read());
        assert!(!Opcode::Enable.is_read());
        assert!(!Opcode::AggregateMotion.is_read());
    }

    #[test]
    fn test_gateway_status_from_u8() {
        assert_eq!(GatewayStatus::try_from(0u8).unwrap(), GatewayStatus::Ok);
        assert_eq!(GatewayStatus::try_from(3u8).unwrap(), GatewayStatus::DownstreamTimeout);
        assert!(GatewayStatus::try_from(9u8).is_err());
    }
}
