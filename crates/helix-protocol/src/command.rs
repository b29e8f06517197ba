//! 驱动板原生参数编码与读数解析
//!
//! 单播命令的参数统一使用小端序，角度/转速在线上以 ×10 定点数表示
//! （0.1° / 0.1RPM 分辨率）。标准化读取返回小端 float32/uint32。
//!
//! 数值语义：
//! - 位置：有符号度数，按每次调用的标志位区分绝对/相对；
//! - 速度：有符号 RPM，符号编码方向；
//! - 加减速：RPM/s，恒为非负；
//! - 力矩/电流：有符号毫安。

use crate::opcodes::Opcode;
use crate::ProtocolError;
use num_enum::{IntoPrimitive, TryFromPrimitive};

// ============================================================================
// 定点数换算
// ============================================================================

fn deg_to_x10(deg: f64, field: &str) -> Result<i32, ProtocolError> {
    let scaled = (deg * 10.0).round();
    if !scaled.is_finite() || scaled < i32::MIN as f64 || scaled > i32::MAX as f64 {
        return Err(ProtocolError::OutOfRange {
            field: field.to_string(),
            value: deg,
        });
    }
    Ok(scaled as i32)
}

fn rpm_to_x10_signed(rpm: f64, field: &str) -> Result<i16, ProtocolError> {
    let scaled = (rpm * 10.0).round();
    if !scaled.is_finite() || scaled < i16::MIN as f64 || scaled > i16::MAX as f64 {
        return Err(ProtocolError::OutOfRange {
            field: field.to_string(),
            value: rpm,
        });
    }
    Ok(scaled as i16)
}

fn rpm_to_x10_unsigned(rpm: f64, field: &str) -> Result<u16, ProtocolError> {
    let scaled = (rpm * 10.0).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > u16::MAX as f64 {
        return Err(ProtocolError::OutOfRange {
            field: field.to_string(),
            value: rpm,
        });
    }
    Ok(scaled as u16)
}

// ============================================================================
// 控制命令
// ============================================================================

/// 使能/失能命令 (0x01)
///
/// 参数：`enabled(u8), sync(u8)`。sync 恒为 0：多电机同步只允许走
/// 聚合帧，预加载式同步触发在本协议中不开放。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnableCommand {
    pub enabled: bool,
}

impl EnableCommand {
    pub const OPCODE: Opcode = Opcode::Enable;

    pub fn to_args(self) -> Vec<u8> {
        vec![self.enabled as u8, 0]
    }

    pub fn from_args(args: &[u8]) -> Result<Self, ProtocolError> {
        if args.is_empty() {
            return Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: 0,
            });
        }
        Ok(Self {
            enabled: args[0] != 0,
        })
    }
}

/// 停止命令 (0x02)
///
/// 立即停止运动，保持使能与保持力矩。参数：`sync(u8)`。
#[derive(Debug, Clone, Copy, Default)]
pub struct StopCommand;

impl StopCommand {
    pub const OPCODE: Opcode = Opcode::Stop;

    pub fn to_args(self) -> Vec<u8> {
        vec![0]
    }
}

/// 速度模式命令 (0x10)
///
/// 参数：`rpm_x10(i16), accel_rpm_s(u16), sync(u8)`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedCommand {
    /// 目标转速（RPM，符号编码方向）
    pub rpm: f64,
    /// 加速度（RPM/s）
    pub accel_rpm_s: u16,
}

impl SpeedCommand {
    pub const OPCODE: Opcode = Opcode::SpeedMode;

    pub fn to_args(self) -> Result<Vec<u8>, ProtocolError> {
        let rpm_x10 = rpm_to_x10_signed(self.rpm, "speed_rpm")?;
        let mut args = Vec::with_capacity(5);
        args.extend_from_slice(&rpm_x10.to_le_bytes());
        args.extend_from_slice(&self.accel_rpm_s.to_le_bytes());
        args.push(0);
        Ok(args)
    }

    pub fn from_args(args: &[u8]) -> Result<Self, ProtocolError> {
        if args.len() < 5 {
            return Err(ProtocolError::InvalidLength {
                expected: 5,
                actual: args.len(),
            });
        }
        Ok(Self {
            rpm: i16::from_le_bytes([args[0], args[1]]) as f64 / 10.0,
            accel_rpm_s: u16::from_le_bytes([args[2], args[3]]),
        })
    }
}

/// 力矩/电流模式命令 (0x11)
///
/// 参数：`current_ma(i16), slope_ma_s(u16), sync(u8)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorqueCommand {
    /// 目标电流（mA，符号编码方向）
    pub current_ma: i16,
    /// 电流爬升斜率（mA/s）
    pub slope_ma_s: u16,
}

impl TorqueCommand {
    pub const OPCODE: Opcode = Opcode::TorqueMode;

    pub fn to_args(self) -> Vec<u8> {
        let mut args = Vec::with_capacity(5);
        args.extend_from_slice(&self.current_ma.to_le_bytes());
        args.extend_from_slice(&self.slope_ma_s.to_le_bytes());
        args.push(0);
        args
    }

    pub fn from_args(args: &[u8]) -> Result<Self, ProtocolError> {
        if args.len() < 5 {
            return Err(ProtocolError::InvalidLength {
                expected: 5,
                actual: args.len(),
            });
        }
        Ok(Self {
            current_ma: i16::from_le_bytes([args[0], args[1]]),
            slope_ma_s: u16::from_le_bytes([args[2], args[3]]),
        })
    }
}

/// 位置直通命令 (0x12)
///
/// 限速直达目标位置。参数：
/// `pos_x10(i32), speed_x10(u16), absolute(u8), sync(u8)`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionDirectCommand {
    /// 目标位置（度）
    pub position_deg: f64,
    /// 运动速度（RPM，非负）
    pub speed_rpm: f64,
    /// 绝对位置（false = 相对当前位置）
    pub absolute: bool,
}

impl PositionDirectCommand {
    pub const OPCODE: Opcode = Opcode::PositionDirect;

    pub fn to_args(self) -> Result<Vec<u8>, ProtocolError> {
        let pos_x10 = deg_to_x10(self.position_deg, "position_deg")?;
        let speed_x10 = rpm_to_x10_unsigned(self.speed_rpm, "speed_rpm")?;
        let mut args = Vec::with_capacity(8);
        args.extend_from_slice(&pos_x10.to_le_bytes());
        args.extend_from_slice(&speed_x10.to_le_bytes());
        args.push(self.absolute as u8);
        args.push(0);
        Ok(args)
    }

    pub fn from_args(args: &[u8]) -> Result<Self, ProtocolError> {
        if args.len() < 8 {
            return Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: args.len(),
            });
        }
        Ok(Self {
            position_deg: i32::from_le_bytes([args[0], args[1], args[2], args[3]]) as f64 / 10.0,
            speed_rpm: u16::from_le_bytes([args[4], args[5]]) as f64 / 10.0,
            absolute: args[6] != 0,
        })
    }
}

/// 位置梯形曲线命令 (0x13)
///
/// 带加减速规划的位置命令。参数：
/// `pos_x10(i32), vmax_x10(u16), accel(u16), decel(u16), absolute(u8), sync(u8)`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionTrapezoidCommand {
    /// 目标位置（度）
    pub position_deg: f64,
    /// 峰值速度（RPM，非负）
    pub max_speed_rpm: f64,
    /// 加速度（RPM/s）
    pub accel_rpm_s: u16,
    /// 减速度（RPM/s）
    pub decel_rpm_s: u16,
    /// 绝对位置
    pub absolute: bool,
}

impl PositionTrapezoidCommand {
    pub const OPCODE: Opcode = Opcode::PositionTrapezoid;

    pub fn to_args(self) -> Result<Vec<u8>, ProtocolError> {
        let pos_x10 = deg_to_x10(self.position_deg, "position_deg")?;
        let vmax_x10 = rpm_to_x10_unsigned(self.max_speed_rpm, "max_speed_rpm")?;
        let mut args = Vec::with_capacity(12);
        args.extend_from_slice(&pos_x10.to_le_bytes());
        args.extend_from_slice(&vmax_x10.to_le_bytes());
        args.extend_from_slice(&self.accel_rpm_s.to_le_bytes());
        args.extend_from_slice(&self.decel_rpm_s.to_le_bytes());
        args.push(self.absolute as u8);
        args.push(0);
        Ok(args)
    }

    pub fn from_args(args: &[u8]) -> Result<Self, ProtocolError> {
        if args.len() < 12 {
            return Err(ProtocolError::InvalidLength {
                expected: 12,
                actual: args.len(),
            });
        }
        Ok(Self {
            position_deg: i32::from_le_bytes([args[0], args[1], args[2], args[3]]) as f64 / 10.0,
            max_speed_rpm: u16::from_le_bytes([args[4], args[5]]) as f64 / 10.0,
            accel_rpm_s: u16::from_le_bytes([args[6], args[7]]),
            decel_rpm_s: u16::from_le_bytes([args[8], args[9]]),
            absolute: args[10] != 0,
        })
    }
}

// ============================================================================
// 回零与维护
// ============================================================================

/// 回零模式
///
/// 召回类模式（绝对零点/掉电位置）依赖驱动板侧跨上电周期持久化的
/// 状态，其一致性主机无法验证，属于集成时需要确认的外部不变量。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HomingMode {
    /// 单圈就近回零
    #[default]
    NearestDirection = 0,
    /// 单圈方向回零
    Directional = 1,
    /// 回到绝对位置坐标零点
    AbsoluteZeroRecall = 4,
    /// 回到上次掉电位置
    LastPowerOffRecall = 5,
}

/// 触发回零命令 (0x41)
///
/// 参数：`mode(u8), collision_detection(u8), sync(u8)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingCommand {
    pub mode: HomingMode,
    /// 回零途中是否启用碰撞检测（命中即判回零失败）
    pub collision_detection: bool,
}

impl HomingCommand {
    pub const OPCODE: Opcode = Opcode::TriggerHoming;

    pub fn to_args(self) -> Vec<u8> {
        vec![self.mode.into(), self.collision_detection as u8, 0]
    }

    pub fn from_args(args: &[u8]) -> Result<Self, ProtocolError> {
        if args.len() < 3 {
            return Err(ProtocolError::InvalidLength {
                expected: 3,
                actual: args.len(),
            });
        }
        let mode = HomingMode::try_from(args[0]).map_err(|_| ProtocolError::InvalidValue {
            field: "HomingMode".to_string(),
            value: args[0] as u32,
        })?;
        Ok(Self {
            mode,
            collision_detection: args[1] != 0,
        })
    }
}

/// 设置零点命令 (0x40)
///
/// 把当前原始位置捕获为逻辑零点，可选持久化到芯片。参数：`save(u8)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetZeroCommand {
    pub save_to_chip: bool,
}

impl SetZeroCommand {
    pub const OPCODE: Opcode = Opcode::SetZeroPosition;

    pub fn to_args(self) -> Vec<u8> {
        vec![self.save_to_chip as u8]
    }
}

// ============================================================================
// 标准化读数解析
// ============================================================================

/// 解析标准化 float32 读数（小端 IEEE 754）
///
/// 固件解析失败时回传 NaN，这里统一映射为 `InvalidValue`。
pub fn parse_f32(data: &[u8]) -> Result<f32, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidLength {
            expected: 4,
            actual: data.len(),
        });
    }
    let value = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if value.is_nan() {
        return Err(ProtocolError::InvalidValue {
            field: "f32 reading".to_string(),
            value: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        });
    }
    Ok(value)
}

/// 版本信息
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VersionInfo {
    /// 固件版本，格式 `major.minor`
    pub firmware: String,
    /// 硬件版本，格式 `major.minor`
    pub hardware: String,
}

impl VersionInfo {
    /// 从 `ReadVersion` 响应解析
    ///
    /// 数据格式：`fw(u16 BE), hw(u16 BE)`，数值 125 表示 "1.25"。
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: data.len(),
            });
        }
        let fw = u16::from_be_bytes([data[0], data[1]]);
        let hw = u16::from_be_bytes([data[2], data[3]]);
        Ok(Self {
            firmware: format!("{}.{:02}", fw / 100, fw % 100),
            hardware: format!("{}.{:02}", hw / 100, hw % 100),
        })
    }
}

// ============================================================================
// 驱动参数块
// ============================================================================

/// 驱动参数块 (0x38 读 / 0x51 写)
///
/// 线上布局（小端，16 字节）：
///
/// ```text
/// control_mode(u8) | reserved(u8) | open_loop_ma(u16) | closed_loop_max_ma(u16)
/// | speed_limit_rpm(u16) | stall_threshold_rpm(u16) | stall_current_ma(u16)
/// | stall_timeout_ms(u16) | position_error_limit_x10(u16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriveParameters {
    /// 控制模式（驱动板自定义编码）
    pub control_mode: u8,
    /// 开环电流（mA）
    pub open_loop_ma: u16,
    /// 闭环最大电流（mA）
    pub closed_loop_max_ma: u16,
    /// 速度上限（RPM）
    pub speed_limit_rpm: u16,
    /// 堵转判定转速阈值（RPM）
    pub stall_threshold_rpm: u16,
    /// 堵转判定电流阈值（mA）
    pub stall_current_ma: u16,
    /// 堵转判定时间（ms）
    pub stall_timeout_ms: u16,
    /// 位置误差保护阈值（0.1°）
    pub position_error_limit_x10: u16,
}

impl Default for DriveParameters {
    fn default() -> Self {
        Self {
            control_mode: 2, // 闭环矢量
            open_loop_ma: 800,
            closed_loop_max_ma: 2000,
            speed_limit_rpm: 3000,
            stall_threshold_rpm: 40,
            stall_current_ma: 2400,
            stall_timeout_ms: 4000,
            position_error_limit_x10: 40,
        }
    }
}

impl DriveParameters {
    const WIRE_LEN: usize = 16;

    /// 从 `ReadDriveParameters` 响应解析
    pub fn from_raw(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::WIRE_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: Self::WIRE_LEN,
                actual: data.len(),
            });
        }
        let le_u16 = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        Ok(Self {
            control_mode: data[0],
            open_loop_ma: le_u16(2),
            closed_loop_max_ma: le_u16(4),
            speed_limit_rpm: le_u16(6),
            stall_threshold_rpm: le_u16(8),
            stall_current_ma: le_u16(10),
            stall_timeout_ms: le_u16(12),
            position_error_limit_x10: le_u16(14),
        })
    }

    /// 编码为 `ModifyDriveParameters` 参数（前置 save 字节）
    pub fn to_args(self, save_to_chip: bool) -> Vec<u8> {
        let mut args = Vec::with_capacity(1 + Self::WIRE_LEN);
        args.push(save_to_chip as u8);
        args.extend_from_slice(&self.to_raw());
        args
    }

    /// 编码为 14 字节线上布局
    pub fn to_raw(self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(Self::WIRE_LEN);
        raw.push(self.control_mode);
        raw.push(0);
        raw.extend_from_slice(&self.open_loop_ma.to_le_bytes());
        raw.extend_from_slice(&self.closed_loop_max_ma.to_le_bytes());
        raw.extend_from_slice(&self.speed_limit_rpm.to_le_bytes());
        raw.extend_from_slice(&self.stall_threshold_rpm.to_le_bytes());
        raw.extend_from_slice(&self.stall_current_ma.to_le_bytes());
        raw.extend_from_slice(&self.stall_timeout_ms.to_le_bytes());
        raw.extend_from_slice(&self.position_error_limit_x10.to_le_bytes());
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_direct_encoding() {
        let cmd = PositionDirectCommand {
            position_deg: -90.0,
            speed_rpm: 200.0,
            absolute: true,
        };
        let args = cmd.to_args().unwrap();
        assert_eq!(args.len(), 8);
        assert_eq!(i32::from_le_bytes([args[0], args[1], args[2], args[3]]), -900);
        assert_eq!(u16::from_le_bytes([args[4], args[5]]), 2000);
        assert_eq!(args[6], 1);
        assert_eq!(args[7], 0);

        let decoded = PositionDirectCommand::from_args(&args).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_speed_sign_encodes_direction() {
        let cmd = SpeedCommand {
            rpm: -120.5,
            accel_rpm_s: 1000,
        };
        let args = cmd.to_args().unwrap();
        assert_eq!(i16::from_le_bytes([args[0], args[1]]), -1205);

        let decoded = SpeedCommand::from_args(&args).unwrap();
        assert!((decoded.rpm - -120.5).abs() < 1e-9);
    }

    #[test]
    fn test_speed_out_of_range_rejected() {
        let cmd = SpeedCommand {
            rpm: 5000.0, // 50000 x10 超出 i16
            accel_rpm_s: 1000,
        };
        assert!(matches!(
            cmd.to_args(),
            Err(ProtocolError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_negative_direct_speed_rejected() {
        // 位置命令的速度是幅值，方向由目标位置决定
        let cmd = PositionDirectCommand {
            position_deg: 10.0,
            speed_rpm: -5.0,
            absolute: true,
        };
        assert!(cmd.to_args().is_err());
    }

    #[test]
    fn test_trapezoid_roundtrip() {
        let cmd = PositionTrapezoidCommand {
            position_deg: 361.5,
            max_speed_rpm: 150.0,
            accel_rpm_s: 500,
            decel_rpm_s: 800,
            absolute: false,
        };
        let decoded = PositionTrapezoidCommand::from_args(&cmd.to_args().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_homing_mode_codes() {
        assert_eq!(u8::from(HomingMode::NearestDirection), 0);
        assert_eq!(u8::from(HomingMode::AbsoluteZeroRecall), 4);
        assert!(HomingCommand::from_args(&[2, 0, 0]).is_err()); // 限位/碰撞回零未开放

        let cmd = HomingCommand {
            mode: HomingMode::Directional,
            collision_detection: true,
        };
        assert_eq!(HomingCommand::from_args(&cmd.to_args()).unwrap(), cmd);
    }

    #[test]
    fn test_parse_f32_nan_rejected() {
        let nan = f32::NAN.to_le_bytes();
        assert!(parse_f32(&nan).is_err());
        assert_eq!(parse_f32(&42.5f32.to_le_bytes()).unwrap(), 42.5);
    }

    #[test]
    fn test_version_format() {
        let mut data = Vec::new();
        data.extend_from_slice(&125u16.to_be_bytes());
        data.extend_from_slice(&203u16.to_be_bytes());
        let ver = VersionInfo::parse(&data).unwrap();
        assert_eq!(ver.firmware, "1.25");
        assert_eq!(ver.hardware, "2.03");
    }

    #[test]
    fn test_drive_parameters_roundtrip() {
        let params = DriveParameters {
            control_mode: 2,
            open_loop_ma: 900,
            closed_loop_max_ma: 2200,
            speed_limit_rpm: 2500,
            stall_threshold_rpm: 50,
            stall_current_ma: 2600,
            stall_timeout_ms: 3000,
            position_error_limit_x10: 55,
        };
        let decoded = DriveParameters::from_raw(&params.to_raw()).unwrap();
        assert_eq!(decoded, params);
    }
}
