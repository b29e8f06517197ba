//! 电机状态标志位域与设备故障分类
//!
//! `ReadStatusFlags` (0x69) 返回一个小端 u32 位域，涵盖使能、到位、
//! 堵转、回零与编码器状态。位序为 LSB first，与 bilge 的默认位序一致。

use crate::ProtocolError;
use bilge::prelude::*;
use thiserror::Error;

/// 电机状态标志位域（u32，LSB first）
#[bitsize(32)]
#[derive(FromBits, DebugBits, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorStatusFlags {
    /// Bit 0: 已使能
    pub enabled: bool,
    /// Bit 1: 到位
    pub in_position: bool,
    /// Bit 2: 检测到堵转
    pub stall_detected: bool,
    /// Bit 3: 堵转保护已触发
    pub stall_protection: bool,
    /// Bit 4: 回零进行中
    pub homing_in_progress: bool,
    /// Bit 5: 回零完成
    pub homing_complete: bool,
    /// Bit 6: 回零失败
    pub homing_failed: bool,
    /// Bit 7: 编码器就绪（上电自校准完成）
    pub encoder_ready: bool,
    /// Bit 8: 编码器已标定
    pub encoder_calibrated: bool,
    /// Bit 9: 位置误差超限
    pub position_error: bool,
    /// Bit 10: 其他错误状态
    pub error_state: bool,
    reserved: u21,
}

impl MotorStatusFlags {
    /// 从 `ReadStatusFlags` 的响应数据解析
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: data.len(),
            });
        }
        let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Self::from(raw))
    }

    /// 编码为响应数据（mock 网关使用）
    pub fn to_bytes(self) -> [u8; 4] {
        u32::from(self).to_le_bytes()
    }

    /// 分类出设备侧故障（若有）
    ///
    /// 堵转保护优先于堵转检测：保护一旦触发，设备会拒绝后续运动命令，
    /// 必须显式解除。
    pub fn fault(self) -> Option<DeviceFault> {
        if self.stall_protection() {
            Some(DeviceFault::StallProtection)
        } else if self.stall_detected() {
            Some(DeviceFault::Stalled)
        } else if self.position_error() {
            Some(DeviceFault::PositionError)
        } else if self.homing_failed() {
            Some(DeviceFault::HomingFailed)
        } else {
            None
        }
    }
}

/// 设备上报的故障分类
///
/// 设备故障同时以两种形式呈现给调用方：观测到的那一次交换返回错误，
/// 并持久化到会话状态里，供独立轮询的监督逻辑读取。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// 堵转检测命中（尚未触发保护）
    #[error("Stall detected")]
    Stalled,

    /// 堵转保护已触发，需显式解除后才能继续运动
    #[error("Stall protection engaged (release required)")]
    StallProtection,

    /// 位置误差超出驱动板阈值
    #[error("Position error exceeded")]
    PositionError,

    /// 回零失败（未找到限位信号或检测到碰撞）
    #[error("Homing failed")]
    HomingFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_roundtrip() {
        let raw: u32 = 0b0000_0001_0011; // enabled + in_position + homing_in_progress
        let flags = MotorStatusFlags::parse(&raw.to_le_bytes()).unwrap();
        assert!(flags.enabled());
        assert!(flags.in_position());
        assert!(!flags.stall_detected());
        assert!(flags.homing_in_progress());
        assert_eq!(flags.to_bytes(), raw.to_le_bytes());
    }

    #[test]
    fn test_flags_short_data_rejected() {
        assert!(matches!(
            MotorStatusFlags::parse(&[0x01, 0x02]),
            Err(ProtocolError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_fault_priority_stall_protection_first() {
        let mut flags = MotorStatusFlags::default();
        flags.set_stall_detected(true);
        flags.set_stall_protection(true);
        flags.set_position_error(true);
        assert_eq!(flags.fault(), Some(DeviceFault::StallProtection));

        flags.set_stall_protection(false);
        assert_eq!(flags.fault(), Some(DeviceFault::Stalled));

        flags.set_stall_detected(false);
        assert_eq!(flags.fault(), Some(DeviceFault::PositionError));
    }

    #[test]
    fn test_no_fault_when_clean() {
        let mut flags = MotorStatusFlags::default();
        flags.set_enabled(true);
        flags.set_encoder_ready(true);
        assert_eq!(flags.fault(), None);
    }

    #[test]
    fn test_homing_failed_is_fault() {
        let mut flags = MotorStatusFlags::default();
        flags.set_homing_failed(true);
        assert_eq!(flags.fault(), Some(DeviceFault::HomingFailed));
    }
}
