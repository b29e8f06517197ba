//! 多电机聚合（同步组）帧构建
//!
//! N 条串行下发的单播命令无法保证 N 台电机同时启动（逐条派发的启动
//! 偏斜以单命令往返时间为界）。聚合帧把每台电机的目标打包进**一个**
//! 广播请求，网关在下游总线上一次性转发，各驱动板同一瞬间开始执行。
//!
//! 聚合请求的参数布局：
//!
//! ```text
//! primary_ack_id(1) | 0xAA | total_len(2 BE) | sub* | 0x6B
//! ```
//!
//! `total_len` 为全部子命令加尾字节 0x6B 的长度。每个 `sub` 是
//! `motor_id(1)` 加一条驱动板原生命令（大端序，驱动板固件既有约定）。
//! 只有主应答者（`primary_ack_id`）需要回 ACK；其余电机默认已在同一
//! 网关事务中收到广播部分。派发失败与部分物理送达从主机侧不可区分，
//! 这是聚合广播的固有局限（见 driver 层的补救轮询）。

use crate::ProtocolError;
use smallvec::SmallVec;

/// 聚合帧内部的起始字节
pub const AGG_HEADER: u8 = 0xAA;

/// 聚合帧与原生子命令共用的尾字节
pub const AGG_TRAILER: u8 = 0x6B;

/// 原生命令字：位置直通
const NATIVE_POSITION: u8 = 0xFB;
/// 原生命令字：速度模式
const NATIVE_SPEED: u8 = 0xF6;
/// 原生命令字：使能
const NATIVE_ENABLE: u8 = 0xF3;

/// 聚合帧里的单电机命令
///
/// 一个聚合帧内所有成员必须是同一变体（聚合模式同质），该不变量由
/// driver 层的同步组构建器保证。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateCommand {
    /// 位置直通（共享速度由调用方展开到每个成员）
    Position {
        position_deg: f64,
        speed_rpm: f64,
        absolute: bool,
    },
    /// 速度模式
    Speed { rpm: f64, accel_rpm_s: u16 },
    /// 使能/失能
    Enable { enabled: bool },
}

impl AggregateCommand {
    /// 编码为驱动板原生命令（大端序）
    fn encode_native(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match *self {
            AggregateCommand::Position {
                position_deg,
                speed_rpm,
                absolute,
            } => {
                let direction = (position_deg < 0.0) as u8;
                let pos_x10 = scale_x10(position_deg.abs(), "position_deg", u32::MAX as f64)? as u32;
                let speed_x10 = scale_x10(speed_rpm, "speed_rpm", u16::MAX as f64)? as u16;
                out.push(NATIVE_POSITION);
                out.push(direction);
                out.extend_from_slice(&speed_x10.to_be_bytes());
                out.extend_from_slice(&pos_x10.to_be_bytes());
                out.push(absolute as u8);
                out.push(0); // sync 字节：同步由聚合帧本身保证
                out.push(AGG_TRAILER);
            }
            AggregateCommand::Speed { rpm, accel_rpm_s } => {
                let direction = (rpm < 0.0) as u8;
                let speed_x10 = scale_x10(rpm.abs(), "speed_rpm", u16::MAX as f64)? as u16;
                out.push(NATIVE_SPEED);
                out.push(direction);
                out.extend_from_slice(&accel_rpm_s.to_be_bytes());
                out.extend_from_slice(&speed_x10.to_be_bytes());
                out.push(0);
                out.push(AGG_TRAILER);
            }
            AggregateCommand::Enable { enabled } => {
                out.push(NATIVE_ENABLE);
                out.push(enabled as u8);
                out.push(0);
                out.push(AGG_TRAILER);
            }
        }
        Ok(())
    }

    /// 从原生命令字节解码（mock 网关使用）
    ///
    /// 返回命令与消耗的字节数。
    pub fn decode_native(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let kind = *buf.first().ok_or(ProtocolError::InvalidLength {
            expected: 1,
            actual: 0,
        })?;
        match kind {
            NATIVE_POSITION => {
                ensure_len(buf, 11)?;
                let speed_x10 = u16::from_be_bytes([buf[2], buf[3]]);
                let pos_x10 = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                let mut position_deg = pos_x10 as f64 / 10.0;
                if buf[1] != 0 {
                    position_deg = -position_deg;
                }
                Ok((
                    AggregateCommand::Position {
                        position_deg,
                        speed_rpm: speed_x10 as f64 / 10.0,
                        absolute: buf[8] != 0,
                    },
                    11,
                ))
            }
            NATIVE_SPEED => {
                ensure_len(buf, 8)?;
                let accel_rpm_s = u16::from_be_bytes([buf[2], buf[3]]);
                let speed_x10 = u16::from_be_bytes([buf[4], buf[5]]);
                let mut rpm = speed_x10 as f64 / 10.0;
                if buf[1] != 0 {
                    rpm = -rpm;
                }
                Ok((AggregateCommand::Speed { rpm, accel_rpm_s }, 8))
            }
            NATIVE_ENABLE => {
                ensure_len(buf, 4)?;
                Ok((
                    AggregateCommand::Enable {
                        enabled: buf[1] != 0,
                    },
                    4,
                ))
            }
            other => Err(ProtocolError::InvalidValue {
                field: "native command".to_string(),
                value: other as u32,
            }),
        }
    }
}

fn ensure_len(buf: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if buf.len() < expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn scale_x10(value: f64, field: &str, max: f64) -> Result<u64, ProtocolError> {
    let scaled = (value * 10.0).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > max {
        return Err(ProtocolError::OutOfRange {
            field: field.to_string(),
            value,
        });
    }
    Ok(scaled as u64)
}

/// 聚合帧
///
/// 构建后经 `Opcode::AggregateMotion` 广播发出，整个同步组被**一次**
/// 传输写入消耗，派发完即丢弃，不持久化。
#[derive(Debug, Clone)]
pub struct AggregateFrame {
    /// 主应答者电机 ID
    pub primary_ack_id: u8,
    /// 成员列表：(电机 ID, 命令)
    pub members: SmallVec<[(u8, AggregateCommand); 8]>,
}

impl AggregateFrame {
    /// 构建聚合帧
    pub fn new(primary_ack_id: u8, members: impl IntoIterator<Item = (u8, AggregateCommand)>) -> Self {
        Self {
            primary_ack_id,
            members: members.into_iter().collect(),
        }
    }

    /// 编码为聚合请求的 Args 字节
    pub fn to_args(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.members.is_empty() {
            return Err(ProtocolError::InvalidLength {
                expected: 1,
                actual: 0,
            });
        }

        let mut payload = Vec::with_capacity(self.members.len() * 12);
        for (motor_id, cmd) in &self.members {
            payload.push(*motor_id);
            cmd.encode_native(&mut payload)?;
        }

        let total_len = (payload.len() + 1) as u16; // 含尾字节
        let mut args = Vec::with_capacity(4 + payload.len() + 1);
        args.push(self.primary_ack_id);
        args.push(AGG_HEADER);
        args.extend_from_slice(&total_len.to_be_bytes());
        args.extend_from_slice(&payload);
        args.push(AGG_TRAILER);
        Ok(args)
    }

    /// 从聚合请求的 Args 解码（mock 网关使用）
    pub fn from_args(args: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(args, 5)?;
        let primary_ack_id = args[0];
        if args[1] != AGG_HEADER {
            return Err(ProtocolError::InvalidValue {
                field: "aggregate header".to_string(),
                value: args[1] as u32,
            });
        }
        let total_len = u16::from_be_bytes([args[2], args[3]]) as usize;
        ensure_len(args, 4 + total_len)?;
        let body = &args[4..4 + total_len - 1];
        if args[4 + total_len - 1] != AGG_TRAILER {
            return Err(ProtocolError::InvalidValue {
                field: "aggregate trailer".to_string(),
                value: args[4 + total_len - 1] as u32,
            });
        }

        let mut members = SmallVec::new();
        let mut i = 0;
        while i < body.len() {
            let motor_id = body[i];
            let (cmd, used) = AggregateCommand::decode_native(&body[i + 1..])?;
            members.push((motor_id, cmd));
            i += 1 + used;
        }
        Ok(Self {
            primary_ack_id,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_frame_layout() {
        let frame = AggregateFrame::new(
            1,
            [
                (
                    1,
                    AggregateCommand::Position {
                        position_deg: 90.0,
                        speed_rpm: 1000.0,
                        absolute: true,
                    },
                ),
                (
                    2,
                    AggregateCommand::Position {
                        position_deg: -45.0,
                        speed_rpm: 1000.0,
                        absolute: true,
                    },
                ),
            ],
        );
        let args = frame.to_args().unwrap();

        assert_eq!(args[0], 1); // 主应答者
        assert_eq!(args[1], AGG_HEADER);
        // 每个子命令 1 + 11 字节，total_len = 24 + 1
        assert_eq!(u16::from_be_bytes([args[2], args[3]]), 25);
        assert_eq!(*args.last().unwrap(), AGG_TRAILER);

        // 第二个成员：dir=1（负向），|pos|=450
        let sub2 = &args[4 + 12..4 + 24];
        assert_eq!(sub2[0], 2);
        assert_eq!(sub2[1], NATIVE_POSITION);
        assert_eq!(sub2[2], 1);
        assert_eq!(u32::from_be_bytes([sub2[5], sub2[6], sub2[7], sub2[8]]), 450);
    }

    #[test]
    fn test_aggregate_roundtrip() {
        let frame = AggregateFrame::new(
            3,
            [
                (3, AggregateCommand::Speed { rpm: -60.0, accel_rpm_s: 500 }),
                (4, AggregateCommand::Speed { rpm: 30.0, accel_rpm_s: 500 }),
            ],
        );
        let decoded = AggregateFrame::from_args(&frame.to_args().unwrap()).unwrap();
        assert_eq!(decoded.primary_ack_id, 3);
        assert_eq!(decoded.members.len(), 2);
        assert_eq!(
            decoded.members[0].1,
            AggregateCommand::Speed { rpm: -60.0, accel_rpm_s: 500 }
        );
    }

    #[test]
    fn test_enable_roundtrip() {
        let frame = AggregateFrame::new(
            1,
            (1..=6).map(|id| (id, AggregateCommand::Enable { enabled: true })),
        );
        let decoded = AggregateFrame::from_args(&frame.to_args().unwrap()).unwrap();
        assert_eq!(decoded.members.len(), 6);
        assert!(decoded
            .members
            .iter()
            .all(|(_, c)| matches!(c, AggregateCommand::Enable { enabled: true })));
    }

    #[test]
    fn test_empty_group_rejected() {
        let frame = AggregateFrame::new(1, []);
        assert!(frame.to_args().is_err());
    }

    #[test]
    fn test_bad_trailer_rejected() {
        let frame = AggregateFrame::new(1, [(1, AggregateCommand::Enable { enabled: true })]);
        let mut args = frame.to_args().unwrap();
        let last = args.len() - 1;
        args[last] = 0x00;
        assert!(AggregateFrame::from_args(&args).is_err());
    }
}
