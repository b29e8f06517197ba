//! 多电机同步派发
//!
//! [`SyncGroup`] 把 N 个会话的目标打包为一个聚合帧，经一次
//! `Transport::exchange` 广播出去，使物理上相互独立的驱动板在同一
//! 瞬间启动。逐条单播做不到这一点：串行派发引入的启动偏斜以单命令
//! 往返时间为界。
//!
//! 原子性：只等主应答者的 ACK。成功时所有成员会话在调用方视角下
//! **一次性**进入 `Moving`（不存在部分成员运动的可观测中间态）；
//! 超时或 NACK 时整组失败，任何成员的状态都不推进，失败以单个
//! [`DriverError::SyncDispatchFailed`] 呈现。注意固有局限：失败的
//! 派发与部分物理送达在主机侧不可区分——其余电机可能已经收到广播
//! 部分。[`SyncGroup::dispatch_verified`] 用派发后的逐成员状态轮询
//! 补救：能**检测**分歧成员，但无法阻止已发生的部分送达，且轮询
//! 本身花费 N 次往返、发生在同步启动之后。
//!
//! 并发：两个线程对同一传输同时派发同步组时，由传输的互斥纪律
//! 串行化——先拿到锁的先执行，没有优先级方案。
//!
//! 同步组构建后被一次派发消耗，不持久化。

use crate::error::DriverError;
use crate::session::{MotorSession, MotorState};
use helix_protocol::{
    AggregateCommand, AggregateFrame, GatewayRequest, GatewayStatus, Opcode, BROADCAST_ADDR,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 共享运动轮廓
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionProfile {
    /// 运动速度（关节空间 RPM，非负）
    pub speed_rpm: f64,
    /// 加速度（RPM/s）
    pub accel_rpm_s: u16,
    /// 减速度（RPM/s）
    pub decel_rpm_s: u16,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            speed_rpm: 200.0,
            accel_rpm_s: 1000,
            decel_rpm_s: 1000,
        }
    }
}

/// 聚合模式（组内同质，混合控制类/读取类在构建层面即不可表达）
#[derive(Debug, Clone, Copy)]
enum SyncMode {
    Position { profile: MotionProfile, absolute: bool },
    Speed { accel_rpm_s: u16 },
    Enable { enabled: bool },
}

/// 派发后校验结果
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// 状态与期望不符的成员地址
    pub divergent: Vec<u8>,
}

impl SyncOutcome {
    /// 所有成员状态与期望一致
    pub fn is_consistent(&self) -> bool {
        self.divergent.is_empty()
    }
}

/// 同步组
///
/// ```text
/// SyncGroup::position(MotionProfile::default())
///     .push(&mut j1, 90.0)
///     .push(&mut j2, -45.0)
///     .dispatch()?;
/// ```
pub struct SyncGroup<'a> {
    mode: SyncMode,
    members: Vec<(&'a mut MotorSession, f64)>,
    timeout: Duration,
}

impl<'a> SyncGroup<'a> {
    /// 位置同步组（绝对位置）
    pub fn position(profile: MotionProfile) -> Self {
        Self::new(SyncMode::Position {
            profile,
            absolute: true,
        })
    }

    /// 速度同步组
    pub fn speed(accel_rpm_s: u16) -> Self {
        Self::new(SyncMode::Speed { accel_rpm_s })
    }

    /// 使能/失能同步组（目标值被忽略）
    pub fn enable(enabled: bool) -> Self {
        Self::new(SyncMode::Enable { enabled })
    }

    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            members: Vec::new(),
            timeout: Duration::from_millis(2000),
        }
    }

    /// 位置目标按相对位移解释
    pub fn relative(mut self) -> Self {
        if let SyncMode::Position { absolute, .. } = &mut self.mode {
            *absolute = false;
        }
        self
    }

    /// 设置派发超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 加入一个成员（目标值在关节空间）
    pub fn push(mut self, session: &'a mut MotorSession, target: f64) -> Self {
        self.members.push((session, target));
        self
    }

    /// 成员数
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 派发同步组
    ///
    /// 校验失败在任何线上 I/O 之前报告；派发失败时所有成员状态保持
    /// 调用前原样。
    pub fn dispatch(mut self) -> Result<(), DriverError> {
        self.dispatch_inner()?;
        Ok(())
    }

    /// 派发并做补救性一致性轮询
    ///
    /// 成功派发后逐成员轮询状态，报告与期望不符的地址。权衡：多花
    /// N 次往返，且只能在同步启动之后检测（无法阻止）部分送达。
    pub fn dispatch_verified(mut self) -> Result<SyncOutcome, DriverError> {
        self.dispatch_inner()?;

        let mut outcome = SyncOutcome::default();
        for (session, target) in &mut self.members {
            let consistent = match session.poll_status() {
                Ok(flags) => match self.mode {
                    SyncMode::Enable { enabled } => flags.enabled() == enabled,
                    SyncMode::Speed { .. } => !flags.in_position(),
                    SyncMode::Position { absolute, .. } => {
                        if !absolute {
                            // 相对位移没有可核对的绝对期望值
                            true
                        } else if flags.in_position() {
                            // 短行程可能已经到位：核对实际位置
                            match session.read_position() {
                                Ok(pos) => (pos - *target).abs() <= 0.5,
                                Err(_) => false,
                            }
                        } else {
                            true
                        }
                    }
                },
                Err(_) => false,
            };
            if !consistent {
                outcome.divergent.push(session.addr());
            }
        }
        if !outcome.is_consistent() {
            warn!(divergent = ?outcome.divergent, "sync dispatch verification found divergent members");
        }
        Ok(outcome)
    }

    fn dispatch_inner(&mut self) -> Result<(), DriverError> {
        self.validate()?;

        // 构建聚合帧：标定换算发生在写边界
        let mut commands = Vec::with_capacity(self.members.len());
        for (session, target) in &self.members {
            let cal = session.calibration();
            let cmd = match self.mode {
                SyncMode::Position { profile, absolute } => AggregateCommand::Position {
                    position_deg: cal.joint_to_motor(*target),
                    speed_rpm: cal.joint_to_motor(profile.speed_rpm).abs(),
                    absolute,
                },
                SyncMode::Speed { accel_rpm_s } => AggregateCommand::Speed {
                    rpm: cal.joint_to_motor(*target),
                    accel_rpm_s,
                },
                SyncMode::Enable { enabled } => AggregateCommand::Enable { enabled },
            };
            commands.push((session.addr(), cmd));
        }

        let primary_ack_id = self.members[0].0.addr();
        let frame = AggregateFrame::new(primary_ack_id, commands);
        let args = frame.to_args().map_err(|e| DriverError::SyncDispatchFailed {
            reason: format!("frame encoding failed: {e}"),
        })?;

        let request = GatewayRequest::new(BROADCAST_ADDR, Opcode::AggregateMotion, args)
            .with_timeout_ms(self.timeout.as_millis().min(u16::MAX as u128) as u16);
        let transport = self.members[0].0.transport().clone();

        debug!(
            members = self.members.len(),
            primary_ack_id,
            mode = ?mode_name(&self.mode),
            "dispatching sync group"
        );
        let response = transport
            .exchange(&request, self.timeout)
            .map_err(|e| DriverError::SyncDispatchFailed {
                reason: format!("aggregate exchange failed: {e}"),
            })?;

        if response.status != GatewayStatus::Ok {
            return Err(DriverError::SyncDispatchFailed {
                reason: format!(
                    "primary acknowledger {} rejected: {:?} (err=0x{:04X})",
                    primary_ack_id, response.status, response.err_code
                ),
            });
        }
        if let Some(echo) = response.motor_id
            && echo != primary_ack_id
        {
            return Err(DriverError::SyncDispatchFailed {
                reason: format!("ack from unexpected motor {echo} (expected {primary_ack_id})"),
            });
        }

        // 主应答者确认后，所有成员状态一次性推进
        for (session, _) in &mut self.members {
            match self.mode {
                SyncMode::Enable { enabled } => session.mark_state(if enabled {
                    MotorState::Enabled
                } else {
                    MotorState::Disabled
                }),
                _ => session.mark_moving(),
            }
        }
        info!(members = self.members.len(), "sync group dispatched");
        Ok(())
    }

    /// 校验同步组不变量（全部在线上 I/O 之前）
    fn validate(&self) -> Result<(), DriverError> {
        if self.members.is_empty() {
            return Err(DriverError::SyncDispatchFailed {
                reason: "empty sync group".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for (session, _) in &self.members {
            if !seen.insert(session.addr()) {
                return Err(DriverError::SyncDispatchFailed {
                    reason: format!("motor {} appears twice in the group", session.addr()),
                });
            }
        }

        let first = &self.members[0].0;
        for (session, _) in &self.members[1..] {
            if !session.transport().same_channel(first.transport()) {
                return Err(DriverError::SyncDispatchFailed {
                    reason: format!(
                        "motor {} is bound to a different transport than motor {}",
                        session.addr(),
                        first.addr()
                    ),
                });
            }
        }

        for (session, _) in &self.members {
            let ok = match self.mode {
                // 运动类同步要求所有成员处于 Enabled 枢纽态
                SyncMode::Position { .. } | SyncMode::Speed { .. } => {
                    session.state() == MotorState::Enabled
                }
                // 使能类同步只要求已连接且不在运动/故障中
                SyncMode::Enable { .. } => matches!(
                    session.state(),
                    MotorState::Disabled | MotorState::Enabled
                ),
            };
            if !ok {
                return Err(DriverError::SyncDispatchFailed {
                    reason: format!(
                        "motor {} is in state {} (not eligible for sync dispatch)",
                        session.addr(),
                        session.state()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn mode_name(mode: &SyncMode) -> &'static str {
    match mode {
        SyncMode::Position { .. } => "position",
        SyncMode::Speed { .. } => "speed",
        SyncMode::Enable { .. } => "enable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_serial::mock::MockGateway;
    use helix_serial::Transport;

    fn setup(ids: &[u8]) -> (MockGateway, Transport) {
        let gw = MockGateway::new(ids);
        let transport = Transport::open("mock0", 115200, Box::new(gw.adapter()));
        (gw, transport)
    }

    fn enabled_session(transport: &Transport, addr: u8) -> MotorSession {
        let mut s = MotorSession::connect(transport, addr).unwrap();
        s.enable().unwrap();
        s
    }

    /// 恰好一个聚合帧上线，两个会话都进入 Moving
    #[test]
    fn test_sync_position_single_frame_both_moving() {
        let (gw, transport) = setup(&[1, 2]);
        let mut j1 = enabled_session(&transport, 1);
        let mut j2 = enabled_session(&transport, 2);

        SyncGroup::position(MotionProfile {
            speed_rpm: 1000.0,
            ..Default::default()
        })
        .push(&mut j1, 90.0)
        .push(&mut j2, -45.0)
        .dispatch()
        .unwrap();

        assert_eq!(gw.aggregate_frames_written(), 1);
        assert_eq!(j1.state(), MotorState::Moving);
        assert_eq!(j2.state(), MotorState::Moving);
        assert_eq!(gw.motor(1).target_deg, 90.0);
        assert_eq!(gw.motor(2).target_deg, -45.0);
    }

    /// 派发失败时没有任何成员推进状态
    #[test]
    fn test_sync_timeout_is_atomic() {
        let (gw, transport) = setup(&[1, 2]);
        let mut j1 = enabled_session(&transport, 1);
        let mut j2 = enabled_session(&transport, 2);

        gw.set_respond(false);
        let err = SyncGroup::position(MotionProfile::default())
            .with_timeout(Duration::from_millis(50))
            .push(&mut j1, 10.0)
            .push(&mut j2, 20.0)
            .dispatch()
            .unwrap_err();

        assert!(matches!(err, DriverError::SyncDispatchFailed { .. }));
        assert_eq!(j1.state(), MotorState::Enabled);
        assert_eq!(j2.state(), MotorState::Enabled);
    }

    /// 主应答者 NACK：整组失败，单个错误呈现
    #[test]
    fn test_primary_nack_fails_whole_group() {
        let (gw, transport) = setup(&[1, 3]);
        let mut j3 = enabled_session(&transport, 3);
        let mut j1 = enabled_session(&transport, 1);

        // 电机 3（主应答者）在派发前失联
        gw.silence_motor(3);

        let err = SyncGroup::position(MotionProfile::default())
            .push(&mut j3, 10.0)
            .push(&mut j1, 20.0)
            .dispatch()
            .unwrap_err();

        assert!(matches!(err, DriverError::SyncDispatchFailed { .. }));
        // 会话状态原子地保持原样——即使电机 1 可能已物理收到广播部分
        assert_eq!(j3.state(), MotorState::Enabled);
        assert_eq!(j1.state(), MotorState::Enabled);
    }

    #[test]
    fn test_validation_rejects_disabled_member_before_wire() {
        let (gw, transport) = setup(&[1, 2]);
        let mut j1 = enabled_session(&transport, 1);
        let mut j2 = MotorSession::connect(&transport, 2).unwrap(); // 未使能

        let frames_before = gw.written_frames().len();
        let err = SyncGroup::position(MotionProfile::default())
            .push(&mut j1, 10.0)
            .push(&mut j2, 20.0)
            .dispatch()
            .unwrap_err();

        assert!(matches!(err, DriverError::SyncDispatchFailed { .. }));
        // 校验失败发生在任何线上 I/O 之前
        assert_eq!(gw.written_frames().len(), frames_before);
    }

    #[test]
    fn test_validation_rejects_mixed_transports() {
        let (gw_a, transport_a) = setup(&[1]);
        let (_gw_b, transport_b) = setup(&[2]);
        let mut j1 = enabled_session(&transport_a, 1);
        let mut j2 = enabled_session(&transport_b, 2);

        let frames_before = gw_a.written_frames().len();
        let err = SyncGroup::position(MotionProfile::default())
            .push(&mut j1, 10.0)
            .push(&mut j2, 20.0)
            .dispatch()
            .unwrap_err();

        assert!(matches!(err, DriverError::SyncDispatchFailed { .. }));
        assert_eq!(gw_a.written_frames().len(), frames_before);
    }

    #[test]
    fn test_empty_group_rejected() {
        let err = SyncGroup::position(MotionProfile::default()).dispatch().unwrap_err();
        assert!(matches!(err, DriverError::SyncDispatchFailed { .. }));
    }

    #[test]
    fn test_sync_enable_group() {
        let (gw, transport) = setup(&[1, 2]);
        let mut j1 = MotorSession::connect(&transport, 1).unwrap();
        let mut j2 = MotorSession::connect(&transport, 2).unwrap();

        SyncGroup::enable(true)
            .push(&mut j1, 0.0)
            .push(&mut j2, 0.0)
            .dispatch()
            .unwrap();

        assert_eq!(j1.state(), MotorState::Enabled);
        assert_eq!(j2.state(), MotorState::Enabled);
        assert!(gw.motor(1).enabled);
        assert!(gw.motor(2).enabled);
    }

    #[test]
    fn test_dispatch_verified_consistent() {
        let (_gw, transport) = setup(&[1, 2]);
        let mut j1 = enabled_session(&transport, 1);
        let mut j2 = enabled_session(&transport, 2);

        let outcome = SyncGroup::position(MotionProfile {
            speed_rpm: 500.0,
            ..Default::default()
        })
        .push(&mut j1, 30.0)
        .push(&mut j2, -30.0)
        .dispatch_verified()
        .unwrap();

        assert!(outcome.is_consistent());
        assert_eq!(j1.state(), MotorState::Moving);
    }

    #[test]
    fn test_dispatch_verified_reports_divergent_member() {
        let (gw, transport) = setup(&[1, 2]);
        let mut j1 = enabled_session(&transport, 1);
        let mut j2 = enabled_session(&transport, 2);

        // 电机 2 失联：广播部分未送达，但主应答者 1 仍然确认
        gw.silence_motor(2);

        let outcome = SyncGroup::position(MotionProfile::default())
            .push(&mut j1, 40.0)
            .push(&mut j2, 40.0)
            .dispatch_verified()
            .unwrap();

        assert_eq!(outcome.divergent, vec![2]);
    }
}
