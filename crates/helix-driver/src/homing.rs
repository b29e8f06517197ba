//! 回零控制器
//!
//! 把一台电机从"位置未知"驱动到"位置已建立"的状态机：
//!
//! ```text
//! Idle → InProgress → {Completed, Failed, Aborted}
//! ```
//!
//! 控制器独占借用所属会话（`&mut`），因此一个会话同一时刻至多存在
//! 一个活跃的回零过程，这条不变量由借用检查器静态保证。
//!
//! 终态惰性：到达 `Completed` / `Failed` / `Aborted` 后，没有显式
//! `start()` 就不会再发生任何自动状态变化；`Completed` 之后重新
//! `start()` 合法，旧结果直接丢弃。控制器从不自动重试。

use crate::error::DriverError;
use crate::session::{MotorSession, MotorState};
use helix_protocol::{HomingCommand, HomingMode, Opcode};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 回零失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingFailure {
    /// 设备上报回零失败（未找到限位信号、碰撞检测命中）
    DeviceFault,
    /// 超时窗口内未完成
    Timeout,
}

/// 回零状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingState {
    /// 未启动
    Idle,
    /// 回零进行中
    InProgress,
    /// 成功建立零点（终态，可重新 `start()`）
    Completed,
    /// 失败（终态，需显式 `start()` 重试）
    Failed(HomingFailure),
    /// 被 `force_stop()` 中止（终态）
    Aborted,
}

impl HomingState {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HomingState::Completed | HomingState::Failed(_) | HomingState::Aborted
        )
    }
}

/// 回零控制器
pub struct HomingController<'a> {
    session: &'a mut MotorSession,
    state: HomingState,
    deadline: Option<Instant>,
    poll_interval: Duration,
}

impl<'a> HomingController<'a> {
    /// 默认轮询间隔
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// 创建控制器（初始 `Idle`）
    pub fn new(session: &'a mut MotorSession) -> Self {
        Self {
            session,
            state: HomingState::Idle,
            deadline: None,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// 设置轮询间隔
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 当前状态
    pub fn state(&self) -> HomingState {
        self.state
    }

    /// 启动回零
    ///
    /// 从任何状态合法（终态重启丢弃旧结果）。前置条件：
    /// - 会话处于 `Enabled`（回零需要力矩）；
    /// - 编码器已完成上电自校准，否则 [`DriverError::EncoderNotReady`]。
    pub fn start(
        &mut self,
        mode: HomingMode,
        timeout: Duration,
        collision_detection: bool,
    ) -> Result<(), DriverError> {
        if self.session.state() != MotorState::Enabled {
            return Err(DriverError::InvalidState {
                op: "homing start",
                state: self.session.state(),
            });
        }

        let flags = self.session.poll_status()?;
        if !flags.encoder_ready() {
            return Err(DriverError::EncoderNotReady {
                addr: self.session.addr(),
            });
        }

        let cmd = HomingCommand {
            mode,
            collision_detection,
        };
        self.session.exchange_raw(Opcode::TriggerHoming, cmd.to_args())?;
        self.session.mark_state(MotorState::Homing);
        self.state = HomingState::InProgress;
        self.deadline = Some(Instant::now() + timeout);
        info!(addr = self.session.addr(), ?mode, ?timeout, "homing started");
        Ok(())
    }

    /// 轮询一次
    ///
    /// 终态下是纯粹的空操作（不触线、不改状态）。`InProgress` 下读
    /// 一次设备状态：
    /// - 设备报回零完成 → `Completed`；
    /// - 设备报回零失败或超时 → `Failed`；
    /// - 其余情况维持 `InProgress`。
    pub fn poll(&mut self) -> Result<HomingState, DriverError> {
        if self.state != HomingState::InProgress {
            return Ok(self.state);
        }

        let flags = self.session.poll_status()?;

        if flags.homing_failed() {
            warn!(addr = self.session.addr(), "device reported homing failure");
            self.finish(HomingState::Failed(HomingFailure::DeviceFault));
            return Ok(self.state);
        }
        if flags.homing_complete() && !flags.homing_in_progress() {
            debug!(addr = self.session.addr(), "homing complete");
            self.finish(HomingState::Completed);
            return Ok(self.state);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(addr = self.session.addr(), "homing timed out, forcing stop");
            // 尽力让设备退出回零；失败只记日志，不掩盖超时本身
            if let Err(e) = self.session.exchange_raw(Opcode::ForceStopHoming, Vec::new()) {
                warn!(addr = self.session.addr(), error = %e, "force stop after timeout failed");
            }
            self.finish(HomingState::Failed(HomingFailure::Timeout));
            return Ok(self.state);
        }
        Ok(HomingState::InProgress)
    }

    /// 阻塞直到终态
    ///
    /// 以固定间隔轮询（间隔见 [`Self::with_poll_interval`]）。
    pub fn wait(&mut self) -> Result<HomingState, DriverError> {
        loop {
            let state = self.poll()?;
            if state.is_terminal() {
                return Ok(state);
            }
            spin_sleep::sleep(self.poll_interval);
        }
    }

    /// 显式中止回零
    ///
    /// 只有 `InProgress` 会被中止为 `Aborted`；其他状态下是空操作。
    pub fn force_stop(&mut self) -> Result<(), DriverError> {
        if self.state != HomingState::InProgress {
            return Ok(());
        }
        self.session.exchange_raw(Opcode::ForceStopHoming, Vec::new())?;
        info!(addr = self.session.addr(), "homing aborted");
        self.finish(HomingState::Aborted);
        Ok(())
    }

    fn finish(&mut self, terminal: HomingState) {
        self.state = terminal;
        self.deadline = None;
        if self.session.state() == MotorState::Homing {
            self.session.mark_state(MotorState::Enabled);
        }
    }
}
