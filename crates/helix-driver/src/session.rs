//! 电机会话与运行时状态机
//!
//! 一个 [`MotorSession`] 绑定一条共享传输上的一个单播地址，持有该
//! 电机的逻辑状态：使能、最近读数、故障标志、回零快照。状态机：
//!
//! ```text
//! Disconnected → Disabled → Enabled → {Moving, Stalled, Homing}
//! ```
//!
//! `Enabled` 是枢纽状态，所有运动状态最终回到它。运动命令只有在
//! 成功收到 ACK 后才把状态推进到 `Moving`——超时的调用让会话停留
//! 在调用前的状态。
//!
//! 会话设计为单一逻辑属主驱动（方法取 `&mut self`）；监督线程通过
//! [`MotorSession::watch`] 拿到的只读句柄读取缓存状态，读取路径与
//! 传输锁完全无关。

use crate::calibration::JointCalibration;
use crate::error::DriverError;
use arc_swap::ArcSwap;
use helix_protocol::{
    DeviceFault, DriveParameters, EnableCommand, GatewayRequest, GatewayResponse, GatewayStatus,
    MotorStatusFlags, Opcode, PositionDirectCommand, PositionTrapezoidCommand, SetZeroCommand,
    SpeedCommand, StopCommand, TorqueCommand, VersionInfo, parse_f32, BROADCAST_ADDR,
    ERR_DEVICE_BUSY,
};
use helix_serial::Transport;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 会话运行时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    /// 未连接（初始与终止状态）
    Disconnected,
    /// 已连接，未使能
    Disabled,
    /// 已连接且使能（枢纽状态）
    Enabled,
    /// 运动中（位置/速度/力矩命令已被确认）
    Moving,
    /// 堵转保护已触发，需显式解除
    Stalled,
    /// 回零进行中
    Homing,
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MotorState::Disconnected => "Disconnected",
            MotorState::Disabled => "Disabled",
            MotorState::Enabled => "Enabled",
            MotorState::Moving => "Moving",
            MotorState::Stalled => "Stalled",
            MotorState::Homing => "Homing",
        };
        f.write_str(s)
    }
}

/// 缓存的电机读数快照
///
/// 位置/速度已换算到关节空间。
#[derive(Debug, Clone, Default)]
pub struct MotorReadings {
    /// 最近读到的关节角（度）
    pub position_deg: f64,
    /// 最近读到的关节转速（RPM）
    pub speed_rpm: f64,
    /// 最近读到的相电流（A）
    pub current_a: f64,
    /// 最近一次状态轮询的标志位
    pub flags: MotorStatusFlags,
    /// 持久化的设备故障（独立轮询方无需触发命令也能观测到）
    pub last_fault: Option<DeviceFault>,
    /// 最近更新时刻
    pub updated: Option<Instant>,
}

/// 只读观察句柄
///
/// 读取的是 `ArcSwap` 快照，永远不会触碰传输锁，适合监督循环高频
/// 调用。
#[derive(Clone)]
pub struct MotorWatch {
    readings: Arc<ArcSwap<MotorReadings>>,
}

impl MotorWatch {
    /// 当前缓存快照
    pub fn snapshot(&self) -> MotorReadings {
        (**self.readings.load()).clone()
    }

    /// 持久化的设备故障
    pub fn fault(&self) -> Option<DeviceFault> {
        self.readings.load().last_fault
    }
}

/// 电机会话
pub struct MotorSession {
    addr: u8,
    transport: Transport,
    calibration: JointCalibration,
    state: MotorState,
    readings: Arc<ArcSwap<MotorReadings>>,
    timeout: Duration,
}

impl MotorSession {
    /// 默认单次交换超时
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

    /// 绑定地址，创建会话（恒等标定）
    pub fn connect(transport: &Transport, addr: u8) -> Result<Self, DriverError> {
        Self::connect_with(transport, addr, JointCalibration::default())
    }

    /// 绑定地址，创建会话（带标定系数）
    ///
    /// 同一传输上的单播地址必须唯一，冲突返回
    /// [`DriverError::DuplicateAddress`]，且不影响已有会话。
    pub fn connect_with(
        transport: &Transport,
        addr: u8,
        calibration: JointCalibration,
    ) -> Result<Self, DriverError> {
        if addr == BROADCAST_ADDR {
            return Err(DriverError::InvalidParameter {
                name: "addr".to_string(),
                reason: "address 0 is reserved for broadcast".to_string(),
            });
        }
        if !transport.claim_address(addr) {
            return Err(DriverError::DuplicateAddress {
                addr,
                port: transport.port_name().to_string(),
            });
        }
        info!(addr, port = transport.port_name(), "motor session connected");
        Ok(Self {
            addr,
            transport: transport.clone(),
            calibration,
            state: MotorState::Disabled,
            readings: Arc::new(ArcSwap::from_pointee(MotorReadings::default())),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// 设置单次交换超时
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// 电机地址
    pub fn addr(&self) -> u8 {
        self.addr
    }

    /// 当前状态
    pub fn state(&self) -> MotorState {
        self.state
    }

    /// 标定系数
    pub fn calibration(&self) -> JointCalibration {
        self.calibration
    }

    /// 所绑定的传输
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// 缓存读数快照
    pub fn readings(&self) -> MotorReadings {
        (**self.readings.load()).clone()
    }

    /// 只读观察句柄（可跨线程克隆）
    pub fn watch(&self) -> MotorWatch {
        MotorWatch {
            readings: self.readings.clone(),
        }
    }

    // ==================== 连接生命周期 ====================

    /// 断开会话
    ///
    /// 释放地址与传输引用。**不会**向设备发送任何断电命令：无抱闸
    /// 关节在失能瞬间会在重力下跌落，断电必须由调用方显式决定
    /// （见 [`MotorSession::disable`]）。
    pub fn disconnect(&mut self) {
        if self.state == MotorState::Disconnected {
            return;
        }
        self.transport.release_address(self.addr);
        self.transport.close();
        self.state = MotorState::Disconnected;
        info!(addr = self.addr, "motor session disconnected (holding torque preserved)");
    }

    // ==================== 使能控制 ====================

    /// 使能（上电保持）
    ///
    /// 已使能时是无害的空操作。
    pub fn enable(&mut self) -> Result<(), DriverError> {
        self.ensure_connected("enable")?;
        if self.state != MotorState::Disabled {
            return Ok(());
        }
        self.exchange(Opcode::Enable, EnableCommand { enabled: true }.to_args())?;
        self.state = MotorState::Enabled;
        debug!(addr = self.addr, "motor enabled");
        Ok(())
    }

    /// 失能（断电）
    ///
    /// **危险**：对没有机械抱闸的关节，这会移除对抗重力的唯一力矩。
    /// 需要停住而非断电时，请使用 [`MotorSession::stop`]。本方法不会
    /// 被任何其他路径（错误处理、Drop、断开）隐式调用。
    ///
    /// 已失能时是无害的空操作；运动中或回零中必须先停止。
    pub fn disable(&mut self) -> Result<(), DriverError> {
        self.ensure_connected("disable")?;
        match self.state {
            MotorState::Disabled => Ok(()),
            MotorState::Moving | MotorState::Homing => Err(DriverError::InvalidState {
                op: "disable",
                state: self.state,
            }),
            _ => {
                self.exchange(Opcode::Enable, EnableCommand { enabled: false }.to_args())?;
                self.state = MotorState::Disabled;
                warn!(addr = self.addr, "motor de-energized");
                Ok(())
            }
        }
    }

    /// 停止运动，保持使能与保持力矩
    ///
    /// 已停止/已失能时是无害的空操作。
    pub fn stop(&mut self) -> Result<(), DriverError> {
        self.ensure_connected("stop")?;
        match self.state {
            MotorState::Disabled | MotorState::Stalled => Ok(()),
            MotorState::Homing => {
                self.exchange(Opcode::ForceStopHoming, Vec::new())?;
                self.state = MotorState::Enabled;
                Ok(())
            }
            _ => {
                self.exchange(Opcode::Stop, StopCommand.to_args())?;
                self.state = MotorState::Enabled;
                Ok(())
            }
        }
    }

    // ==================== 运动控制 ====================

    /// 位置直通（限速直达）
    ///
    /// `joint_deg` 是关节角；`absolute` 为假时表示相对当前位置的
    /// 增量。命令被确认后会话进入 `Moving`，到位由
    /// [`MotorSession::poll_status`] 观测并收回 `Enabled`。
    pub fn move_to_position(
        &mut self,
        joint_deg: f64,
        speed_rpm: f64,
        absolute: bool,
    ) -> Result<(), DriverError> {
        self.ensure_motion_allowed("move_to_position")?;
        let cmd = PositionDirectCommand {
            position_deg: self.calibration.joint_to_motor(joint_deg),
            speed_rpm: self.calibration.joint_to_motor(speed_rpm).abs(),
            absolute,
        };
        self.exchange(Opcode::PositionDirect, cmd.to_args()?)?;
        self.state = MotorState::Moving;
        debug!(addr = self.addr, joint_deg, speed_rpm, absolute, "position command accepted");
        Ok(())
    }

    /// 位置梯形曲线（带加减速规划）
    pub fn move_to_position_trapezoid(
        &mut self,
        joint_deg: f64,
        max_speed_rpm: f64,
        accel_rpm_s: u16,
        decel_rpm_s: u16,
        absolute: bool,
    ) -> Result<(), DriverError> {
        self.ensure_motion_allowed("move_to_position_trapezoid")?;
        let cmd = PositionTrapezoidCommand {
            position_deg: self.calibration.joint_to_motor(joint_deg),
            max_speed_rpm: self.calibration.joint_to_motor(max_speed_rpm).abs(),
            accel_rpm_s,
            decel_rpm_s,
            absolute,
        };
        self.exchange(Opcode::PositionTrapezoid, cmd.to_args()?)?;
        self.state = MotorState::Moving;
        Ok(())
    }

    /// 速度模式（符号编码方向）
    ///
    /// 设备瞬态忙（高频下发时常见）不视为失败：命令丢弃，调用方在
    /// 下一控制周期重发即可。
    pub fn set_speed(&mut self, joint_rpm: f64, accel_rpm_s: u16) -> Result<(), DriverError> {
        self.ensure_motion_allowed("set_speed")?;
        let cmd = SpeedCommand {
            rpm: self.calibration.joint_to_motor(joint_rpm),
            accel_rpm_s,
        };
        match self.exchange(Opcode::SpeedMode, cmd.to_args()?) {
            Ok(_) => {
                self.state = MotorState::Moving;
                Ok(())
            }
            Err(DriverError::DeviceBusy { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 力矩/电流模式（有符号毫安）
    pub fn set_torque(&mut self, current_ma: i16, slope_ma_s: u16) -> Result<(), DriverError> {
        self.ensure_motion_allowed("set_torque")?;
        let signed = current_ma as i32 * self.calibration.direction() as i32;
        let cmd = TorqueCommand {
            current_ma: signed.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            slope_ma_s,
        };
        self.exchange(Opcode::TorqueMode, cmd.to_args())?;
        self.state = MotorState::Moving;
        Ok(())
    }

    /// 解除堵转保护
    ///
    /// 成功后清除持久化的堵转故障，`Stalled` 回到 `Enabled`。
    pub fn release_stall_protection(&mut self) -> Result<(), DriverError> {
        self.ensure_connected("release_stall_protection")?;
        self.exchange(Opcode::ReleaseStallProtection, Vec::new())?;
        self.update_readings(|r| {
            r.last_fault = None;
            let mut flags = r.flags;
            flags.set_stall_detected(false);
            flags.set_stall_protection(false);
            r.flags = flags;
        });
        if self.state == MotorState::Stalled {
            self.state = MotorState::Enabled;
        }
        info!(addr = self.addr, "stall protection released");
        Ok(())
    }

    // ==================== 零点 ====================

    /// 把当前原始位置捕获为逻辑零点（绕过回零流程）
    ///
    /// 除 `Disconnected` 外任何状态都合法。
    pub fn set_zero(&mut self, save_to_chip: bool) -> Result<(), DriverError> {
        self.ensure_connected("set_zero")?;
        self.exchange(Opcode::SetZeroPosition, SetZeroCommand { save_to_chip }.to_args())?;
        info!(addr = self.addr, save_to_chip, "zero position captured");
        Ok(())
    }

    /// 清零位置计数
    pub fn clear_position(&mut self) -> Result<(), DriverError> {
        self.ensure_connected("clear_position")?;
        self.exchange(Opcode::ClearPosition, Vec::new())?;
        Ok(())
    }

    // ==================== 状态读取 ====================

    /// 读取关节角（度）
    pub fn read_position(&mut self) -> Result<f64, DriverError> {
        self.ensure_connected("read_position")?;
        let data = self.exchange(Opcode::ReadPosition, Vec::new())?;
        let joint = self.calibration.motor_to_joint(parse_f32(&data)? as f64);
        self.update_readings(|r| r.position_deg = joint);
        Ok(joint)
    }

    /// 读取关节转速（RPM）
    pub fn read_speed(&mut self) -> Result<f64, DriverError> {
        self.ensure_connected("read_speed")?;
        let data = self.exchange(Opcode::ReadSpeed, Vec::new())?;
        let joint = self.calibration.motor_to_joint(parse_f32(&data)? as f64);
        self.update_readings(|r| r.speed_rpm = joint);
        Ok(joint)
    }

    /// 读取相电流（A）
    pub fn read_current(&mut self) -> Result<f64, DriverError> {
        self.ensure_connected("read_current")?;
        let data = self.exchange(Opcode::ReadCurrent, Vec::new())?;
        let amps = parse_f32(&data)? as f64;
        self.update_readings(|r| r.current_a = amps);
        Ok(amps)
    }

    /// 读取驱动板温度（°C）
    pub fn read_temperature(&mut self) -> Result<f64, DriverError> {
        self.ensure_connected("read_temperature")?;
        let data = self.exchange(Opcode::ReadTemperature, Vec::new())?;
        Ok(parse_f32(&data)? as f64)
    }

    /// 读取总线电压（V）
    pub fn read_bus_voltage(&mut self) -> Result<f64, DriverError> {
        self.ensure_connected("read_bus_voltage")?;
        let data = self.exchange(Opcode::ReadBusVoltage, Vec::new())?;
        Ok(parse_f32(&data)? as f64)
    }

    /// 读取位置误差（关节空间，度）
    pub fn read_position_error(&mut self) -> Result<f64, DriverError> {
        self.ensure_connected("read_position_error")?;
        let data = self.exchange(Opcode::ReadPositionError, Vec::new())?;
        Ok(self.calibration.motor_to_joint(parse_f32(&data)? as f64))
    }

    /// 读取固件/硬件版本
    pub fn read_version(&mut self) -> Result<VersionInfo, DriverError> {
        self.ensure_connected("read_version")?;
        let data = self.exchange(Opcode::ReadVersion, Vec::new())?;
        Ok(VersionInfo::parse(&data)?)
    }

    /// 读取驱动参数块
    pub fn read_drive_parameters(&mut self) -> Result<DriveParameters, DriverError> {
        self.ensure_connected("read_drive_parameters")?;
        let data = self.exchange(Opcode::ReadDriveParameters, Vec::new())?;
        Ok(DriveParameters::from_raw(&data)?)
    }

    /// 写入驱动参数块
    pub fn modify_drive_parameters(
        &mut self,
        params: DriveParameters,
        save_to_chip: bool,
    ) -> Result<(), DriverError> {
        self.ensure_connected("modify_drive_parameters")?;
        self.exchange(Opcode::ModifyDriveParameters, params.to_args(save_to_chip))?;
        info!(addr = self.addr, save_to_chip, "drive parameters updated");
        Ok(())
    }

    // ==================== 状态轮询 ====================

    /// 轮询状态标志并推进状态机（不把设备故障转成错误）
    ///
    /// 更新缓存快照；观测到堵转类故障时把会话置为 `Stalled` 并持久化
    /// 故障，但返回值仍是标志位本身——回零控制器等需要读标志而非
    /// 吃异常的调用方使用此方法。
    pub fn poll_status(&mut self) -> Result<MotorStatusFlags, DriverError> {
        self.ensure_connected("poll_status")?;
        let data = self.exchange(Opcode::ReadStatusFlags, Vec::new())?;
        let flags = MotorStatusFlags::parse(&data)?;
        let fault = flags.fault();

        self.update_readings(|r| {
            r.flags = flags;
            if fault.is_some() {
                r.last_fault = fault;
            }
        });

        match fault {
            Some(DeviceFault::Stalled | DeviceFault::StallProtection) => {
                if self.state != MotorState::Stalled {
                    warn!(addr = self.addr, ?fault, "stall reported by device");
                    self.state = MotorState::Stalled;
                }
            }
            _ => {
                if self.state == MotorState::Stalled && !flags.stall_protection() {
                    // 保护被外部路径解除
                    self.state = MotorState::Enabled;
                } else if self.state == MotorState::Moving && flags.in_position() {
                    self.state = MotorState::Enabled;
                } else if self.state == MotorState::Homing && !flags.homing_in_progress() {
                    self.state = MotorState::Enabled;
                }
                if !flags.enabled()
                    && matches!(self.state, MotorState::Enabled | MotorState::Moving)
                {
                    self.state = MotorState::Disabled;
                }
            }
        }
        Ok(flags)
    }

    /// 轮询状态，观测到设备故障时作为错误返回
    ///
    /// 故障同时持久化在缓存快照里（双重呈现：一次异常，一次状态）。
    pub fn refresh(&mut self) -> Result<MotorStatusFlags, DriverError> {
        let flags = self.poll_status()?;
        if let Some(fault) = flags.fault() {
            return Err(DriverError::Device {
                addr: self.addr,
                fault,
            });
        }
        Ok(flags)
    }

    /// 阻塞等待到位
    pub fn wait_for_in_position(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), DriverError> {
        self.ensure_connected("wait_for_in_position")?;
        let deadline = Instant::now() + timeout;
        loop {
            let flags = self.refresh()?;
            if flags.in_position() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Transport(helix_serial::SerialError::Timeout(
                    timeout,
                )));
            }
            spin_sleep::sleep(poll_interval);
        }
    }

    // ==================== 内部辅助 ====================

    fn ensure_connected(&self, op: &'static str) -> Result<(), DriverError> {
        if self.state == MotorState::Disconnected {
            return Err(DriverError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn ensure_motion_allowed(&self, op: &'static str) -> Result<(), DriverError> {
        match self.state {
            MotorState::Enabled | MotorState::Moving => Ok(()),
            MotorState::Stalled => Err(DriverError::Device {
                addr: self.addr,
                fault: self
                    .readings
                    .load()
                    .last_fault
                    .unwrap_or(DeviceFault::StallProtection),
            }),
            state => Err(DriverError::InvalidState { op, state }),
        }
    }

    fn exchange(&mut self, opcode: Opcode, args: Vec<u8>) -> Result<Vec<u8>, DriverError> {
        let request = GatewayRequest::new(self.addr, opcode, args)
            .with_timeout_ms(self.timeout.as_millis().min(u16::MAX as u128) as u16);
        let response = self.transport.exchange(&request, self.timeout)?;
        self.accept(response)
    }

    fn accept(&self, response: GatewayResponse) -> Result<Vec<u8>, DriverError> {
        match response.status {
            GatewayStatus::Ok => Ok(response.data),
            GatewayStatus::Busy if response.err_code == ERR_DEVICE_BUSY => {
                Err(DriverError::DeviceBusy { addr: self.addr })
            }
            status => {
                let err_hex = format!("0x{:04X}", response.err_code);
                warn!(
                    addr = self.addr,
                    ?status,
                    err_code = %err_hex,
                    diag = %hex_diag(&response.diag),
                    "gateway rejected request"
                );
                Err(DriverError::Gateway {
                    addr: self.addr,
                    status,
                    err_code: response.err_code,
                })
            }
        }
    }

    fn update_readings(&self, f: impl FnOnce(&mut MotorReadings)) {
        let mut next = (**self.readings.load()).clone();
        f(&mut next);
        next.updated = Some(Instant::now());
        self.readings.store(Arc::new(next));
    }

    /// 本 crate 内部使用的原始交换入口（回零控制器等）
    pub(crate) fn exchange_raw(
        &mut self,
        opcode: Opcode,
        args: Vec<u8>,
    ) -> Result<Vec<u8>, DriverError> {
        self.ensure_connected("exchange")?;
        self.exchange(opcode, args)
    }

    pub(crate) fn mark_moving(&mut self) {
        self.state = MotorState::Moving;
    }

    pub(crate) fn mark_state(&mut self, state: MotorState) {
        self.state = state;
    }
}

fn hex_diag(diag: &[u8]) -> String {
    if diag.is_empty() {
        "-".to_string()
    } else {
        hex::encode(diag)
    }
}

impl Drop for MotorSession {
    fn drop(&mut self) {
        // 只释放资源；永远不发送任何命令（尤其不失能）。
        if self.state != MotorState::Disconnected {
            self.transport.release_address(self.addr);
        }
    }
}

impl fmt::Debug for MotorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotorSession")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("port", &self.transport.port_name())
            .finish()
    }
}
