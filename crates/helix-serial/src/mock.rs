//! 虚拟驱动板仿真（测试用）
//!
//! [`MockGateway`] 在进程内模拟串口网关加若干闭环步进驱动板：解析
//! 主机写入的请求帧，推进每台虚拟电机的状态，并把响应帧放进读缓冲。
//! 测试通过注入开关（静默、坏帧、错误应答方、堵转）覆盖各失败路径。
//!
//! 仿真时间以状态轮询为节拍：每次 `ReadStatusFlags` 推进一格，运动
//! 与回零分别在 `move_ticks` / `homing_ticks` 格后完成。这让等待循环
//! 的测试不依赖真实时钟。

use crate::{SerialAdapter, SerialError};
use helix_protocol::{
    AggregateCommand, AggregateFrame, DriveParameters, EnableCommand, FrameDecoder,
    GatewayResponse, GatewayStatus, HomingCommand, MotorStatusFlags, Opcode,
    PositionDirectCommand, PositionTrapezoidCommand, RawFrame, SpeedCommand, TlvTag,
    TorqueCommand, find_tlv, BROADCAST_ADDR, ERR_DEVICE_BUSY, ERR_DOWNSTREAM_ACK_MISSING,
    FRAME_TYPE_REQUEST,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// 虚拟电机
#[derive(Debug, Clone)]
pub struct VirtualMotor {
    pub position_deg: f64,
    pub target_deg: f64,
    pub speed_rpm: f64,
    pub current_a: f64,
    pub temperature_c: f64,
    pub bus_voltage_v: f64,
    pub enabled: bool,
    pub in_position: bool,
    pub stall_detected: bool,
    pub stall_protection: bool,
    pub homing_in_progress: bool,
    pub homing_complete: bool,
    pub homing_failed: bool,
    pub encoder_ready: bool,
    pub encoder_calibrated: bool,
    pub position_error: bool,
    pub drive_params: DriveParameters,
    /// 下一次回零是否失败（模拟找不到限位/碰撞）
    pub fail_next_homing: bool,
    move_ticks_left: u32,
    homing_ticks_left: u32,
}

impl Default for VirtualMotor {
    fn default() -> Self {
        Self {
            position_deg: 0.0,
            target_deg: 0.0,
            speed_rpm: 0.0,
            current_a: 0.0,
            temperature_c: 32.0,
            bus_voltage_v: 24.0,
            enabled: false,
            in_position: true,
            stall_detected: false,
            stall_protection: false,
            homing_in_progress: false,
            homing_complete: false,
            homing_failed: false,
            encoder_ready: true,
            encoder_calibrated: true,
            position_error: false,
            drive_params: DriveParameters::default(),
            fail_next_homing: false,
            move_ticks_left: 0,
            homing_ticks_left: 0,
        }
    }
}

impl VirtualMotor {
    fn status_flags(&self) -> MotorStatusFlags {
        let mut flags = MotorStatusFlags::default();
        flags.set_enabled(self.enabled);
        flags.set_in_position(self.in_position);
        flags.set_stall_detected(self.stall_detected);
        flags.set_stall_protection(self.stall_protection);
        flags.set_homing_in_progress(self.homing_in_progress);
        flags.set_homing_complete(self.homing_complete);
        flags.set_homing_failed(self.homing_failed);
        flags.set_encoder_ready(self.encoder_ready);
        flags.set_encoder_calibrated(self.encoder_calibrated);
        flags.set_position_error(self.position_error);
        flags
    }

    /// 推进一格仿真时间（每次状态轮询调用）
    fn tick(&mut self) {
        if self.homing_ticks_left > 0 {
            self.homing_ticks_left -= 1;
            if self.homing_ticks_left == 0 {
                self.homing_in_progress = false;
                if self.fail_next_homing {
                    self.fail_next_homing = false;
                    self.homing_failed = true;
                } else {
                    self.homing_complete = true;
                    self.position_deg = 0.0;
                    self.target_deg = 0.0;
                    self.in_position = true;
                }
            }
        } else if self.move_ticks_left > 0 {
            self.move_ticks_left -= 1;
            if self.move_ticks_left == 0 {
                self.position_deg = self.target_deg;
                self.in_position = true;
            }
        }
    }

    fn start_move(&mut self, target_deg: f64, absolute: bool, ticks: u32) {
        self.target_deg = if absolute {
            target_deg
        } else {
            self.position_deg + target_deg
        };
        self.in_position = false;
        self.move_ticks_left = ticks;
    }
}

struct GatewayState {
    motors: HashMap<u8, VirtualMotor>,
    /// 模拟"下游无应答"的电机（掉电/断线）
    silenced: HashSet<u8>,
    decoder: FrameDecoder,
    pending_rx: VecDeque<u8>,
    written_frames: Vec<Vec<u8>>,
    respond: bool,
    corrupt_next: bool,
    wrong_responder: Option<u8>,
    move_ticks: u32,
    homing_ticks: u32,
}

/// 虚拟网关
///
/// 克隆出的 [`MockSerialPort`] 与本句柄共享同一份状态，测试侧通过
/// 本句柄观察写入的帧并注入故障。
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl MockGateway {
    /// 创建带给定电机地址的虚拟网关
    pub fn new(motor_ids: &[u8]) -> Self {
        let motors = motor_ids.iter().map(|&id| (id, VirtualMotor::default())).collect();
        Self {
            state: Arc::new(Mutex::new(GatewayState {
                motors,
                silenced: HashSet::new(),
                decoder: FrameDecoder::new(),
                pending_rx: VecDeque::new(),
                written_frames: Vec::new(),
                respond: true,
                corrupt_next: false,
                wrong_responder: None,
                move_ticks: 2,
                homing_ticks: 2,
            })),
        }
    }

    /// 取一个挂在本网关上的串口适配器
    pub fn adapter(&self) -> MockSerialPort {
        MockSerialPort {
            state: self.state.clone(),
        }
    }

    /// 开/关应答（关闭后请求被吞掉，用于超时测试）
    pub fn set_respond(&self, respond: bool) {
        self.state.lock().respond = respond;
    }

    /// 下一条响应注入 CRC 损坏
    pub fn corrupt_next_response(&self) {
        self.state.lock().corrupt_next = true;
    }

    /// 下一条响应伪装成另一台电机
    pub fn wrong_responder_next(&self, motor_id: u8) {
        self.state.lock().wrong_responder = Some(motor_id);
    }

    /// 运动完成所需的轮询格数
    pub fn set_move_ticks(&self, ticks: u32) {
        self.state.lock().move_ticks = ticks;
    }

    /// 回零完成所需的轮询格数
    pub fn set_homing_ticks(&self, ticks: u32) {
        self.state.lock().homing_ticks = ticks;
    }

    /// 让某台电机在下游总线上失联（单播与聚合主应答都不再回 ACK）
    pub fn silence_motor(&self, motor_id: u8) {
        self.state.lock().silenced.insert(motor_id);
    }

    /// 注入堵转保护触发
    pub fn inject_stall(&self, motor_id: u8) {
        self.with_motor(motor_id, |m| {
            m.stall_detected = true;
            m.stall_protection = true;
            m.in_position = true;
            m.move_ticks_left = 0;
        });
    }

    /// 读取虚拟电机快照
    pub fn motor(&self, motor_id: u8) -> VirtualMotor {
        self.state.lock().motors.get(&motor_id).cloned().unwrap_or_default()
    }

    /// 修改虚拟电机状态
    pub fn with_motor(&self, motor_id: u8, f: impl FnOnce(&mut VirtualMotor)) {
        if let Some(m) = self.state.lock().motors.get_mut(&motor_id) {
            f(m);
        }
    }

    /// 主机写入过的原始帧（每次 `write_all` 一条）
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().written_frames.clone()
    }

    /// 写入过的聚合帧数量
    pub fn aggregate_frames_written(&self) -> usize {
        let state = self.state.lock();
        state
            .written_frames
            .iter()
            .filter(|bytes| {
                let mut dec = FrameDecoder::new();
                dec.extend(bytes);
                matches!(
                    dec.try_decode(),
                    Ok(Some(raw)) if find_tlv(&raw.payload, TlvTag::Opcode)
                        == Some(&[u8::from(Opcode::AggregateMotion)][..])
                )
            })
            .count()
    }
}

/// 挂在虚拟网关上的串口适配器
pub struct MockSerialPort {
    state: Arc<Mutex<GatewayState>>,
}

impl SerialAdapter for MockSerialPort {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        state.written_frames.push(bytes.to_vec());
        state.decoder.extend(bytes);
        loop {
            match state.decoder.try_decode() {
                Ok(Some(raw)) => handle_request(&mut state, raw),
                Ok(None) => break,
                Err(_) => break, // 主机写坏帧：真实网关只会沉默
            }
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        {
            let mut state = self.state.lock();
            if !state.pending_rx.is_empty() {
                let n = buf.len().min(state.pending_rx.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.pending_rx.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
        }
        // 无数据：礼貌地睡一小段，避免调用方忙等
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(0)
    }

    fn clear_input(&mut self) -> Result<(), SerialError> {
        self.state.lock().pending_rx.clear();
        Ok(())
    }
}

fn handle_request(state: &mut GatewayState, raw: RawFrame) {
    if raw.frame_type != FRAME_TYPE_REQUEST {
        return;
    }
    let payload = raw.payload.as_slice();
    let Some(motor_id) = find_tlv(payload, TlvTag::MotorId).and_then(|v| v.first().copied()) else {
        return;
    };
    let Some(opcode) = find_tlv(payload, TlvTag::Opcode)
        .and_then(|v| v.first().copied())
        .and_then(|v| Opcode::try_from(v).ok())
    else {
        return;
    };
    let args = find_tlv(payload, TlvTag::Args).unwrap_or(&[]).to_vec();

    if !state.respond {
        return;
    }

    let response = dispatch(state, raw.seq, motor_id, opcode, &args);
    let Some(mut response) = response else {
        return; // 纯广播：不产生逐设备应答
    };

    if let Some(fake_id) = state.wrong_responder.take() {
        response.motor_id = Some(fake_id);
    }
    let mut bytes = response.encode();
    if state.corrupt_next {
        state.corrupt_next = false;
        let idx = bytes.len() - 3; // 最后一个载荷字节，CRC 必然失配
        bytes[idx] ^= 0xFF;
    }
    state.pending_rx.extend(bytes);
}

fn dispatch(
    state: &mut GatewayState,
    seq: u16,
    motor_id: u8,
    opcode: Opcode,
    args: &[u8],
) -> Option<GatewayResponse> {
    if motor_id == BROADCAST_ADDR {
        if opcode == Opcode::AggregateMotion {
            return Some(handle_aggregate(state, seq, args));
        }
        // 非聚合广播：所有电机执行，无应答
        let ids: Vec<u8> = state.motors.keys().copied().collect();
        for id in ids {
            let move_ticks = state.move_ticks;
            let homing_ticks = state.homing_ticks;
            if let Some(m) = state.motors.get_mut(&id) {
                let _ = apply_unicast(m, opcode, args, move_ticks, homing_ticks);
            }
        }
        return None;
    }

    let move_ticks = state.move_ticks;
    let homing_ticks = state.homing_ticks;
    if state.silenced.contains(&motor_id) {
        return Some(GatewayResponse::error(
            seq,
            motor_id,
            GatewayStatus::DownstreamTimeout,
            ERR_DOWNSTREAM_ACK_MISSING,
        ));
    }
    let Some(motor) = state.motors.get_mut(&motor_id) else {
        return Some(GatewayResponse::error(
            seq,
            motor_id,
            GatewayStatus::DownstreamTimeout,
            ERR_DOWNSTREAM_ACK_MISSING,
        ));
    };

    Some(match apply_unicast(motor, opcode, args, move_ticks, homing_ticks) {
        Ok(data) => GatewayResponse::ok(seq, motor_id, data),
        Err((status, err_code)) => GatewayResponse::error(seq, motor_id, status, err_code),
    })
}

type DeviceReply = Result<Vec<u8>, (GatewayStatus, u16)>;

fn apply_unicast(
    m: &mut VirtualMotor,
    opcode: Opcode,
    args: &[u8],
    move_ticks: u32,
    homing_ticks: u32,
) -> DeviceReply {
    match opcode {
        Opcode::Enable => {
            let cmd = EnableCommand::from_args(args).map_err(invalid)?;
            m.enabled = cmd.enabled;
            Ok(Vec::new())
        }
        Opcode::Stop => {
            m.move_ticks_left = 0;
            m.speed_rpm = 0.0;
            m.in_position = true;
            Ok(Vec::new())
        }
        Opcode::SpeedMode => {
            reject_if_protected(m)?;
            let cmd = SpeedCommand::from_args(args).map_err(invalid)?;
            m.speed_rpm = cmd.rpm;
            m.in_position = false;
            m.move_ticks_left = 0; // 持续转动，直到 Stop
            Ok(Vec::new())
        }
        Opcode::TorqueMode => {
            reject_if_protected(m)?;
            let cmd = TorqueCommand::from_args(args).map_err(invalid)?;
            m.current_a = cmd.current_ma as f64 / 1000.0;
            m.in_position = false;
            m.move_ticks_left = 0;
            Ok(Vec::new())
        }
        Opcode::PositionDirect => {
            reject_if_protected(m)?;
            let cmd = PositionDirectCommand::from_args(args).map_err(invalid)?;
            m.start_move(cmd.position_deg, cmd.absolute, move_ticks);
            Ok(Vec::new())
        }
        Opcode::PositionTrapezoid => {
            reject_if_protected(m)?;
            let cmd = PositionTrapezoidCommand::from_args(args).map_err(invalid)?;
            m.start_move(cmd.position_deg, cmd.absolute, move_ticks);
            Ok(Vec::new())
        }
        Opcode::TriggerHoming => {
            let _cmd = HomingCommand::from_args(args).map_err(invalid)?;
            if !m.encoder_ready {
                return Err((GatewayStatus::InvalidRequest, 0));
            }
            m.homing_in_progress = true;
            m.homing_complete = false;
            m.homing_failed = false;
            m.homing_ticks_left = homing_ticks;
            Ok(Vec::new())
        }
        Opcode::ForceStopHoming => {
            m.homing_in_progress = false;
            m.homing_ticks_left = 0;
            Ok(Vec::new())
        }
        Opcode::SetZeroPosition | Opcode::ClearPosition => {
            m.position_deg = 0.0;
            m.target_deg = 0.0;
            Ok(Vec::new())
        }
        Opcode::ReleaseStallProtection => {
            m.stall_detected = false;
            m.stall_protection = false;
            Ok(Vec::new())
        }
        Opcode::ReadPosition => Ok((m.position_deg as f32).to_le_bytes().to_vec()),
        Opcode::ReadSpeed => Ok((m.speed_rpm as f32).to_le_bytes().to_vec()),
        Opcode::ReadTemperature => Ok((m.temperature_c as f32).to_le_bytes().to_vec()),
        Opcode::ReadBusVoltage => Ok((m.bus_voltage_v as f32).to_le_bytes().to_vec()),
        Opcode::ReadCurrent => Ok((m.current_a as f32).to_le_bytes().to_vec()),
        Opcode::ReadPositionError => Ok(0.0f32.to_le_bytes().to_vec()),
        Opcode::ReadStatusFlags => {
            m.tick();
            Ok(m.status_flags().to_bytes().to_vec())
        }
        Opcode::ReadVersion => {
            let mut data = Vec::with_capacity(4);
            data.extend_from_slice(&125u16.to_be_bytes());
            data.extend_from_slice(&100u16.to_be_bytes());
            Ok(data)
        }
        Opcode::ReadDriveParameters => Ok(m.drive_params.to_raw()),
        Opcode::ModifyDriveParameters => {
            if args.is_empty() {
                return Err((GatewayStatus::InvalidRequest, 0));
            }
            m.drive_params = DriveParameters::from_raw(&args[1..]).map_err(invalid)?;
            Ok(Vec::new())
        }
        Opcode::AggregateMotion => Err((GatewayStatus::InvalidRequest, 0)), // 只接受广播形式
    }
}

fn handle_aggregate(state: &mut GatewayState, seq: u16, args: &[u8]) -> GatewayResponse {
    let frame = match AggregateFrame::from_args(args) {
        Ok(f) => f,
        Err(_) => {
            return GatewayResponse::error(seq, BROADCAST_ADDR, GatewayStatus::InvalidRequest, 0);
        }
    };

    let move_ticks = state.move_ticks;
    for (motor_id, cmd) in &frame.members {
        // 失联的电机收不到广播部分
        if state.silenced.contains(motor_id) {
            continue;
        }
        if let Some(m) = state.motors.get_mut(motor_id) {
            match *cmd {
                AggregateCommand::Position {
                    position_deg,
                    speed_rpm: _,
                    absolute,
                } => m.start_move(position_deg, absolute, move_ticks),
                AggregateCommand::Speed { rpm, .. } => {
                    m.speed_rpm = rpm;
                    m.in_position = false;
                }
                AggregateCommand::Enable { enabled } => m.enabled = enabled,
            }
        }
    }

    if state.motors.contains_key(&frame.primary_ack_id)
        && !state.silenced.contains(&frame.primary_ack_id)
    {
        GatewayResponse::ok(seq, frame.primary_ack_id, Vec::new())
    } else {
        // 主应答者不存在：下游 ACK 缺失
        GatewayResponse::error(
            seq,
            frame.primary_ack_id,
            GatewayStatus::DownstreamTimeout,
            ERR_DOWNSTREAM_ACK_MISSING,
        )
    }
}

fn invalid(_: helix_protocol::ProtocolError) -> (GatewayStatus, u16) {
    (GatewayStatus::InvalidRequest, 0)
}

fn reject_if_protected(m: &VirtualMotor) -> Result<(), (GatewayStatus, u16)> {
    if m.stall_protection {
        return Err((GatewayStatus::Busy, ERR_DEVICE_BUSY));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_protocol::{GatewayRequest, HomingMode};

    fn request_bytes(motor_id: u8, opcode: Opcode, args: Vec<u8>, seq: u16) -> Vec<u8> {
        GatewayRequest::new(motor_id, opcode, args).encode(seq)
    }

    fn read_response(port: &mut MockSerialPort) -> GatewayResponse {
        let mut dec = FrameDecoder::new();
        let mut buf = [0u8; 256];
        let n = port.read_available(&mut buf, Duration::from_millis(10)).unwrap();
        dec.extend(&buf[..n]);
        GatewayResponse::parse(&dec.try_decode().unwrap().unwrap()).unwrap()
    }

    #[test]
    fn test_enable_then_status_poll() {
        let gw = MockGateway::new(&[1]);
        let mut port = gw.adapter();

        port.write_all(&request_bytes(1, Opcode::Enable, EnableCommand { enabled: true }.to_args(), 1))
            .unwrap();
        let resp = read_response(&mut port);
        assert_eq!(resp.status, GatewayStatus::Ok);
        assert!(gw.motor(1).enabled);
    }

    #[test]
    fn test_move_completes_after_ticks() {
        let gw = MockGateway::new(&[1]);
        gw.set_move_ticks(2);
        let mut port = gw.adapter();

        let cmd = PositionDirectCommand {
            position_deg: 90.0,
            speed_rpm: 200.0,
            absolute: true,
        };
        port.write_all(&request_bytes(1, Opcode::PositionDirect, cmd.to_args().unwrap(), 1))
            .unwrap();
        let _ = read_response(&mut port);
        assert!(!gw.motor(1).in_position);

        // 两次状态轮询后到位
        for seq in 2..4 {
            port.write_all(&request_bytes(1, Opcode::ReadStatusFlags, vec![], seq)).unwrap();
            let _ = read_response(&mut port);
        }
        let m = gw.motor(1);
        assert!(m.in_position);
        assert_eq!(m.position_deg, 90.0);
    }

    #[test]
    fn test_unknown_motor_gets_downstream_timeout() {
        let gw = MockGateway::new(&[1]);
        let mut port = gw.adapter();
        port.write_all(&request_bytes(9, Opcode::ReadPosition, vec![], 1)).unwrap();
        let resp = read_response(&mut port);
        assert_eq!(resp.status, GatewayStatus::DownstreamTimeout);
        assert_eq!(resp.err_code, ERR_DOWNSTREAM_ACK_MISSING);
    }

    #[test]
    fn test_stall_protection_rejects_motion() {
        let gw = MockGateway::new(&[1]);
        gw.inject_stall(1);
        let mut port = gw.adapter();

        let cmd = PositionDirectCommand {
            position_deg: 10.0,
            speed_rpm: 100.0,
            absolute: true,
        };
        port.write_all(&request_bytes(1, Opcode::PositionDirect, cmd.to_args().unwrap(), 1))
            .unwrap();
        let resp = read_response(&mut port);
        assert_eq!(resp.status, GatewayStatus::Busy);
        assert_eq!(resp.err_code, ERR_DEVICE_BUSY);
    }

    #[test]
    fn test_aggregate_moves_all_members() {
        let gw = MockGateway::new(&[1, 2]);
        let mut port = gw.adapter();

        let frame = AggregateFrame::new(
            1,
            [
                (1, AggregateCommand::Position { position_deg: 90.0, speed_rpm: 1000.0, absolute: true }),
                (2, AggregateCommand::Position { position_deg: -45.0, speed_rpm: 1000.0, absolute: true }),
            ],
        );
        port.write_all(&request_bytes(
            BROADCAST_ADDR,
            Opcode::AggregateMotion,
            frame.to_args().unwrap(),
            1,
        ))
        .unwrap();

        let resp = read_response(&mut port);
        assert_eq!(resp.status, GatewayStatus::Ok);
        assert_eq!(resp.motor_id, Some(1));
        assert!(!gw.motor(1).in_position);
        assert_eq!(gw.motor(2).target_deg, -45.0);
    }

    #[test]
    fn test_homing_completes_and_zeroes() {
        let gw = MockGateway::new(&[1]);
        gw.set_homing_ticks(2);
        gw.with_motor(1, |m| m.position_deg = 123.4);
        let mut port = gw.adapter();

        let homing = HomingCommand {
            mode: HomingMode::NearestDirection,
            collision_detection: false,
        };
        port.write_all(&request_bytes(1, Opcode::TriggerHoming, homing.to_args(), 1)).unwrap();
        let _ = read_response(&mut port);
        assert!(gw.motor(1).homing_in_progress);

        for seq in 2..4 {
            port.write_all(&request_bytes(1, Opcode::ReadStatusFlags, vec![], seq)).unwrap();
            let _ = read_response(&mut port);
        }
        let m = gw.motor(1);
        assert!(m.homing_complete);
        assert_eq!(m.position_deg, 0.0);
    }
}
