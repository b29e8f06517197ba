//! 网关帧的构建与增量解码
//!
//! 帧格式（主机 ↔ 网关，小端序）：
//!
//! ```text
//! 0x55 0xAA | ver(1) | type(1) | seq(2 LE) | len(2 LE) | payload | crc16(2 LE)
//! ```
//!
//! CRC-16/IBM 覆盖魔数之后的 6 字节帧头与全部载荷。载荷是 TLV 序列：
//! `tag(1) | len(2 LE) | value`。
//!
//! 串口线上可能存在残留噪声或半包，解码器以增量方式累积字节流，
//! 扫描魔数并在 CRC 校验失败时越过坏帧头重新同步。

use crate::crc::crc16_ibm;
use crate::opcodes::{DriverKind, GatewayStatus, Opcode};
use crate::ProtocolError;
use bytes::{Buf, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 帧起始魔数
pub const FRAME_MAGIC: [u8; 2] = [0x55, 0xAA];

/// 协议版本
pub const PROTOCOL_VERSION: u8 = 0x01;

/// 帧类型：请求
pub const FRAME_TYPE_REQUEST: u8 = 0x01;

/// 帧类型：响应
pub const FRAME_TYPE_RESPONSE: u8 = 0x02;

/// 广播地址（永远不是可寻址的设备）
pub const BROADCAST_ADDR: u8 = 0;

/// 载荷长度上限
///
/// len 字段超过该值视为损坏帧，避免解码器被一个坏长度卡住。
pub const MAX_PAYLOAD_LEN: usize = 2048;

// ============================================================================
// TLV
// ============================================================================

/// TLV 标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TlvTag {
    /// 目标电机 ID（请求）/ 响应方回显（响应）
    MotorId = 0x01,
    /// 驱动板类型
    Driver = 0x02,
    /// 操作码
    Opcode = 0x03,
    /// 网关侧下游超时（毫秒）
    TimeoutMs = 0x04,
    /// 命令参数字节
    Args = 0x05,
    /// 状态码
    Status = 0x10,
    /// 错误码
    ErrCode = 0x11,
    /// 响应数据
    Data = 0x12,
    /// 诊断信息
    Diag = 0x13,
}

fn push_tlv(out: &mut Vec<u8>, tag: TlvTag, value: &[u8]) {
    out.push(tag.into());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
}

/// 在 TLV 序列中查找指定标签的首个 value
///
/// 遇到截断的 TLV 直接停止，不报错：响应里缺某个可选标签是合法的。
pub fn find_tlv(buf: &[u8], tag: TlvTag) -> Option<&[u8]> {
    let want: u8 = tag.into();
    let mut i = 0;
    while i + 3 <= buf.len() {
        let t = buf[i];
        let len = u16::from_le_bytes([buf[i + 1], buf[i + 2]]) as usize;
        i += 3;
        if i + len > buf.len() {
            break;
        }
        if t == want {
            return Some(&buf[i..i + len]);
        }
        i += len;
    }
    None
}

// ============================================================================
// 请求帧
// ============================================================================

/// 网关请求
///
/// 单播（motor_id 1-255）请求恰好期待一个 ACK 帧或超时；
/// 广播（motor_id 0）请求不期待逐设备 ACK，聚合命令通过
/// "主应答者" 机制获得唯一一个 ACK（见 [`crate::aggregate`]）。
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// 目标电机 ID（0 = 广播）
    pub motor_id: u8,
    /// 驱动板类型
    pub driver: DriverKind,
    /// 操作码
    pub opcode: Opcode,
    /// 命令参数（驱动板原生编码，见 [`crate::command`]）
    pub args: Vec<u8>,
    /// 网关侧下游总线超时（毫秒）
    pub timeout_ms: u16,
}

impl GatewayRequest {
    /// 构建请求
    pub fn new(motor_id: u8, opcode: Opcode, args: Vec<u8>) -> Self {
        Self {
            motor_id,
            driver: DriverKind::default(),
            opcode,
            args,
            timeout_ms: 1000,
        }
    }

    /// 设置网关侧下游超时
    pub fn with_timeout_ms(mut self, timeout_ms: u16) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// 是否为广播请求
    pub fn is_broadcast(&self) -> bool {
        self.motor_id == BROADCAST_ADDR
    }

    /// 编码为线上帧
    ///
    /// `seq` 由传输层统一分配，保证同一连接上的请求/响应可以一一配对。
    pub fn encode(&self, seq: u16) -> Vec<u8> {
        let mut payload = Vec::with_capacity(24 + self.args.len());
        push_tlv(&mut payload, TlvTag::MotorId, &[self.motor_id]);
        push_tlv(&mut payload, TlvTag::Driver, &[self.driver.into()]);
        push_tlv(&mut payload, TlvTag::Opcode, &[self.opcode.into()]);
        push_tlv(&mut payload, TlvTag::TimeoutMs, &self.timeout_ms.to_le_bytes());
        push_tlv(&mut payload, TlvTag::Args, &self.args);

        encode_frame(FRAME_TYPE_REQUEST, seq, &payload)
    }
}

/// 编码一个完整帧（帧头 + 载荷 + CRC）
pub fn encode_frame(frame_type: u8, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut header = [0u8; 6];
    header[0] = PROTOCOL_VERSION;
    header[1] = frame_type;
    header[2..4].copy_from_slice(&seq.to_le_bytes());
    header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());

    let mut crc_input = Vec::with_capacity(6 + payload.len());
    crc_input.extend_from_slice(&header);
    crc_input.extend_from_slice(payload);
    let crc = crc16_ibm(&crc_input);

    let mut out = Vec::with_capacity(2 + 6 + payload.len() + 2);
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

// ============================================================================
// 响应帧
// ============================================================================

/// 已通过 CRC 校验的原始帧（类型 + 序号 + 载荷）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub frame_type: u8,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// 网关响应
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// 请求序号回显
    pub seq: u16,
    /// 状态码
    pub status: GatewayStatus,
    /// 错误码（status != Ok 时有意义）
    pub err_code: u16,
    /// 响应方电机 ID 回显（旧固件可能缺失）
    pub motor_id: Option<u8>,
    /// 响应数据
    pub data: Vec<u8>,
    /// 诊断字节（仅用于日志）
    pub diag: Vec<u8>,
}

impl GatewayResponse {
    /// 从原始帧解析响应
    pub fn parse(frame: &RawFrame) -> Result<Self, ProtocolError> {
        if frame.frame_type != FRAME_TYPE_RESPONSE {
            return Err(ProtocolError::UnexpectedResponder {
                reason: format!("frame type 0x{:02X} is not a response", frame.frame_type),
            });
        }

        let payload = frame.payload.as_slice();
        let status_raw = find_tlv(payload, TlvTag::Status).and_then(|v| v.first().copied()).ok_or(
            ProtocolError::InvalidLength {
                expected: 1,
                actual: 0,
            },
        )?;
        let status =
            GatewayStatus::try_from(status_raw).map_err(|_| ProtocolError::InvalidValue {
                field: "GatewayStatus".to_string(),
                value: status_raw as u32,
            })?;

        let err_code = find_tlv(payload, TlvTag::ErrCode)
            .filter(|v| v.len() >= 2)
            .map(|v| u16::from_le_bytes([v[0], v[1]]))
            .unwrap_or(0);
        let motor_id = find_tlv(payload, TlvTag::MotorId).and_then(|v| v.first().copied());
        let data = find_tlv(payload, TlvTag::Data).map(<[u8]>::to_vec).unwrap_or_default();
        let diag = find_tlv(payload, TlvTag::Diag).map(<[u8]>::to_vec).unwrap_or_default();

        Ok(Self {
            seq: frame.seq,
            status,
            err_code,
            motor_id,
            data,
            diag,
        })
    }

    /// 校验响应确实来自被寻址的设备
    ///
    /// - 序号必须与未决请求一致；
    /// - 单播请求若带有电机 ID 回显，回显必须等于目标地址。
    ///   广播/聚合请求的回显是主应答者的地址，由上层自行核对。
    pub fn check_responder(&self, request: &GatewayRequest, seq: u16) -> Result<(), ProtocolError> {
        if self.seq != seq {
            return Err(ProtocolError::UnexpectedResponder {
                reason: format!("seq mismatch: expected {}, got {}", seq, self.seq),
            });
        }
        if !request.is_broadcast()
            && let Some(echo) = self.motor_id
            && echo != request.motor_id
        {
            return Err(ProtocolError::UnexpectedResponder {
                reason: format!(
                    "motor id mismatch: addressed {}, answered {}",
                    request.motor_id, echo
                ),
            });
        }
        Ok(())
    }

    /// 编码为线上帧（网关 → 主机方向，mock 网关使用）
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(16 + self.data.len() + self.diag.len());
        push_tlv(&mut payload, TlvTag::Status, &[self.status.into()]);
        push_tlv(&mut payload, TlvTag::ErrCode, &self.err_code.to_le_bytes());
        if let Some(id) = self.motor_id {
            push_tlv(&mut payload, TlvTag::MotorId, &[id]);
        }
        if !self.data.is_empty() {
            push_tlv(&mut payload, TlvTag::Data, &self.data);
        }
        if !self.diag.is_empty() {
            push_tlv(&mut payload, TlvTag::Diag, &self.diag);
        }
        encode_frame(FRAME_TYPE_RESPONSE, self.seq, &payload)
    }

    /// 构建一个成功响应（mock 网关使用）
    pub fn ok(seq: u16, motor_id: u8, data: Vec<u8>) -> Self {
        Self {
            seq,
            status: GatewayStatus::Ok,
            err_code: 0,
            motor_id: Some(motor_id),
            data,
            diag: Vec::new(),
        }
    }

    /// 构建一个失败响应（mock 网关使用）
    pub fn error(seq: u16, motor_id: u8, status: GatewayStatus, err_code: u16) -> Self {
        Self {
            seq,
            status,
            err_code,
            motor_id: Some(motor_id),
            data: Vec::new(),
            diag: Vec::new(),
        }
    }
}

// ============================================================================
// 增量解码器
// ============================================================================

/// 字节流增量解码器
///
/// 传输层把串口读到的字节喂给 [`FrameDecoder::extend`]，随后反复调用
/// [`FrameDecoder::try_decode`] 直到取出完整帧或确认数据不足。
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// 创建空解码器
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// 追加收到的字节
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// 丢弃全部缓冲内容
    ///
    /// 发送新请求前调用，避免旧的半包让解码器在噪声里找帧头。
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// 尝试取出一个完整帧
    ///
    /// - `Ok(Some(frame))`: 取出一帧（已通过 CRC 校验）
    /// - `Ok(None)`: 数据不足，需要继续读
    /// - `Err(FrameCorrupt)`: 找到完整候选帧但 CRC 不匹配；
    ///   坏帧头已被越过，再次调用会在剩余字节里继续找
    pub fn try_decode(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        loop {
            // 找魔数
            let Some(start) = self.find_magic() else {
                self.trim_noise();
                return Ok(None);
            };
            if start > 0 {
                self.buf.advance(start);
            }

            // 帧头（魔数 2 + 头 6）
            if self.buf.len() < 8 {
                return Ok(None);
            }
            let payload_len = u16::from_le_bytes([self.buf[6], self.buf[7]]) as usize;
            if payload_len > MAX_PAYLOAD_LEN {
                // 长度字段损坏，越过这个魔数重新同步
                self.buf.advance(2);
                continue;
            }

            let total = 2 + 6 + payload_len + 2;
            if self.buf.len() < total {
                return Ok(None);
            }

            let frame = &self.buf[..total];
            let got_crc = u16::from_le_bytes([frame[total - 2], frame[total - 1]]);
            let calc_crc = crc16_ibm(&frame[2..total - 2]);
            if got_crc != calc_crc {
                self.buf.advance(2);
                return Err(ProtocolError::FrameCorrupt {
                    expected: calc_crc,
                    actual: got_crc,
                });
            }

            let frame_type = frame[3];
            let seq = u16::from_le_bytes([frame[4], frame[5]]);
            let payload = frame[8..8 + payload_len].to_vec();
            self.buf.advance(total);
            return Ok(Some(RawFrame {
                frame_type,
                seq,
                payload,
            }));
        }
    }

    fn find_magic(&self) -> Option<usize> {
        self.buf.windows(2).position(|w| w == FRAME_MAGIC)
    }

    /// 防止纯噪声让缓冲区无限增长：没有魔数时只保留最后 1 字节
    /// （可能是下一个魔数的前半）。
    fn trim_noise(&mut self) {
        if self.buf.len() > 1 {
            let keep = self.buf.len() - 1;
            self.buf.advance(keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<RawFrame> {
        let mut dec = FrameDecoder::new();
        dec.extend(bytes);
        let mut out = Vec::new();
        while let Ok(Some(f)) = dec.try_decode() {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_request_encode_decode_roundtrip() {
        let req = GatewayRequest::new(3, Opcode::Stop, vec![0x00]).with_timeout_ms(500);
        let bytes = req.encode(42);

        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.frame_type, FRAME_TYPE_REQUEST);
        assert_eq!(frame.seq, 42);
        assert_eq!(find_tlv(&frame.payload, TlvTag::MotorId), Some(&[3u8][..]));
        assert_eq!(find_tlv(&frame.payload, TlvTag::Opcode), Some(&[0x02u8][..]));
        assert_eq!(
            find_tlv(&frame.payload, TlvTag::TimeoutMs),
            Some(&500u16.to_le_bytes()[..])
        );
        assert_eq!(find_tlv(&frame.payload, TlvTag::Args), Some(&[0x00u8][..]));
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = GatewayResponse::ok(7, 2, vec![0xDE, 0xAD]);
        let bytes = resp.encode();
        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 1);

        let parsed = GatewayResponse::parse(&frames[0]).unwrap();
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.status, GatewayStatus::Ok);
        assert_eq!(parsed.motor_id, Some(2));
        assert_eq!(parsed.data, vec![0xDE, 0xAD]);
    }

    #[test]
    fn test_decoder_resyncs_past_noise() {
        let resp = GatewayResponse::ok(1, 1, vec![]);
        let mut stream = vec![0x00, 0x55, 0x13, 0xFF];
        stream.extend_from_slice(&resp.encode());

        let frames = decode_all(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 1);
    }

    #[test]
    fn test_decoder_incomplete_frame_waits() {
        let resp = GatewayResponse::ok(1, 1, vec![1, 2, 3, 4]);
        let bytes = resp.encode();

        let mut dec = FrameDecoder::new();
        dec.extend(&bytes[..bytes.len() - 3]);
        assert!(matches!(dec.try_decode(), Ok(None)));

        dec.extend(&bytes[bytes.len() - 3..]);
        let frame = dec.try_decode().unwrap().unwrap();
        assert_eq!(frame.seq, 1);
    }

    #[test]
    fn test_decoder_crc_mismatch_is_frame_corrupt() {
        let resp = GatewayResponse::ok(5, 1, vec![9, 9]);
        let mut bytes = resp.encode();
        let idx = bytes.len() - 4;
        bytes[idx] ^= 0xFF; // 破坏载荷

        let mut dec = FrameDecoder::new();
        dec.extend(&bytes);
        assert!(matches!(
            dec.try_decode(),
            Err(ProtocolError::FrameCorrupt { .. })
        ));
    }

    #[test]
    fn test_decoder_recovers_after_corrupt_frame() {
        let bad = {
            let mut b = GatewayResponse::ok(5, 1, vec![]).encode();
            let idx = b.len() - 1;
            b[idx] ^= 0xFF;
            b
        };
        let good = GatewayResponse::ok(6, 1, vec![]).encode();

        let mut dec = FrameDecoder::new();
        dec.extend(&bad);
        dec.extend(&good);

        assert!(dec.try_decode().is_err());
        let frame = dec.try_decode().unwrap().unwrap();
        assert_eq!(frame.seq, 6);
    }

    #[test]
    fn test_check_responder_seq_mismatch() {
        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        let resp = GatewayResponse::ok(9, 1, vec![]);
        assert!(matches!(
            resp.check_responder(&req, 8),
            Err(ProtocolError::UnexpectedResponder { .. })
        ));
    }

    #[test]
    fn test_check_responder_wrong_motor() {
        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        let resp = GatewayResponse::ok(8, 4, vec![]);
        assert!(matches!(
            resp.check_responder(&req, 8),
            Err(ProtocolError::UnexpectedResponder { .. })
        ));
    }

    #[test]
    fn test_check_responder_broadcast_skips_echo_check() {
        // 聚合请求的回显是主应答者地址，不等于广播地址 0 是正常的
        let req = GatewayRequest::new(BROADCAST_ADDR, Opcode::AggregateMotion, vec![]);
        let resp = GatewayResponse::ok(8, 1, vec![]);
        assert!(resp.check_responder(&req, 8).is_ok());
    }

    #[test]
    fn test_noise_buffer_bounded() {
        let mut dec = FrameDecoder::new();
        for _ in 0..100 {
            dec.extend(&[0x00; 64]);
            let _ = dec.try_decode();
        }
        // 无魔数的噪声不应该累积
        assert!(dec.buf.len() <= 1);
    }
}
