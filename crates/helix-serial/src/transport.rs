//! 共享传输对象
//!
//! 一个 [`Transport`] 对应一条物理串口，被绑定到同一端口的所有电机
//! 会话共享。所有权是显式的：句柄克隆即引用计数加一，不存在进程级
//! 单例。最后一个句柄关闭时才释放 OS 级串口。
//!
//! 互斥纪律：`exchange()` 在**整个**写/读循环期间持有 I/O 锁，读到
//! 完整响应或超时后立刻释放。两个线程并发发起交换会背靠背执行，
//! 字节层面绝不交错；跨 Transport（不同物理端口）之间没有任何顺序
//! 保证。

use crate::{SerialAdapter, SerialError};
use helix_protocol::{FrameDecoder, GatewayRequest, GatewayResponse, BROADCAST_ADDR};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 单次 `read_available` 的阻塞片长
///
/// 片长过小会在部分平台退化成忙等，过大会把超时判定拖迟一个片。
const READ_SLICE: Duration = Duration::from_millis(20);

struct TransportIo {
    adapter: Box<dyn SerialAdapter>,
    decoder: FrameDecoder,
    /// 请求序号，0 保留不用，0xFFFF 后回绕到 1
    seq: u16,
}

struct TransportInner {
    port_name: String,
    baud: u32,
    io: Mutex<TransportIo>,
    /// 活跃句柄数；归零后传输进入关闭态
    refs: AtomicUsize,
    closed: AtomicBool,
    /// 已被占用的单播地址（同一传输上地址必须唯一）
    addresses: Mutex<HashSet<u8>>,
}

/// 引用计数的共享传输句柄
///
/// 克隆句柄共享同一条串口与同一把 I/O 锁；`close()`（或 Drop）使
/// 引用计数减一，计数归零时才真正释放连接，之后任何交换都返回
/// [`SerialError::Closed`]。
pub struct Transport {
    inner: Arc<TransportInner>,
    /// 本句柄是否已显式关闭（防止 Drop 二次递减）
    released: AtomicBool,
}

impl Transport {
    /// 打开传输
    ///
    /// `adapter` 独占一条已打开的 OS 级串口；打开失败由适配器构造
    /// 函数以 [`SerialError::Unavailable`] 报告。
    pub fn open(port_name: impl Into<String>, baud: u32, adapter: Box<dyn SerialAdapter>) -> Self {
        let port_name = port_name.into();
        debug!(port = %port_name, baud, "transport opened");
        Self {
            inner: Arc::new(TransportInner {
                port_name,
                baud,
                io: Mutex::new(TransportIo {
                    adapter,
                    decoder: FrameDecoder::new(),
                    seq: 0,
                }),
                refs: AtomicUsize::new(1),
                closed: AtomicBool::new(false),
                addresses: Mutex::new(HashSet::new()),
            }),
            released: AtomicBool::new(false),
        }
    }

    /// 端口名
    pub fn port_name(&self) -> &str {
        &self.inner.port_name
    }

    /// 波特率
    pub fn baud(&self) -> u32 {
        self.inner.baud
    }

    /// 当前句柄引用计数
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// 两个句柄是否指向同一条物理通道
    pub fn same_channel(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 占用一个单播地址
    ///
    /// 返回 `false` 表示该地址已被同一传输上的其他会话占用。
    /// 地址 0 保留给广播，永远不可占用。
    pub fn claim_address(&self, addr: u8) -> bool {
        if addr == BROADCAST_ADDR {
            return false;
        }
        self.inner.addresses.lock().insert(addr)
    }

    /// 释放一个单播地址
    pub fn release_address(&self, addr: u8) {
        self.inner.addresses.lock().remove(&addr);
    }

    /// 独占执行一次请求/响应交换
    ///
    /// 这是整个核心库**唯一**的阻塞点。流程：
    /// 1. 获取 I/O 锁（并发调用方在此排队，先到先得，无优先级）；
    /// 2. 丢弃输入缓冲的残留字节；
    /// 3. 分配序号并写出请求帧；
    /// 4. 读到通过校验且序号匹配的响应帧，或超时。
    ///
    /// 超时是唯一的取消方式：写出一半的帧无法安全中止，否则线上
    /// 协议会失步。
    pub fn exchange(
        &self,
        request: &GatewayRequest,
        timeout: Duration,
    ) -> Result<GatewayResponse, SerialError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SerialError::Closed);
        }

        let mut io = self.inner.io.lock();

        // 锁竞争期间传输可能已被最后一个句柄关闭
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SerialError::Closed);
        }

        io.adapter.clear_input()?;
        io.decoder.clear();

        io.seq = io.seq.wrapping_add(1);
        if io.seq == 0 {
            io.seq = 1;
        }
        let seq = io.seq;

        let frame = request.encode(seq);
        trace!(
            motor_id = request.motor_id,
            opcode = ?request.opcode,
            seq,
            bytes = %hex::encode(&frame),
            "tx frame"
        );
        io.adapter.write_all(&frame)?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    motor_id = request.motor_id,
                    opcode = ?request.opcode,
                    ?timeout,
                    "exchange timed out"
                );
                return Err(SerialError::Timeout(timeout));
            }

            let n = io.adapter.read_available(&mut buf, remaining.min(READ_SLICE))?;
            if n == 0 {
                continue;
            }
            io.decoder.extend(&buf[..n]);

            loop {
                match io.decoder.try_decode() {
                    Ok(Some(raw)) => {
                        let response = GatewayResponse::parse(&raw)?;
                        response.check_responder(request, seq)?;
                        trace!(seq, status = ?response.status, "rx frame");
                        return Ok(response);
                    }
                    Ok(None) => break,
                    // 坏帧对本次交换致命；解码器已越过坏帧头
                    Err(e) => return Err(SerialError::Protocol(e)),
                }
            }
        }
    }

    /// 发送一条不期待 ACK 的广播命令
    ///
    /// 广播命令（目标地址 0）从不期待逐设备应答；聚合同步走
    /// [`Transport::exchange`]（主应答者机制），这里只负责纯广播。
    pub fn send_broadcast(&self, request: &GatewayRequest) -> Result<(), SerialError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SerialError::Closed);
        }

        let mut io = self.inner.io.lock();
        io.seq = io.seq.wrapping_add(1);
        if io.seq == 0 {
            io.seq = 1;
        }
        let seq = io.seq;
        let frame = request.encode(seq);
        trace!(opcode = ?request.opcode, seq, "tx broadcast");
        io.adapter.write_all(&frame)
    }

    /// 显式关闭本句柄
    ///
    /// 引用计数减一；最后一个句柄关闭时传输进入关闭态。重复关闭
    /// 同一句柄是无害的空操作。
    pub fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let prev = self.inner.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.inner.closed.store(true, Ordering::Release);
            debug!(port = %self.inner.port_name, "transport closed (last handle released)");
        }
    }
}

impl Clone for Transport {
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: self.inner.clone(),
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("port", &self.inner.port_name)
            .field("baud", &self.inner.baud)
            .field("refs", &self.ref_count())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGateway;
    use helix_protocol::Opcode;

    fn mock_transport(gw: &MockGateway) -> Transport {
        Transport::open("mock0", 115200, Box::new(gw.adapter()))
    }

    #[test]
    fn test_exchange_roundtrip() {
        let gw = MockGateway::new(&[1]);
        let transport = mock_transport(&gw);

        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        let resp = transport.exchange(&req, Duration::from_millis(200)).unwrap();
        assert_eq!(resp.motor_id, Some(1));
        assert_eq!(resp.data.len(), 4);
    }

    #[test]
    fn test_exchange_timeout_when_gateway_silent() {
        let gw = MockGateway::new(&[1]);
        gw.set_respond(false);
        let transport = mock_transport(&gw);

        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        let err = transport.exchange(&req, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, SerialError::Timeout(_)));
    }

    #[test]
    fn test_exchange_after_close_fails() {
        let gw = MockGateway::new(&[1]);
        let transport = mock_transport(&gw);
        transport.close();

        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        assert!(matches!(
            transport.exchange(&req, Duration::from_millis(50)),
            Err(SerialError::Closed)
        ));
    }

    #[test]
    fn test_refcount_keeps_transport_alive() {
        let gw = MockGateway::new(&[1]);
        let t1 = mock_transport(&gw);
        let t2 = t1.clone();
        assert_eq!(t1.ref_count(), 2);

        t1.close();
        // t2 仍然可用
        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        assert!(t2.exchange(&req, Duration::from_millis(200)).is_ok());

        t2.close();
        assert!(matches!(
            t2.exchange(&req, Duration::from_millis(50)),
            Err(SerialError::Closed)
        ));
    }

    #[test]
    fn test_double_close_is_noop() {
        let gw = MockGateway::new(&[1]);
        let t1 = mock_transport(&gw);
        let t2 = t1.clone();
        t1.close();
        t1.close(); // 同一句柄重复关闭不应影响 t2
        assert_eq!(t2.ref_count(), 1);

        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        assert!(t2.exchange(&req, Duration::from_millis(200)).is_ok());
    }

    #[test]
    fn test_address_claims_unique_per_transport() {
        let gw = MockGateway::new(&[1, 2]);
        let transport = mock_transport(&gw);

        assert!(transport.claim_address(1));
        assert!(!transport.claim_address(1));
        assert!(transport.claim_address(2));

        transport.release_address(1);
        assert!(transport.claim_address(1));
    }

    #[test]
    fn test_broadcast_address_never_claimable() {
        let gw = MockGateway::new(&[1]);
        let transport = mock_transport(&gw);
        assert!(!transport.claim_address(0));
    }

    #[test]
    fn test_corrupt_response_surfaces_frame_corrupt() {
        let gw = MockGateway::new(&[1]);
        gw.corrupt_next_response();
        let transport = mock_transport(&gw);

        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        let err = transport.exchange(&req, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            SerialError::Protocol(helix_protocol::ProtocolError::FrameCorrupt { .. })
        ));

        // 坏帧只影响那一次交换，会话可以继续
        assert!(transport.exchange(&req, Duration::from_millis(200)).is_ok());
    }

    #[test]
    fn test_wrong_responder_detected() {
        let gw = MockGateway::new(&[1, 2]);
        gw.wrong_responder_next(2);
        let transport = mock_transport(&gw);

        let req = GatewayRequest::new(1, Opcode::ReadPosition, vec![]);
        let err = transport.exchange(&req, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            SerialError::Protocol(helix_protocol::ProtocolError::UnexpectedResponder { .. })
        ));
    }

    /// 串行化保证：并发交换在线上留下的只能是完整的、可独立解码的帧
    #[test]
    fn test_concurrent_exchanges_never_interleave() {
        use std::thread;

        let gw = MockGateway::new(&[1, 2]);
        let transport = mock_transport(&gw);

        let mut handles = Vec::new();
        for motor_id in [1u8, 2u8] {
            let t = transport.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    let req = GatewayRequest::new(motor_id, Opcode::ReadPosition, vec![]);
                    t.exchange(&req, Duration::from_millis(500)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // 每次 write_all 恰好是一个完整请求帧：逐个独立解码必须成功
        let frames = gw.written_frames();
        assert_eq!(frames.len(), 40);
        for bytes in frames {
            let mut dec = FrameDecoder::new();
            dec.extend(&bytes);
            let raw = dec.try_decode().unwrap().expect("whole frame per write");
            assert_eq!(raw.frame_type, helix_protocol::FRAME_TYPE_REQUEST);
            // 帧后不允许残留字节
            assert!(matches!(dec.try_decode(), Ok(None)));
        }
    }
}
