//! 전송 세션
//!
//! - UMP 패킷 배치를 MTU 한도 내에서 하나의 데이터그램으로 병합
//! - 수신 데이터그램을 패킷 배치로 복원하여 구독자에게 원자적으로 전달
//! - 경량 핸드쉐이크 ("MC" + 버전 + 세션 ID + 그룹 + 채널)
//!
//! 데이터그램 레이아웃: 12바이트 고정 헤더 + N개의 16바이트 빅엔디안 패킷

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::packet::Ump128;
use crate::{Error, Result, FRAME_HEADER_LEN, PROTOCOL_VERSION};

/// 배치 수신 핸들러
pub type BatchHandler = Arc<dyn Fn(&[Ump128]) + Send + Sync>;

/// 패킷 단위 수신 핸들러
pub type PacketHandler = Arc<dyn Fn(Ump128) + Send + Sync>;

/// 핸드쉐이크 상태
///
/// 타임아웃 폴백으로 협상을 가장하는 대신 세 가지 상태를 명시적으로 구분함.
/// Assumed는 호스트가 관측할 수 있고 로그로도 남음
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// 협상 대기 중
    Pending,

    /// 피어와 실제로 협상 완료
    Negotiated,

    /// 타임아웃으로 협상 완료를 가정하고 진행
    Assumed,
}

/// 전송 세션 최소 계약
///
/// 코어가 요구하는 것: open/close, 패킷 배치 송신, 수신 배치 구독
#[async_trait]
pub trait MidiTransport: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// 패킷 배치 송신 (MTU 한도 내 병합은 구현 책임)
    async fn send_umps(&self, umps: &[Ump128]) -> Result<()>;

    /// 배치 구독자 등록 (기존 핸들러를 덮어쓰지 않고 목록에 추가)
    fn subscribe_batches(&self, handler: BatchHandler);

    /// 패킷 단위 구독자 등록
    fn subscribe_packets(&self, handler: PacketHandler);
}

/// 구독 슬롯
///
/// 배치/패킷 핸들러를 등록 순서대로 독립적으로 팬아웃함
#[derive(Default)]
struct Subscribers {
    batch: Vec<BatchHandler>,
    packet: Vec<PacketHandler>,
}

impl Subscribers {
    fn deliver(&self, batch: &[Ump128]) {
        for handler in &self.batch {
            handler(batch);
        }
        for handler in &self.packet {
            for pkt in batch {
                handler(*pkt);
            }
        }
    }
}

/// 핸드쉐이크 협상 정보
struct HandshakeInfo {
    state: HandshakeState,
    remote_id: Option<[u8; 16]>,
    version: u8,
    group: u8,
    channel: u8,
}

/// RTP-MIDI 세션 설정
#[derive(Debug, Clone)]
pub struct RtpMidiConfig {
    /// 세션 이름 (로그 식별용)
    pub local_name: String,

    /// 바인드 주소
    pub bind_addr: SocketAddr,

    /// 피어 주소 (모르면 첫 수신 데이터그램에서 학습)
    pub peer_addr: Option<SocketAddr>,

    /// 데이터그램 MTU (바이트)
    pub mtu: usize,

    /// 핸드쉐이크 활성화 여부
    pub enable_handshake: bool,

    /// 핸드쉐이크 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,
}

impl RtpMidiConfig {
    pub fn new(local_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            local_name: local_name.into(),
            bind_addr,
            peer_addr: None,
            mtu: 1500,
            enable_handshake: true,
            handshake_timeout_ms: 150,
        }
    }

    /// 프로토콜 설정에서 전송 MTU와 핸드쉐이크 타임아웃을 물려받아 생성
    pub fn from_config(
        local_name: impl Into<String>,
        bind_addr: SocketAddr,
        config: &Config,
    ) -> Self {
        Self {
            mtu: config.transport_mtu,
            handshake_timeout_ms: config.handshake_timeout_ms,
            ..Self::new(local_name, bind_addr)
        }
    }
}

/// 열린 세션의 가변 상태
#[derive(Default)]
struct RtpState {
    socket: Option<Arc<UdpSocket>>,
    recv_task: Option<JoinHandle<()>>,
    handshake_task: Option<JoinHandle<()>>,
}

/// UDP 기반 RTP-MIDI 세션
pub struct RtpMidiSession {
    config: RtpMidiConfig,
    local_id: [u8; 16],
    subscribers: Arc<Mutex<Subscribers>>,
    state: Mutex<RtpState>,
    peer: Arc<RwLock<Option<SocketAddr>>>,
    handshake: Arc<RwLock<HandshakeInfo>>,
    running: Arc<AtomicBool>,
}

impl RtpMidiSession {
    pub fn new(config: RtpMidiConfig) -> Self {
        let mut local_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut local_id);

        let peer = Arc::new(RwLock::new(config.peer_addr));

        Self {
            config,
            local_id,
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            state: Mutex::new(RtpState::default()),
            peer,
            handshake: Arc::new(RwLock::new(HandshakeInfo {
                state: HandshakeState::Pending,
                remote_id: None,
                version: 0,
                group: 0,
                channel: 0,
            })),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 현재 핸드쉐이크 상태
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.read().state
    }

    /// 바인드된 로컬 주소
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let state = self.state.lock();
        let socket = state.socket.as_ref().ok_or(Error::NotOpen)?;
        Ok(socket.local_addr()?)
    }

    /// 피어 주소 설정 (핸드쉐이크 활성 시 협상 데이터그램 송신)
    pub async fn set_peer(&self, addr: SocketAddr) -> Result<()> {
        *self.peer.write() = Some(addr);

        if self.config.enable_handshake {
            let socket = {
                let state = self.state.lock();
                state.socket.clone()
            };
            if let Some(socket) = socket {
                let msg = handshake_datagram(self.local_id, &self.handshake);
                socket.send_to(&msg, addr).await?;
            }
        }

        Ok(())
    }

    /// 수신 데이터그램 처리 (핸드쉐이크 응답이 필요하면 반환)
    fn handle_datagram(
        data: &[u8],
        addr: SocketAddr,
        local_id: [u8; 16],
        peer: &Arc<RwLock<Option<SocketAddr>>>,
        handshake: &Arc<RwLock<HandshakeInfo>>,
        subscribers: &Arc<Mutex<Subscribers>>,
    ) -> Option<Vec<u8>> {
        // 피어 학습
        if peer.read().is_none() {
            *peer.write() = Some(addr);
            info!("피어 학습: {}", addr);
        }

        // 핸드쉐이크 데이터그램
        if data.len() >= 3 && &data[0..2] == b"MC" {
            let mut hs = handshake.write();
            let was_negotiated = hs.state == HandshakeState::Negotiated;
            hs.version = data[2];
            if data.len() >= 19 {
                let mut remote = [0u8; 16];
                remote.copy_from_slice(&data[3..19]);
                hs.remote_id = Some(remote);
            }
            if data.len() >= 20 {
                hs.group = data[19];
            }
            if data.len() >= 21 {
                hs.channel = data[20];
            }
            hs.state = HandshakeState::Negotiated;
            drop(hs);

            // 상대가 상태를 확정하도록 한 번만 응답
            if !was_negotiated {
                return Some(handshake_datagram(local_id, handshake));
            }
            return None;
        }

        // 페이로드 프레임: 12바이트 헤더 + 16바이트 패킷들
        if data.len() < FRAME_HEADER_LEN {
            debug!("절단된 프레임 {}바이트, 버림", data.len());
            return None;
        }

        let payload = &data[FRAME_HEADER_LEN..];
        let batch: Vec<Ump128> = payload
            .chunks_exact(16)
            .filter_map(Ump128::from_bytes)
            .collect();

        if !batch.is_empty() {
            subscribers.lock().deliver(&batch);
        }
        None
    }
}

/// "MC" + 버전 + 16바이트 세션 ID + 그룹 + 채널
fn handshake_datagram(local_id: [u8; 16], handshake: &Arc<RwLock<HandshakeInfo>>) -> Vec<u8> {
    let hs = handshake.read();
    let mut msg = Vec::with_capacity(21);
    msg.extend_from_slice(b"MC");
    msg.push(PROTOCOL_VERSION);
    msg.extend_from_slice(&local_id);
    msg.push(hs.group);
    msg.push(hs.channel);
    msg
}

/// 12바이트 고정 프레임 헤더
fn frame_header() -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = 0x80;
    header[1] = 0x61;
    header
}

#[async_trait]
impl MidiTransport for RtpMidiSession {
    async fn open(&self) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.config.bind_addr).await?);
        self.running.store(true, Ordering::SeqCst);

        info!(
            "RTP-MIDI 세션 '{}' 시작: {}",
            self.config.local_name,
            socket.local_addr()?
        );

        // 수신 루프
        let recv_socket = socket.clone();
        let running = self.running.clone();
        let peer = self.peer.clone();
        let handshake = self.handshake.clone();
        let subscribers = self.subscribers.clone();
        let local_id = self.local_id;

        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            while running.load(Ordering::SeqCst) {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        if let Some(reply) = Self::handle_datagram(
                            &buf[..len],
                            addr,
                            local_id,
                            &peer,
                            &handshake,
                            &subscribers,
                        ) {
                            if let Err(e) = recv_socket.send_to(&reply, addr).await {
                                warn!("핸드쉐이크 응답 실패: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            warn!("수신 에러: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        // 핸드쉐이크 개시 및 타임아웃
        let handshake_task = if self.config.enable_handshake {
            // 가드를 await 너머로 들고 가지 않도록 주소만 복사
            let peer_addr = *self.peer.read();
            if let Some(peer_addr) = peer_addr {
                let msg = handshake_datagram(self.local_id, &self.handshake);
                socket.send_to(&msg, peer_addr).await?;
            }

            let handshake = self.handshake.clone();
            let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
            let name = self.config.local_name.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let mut hs = handshake.write();
                if hs.state == HandshakeState::Pending {
                    hs.state = HandshakeState::Assumed;
                    warn!("'{}' 핸드쉐이크 타임아웃, assumed 상태로 진행", name);
                }
            }))
        } else {
            // 협상 없이 진행하는 구성은 곧바로 assumed
            self.handshake.write().state = HandshakeState::Assumed;
            None
        };

        let mut state = self.state.lock();
        state.socket = Some(socket);
        state.recv_task = Some(recv_task);
        state.handshake_task = handshake_task;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(task) = state.recv_task.take() {
            task.abort();
        }
        if let Some(task) = state.handshake_task.take() {
            task.abort();
        }
        state.socket = None;

        debug!("RTP-MIDI 세션 '{}' 종료", self.config.local_name);
        Ok(())
    }

    async fn send_umps(&self, umps: &[Ump128]) -> Result<()> {
        let socket = {
            let state = self.state.lock();
            state.socket.clone().ok_or(Error::NotOpen)?
        };
        let peer = (*self.peer.read()).ok_or(Error::ConnectionClosed)?;

        // MTU 한도 내 병합: 다음 패킷을 넣으면 초과할 때 새 프레임 시작
        let mut frame: Vec<u8> = frame_header().to_vec();
        for pkt in umps {
            if frame.len() + 16 > self.config.mtu {
                socket.send_to(&frame, peer).await?;
                frame = frame_header().to_vec();
            }
            frame.extend_from_slice(&pkt.to_bytes());
        }
        if frame.len() > FRAME_HEADER_LEN {
            socket.send_to(&frame, peer).await?;
        }

        Ok(())
    }

    fn subscribe_batches(&self, handler: BatchHandler) {
        self.subscribers.lock().batch.push(handler);
    }

    fn subscribe_packets(&self, handler: PacketHandler) {
        self.subscribers.lock().packet.push(handler);
    }
}

/// 인프로세스 루프백 세션
///
/// 보낸 배치를 그대로 자신의 구독자에게 전달함. 테스트와 데모 배선용
#[derive(Default)]
pub struct LoopbackSession {
    subscribers: Mutex<Subscribers>,
    open: AtomicBool,
}

impl LoopbackSession {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MidiTransport for LoopbackSession {
    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_umps(&self, umps: &[Ump128]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotOpen);
        }
        self.subscribers.lock().deliver(umps);
        Ok(())
    }

    fn subscribe_batches(&self, handler: BatchHandler) {
        self.subscribers.lock().batch.push(handler);
    }

    fn subscribe_packets(&self, handler: PacketHandler) {
        self.subscribers.lock().packet.push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_loopback_fans_out_to_both_handler_kinds() {
        let session = LoopbackSession::new();
        session.open().await.unwrap();

        let batch_calls = Arc::new(AtomicUsize::new(0));
        let packet_calls = Arc::new(AtomicUsize::new(0));

        let b = batch_calls.clone();
        session.subscribe_batches(Arc::new(move |batch| {
            assert_eq!(batch.len(), 2);
            b.fetch_add(1, Ordering::SeqCst);
        }));
        let p = packet_calls.clone();
        session.subscribe_packets(Arc::new(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        }));

        let umps = [Ump128::new(1, 0, 0, 0), Ump128::new(2, 0, 0, 0)];
        session.send_umps(&umps).await.unwrap();

        // 두 종류의 핸들러가 서로 독립적으로 발화
        assert_eq!(batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(packet_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loopback_multiple_batch_handlers() {
        let session = LoopbackSession::new();
        session.open().await.unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        session.subscribe_batches(Arc::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = second.clone();
        session.subscribe_batches(Arc::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        session.send_umps(&[Ump128::new(0, 0, 0, 0)]).await.unwrap();

        // 나중에 등록한 핸들러가 먼저 것을 덮어쓰지 않음
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loopback_closed_rejects_send() {
        let session = LoopbackSession::new();
        session.open().await.unwrap();
        session.close().await.unwrap();

        let result = session.send_umps(&[Ump128::new(0, 0, 0, 0)]).await;
        assert!(result.is_err());
    }

    async fn bound_session(name: &str) -> RtpMidiSession {
        let config = RtpMidiConfig::new(name, "127.0.0.1:0".parse().unwrap());
        let session = RtpMidiSession::new(config);
        session.open().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_udp_pair_delivers_batches() {
        let a = bound_session("a").await;
        let b = bound_session("b").await;

        a.set_peer(b.local_addr().unwrap()).await.unwrap();
        b.set_peer(a.local_addr().unwrap()).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        b.subscribe_batches(Arc::new(move |batch| {
            sink.lock().extend_from_slice(batch);
        }));

        let umps: Vec<Ump128> = (0..10).map(|i| Ump128::new(i, i, i, i)).collect();
        a.send_umps(&umps).await.unwrap();

        // 수신 태스크가 전달할 때까지 대기
        for _ in 0..100 {
            if received.lock().len() >= umps.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*received.lock(), umps);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mtu_coalescing_splits_frames() {
        let mut config = RtpMidiConfig::new("small-mtu", "127.0.0.1:0".parse().unwrap());
        config.mtu = 100; // 프레임당 패킷 5개 (12 + 5*16 = 92)
        config.enable_handshake = false;
        let a = RtpMidiSession::new(config);
        a.open().await.unwrap();

        let mut config_b = RtpMidiConfig::new("sink", "127.0.0.1:0".parse().unwrap());
        config_b.enable_handshake = false;
        let b = RtpMidiSession::new(config_b);
        b.open().await.unwrap();

        a.set_peer(b.local_addr().unwrap()).await.unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        b.subscribe_batches(Arc::new(move |batch| {
            sink.lock().push(batch.to_vec());
        }));

        let umps: Vec<Ump128> = (0..12).map(|i| Ump128::new(i, 0, 0, 0)).collect();
        a.send_umps(&umps).await.unwrap();

        for _ in 0..100 {
            let total: usize = batches.lock().iter().map(|b| b.len()).sum();
            if total >= umps.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let batches = batches.lock();
        // 12개 패킷이 여러 프레임으로 쪼개지되 프레임당 5개 이하
        assert!(batches.len() >= 3);
        assert!(batches.iter().all(|b| b.len() <= 5));
        let flattened: Vec<Ump128> = batches.iter().flatten().copied().collect();
        assert_eq!(flattened, umps);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_negotiates_between_peers() {
        let a = bound_session("hs-a").await;
        let b = bound_session("hs-b").await;

        a.set_peer(b.local_addr().unwrap()).await.unwrap();

        for _ in 0..100 {
            if a.handshake_state() == HandshakeState::Negotiated
                && b.handshake_state() == HandshakeState::Negotiated
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(a.handshake_state(), HandshakeState::Negotiated);
        assert_eq!(b.handshake_state(), HandshakeState::Negotiated);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_with_preset_peer_initiates_handshake() {
        // 피어 주소를 설정에 넣고 열면 open이 곧바로 협상을 개시함
        let b = bound_session("preset-b").await;

        let mut config = RtpMidiConfig::new("preset-a", "127.0.0.1:0".parse().unwrap());
        config.peer_addr = Some(b.local_addr().unwrap());
        let a = RtpMidiSession::new(config);
        a.open().await.unwrap();

        for _ in 0..100 {
            if a.handshake_state() == HandshakeState::Negotiated
                && b.handshake_state() == HandshakeState::Negotiated
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(a.handshake_state(), HandshakeState::Negotiated);
        assert_eq!(b.handshake_state(), HandshakeState::Negotiated);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[test]
    fn test_session_config_inherits_protocol_settings() {
        let mut protocol = Config::default();
        protocol.transport_mtu = 900;
        protocol.handshake_timeout_ms = 75;

        let config =
            RtpMidiConfig::from_config("inherit", "127.0.0.1:0".parse().unwrap(), &protocol);
        assert_eq!(config.mtu, 900);
        assert_eq!(config.handshake_timeout_ms, 75);
        assert!(config.enable_handshake);
    }

    #[tokio::test]
    async fn test_handshake_times_out_to_assumed() {
        // 피어 없이 열면 협상 상대가 없어 타임아웃 후 Assumed
        let session = bound_session("lonely").await;
        assert_eq!(session.handshake_state(), HandshakeState::Pending);

        for _ in 0..100 {
            if session.handshake_state() != HandshakeState::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(session.handshake_state(), HandshakeState::Assumed);

        session.close().await.unwrap();
    }
}
