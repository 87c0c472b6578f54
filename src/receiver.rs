//! 수신 오케스트레이터
//!
//! 전송 계층의 배치 콜백은 채널로만 넘기고, 실제 처리는 단일 태스크가
//! 순서대로 수행함. 재조립 상태와 시퀀스 추적이 한 곳에 모여 잠금 경합이
//! 없음.
//!
//! 시퀀스 처리 규칙:
//! - seq == expected: 전달, expected 전진 (pending에서 연속 구간 흡수), ACK
//! - seq > expected: 갭 감지, 누락 구간 NACK, 엔벨로프는 즉시 전달
//! - seq < expected: 뒤늦은 재전송으로 간주하고 버림

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::envelope::SseEnvelope;
use crate::flex::FlexPacker;
use crate::metrics::Metrics;
use crate::packet::Ump128;
use crate::reliability::Reliability;
use crate::sysex8::SysEx8Packer;
use crate::timing::JrClock;
use crate::transport::MidiTransport;
use crate::Result;

/// 데이터 엔벨로프 핸들러 (벽시계로 변환된 타임스탬프 포함)
pub type EventHandler = Arc<dyn Fn(&SseEnvelope, Option<SystemTime>) + Send + Sync>;

/// 컨트롤 엔벨로프 핸들러
pub type CtrlHandler = Arc<dyn Fn(&SseEnvelope) + Send + Sync>;

/// 핸들러 슬롯 (등록 순서대로 팬아웃, 덮어쓰기 없음)
#[derive(Default)]
struct Handlers {
    on_event: Mutex<Vec<EventHandler>>,
    on_ctrl: Mutex<Vec<CtrlHandler>>,
}

/// SSE 수신자
pub struct SseReceiver {
    transport: Arc<dyn MidiTransport>,
    rel: Arc<Mutex<Reliability>>,
    metrics: Arc<Metrics>,
    clock: Arc<JrClock>,
    config: Config,
    handlers: Arc<Handlers>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// 처리 태스크가 단독 소유하는 상태
struct ReceiverInner {
    transport: Arc<dyn MidiTransport>,
    rel: Arc<Mutex<Reliability>>,
    metrics: Arc<Metrics>,
    clock: Arc<JrClock>,
    config: Config,
    handlers: Arc<Handlers>,

    flex: FlexPacker,
    sysx: SysEx8Packer,

    /// 다음에 기대하는 시퀀스
    expected_seq: u64,

    /// 먼저 도착한 시퀀스 (expected가 따라잡으면 흡수됨)
    pending: BTreeSet<u64>,
}

impl SseReceiver {
    /// 새 수신자 생성
    pub fn new(
        transport: Arc<dyn MidiTransport>,
        rel: Arc<Mutex<Reliability>>,
        metrics: Arc<Metrics>,
        clock: Arc<JrClock>,
        config: Config,
    ) -> Self {
        Self {
            transport,
            rel,
            metrics,
            clock,
            config,
            handlers: Arc::new(Handlers::default()),
            task: Mutex::new(None),
        }
    }

    /// 데이터 엔벨로프 구독
    pub fn subscribe_event(&self, handler: EventHandler) {
        self.handlers.on_event.lock().push(handler);
    }

    /// 컨트롤 엔벨로프 구독 (송신자의 재전송 경로가 사용)
    pub fn subscribe_ctrl(&self, handler: CtrlHandler) {
        self.handlers.on_ctrl.lock().push(handler);
    }

    /// 전송 계층을 열고 처리 태스크 시작
    pub async fn start(&self) -> Result<()> {
        self.transport.open().await?;

        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Ump128>>(self.config.channel_depth);

        self.transport.subscribe_batches(Arc::new(move |batch| {
            if batch_tx.try_send(batch.to_vec()).is_err() {
                warn!("수신 채널 포화, 배치 버림");
            }
        }));

        let mut inner = ReceiverInner {
            transport: self.transport.clone(),
            rel: self.rel.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            flex: FlexPacker::new(),
            sysx: SysEx8Packer::new(),
            expected_seq: 0,
            pending: BTreeSet::new(),
        };

        let task = tokio::spawn(async move {
            let mut batch_rx = batch_rx;
            while let Some(batch) = batch_rx.recv().await {
                inner.handle_batch(batch).await;
            }
        });

        *self.task.lock() = Some(task);
        Ok(())
    }

    /// 처리 태스크를 멈추고 전송 계층 종료
    pub async fn stop(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.transport.close().await
    }
}

impl ReceiverInner {
    async fn handle_batch(&mut self, batch: Vec<Ump128>) {
        let mut blobs: Vec<Bytes> = Vec::new();

        // 메시지 타입별로 청커에 라우팅 (도착 순서 유지)
        for pkt in &batch {
            match pkt.message_type() {
                0xD => blobs.extend(self.flex.unpack(std::slice::from_ref(pkt))),
                0x5 => blobs.extend(
                    self.sysx
                        .unpack(std::slice::from_ref(pkt))
                        .into_iter()
                        .map(|(_stream, blob)| blob),
                ),
                mt => debug!("알 수 없는 메시지 타입 {:#x}, 패킷 버림", mt),
            }
        }

        for blob in blobs {
            self.metrics.add_recv(blob.len());

            let env: SseEnvelope = match serde_json::from_slice(&blob) {
                Ok(env) => env,
                Err(e) => {
                    debug!("엔벨로프 디코딩 실패: {}", e);
                    continue;
                }
            };

            if env.is_ctrl() {
                // 컨트롤은 시퀀스 추적 대상이 아님
                for handler in self.handlers.on_ctrl.lock().iter() {
                    handler(&env);
                }
                continue;
            }

            self.handle_data(env).await;
        }
    }

    async fn handle_data(&mut self, env: SseEnvelope) {
        let seq = env.seq;

        if seq == self.expected_seq {
            self.expected_seq += 1;
            while self.pending.remove(&self.expected_seq) {
                self.expected_seq += 1;
            }

            let ack = self.rel.lock().build_ack(self.expected_seq - 1);
            self.send_ctrl(ack).await;
            self.deliver(env);
        } else if seq > self.expected_seq {
            if self.pending.contains(&seq) {
                // 이미 전달한 시퀀스의 재전송
                debug!("중복 시퀀스 {} 버림", seq);
                return;
            }

            self.metrics.inc_seq_gaps_detected();
            let missing: Vec<u64> = (self.expected_seq..seq)
                .filter(|s| !self.pending.contains(s))
                .collect();
            debug!("시퀀스 갭 감지: 기대 {}, 수신 {}", self.expected_seq, seq);

            let nack = self.rel.lock().build_nack(missing);
            self.send_ctrl(nack).await;

            // 재전송을 기다리지 않고 즉시 전달
            self.pending.insert(seq);
            self.deliver(env);
        } else {
            // 뒤늦은 재전송
            debug!("이미 지난 시퀀스 {} 버림 (기대 {})", seq, self.expected_seq);
        }
    }

    fn deliver(&self, env: SseEnvelope) {
        let wall = env.ts.map(|ticks| self.clock.to_wall(ticks));
        for handler in self.handlers.on_event.lock().iter() {
            handler(&env, wall);
        }
    }

    async fn send_ctrl(&self, env: SseEnvelope) {
        let data = match serde_json::to_vec(&env) {
            Ok(data) => data,
            Err(e) => {
                warn!("컨트롤 직렬화 실패: {}", e);
                return;
            }
        };

        let frames = if data.len() > self.config.flex_capacity {
            self.sysx.pack(0x00, &data, self.config.group)
        } else {
            self.flex.pack(
                &data,
                self.config.group,
                self.config.status_bank,
                self.config.status,
            )
        };

        // 컨트롤 유실은 프로토콜이 복구함 (다음 갭에서 다시 NACK)
        if let Err(e) = self.transport.send_umps(&frames).await {
            warn!("컨트롤 송신 실패: {}", e);
        }
    }
}
