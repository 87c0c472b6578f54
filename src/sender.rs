//! 송신 오케스트레이터
//!
//! - 시퀀스 번호와 JR 타임스탬프 부여
//! - 직렬화 크기에 따라 Flex/SysEx8 청커 선택
//! - 신뢰성 엔진에 프레임 기록, 윈도우 흐름 제어
//! - MTU 한도 기반 내부 배치 버퍼

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::envelope::SseEnvelope;
use crate::flex::FlexPacker;
use crate::metrics::Metrics;
use crate::packet::Ump128;
use crate::receiver::SseReceiver;
use crate::reliability::Reliability;
use crate::sysex8::SysEx8Packer;
use crate::timing::JrClock;
use crate::transport::MidiTransport;
use crate::{Result, FRAME_HEADER_LEN};

/// 송신측 가변 상태 (세션 뮤텍스 아래)
struct SenderState {
    /// 다음 시퀀스 번호 (단조 증가)
    next_seq: u64,

    /// 미확인 허용 시퀀스 최대 수
    window: usize,

    /// 보냈지만 아직 확인되지 않은 시퀀스
    pending: BTreeSet<u64>,

    /// 내부 송신 버퍼
    buffer: Vec<Ump128>,

    flex: FlexPacker,
    sysx: SysEx8Packer,
}

/// SSE 송신자
pub struct SseSender {
    transport: Arc<dyn MidiTransport>,
    rel: Arc<Mutex<Reliability>>,
    metrics: Arc<Metrics>,
    clock: Arc<JrClock>,
    config: Config,
    state: Mutex<SenderState>,
}

impl SseSender {
    /// 새 송신자 생성
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
            state: Mutex::new(SenderState {
                next_seq: 0,
                window: config.window,
                pending: BTreeSet::new(),
                buffer: Vec::new(),
                flex: FlexPacker::new(),
                sysx: SysEx8Packer::new(),
            }),
            config,
        }
    }

    /// 엔벨로프 송신
    ///
    /// 윈도우가 가득 차면 버퍼를 비우고 짧게 대기하며 재시도함
    /// (유일하게 의도적으로 블로킹하는 연산)
    pub async fn send(&self, event: SseEnvelope) -> Result<()> {
        loop {
            self.prune_pending();
            if self.window_has_room() {
                break;
            }
            self.flush().await?;
            self.prune_pending();
            if self.window_has_room() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.window_retry_interval_ms)).await;
        }

        let seq = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let env = SseEnvelope {
            seq,
            ts: Some(self.clock.jr_now()),
            ..event
        };

        let data = serde_json::to_vec(&env)?;
        self.metrics.add_send(data.len());

        // 프레임을 만들고 신뢰성 엔진에 기록한 뒤 버퍼링
        let to_flush = {
            let mut state = self.state.lock();
            let frames = if data.len() > self.config.flex_capacity {
                state.sysx.pack(0x00, &data, self.config.group)
            } else {
                state.flex.pack(
                    &data,
                    self.config.group,
                    self.config.status_bank,
                    self.config.status,
                )
            };

            self.rel.lock().record(seq, frames.clone());
            state.pending.insert(seq);

            let mut full_batches = Vec::new();
            for frame in frames {
                let buffered = FRAME_HEADER_LEN + (state.buffer.len() + 1) * 16;
                if buffered > self.config.mtu && !state.buffer.is_empty() {
                    full_batches.push(std::mem::take(&mut state.buffer));
                }
                state.buffer.push(frame);
            }
            full_batches
        };

        for batch in to_flush {
            self.transport.send_umps(&batch).await?;
        }

        Ok(())
    }

    /// 버퍼에 남은 프레임을 즉시 전송
    pub async fn flush(&self) -> Result<()> {
        let batch = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.buffer)
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.transport.send_umps(&batch).await
    }

    /// 흐름 제어 윈도우 갱신
    pub fn set_window(&self, n: usize) {
        self.state.lock().window = n.max(1);
    }

    /// 미확인 시퀀스 수 (현재 워터마크 기준으로 정리 후 집계)
    pub fn pending_count(&self) -> usize {
        self.prune_pending();
        self.state.lock().pending.len()
    }

    /// 세션 종료 (잔여 버퍼는 최선 노력으로 전송)
    pub async fn close(&self) -> Result<()> {
        if let Err(e) = self.flush().await {
            warn!("종료 중 플러시 실패: {}", e);
        }
        self.transport.close().await
    }

    /// 수신자의 컨트롤 스트림을 재전송 경로에 연결
    ///
    /// NACK된 시퀀스는 원본 프레임 그대로 오름차순으로 재전송함.
    /// 재전송은 복구 경로이므로 전송 에러를 삼킴
    pub fn listen(&self, receiver: &SseReceiver) {
        let (tx, mut rx) = mpsc::channel::<SseEnvelope>(self.config.channel_depth);

        receiver.subscribe_ctrl(Arc::new(move |env| {
            if tx.try_send(env.clone()).is_err() {
                warn!("컨트롤 채널 포화, 엔벨로프 버림");
            }
        }));

        let rel = self.rel.clone();
        let transport = self.transport.clone();

        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let resend = rel.lock().handle_ctrl(&env);
                if let Some(resend) = resend {
                    for (seq, frames) in resend {
                        debug!("시퀀스 {} 재전송 ({} 패킷)", seq, frames.len());
                        if let Err(e) = transport.send_umps(&frames).await {
                            warn!("재전송 실패: {}", e);
                        }
                    }
                }
            }
        });
    }

    fn prune_pending(&self) {
        let watermark = self.rel.lock().watermark();
        if let Some(watermark) = watermark {
            let mut state = self.state.lock();
            state.pending.retain(|&seq| seq > watermark);
        }
    }

    fn window_has_room(&self) -> bool {
        let state = self.state.lock();
        state.pending.len() < state.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackSession;
    use crate::EV_MESSAGE;

    fn make_sender(config: Config) -> (Arc<SseSender>, Arc<LoopbackSession>, Arc<Mutex<Reliability>>) {
        let transport = Arc::new(LoopbackSession::new());
        let metrics = Arc::new(Metrics::new());
        let rel = Arc::new(Mutex::new(Reliability::new(metrics.clone())));
        let sender = Arc::new(SseSender::new(
            transport.clone(),
            rel.clone(),
            metrics,
            Arc::new(JrClock::new()),
            config,
        ));
        (sender, transport, rel)
    }

    fn captured_batches(transport: &LoopbackSession) -> Arc<Mutex<Vec<Vec<Ump128>>>> {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        transport.subscribe_batches(Arc::new(move |batch| {
            sink.lock().push(batch.to_vec());
        }));
        batches
    }

    #[tokio::test]
    async fn test_small_envelope_uses_flex() {
        let (sender, transport, _) = make_sender(Config::default());
        transport.open().await.unwrap();
        let batches = captured_batches(&transport);

        let env = SseEnvelope::new(EV_MESSAGE, 0, Some("short".into()));
        sender.send(env).await.unwrap();
        sender.flush().await.unwrap();

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].iter().all(|p| p.message_type() == 0xD));
    }

    #[tokio::test]
    async fn test_large_envelope_uses_sysex8() {
        let (sender, transport, _) = make_sender(Config::default());
        transport.open().await.unwrap();
        let batches = captured_batches(&transport);

        let env = SseEnvelope::new(EV_MESSAGE, 0, Some("x".repeat(5 * 1024)));
        sender.send(env).await.unwrap();
        sender.flush().await.unwrap();

        let batches = batches.lock();
        assert!(!batches.is_empty());
        assert!(batches
            .iter()
            .flatten()
            .all(|p| p.message_type() == 0x5));
    }

    #[tokio::test]
    async fn test_buffering_until_flush() {
        let (sender, transport, _) = make_sender(Config::default());
        transport.open().await.unwrap();
        let batches = captured_batches(&transport);

        let env = SseEnvelope::new(EV_MESSAGE, 0, Some("buffered".into()));
        sender.send(env).await.unwrap();

        // MTU에 도달하지 않았으므로 아직 전송되지 않음
        assert!(batches.lock().is_empty());

        sender.flush().await.unwrap();
        assert_eq!(batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_flush_when_mtu_exceeded() {
        let mut config = Config::default();
        config.mtu = 128; // 패킷 7개 수준에서 플러시
        let (sender, transport, _) = make_sender(config);
        transport.open().await.unwrap();
        let batches = captured_batches(&transport);

        // 엔벨로프 하나가 여러 패킷이므로 몇 번 보내면 자동 플러시됨
        for i in 0..4 {
            let env = SseEnvelope::new(EV_MESSAGE, 0, Some(format!("payload-{}", i)));
            sender.send(env).await.unwrap();
        }

        let auto_flushed = batches.lock().len();
        assert!(auto_flushed >= 1);
        assert!(batches
            .lock()
            .iter()
            .all(|b| FRAME_HEADER_LEN + b.len() * 16 <= 128));
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic_from_zero() {
        let (sender, transport, rel) = make_sender(Config::default());
        transport.open().await.unwrap();

        for _ in 0..3 {
            let env = SseEnvelope::new(EV_MESSAGE, 99, None); // 호출자 seq는 무시됨
            sender.send(env).await.unwrap();
        }

        assert_eq!(sender.pending_count(), 3);
        // 신뢰성 버퍼에 0..3이 기록됨
        assert_eq!(rel.lock().buffered(), 3);
    }

    #[tokio::test]
    async fn test_window_backpressure_blocks_then_releases() {
        let mut config = Config::default();
        config.window = 2;
        let (sender, transport, rel) = make_sender(config);
        transport.open().await.unwrap();

        for _ in 0..2 {
            let env = SseEnvelope::new(EV_MESSAGE, 0, Some("w".into()));
            sender.send(env).await.unwrap();
        }

        // 윈도우가 가득 차서 세 번째 송신은 지연됨
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            sender.send(SseEnvelope::new(EV_MESSAGE, 0, Some("blocked".into()))),
        )
        .await;
        assert!(blocked.is_err());

        // ACK가 pending을 줄이면 진행됨
        let ack = SseEnvelope::ctrl(1, r#"{"ack":1}"#.into());
        rel.lock().handle_ctrl(&ack);

        let released = tokio::time::timeout(
            Duration::from_secs(1),
            sender.send(SseEnvelope::new(EV_MESSAGE, 0, Some("released".into()))),
        )
        .await;
        assert!(released.is_ok());
    }
}
