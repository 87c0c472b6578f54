//! 신뢰성 엔진
//!
//! - 송신 시퀀스별 원본 프레임을 상한 있는 버퍼에 보관
//! - ACK/NACK 컨트롤 엔벨로프 생성
//! - 수신한 컨트롤 엔벨로프를 재전송 지시로 변환

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::envelope::{Ctrl, SseEnvelope};
use crate::metrics::Metrics;
use crate::packet::Ump128;
use crate::RETRANSMIT_BUFFER_CAP;

/// 신뢰성 엔진
///
/// 세션 상태 뮤텍스 아래에서 사용되는 일반 구조체 (자체 잠금 없음)
pub struct Reliability {
    /// 확인된 최고 시퀀스 (단조 증가 워터마크, 첫 ACK 전에는 None)
    watermark: Option<u64>,

    /// 시퀀스 -> 원본 프레임 버퍼 (키 순서 유지, 최소 키부터 축출)
    buffer: BTreeMap<u64, Vec<Ump128>>,

    /// 버퍼 상한 (초과 시 가장 오래된 시퀀스 축출)
    capacity: usize,

    /// 메트릭 훅
    metrics: Arc<Metrics>,
}

impl Reliability {
    /// 기본 상한으로 생성
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::with_capacity(RETRANSMIT_BUFFER_CAP, metrics)
    }

    /// 상한 지정 생성
    pub fn with_capacity(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            watermark: None,
            buffer: BTreeMap::new(),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// 확인된 최고 시퀀스 (ACK가 없었다면 0)
    pub fn highest_acked(&self) -> u64 {
        self.watermark.unwrap_or(0)
    }

    /// 워터마크 (첫 ACK 전에는 None, seq 0의 확인 여부를 구분함)
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// 현재 버퍼에 보관 중인 시퀀스 수
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 재전송 대비로 프레임 보관
    ///
    /// 상한 초과 시 가장 낮은 시퀀스를 버림. 아주 오래된 미확인 시퀀스는
    /// 복구 불가능해질 수 있음 (메모리 상한과의 명시적 트레이드오프)
    pub fn record(&mut self, seq: u64, frames: Vec<Ump128>) {
        self.buffer.insert(seq, frames);
        if self.buffer.len() > self.capacity {
            if let Some((&oldest, _)) = self.buffer.iter().next() {
                self.buffer.remove(&oldest);
                debug!("재전송 버퍼 상한 초과, 시퀀스 {} 축출", oldest);
            }
        }
    }

    /// `h`까지 확인하는 ACK 컨트롤 엔벨로프 생성
    pub fn build_ack(&self, h: u64) -> SseEnvelope {
        self.metrics.inc_acks_sent();
        SseEnvelope::ctrl(h, Ctrl::Ack(h).encode())
    }

    /// 누락 시퀀스 목록을 담은 NACK 컨트롤 엔벨로프 생성
    pub fn build_nack(&self, seqs: Vec<u64>) -> SseEnvelope {
        self.metrics.inc_nacks_sent();
        SseEnvelope::ctrl(self.highest_acked(), Ctrl::Nack(seqs).encode())
    }

    /// 수신한 컨트롤 엔벨로프 처리
    ///
    /// ACK는 워터마크를 올리고 `seq <= ack`인 버퍼 엔트리를 정리함.
    /// NACK는 아직 버퍼에 남은 시퀀스의 프레임을 모아 반환함. 이미 축출된
    /// 시퀀스는 조용히 건너뜀 (메트릭으로만 관측 가능).
    /// 재전송할 것이 없으면 None.
    pub fn handle_ctrl(&mut self, env: &SseEnvelope) -> Option<BTreeMap<u64, Vec<Ump128>>> {
        let ctrl = Ctrl::decode(env)?;

        let (ack, nacks) = match ctrl {
            Ctrl::Ack(ack) => (Some(ack), None),
            Ctrl::Nack(nacks) => (None, Some(nacks)),
            Ctrl::Both { ack, nack } => (Some(ack), Some(nack)),
        };

        if let Some(ack) = ack {
            if self.watermark.map_or(true, |w| ack > w) {
                self.watermark = Some(ack);
            }
            // 워터마크 이하 프레임은 더 이상 필요 없음
            self.buffer.retain(|&seq, _| seq > ack);
        }

        let nacks = nacks?;
        let mut resend = BTreeMap::new();
        let mut retransmit_count = 0;

        for seq in nacks {
            if let Some(frames) = self.buffer.get(&seq) {
                retransmit_count += frames.len();
                resend.insert(seq, frames.clone());
            }
        }

        if retransmit_count > 0 {
            self.metrics.inc_retransmits(retransmit_count as u64);
        }

        if resend.is_empty() {
            None
        } else {
            Some(resend)
        }
    }
}
