//! 세션 메트릭
//!
//! 세션 상태와 분리된 자체 잠금을 사용해 메트릭 조회가 송수신 핫패스와
//! 경합하지 않도록 함

use parking_lot::Mutex;

/// 내부 카운터
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    send_bytes_total: u64,
    recv_bytes_total: u64,
    acks_sent: u64,
    nacks_sent: u64,
    retransmits: u64,
    seq_gaps_detected: u64,
}

/// 프로세스 수준 전송 메트릭
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Counters>,
}

/// 메트릭 불변 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// 송신한 엔벨로프 바이트 합계
    pub send_bytes_total: u64,

    /// 수신한 블롭 바이트 합계
    pub recv_bytes_total: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,

    /// 보낸 NACK 수
    pub nacks_sent: u64,

    /// 재전송된 패킷 수
    pub retransmits: u64,

    /// 감지된 시퀀스 갭 수
    pub seq_gaps_detected: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 송신 바이트 기록
    pub fn add_send(&self, bytes: usize) {
        self.inner.lock().send_bytes_total += bytes as u64;
    }

    /// 수신 바이트 기록
    pub fn add_recv(&self, bytes: usize) {
        self.inner.lock().recv_bytes_total += bytes as u64;
    }

    pub fn inc_acks_sent(&self) {
        self.inner.lock().acks_sent += 1;
    }

    pub fn inc_nacks_sent(&self) {
        self.inner.lock().nacks_sent += 1;
    }

    pub fn inc_retransmits(&self, n: u64) {
        self.inner.lock().retransmits += n;
    }

    pub fn inc_seq_gaps_detected(&self) {
        self.inner.lock().seq_gaps_detected += 1;
    }

    /// 스냅샷 반환
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = *self.inner.lock();
        MetricsSnapshot {
            send_bytes_total: c.send_bytes_total,
            recv_bytes_total: c.recv_bytes_total,
            acks_sent: c.acks_sent,
            nacks_sent: c.nacks_sent,
            retransmits: c.retransmits,
            seq_gaps_detected: c.seq_gaps_detected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.add_send(100);
        metrics.add_send(20);
        metrics.add_recv(64);
        metrics.inc_acks_sent();
        metrics.inc_nacks_sent();
        metrics.inc_retransmits(3);
        metrics.inc_seq_gaps_detected();

        let snap = metrics.snapshot();
        assert_eq!(snap.send_bytes_total, 120);
        assert_eq!(snap.recv_bytes_total, 64);
        assert_eq!(snap.acks_sent, 1);
        assert_eq!(snap.nacks_sent, 1);
        assert_eq!(snap.retransmits, 3);
        assert_eq!(snap.seq_gaps_detected, 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let metrics = Metrics::new();
        let before = metrics.snapshot();
        metrics.add_send(1);
        assert_eq!(before.send_bytes_total, 0);
        assert_eq!(metrics.snapshot().send_bytes_total, 1);
    }
}
