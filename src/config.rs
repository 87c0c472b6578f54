//! 프로토콜 설정

use crate::{FLEX_CAPACITY, RETRANSMIT_BUFFER_CAP};

/// SOM 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 오케스트레이터 내부 송신 버퍼 MTU (바이트)
    pub mtu: usize,

    /// 전송 계층 데이터그램 MTU (바이트)
    pub transport_mtu: usize,

    /// Flex 포맷 한계 (직렬화 크기가 초과하면 SysEx8 사용)
    pub flex_capacity: usize,

    /// 송신 윈도우 (미확인 시퀀스 최대 수, 기본 무제한)
    pub window: usize,

    /// 재전송 버퍼 상한 (시퀀스 수)
    pub retransmit_buffer_cap: usize,

    /// UMP 그룹 니블
    pub group: u8,

    /// Flex 상태 뱅크 니블
    pub status_bank: u8,

    /// Flex 상태 바이트
    pub status: u8,

    /// 핸드쉐이크 대기 타임아웃 (밀리초, 초과 시 Assumed 상태로 전환)
    pub handshake_timeout_ms: u64,

    /// 윈도우가 찼을 때 재시도 간격 (밀리초)
    pub window_retry_interval_ms: u64,

    /// 수신 배치/컨트롤 채널 깊이
    pub channel_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1200,
            transport_mtu: 1500,
            flex_capacity: FLEX_CAPACITY,
            window: usize::MAX,               // 기본 무제한
            retransmit_buffer_cap: RETRANSMIT_BUFFER_CAP,
            group: 0x1,
            status_bank: 0x01,
            status: 0x01,
            handshake_timeout_ms: 150,
            window_retry_interval_ms: 10,
            channel_depth: 256,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 손실이 잦은 링크용 설정
    ///
    /// 윈도우를 좁혀 미확인 적체를 줄이고 재전송 버퍼를 넉넉히 유지
    pub fn lossy_link() -> Self {
        Self {
            window: 64,
            retransmit_buffer_cap: 1024,
            window_retry_interval_ms: 20,
            ..Self::default()
        }
    }

    /// 저지연 우선 설정
    ///
    /// 작은 MTU로 배치 지연을 줄임
    pub fn low_latency() -> Self {
        Self {
            mtu: 512,
            window: 256,
            window_retry_interval_ms: 5,
            ..Self::default()
        }
    }
}
