//! Flex 청커
//!
//! 페이로드를 12바이트 단위로 쪼개 128비트 패킷에 싣는 조각화 포맷.
//! 작거나 중간 크기의 엔벨로프에 사용됨.
//!
//! 바이트 레이아웃:
//! - byte0 = 0xD0 | group
//! - byte1 = (format << 4) | status_bank
//! - byte2 = status
//! - byte3 = 페이로드 바이트 수
//! - byte4..15 = 페이로드 (12바이트로 제로 패딩)

use bytes::Bytes;

use crate::packet::Ump128;
use crate::FLEX_CHUNK_SIZE;

/// Flex 청크 포맷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlexFormat {
    /// 단일 패킷에 완결
    Complete = 0x0,

    /// 조각 시작
    Start = 0x1,

    /// 중간 조각
    Continue = 0x2,

    /// 마지막 조각
    End = 0x3,
}

impl FlexFormat {
    /// 니블 값에서 변환
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(FlexFormat::Complete),
            0x1 => Some(FlexFormat::Start),
            0x2 => Some(FlexFormat::Continue),
            0x3 => Some(FlexFormat::End),
            _ => None,
        }
    }
}

/// Flex 청커 (조립 버퍼 내장)
///
/// `unpack`은 내부 조립 버퍼를 소비하므로 재시작 불가.
/// 청커 인스턴스당 동시에 하나의 조각화 메시지만 조립함.
#[derive(Debug, Default)]
pub struct FlexPacker {
    buffer: Vec<u8>,
    collecting: bool,
}

impl FlexPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 페이로드를 Flex 패킷 목록으로 분할
    ///
    /// 한 청크에 들어가면 Complete, 아니면 Start/Continue.../End
    pub fn pack(&self, payload: &[u8], group: u8, status_bank: u8, status: u8) -> Vec<Ump128> {
        let total = payload.len().div_ceil(FLEX_CHUNK_SIZE).max(1);
        let mut packets = Vec::with_capacity(total);

        let mut index = 0;
        loop {
            let remaining = payload.len() - index;
            let size = remaining.min(FLEX_CHUNK_SIZE);
            let chunk = &payload[index..index + size];

            let format = if total == 1 {
                FlexFormat::Complete
            } else if index == 0 {
                FlexFormat::Start
            } else if remaining <= FLEX_CHUNK_SIZE {
                FlexFormat::End
            } else {
                FlexFormat::Continue
            };

            let mut bytes = [0u8; 16];
            bytes[0] = 0xD0 | (group & 0x0F);
            bytes[1] = ((format as u8) << 4) | (status_bank & 0x0F);
            bytes[2] = status;
            bytes[3] = size as u8;
            bytes[4..4 + size].copy_from_slice(chunk);

            packets.push(Ump128::from_byte_array(bytes));

            index += size;
            if index >= payload.len() {
                break;
            }
        }

        packets
    }

    /// 패킷들을 입력 순서대로 스캔하여 완성된 블롭들을 반환
    ///
    /// Start 없이 도착한 Continue/End는 조용히 무시됨 (의도된 손실 재동기화)
    pub fn unpack(&mut self, umps: &[Ump128]) -> Vec<Bytes> {
        let mut results = Vec::new();

        for pkt in umps {
            let bytes = pkt.to_bytes();
            let format = match FlexFormat::from_raw((bytes[1] >> 4) & 0x0F) {
                Some(f) => f,
                None => continue, // 알 수 없는 포맷은 버림
            };
            let count = (bytes[3] as usize).min(FLEX_CHUNK_SIZE);
            let payload = &bytes[4..4 + count];

            match format {
                FlexFormat::Complete => {
                    results.push(Bytes::copy_from_slice(payload));
                }
                FlexFormat::Start => {
                    self.buffer.clear();
                    self.buffer.extend_from_slice(payload);
                    self.collecting = true;
                }
                FlexFormat::Continue => {
                    if self.collecting {
                        self.buffer.extend_from_slice(payload);
                    }
                }
                FlexFormat::End => {
                    if self.collecting {
                        self.buffer.extend_from_slice(payload);
                        results.push(Bytes::from(std::mem::take(&mut self.buffer)));
                        self.collecting = false;
                    }
                }
            }
        }

        results
    }
}
