//! SysEx8 청커 (대형 블롭용)
//!
//! 페이로드를 14바이트 단위로 쪼개는 조각화 포맷. 논리 메시지의 첫 바이트는
//! 스트림 ID(0~255)로, 동시 대형 전송을 구분하는 데 사용됨.
//!
//! 바이트 레이아웃:
//! - byte0 = 0x50 | group
//! - byte1 = (status << 4) | size
//! - byte2..15 = 페이로드 (최대 14바이트)

use bytes::Bytes;

use crate::packet::Ump128;
use crate::SYSEX8_CHUNK_SIZE;

/// 조각 상태 니블
const STATUS_COMPLETE: u8 = 0x0;
const STATUS_START: u8 = 0x1;
const STATUS_CONTINUE: u8 = 0x2;
const STATUS_END: u8 = 0x3;

/// SysEx8 청커 (조립 버퍼 내장)
///
/// Flex와 동일한 계약이지만 패킷당 14바이트, 스트림 ID 프리픽스가 다름
#[derive(Debug, Default)]
pub struct SysEx8Packer {
    buffer: Vec<u8>,
    current_stream: Option<u8>,
}

impl SysEx8Packer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 스트림 ID를 앞에 붙인 블롭을 SysEx8 패킷 목록으로 분할
    pub fn pack(&self, stream_id: u8, blob: &[u8], group: u8) -> Vec<Ump128> {
        let mut message = Vec::with_capacity(1 + blob.len());
        message.push(stream_id);
        message.extend_from_slice(blob);

        let mut packets = Vec::with_capacity(message.len().div_ceil(SYSEX8_CHUNK_SIZE));
        let mut index = 0;

        while index < message.len() {
            let remaining = message.len() - index;
            let size = remaining.min(SYSEX8_CHUNK_SIZE);
            let chunk = &message[index..index + size];

            let status = if message.len() <= SYSEX8_CHUNK_SIZE {
                STATUS_COMPLETE
            } else if index == 0 {
                STATUS_START
            } else if remaining <= SYSEX8_CHUNK_SIZE {
                STATUS_END
            } else {
                STATUS_CONTINUE
            };

            let mut bytes = [0u8; 16];
            bytes[0] = 0x50 | (group & 0x0F);
            bytes[1] = (status << 4) | (size as u8);
            bytes[2..2 + size].copy_from_slice(chunk);

            packets.push(Ump128::from_byte_array(bytes));
            index += size;
        }

        packets
    }

    /// 패킷들을 스캔하여 완성된 (스트림 ID, 블롭) 쌍들을 반환
    ///
    /// Start 없는 Continue/End는 무시 (의도된 손실 재동기화)
    pub fn unpack(&mut self, umps: &[Ump128]) -> Vec<(u8, Bytes)> {
        let mut results = Vec::new();

        for pkt in umps {
            let bytes = pkt.to_bytes();
            let status = (bytes[1] >> 4) & 0x0F;
            let count = ((bytes[1] & 0x0F) as usize).min(SYSEX8_CHUNK_SIZE);
            let data = &bytes[2..2 + count];

            match status {
                STATUS_COMPLETE => {
                    if let Some((&sid, rest)) = data.split_first() {
                        results.push((sid, Bytes::copy_from_slice(rest)));
                    }
                }
                STATUS_START => {
                    if let Some((&sid, rest)) = data.split_first() {
                        self.current_stream = Some(sid);
                        self.buffer.clear();
                        self.buffer.extend_from_slice(rest);
                    }
                }
                STATUS_CONTINUE => {
                    if self.current_stream.is_some() {
                        self.buffer.extend_from_slice(data);
                    }
                }
                STATUS_END => {
                    if let Some(sid) = self.current_stream.take() {
                        self.buffer.extend_from_slice(data);
                        results.push((sid, Bytes::from(std::mem::take(&mut self.buffer))));
                    }
                }
                _ => continue, // 알 수 없는 상태는 버림
            }
        }

        results
    }
}
