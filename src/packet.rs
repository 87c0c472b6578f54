//! 128비트 UMP 패킷 정의
//!
//! 4개의 32비트 워드로 구성된 불변 패킷. 와이어 상에서는 빅엔디안.

/// 128비트 UMP 패킷 (4워드)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ump128 {
    words: [u32; 4],
}

impl Ump128 {
    /// 새 패킷 생성
    pub fn new(word0: u32, word1: u32, word2: u32, word3: u32) -> Self {
        Self {
            words: [word0, word1, word2, word3],
        }
    }

    /// 워드 슬라이스에서 생성 (정확히 4워드가 아니면 None)
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() != 4 {
            return None;
        }
        Some(Self {
            words: [words[0], words[1], words[2], words[3]],
        })
    }

    /// 빅엔디안 16바이트에서 생성 (길이 부족 시 None)
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let off = i * 4;
            *word = u32::from_be_bytes([
                bytes[off],
                bytes[off + 1],
                bytes[off + 2],
                bytes[off + 3],
            ]);
        }
        Some(Self { words })
    }

    /// 바이트 배열에서 생성
    pub fn from_byte_array(bytes: [u8; 16]) -> Self {
        // 길이가 보장되므로 실패하지 않음
        Self::from_bytes(&bytes).unwrap()
    }

    /// 워드 배열 반환
    pub fn words(&self) -> [u32; 4] {
        self.words
    }

    /// 빅엔디안 16바이트로 직렬화
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, word) in self.words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// 메시지 타입 (word0 상위 니블)
    pub fn message_type(&self) -> u8 {
        ((self.words[0] >> 28) & 0x0F) as u8
    }

    /// 그룹 (word0 두 번째 니블)
    pub fn group(&self) -> u8 {
        ((self.words[0] >> 24) & 0x0F) as u8
    }
}
