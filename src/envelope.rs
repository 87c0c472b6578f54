//! SSE 엔벨로프와 컨트롤 페이로드 정의
//!
//! 엔벨로프는 JSON으로 직렬화되어 청커를 통해 UMP 패킷으로 전송됨

use serde::{Deserialize, Serialize};

use crate::{EV_CTRL, PROTOCOL_VERSION};

/// 애플리케이션 레벨 조각화 디스크립터
///
/// 이 코어는 해석하지 않고 그대로 전달함 (조립은 소비자 책임)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// 조각 인덱스
    pub i: u32,

    /// 총 조각 수
    pub n: u32,
}

/// SSE 엔벨로프 (애플리케이션 가시 단위)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseEnvelope {
    /// 프로토콜 버전
    #[serde(default = "default_version")]
    pub v: u32,

    /// 이벤트 종류 ("message", "ctrl" 등)
    pub ev: String,

    /// 이벤트 ID (선택)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// 컨텐츠 타입 (선택)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,

    /// 시퀀스 번호 (방향별 0부터 단조 증가, 순서/중복 판정의 유일한 키)
    pub seq: u64,

    /// 애플리케이션 조각화 디스크립터 (선택)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frag: Option<Fragment>,

    /// JR 틱 타임스탬프 (선택)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,

    /// 페이로드 (선택)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION as u32
}

impl SseEnvelope {
    /// 새 엔벨로프 생성
    pub fn new(ev: impl Into<String>, seq: u64, data: Option<String>) -> Self {
        Self {
            v: default_version(),
            ev: ev.into(),
            id: None,
            ct: None,
            seq,
            frag: None,
            ts: None,
            data,
        }
    }

    /// 컨트롤 엔벨로프 생성
    pub fn ctrl(seq: u64, payload: String) -> Self {
        Self::new(EV_CTRL, seq, Some(payload))
    }

    /// 컨트롤 엔벨로프 여부
    pub fn is_ctrl(&self) -> bool {
        self.ev == EV_CTRL
    }
}

/// 컨트롤 페이로드 와이어 표현 (엔벨로프 data 내 중첩 JSON)
#[derive(Debug, Serialize, Deserialize)]
struct CtrlWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    nack: Option<Vec<u64>>,
}

/// 디코딩된 컨트롤 명령
///
/// ad hoc 필드 탐색 대신 한 번 디코딩 후 전수 매칭으로 처리함
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ctrl {
    /// 워터마크 확인
    Ack(u64),

    /// 누락 시퀀스 재전송 요청
    Nack(Vec<u64>),

    /// ACK와 NACK 동시 전달
    Both { ack: u64, nack: Vec<u64> },
}

impl Ctrl {
    /// 컨트롤 엔벨로프에서 디코딩
    ///
    /// ev가 "ctrl"이 아니거나 data가 유효한 컨트롤 JSON이 아니면 None
    pub fn decode(env: &SseEnvelope) -> Option<Self> {
        if !env.is_ctrl() {
            return None;
        }
        let data = env.data.as_deref()?;
        let wire: CtrlWire = serde_json::from_str(data).ok()?;

        match (wire.ack, wire.nack) {
            (Some(ack), Some(nack)) => Some(Ctrl::Both { ack, nack }),
            (Some(ack), None) => Some(Ctrl::Ack(ack)),
            (None, Some(nack)) => Some(Ctrl::Nack(nack)),
            (None, None) => None,
        }
    }

    /// 컨트롤 페이로드 문자열로 인코딩
    pub fn encode(&self) -> String {
        let wire = match self {
            Ctrl::Ack(ack) => CtrlWire {
                ack: Some(*ack),
                nack: None,
            },
            Ctrl::Nack(nack) => CtrlWire {
                ack: None,
                nack: Some(nack.clone()),
            },
            Ctrl::Both { ack, nack } => CtrlWire {
                ack: Some(*ack),
                nack: Some(nack.clone()),
            },
        };
        // 구조가 고정되어 있어 실패하지 않음
        serde_json::to_string(&wire).unwrap_or_default()
    }
}
