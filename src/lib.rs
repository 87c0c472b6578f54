//! # SOM (SSE over MIDI)
//!
//! MIDI 2.0 UMP 기반 SSE 이벤트 신뢰 전송 프로토콜
//!
//! ## 핵심 특징
//! - **128비트 UMP 패킷**: 모든 데이터는 4워드 고정 패킷으로 전송
//! - **이중 청킹**: Flex(12바이트)와 SysEx8(14바이트) 두 가지 조각화 포맷
//! - **ACK/NACK 기반**: 시퀀스 번호로 갭 감지, 누락 시퀀스만 재전송 요청
//! - **재전송 버퍼**: 시퀀스별 원본 프레임을 상한 있는 버퍼에 보관
//! - **윈도우 흐름 제어**: 미확인 시퀀스 수 제한으로 송신 백프레셔
//! - **JR 타임스탬프**: 모노토닉 틱 기반 타임스탬프와 벽시계 변환

pub mod config;
pub mod envelope;
pub mod error;
pub mod flex;
pub mod metrics;
pub mod packet;
pub mod receiver;
pub mod reliability;
pub mod sender;
pub mod sysex8;
pub mod timing;
pub mod transport;

pub use config::Config;
pub use envelope::{Ctrl, Fragment, SseEnvelope};
pub use error::{Error, Result};
pub use flex::{FlexFormat, FlexPacker};
pub use metrics::{Metrics, MetricsSnapshot};
pub use packet::Ump128;
pub use receiver::SseReceiver;
pub use reliability::Reliability;
pub use sender::SseSender;
pub use sysex8::SysEx8Packer;
pub use timing::JrClock;
pub use transport::{HandshakeState, LoopbackSession, MidiTransport, RtpMidiConfig, RtpMidiSession};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// Flex 패킷당 페이로드 바이트 수
pub const FLEX_CHUNK_SIZE: usize = 12;

/// SysEx8 패킷당 페이로드 바이트 수
pub const SYSEX8_CHUNK_SIZE: usize = 14;

/// Flex 포맷으로 보내는 최대 직렬화 크기 (초과 시 SysEx8 사용)
pub const FLEX_CAPACITY: usize = FLEX_CHUNK_SIZE * 32;

/// 재전송 버퍼 기본 상한 (시퀀스 수)
pub const RETRANSMIT_BUFFER_CAP: usize = 512;

/// 전송 프레임 고정 헤더 크기 (바이트)
pub const FRAME_HEADER_LEN: usize = 12;

/// 컨트롤 이벤트 종류 식별자
pub const EV_CTRL: &str = "ctrl";

/// 일반 메시지 이벤트 종류 식별자
pub const EV_MESSAGE: &str = "message";
