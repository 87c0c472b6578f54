//! 에러 타입 정의

use thiserror::Error;

/// SOM 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 직렬화 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("세션이 열려 있지 않음")]
    NotOpen,

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
