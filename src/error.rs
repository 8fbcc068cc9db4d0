//! CDC 관련 에러 타입

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("복제 연결 에러: {0}")]
    ConnectionError(String),

    #[error("유효하지 않은 트랜잭션 식별자: {0}")]
    InvalidIdentifier(String),

    #[error("VGTID 처리 에러: {0}")]
    VgtidError(String),

    #[error("테이블을 해석할 수 없습니다: {0}")]
    UnresolvableTable(String),

    #[error("이벤트 디스패치 에러: {0}")]
    DispatchError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("잘못된 세션 상태: {0}")]
    InvalidState(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CdcError>;
