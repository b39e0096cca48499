//! 에러 타입 정의

use thiserror::Error;

/// RFTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    /// 문법에 맞지 않는 메시지 (토큰 수, 숫자 필드, base64, 페이로드 길이)
    #[error("잘못된 메시지: {0}")]
    MalformedMessage(String),

    /// 문법은 맞지만 기대하지 않은 응답
    #[error("프로토콜 불일치: expected {expected}, got {got}")]
    ProtocolMismatch { expected: String, got: String },

    #[error("파일 없음: {filename}")]
    NotFound { filename: String },

    #[error("응답 없음: {attempts}회 시도 후 포기 (last message: {last_message})")]
    NoResponse { attempts: u32, last_message: String },

    /// 서버 파일이 허가 시점의 크기보다 작아짐
    #[error("짧은 읽기: {filename}, expected {expected} bytes, got {got}")]
    ShortRead {
        filename: String,
        expected: u64,
        got: u64,
    },

    #[error("데이터 포트 할당 실패: {attempts}회 시도")]
    PortsExhausted { attempts: u32 },

    #[error("유효하지 않은 파일 이름: {0:?}")]
    InvalidFilename(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// 메시지 파싱 에러 생성 헬퍼
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedMessage(reason.into())
    }

    pub(crate) fn mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Error::ProtocolMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
