//! 에러 타입 정의

use thiserror::Error;

use crate::transaction::{Direction, FragmentIndex, TransactionId};

/// 에러 분류
///
/// 명령 계층은 이 분류만 보고 응답을 결정한다. 재시도는 항상 상대측 명령으로만 일어난다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 잘못된 오프셋/길이, 중복 tid, 조각 길이 불일치
    InputValidation,

    /// tid 고갈, 자원 한도 초과
    ResourceState,

    /// 조립 후 해시 불일치
    IntegrityFailure,

    /// 존재하지 않는 트랜잭션 또는 조각
    NotFound,
}

/// DTL 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("덤프 직렬화 에러: {0}")]
    Dump(#[from] serde_json::Error),

    #[error("원본을 읽을 수 없음: {path}: {source}")]
    SourceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("빈 파일은 전송할 수 없음: {path}")]
    Empty { path: String },

    #[error("파일이 너무 큼: {num_packets} 조각 (최대 {max})")]
    TooLarge { num_packets: u64, max: u64 },

    #[error("유효하지 않은 조각 크기: {fragment_size}")]
    InvalidFragmentSize { fragment_size: usize },

    #[error("유효하지 않은 조각 수: {num_packets}")]
    InvalidPacketCount { num_packets: u16 },

    #[error("이미 존재하는 트랜잭션: {direction} tid={tid}")]
    DuplicateTransaction {
        direction: Direction,
        tid: TransactionId,
    },

    #[error("트랜잭션 없음: {direction} tid={tid}")]
    NotFound {
        direction: Direction,
        tid: TransactionId,
    },

    #[error("알 수 없는 조각: tid={tid}, index={index}")]
    UnknownFragment {
        tid: TransactionId,
        index: FragmentIndex,
    },

    #[error("조각 길이 불일치: index={index}, expected {expected}, got {got}")]
    LengthMismatch {
        index: FragmentIndex,
        expected: String,
        got: usize,
    },

    #[error("유효하지 않은 윈도우: seq_offset={seq_offset}, num_packets={num_packets}")]
    InvalidWindow { seq_offset: u16, num_packets: u16 },

    #[error("잘못된 방향의 연산: {operation} 는 {expected} 트랜잭션 전용")]
    WrongDirection {
        operation: &'static str,
        expected: Direction,
    },

    #[error("종료된 트랜잭션: tid={tid}, state={state}")]
    Terminated { tid: TransactionId, state: String },

    #[error("완료되지 않은 트랜잭션: tid={tid}, state={state}")]
    NotComplete { tid: TransactionId, state: String },

    #[error("사용 가능한 tid 없음 ({direction}, 최대 {capacity})")]
    NoFreeTransactionId {
        direction: Direction,
        capacity: usize,
    },

    #[error("버퍼 한도 초과: 요청 {requested} bytes, 사용 중 {in_use}, 최대 {max}")]
    ResourceExhausted {
        requested: usize,
        in_use: usize,
        max: usize,
    },

    #[error("해시 불일치: tid={tid}, expected {expected}, got {got}")]
    IntegrityFailure {
        tid: TransactionId,
        expected: String,
        got: String,
    },

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("메시지가 너무 짧음: {len} bytes")]
    Truncated { len: usize },

    #[error("알 수 없는 메시지 타입: {0}")]
    UnknownMessageType(u8),
}

impl Error {
    /// 에러 분류 반환
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } | Error::UnknownFragment { .. } => ErrorKind::NotFound,
            Error::NoFreeTransactionId { .. }
            | Error::ResourceExhausted { .. }
            | Error::SourceUnavailable { .. }
            | Error::Terminated { .. }
            | Error::NotComplete { .. }
            | Error::Io(_) => ErrorKind::ResourceState,
            Error::IntegrityFailure { .. } => ErrorKind::IntegrityFailure,
            _ => ErrorKind::InputValidation,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::NotFound {
            direction: Direction::Rx,
            tid: 3,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::NoFreeTransactionId {
            direction: Direction::Tx,
            capacity: 256,
        };
        assert_eq!(err.kind(), ErrorKind::ResourceState);

        let err = Error::LengthMismatch {
            index: 0,
            expected: "200".into(),
            got: 10,
        };
        assert_eq!(err.kind(), ErrorKind::InputValidation);

        let err = Error::DuplicateTransaction {
            direction: Direction::Rx,
            tid: 0,
        };
        assert_eq!(err.kind(), ErrorKind::InputValidation);
    }

    #[test]
    fn test_error_display() {
        let err = Error::NotFound {
            direction: Direction::Tx,
            tid: 7,
        };
        assert!(err.to_string().contains("tid=7"));
        assert!(err.to_string().contains("TX"));
    }
}
