//! # DTL (Delay-Tolerant Transfer Layer)
//!
//! 비연결형 명령 링크 위에서 동작하는 비트맵 윈도우 기반 선택적 재전송 파일 전송 계층
//!
//! ## 핵심 특징
//! - **트랜잭션 단위 전송**: 파일 하나 = 트랜잭션 하나, 방향별 u8 tid
//! - **고정 크기 조각**: 인덱스 단위 지연 생성, 조각 자체에는 헤더 없음
//! - **32비트 윈도우 보고**: 보유/누락 상태를 MSB 우선 비트맵으로 교환
//! - **전체 해시 검증**: 조립 완료 시 SHA-256 비교
//! - **진단 덤프**: 트랜잭션 상태를 JSON으로 기록
//!
//! 타이머와 재시도는 없다. 언제 무엇을 요청할지는 상위 계층이 정한다.

pub mod bitmap;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fragment;
pub mod manager;
pub mod message;
pub mod stats;
pub mod transaction;

pub use bitmap::{apply_update, encode_missing_set, encode_window, WindowUpdate};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, ErrorKind, Result};
pub use fragment::{FileHash, Fragment};
pub use manager::{CreateRequest, FragmentRequest, TransactionManager};
pub use message::{Message, MessageType};
pub use stats::{ManagerStats, TransactionStats};
pub use transaction::{
    Direction, FinalizeOutcome, FragmentIndex, Transaction, TransactionId, TransactionState,
};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 조각 크기 (바이트)
pub const DEFAULT_FRAGMENT_SIZE: usize = 200;

/// 방향별 최대 트랜잭션 수 (u8 tid 공간)
pub const MAX_TRANSACTIONS: usize = 256;

/// 누락 보고 윈도우 폭 (조각 수)
pub const WINDOW_SIZE: u32 = 32;

/// 파일 해시 길이 (바이트)
pub const HASH_LEN: usize = 32;

/// 매직 넘버 (메시지 식별용)
pub const MAGIC_NUMBER: u32 = 0x44544C50; // "DTLP"
