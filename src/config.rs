//! 전송 계층 설정
//!
//! 설정 파일 로딩은 상위 계층의 몫이며 여기서는 값과 프리셋만 제공한다.

use std::path::PathBuf;

use crate::{DEFAULT_FRAGMENT_SIZE, MAX_TRANSACTIONS};

/// DTL 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 조각 크기 (바이트), 트랜잭션 생성 후 변경 불가
    pub fragment_size: usize,

    /// 방향별 최대 동시 트랜잭션 수 (1 ~ 256)
    pub max_transactions: usize,

    /// 전체 활성 트랜잭션의 버퍼 바이트 한도
    /// None이면 제한 없음
    pub max_buffered_bytes: Option<usize>,

    /// 진단 덤프 저장 폴더
    pub dump_dir: PathBuf,

    /// 덤프에 수신 조각별 CRC32 목록 포함 여부
    pub dump_fragments: bool,

    /// 수신측이 누락 보고를 보내기 전 수신할 조각 수
    /// 0이면 상위 계층이 poll할 때만 보고
    pub update_interval_fragments: usize,

    /// 수신 조각을 메모리에 조립할지 여부
    /// false이면 수신 폴더의 사전 할당 파일에 직접 기록
    pub buffer_in_memory: bool,

    /// 파일 기반 조립 시 저장 폴더
    pub receive_dir: PathBuf,

    /// 한 번에 요청할 조각 수 (GENERATE_X_PACKETS의 x)
    /// 0이면 GENERATE_ALL_PACKETS 사용
    pub batch_size: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            max_transactions: MAX_TRANSACTIONS,
            max_buffered_bytes: None,
            dump_dir: PathBuf::from("transaction_history"),
            dump_fragments: false,
            update_interval_fragments: 64,
            buffer_in_memory: true,
            receive_dir: PathBuf::from("received"),
            batch_size: 0,
        }
    }
}

impl Config {
    /// 비행 소프트웨어용 설정
    ///
    /// 메모리가 작은 온보드 컴퓨터 기준
    pub fn flight() -> Self {
        Self {
            fragment_size: 200,
            max_transactions: 8,
            max_buffered_bytes: Some(64 * 1024), // 64KB
            dump_dir: PathBuf::from("transaction_history"),
            dump_fragments: false,
            update_interval_fragments: 32,
            buffer_in_memory: false,
            receive_dir: PathBuf::from("received"),
            batch_size: 32,
        }
    }

    /// 지상국용 설정
    ///
    /// 요청 배치는 `flight()`의 버퍼 한도 안에 들어가는 크기
    pub fn ground_station() -> Self {
        Self {
            fragment_size: 200,
            max_transactions: MAX_TRANSACTIONS,
            max_buffered_bytes: None,
            dump_dir: PathBuf::from("transaction_history"),
            dump_fragments: true,
            update_interval_fragments: 64,
            buffer_in_memory: true,
            receive_dir: PathBuf::from("received"),
            batch_size: 32,
        }
    }

    /// 손실이 심한 링크용 설정
    ///
    /// 작은 배치와 잦은 누락 보고로 재전송 낭비를 줄임
    pub fn lossy_link() -> Self {
        Self {
            fragment_size: 128,
            max_transactions: MAX_TRANSACTIONS,
            max_buffered_bytes: None,
            dump_dir: PathBuf::from("transaction_history"),
            dump_fragments: false,
            update_interval_fragments: 16,
            buffer_in_memory: true,
            receive_dir: PathBuf::from("received"),
            batch_size: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(Config::default().max_transactions, 256);
        assert_eq!(Config::flight().max_transactions, 8);
        assert!(Config::flight().max_buffered_bytes.is_some());
        assert!(Config::lossy_link().batch_size > 0);
    }

    #[test]
    fn test_ground_batch_fits_flight_buffer() {
        let flight = Config::flight();
        let ground = Config::ground_station();
        assert_eq!(ground.fragment_size, flight.fragment_size);
        assert!(ground.batch_size > 0);

        let batch_bytes = ground.batch_size as usize * flight.fragment_size;
        assert!(batch_bytes <= flight.max_buffered_bytes.unwrap());
    }
}
