//! 전송 통계

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// 현재 유닉스 시간 (초)
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// 트랜잭션별 카운터
#[derive(Debug, Clone, Serialize)]
pub struct TransactionStats {
    /// 생성 시각 (유닉스 초)
    pub created_at: u64,

    /// 마지막 활동 시각 (유닉스 초)
    pub last_activity: u64,

    /// 생성 요청된 조각 수 (송신측)
    pub fragments_generated: u64,

    /// 새로 수신된 조각 수 (수신측)
    pub fragments_ingested: u64,

    /// 중복 수신 조각 수
    pub duplicate_fragments: u64,

    /// 반영된 누락 보고 윈도우 수
    pub updates_applied: u64,
}

impl TransactionStats {
    pub fn new() -> Self {
        let now = unix_now();
        Self {
            created_at: now,
            last_activity: now,
            fragments_generated: 0,
            fragments_ingested: 0,
            duplicate_fragments: 0,
            updates_applied: 0,
        }
    }

    /// 활동 시각 갱신
    pub fn touch(&mut self) {
        self.last_activity = unix_now();
    }

    /// 조각 생성 기록
    pub fn record_generated(&mut self, count: usize) {
        self.fragments_generated += count as u64;
        self.touch();
    }

    /// 조각 수신 기록
    pub fn record_ingested(&mut self) {
        self.fragments_ingested += 1;
        self.touch();
    }

    /// 중복 기록
    pub fn record_duplicate(&mut self) {
        self.duplicate_fragments += 1;
        self.touch();
    }

    /// 누락 보고 반영 기록
    pub fn record_update(&mut self) {
        self.updates_applied += 1;
        self.touch();
    }
}

impl Default for TransactionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 매니저 전체 통계
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStats {
    /// 송신 트랜잭션 수
    pub tx_count: usize,

    /// 수신 트랜잭션 수
    pub rx_count: usize,

    /// 상태별 트랜잭션 수
    pub by_state: BTreeMap<String, usize>,

    /// 현재 버퍼 사용량 (바이트)
    pub buffered_bytes: usize,
}

impl ManagerStats {
    /// 전체 트랜잭션 수
    pub fn total(&self) -> usize {
        self.tx_count + self.rx_count
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let states: Vec<String> = self
            .by_state
            .iter()
            .map(|(state, count)| format!("{}={}", state, count))
            .collect();
        format!(
            "Transactions: {} (TX {}, RX {}) | States: [{}] | Buffered: {} bytes",
            self.total(),
            self.tx_count,
            self.rx_count,
            states.join(", "),
            self.buffered_bytes,
        )
    }
}
