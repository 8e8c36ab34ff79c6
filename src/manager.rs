//! 트랜잭션 매니저
//!
//! 방향별로 독립된 두 네임스페이스(TX, RX)에 트랜잭션을 보관한다.
//! 매니저가 트랜잭션의 유일한 소유자이며, 제거는 `delete`로만 일어난다.

use std::path::PathBuf;

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::fragment::{Assembly, FileHash, Fragment};
use crate::stats::{unix_now, ManagerStats};
use crate::transaction::{
    Direction, FragmentIndex, Transaction, TransactionId, TransactionState,
};
use crate::{Config, Error, Result, MAX_TRANSACTIONS};

/// 트랜잭션 접근 가드
///
/// 가드를 쥔 동안 같은 맵의 생성/삭제를 호출하면 교착될 수 있다.
pub type TransactionRef<'a> = RefMut<'a, TransactionId, Transaction>;

/// 생성 요청
#[derive(Debug, Clone)]
pub enum CreateRequest<'a> {
    /// CREATE_TRANS 수신 (송신측, tid 자체 할당)
    Send { file_reference: &'a str },

    /// INIT_TRANS 수신 (수신측, tid 그대로 사용)
    Receive {
        tid: TransactionId,
        hash: FileHash,
        num_packets: u16,
    },
}

impl CreateRequest<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            CreateRequest::Send { .. } => Direction::Tx,
            CreateRequest::Receive { .. } => Direction::Rx,
        }
    }
}

/// 송신측 조각 요청 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentRequest {
    /// GENERATE_ALL_PACKETS
    All,

    /// GENERATE_X_PACKETS
    Next(u16),

    /// GET_SINGLE_PACKET
    Single(FragmentIndex),
}

/// 목록 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub tid: TransactionId,
    pub state: TransactionState,
    pub missing_count: usize,
    pub num_packets: u16,
}

/// 트랜잭션 레지스트리
pub struct TransactionManager {
    config: Config,
    tx: DashMap<TransactionId, Transaction>,
    rx: DashMap<TransactionId, Transaction>,

    /// 수신 조립 버퍼로 예약된 바이트
    buffered: Mutex<usize>,
}

impl TransactionManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            tx: DashMap::new(),
            rx: DashMap::new(),
            buffered: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn map(&self, direction: Direction) -> &DashMap<TransactionId, Transaction> {
        match direction {
            Direction::Tx => &self.tx,
            Direction::Rx => &self.rx,
        }
    }

    /// 방향별 최대 트랜잭션 수
    pub fn capacity(&self) -> usize {
        self.config.max_transactions.clamp(1, MAX_TRANSACTIONS)
    }

    /// 트랜잭션이 예약한 버퍼 크기
    fn reservation(transaction: &Transaction) -> usize {
        match (transaction.direction(), transaction.assembly_path()) {
            (Direction::Rx, None) => {
                transaction.num_packets() as usize * transaction.fragment_size()
            }
            _ => 0,
        }
    }

    /// 버퍼 한도 확인
    fn check_budget(&self, in_use: usize, requested: usize) -> Result<()> {
        match self.config.max_buffered_bytes {
            Some(max) if in_use + requested > max => Err(Error::ResourceExhausted {
                requested,
                in_use,
                max,
            }),
            _ => Ok(()),
        }
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let mut buffered = self.buffered.lock();
        self.check_budget(*buffered, bytes)?;
        *buffered += bytes;
        Ok(())
    }

    fn release(&self, bytes: usize) {
        let mut buffered = self.buffered.lock();
        *buffered = buffered.saturating_sub(bytes);
    }

    /// 현재 예약된 버퍼 바이트
    pub fn buffered_bytes(&self) -> usize {
        *self.buffered.lock()
    }

    /// 트랜잭션 생성
    pub fn create(&self, request: CreateRequest<'_>) -> Result<TransactionId> {
        debug!("{} 트랜잭션 생성 요청", request.direction());
        match request {
            CreateRequest::Send { file_reference } => self.create_tx(file_reference),
            CreateRequest::Receive {
                tid,
                hash,
                num_packets,
            } => self.create_rx(tid, hash, num_packets),
        }
    }

    /// 송신 트랜잭션 생성, 사용하지 않는 가장 낮은 tid 할당
    pub fn create_tx(&self, file_reference: &str) -> Result<TransactionId> {
        let capacity = self.capacity();
        let no_free = || Error::NoFreeTransactionId {
            direction: Direction::Tx,
            capacity,
        };

        if self.tx.len() >= capacity {
            return Err(no_free());
        }

        // 원본 해시 계산은 맵 잠금 밖에서
        let mut transaction =
            Transaction::init_as_sender(0, file_reference, self.config.fragment_size)?;

        for tid in 0..capacity {
            let tid = tid as TransactionId;
            if let Entry::Vacant(entry) = self.tx.entry(tid) {
                transaction.assign_tid(tid);
                info!(
                    "TX 트랜잭션 {} 생성: {} ({} 조각)",
                    tid,
                    file_reference,
                    transaction.num_packets()
                );
                entry.insert(transaction);
                return Ok(tid);
            }
        }

        Err(no_free())
    }

    /// 수신 트랜잭션 생성, 상대가 준 tid 사용
    pub fn create_rx(
        &self,
        tid: TransactionId,
        hash: FileHash,
        num_packets: u16,
    ) -> Result<TransactionId> {
        let capacity = self.capacity();
        if self.rx.len() >= capacity && !self.rx.contains_key(&tid) {
            return Err(Error::NoFreeTransactionId {
                direction: Direction::Rx,
                capacity,
            });
        }

        if num_packets == 0 {
            return Err(Error::InvalidPacketCount { num_packets });
        }

        let fragment_size = self.config.fragment_size;
        match self.rx.entry(tid) {
            Entry::Occupied(_) => Err(Error::DuplicateTransaction {
                direction: Direction::Rx,
                tid,
            }),
            Entry::Vacant(entry) => {
                let transaction = if self.config.buffer_in_memory {
                    let bytes = num_packets as usize * fragment_size;
                    self.reserve(bytes)?;
                    match Transaction::init_as_receiver(tid, hash, num_packets, fragment_size) {
                        Ok(transaction) => transaction,
                        Err(e) => {
                            self.release(bytes);
                            return Err(e);
                        }
                    }
                } else {
                    let path = self
                        .config
                        .receive_dir
                        .join(format!("{}_tid{}.part", unix_now(), tid));
                    let assembly =
                        Assembly::on_disk(&path, num_packets as u64 * fragment_size as u64)?;
                    Transaction::init_as_receiver_with(
                        tid,
                        hash,
                        num_packets,
                        fragment_size,
                        assembly,
                    )?
                };

                info!("RX 트랜잭션 {} 생성: {} 조각", tid, num_packets);
                entry.insert(transaction);
                Ok(tid)
            }
        }
    }

    /// 트랜잭션 조회
    pub fn get(&self, direction: Direction, tid: TransactionId) -> Result<TransactionRef<'_>> {
        self.map(direction)
            .get_mut(&tid)
            .ok_or(Error::NotFound { direction, tid })
    }

    /// 트랜잭션에 대해 클로저 실행
    pub fn with<R>(
        &self,
        direction: Direction,
        tid: TransactionId,
        f: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        let mut transaction = self.get(direction, tid)?;
        f(&mut transaction)
    }

    /// 트랜잭션 제거
    ///
    /// 열린 파일과 버퍼를 함께 해제한다. 없는 tid는 에러가 아니다.
    pub fn delete(&self, direction: Direction, tid: TransactionId) -> bool {
        match self.map(direction).remove(&tid) {
            Some((_, transaction)) => {
                self.release(Self::reservation(&transaction));
                info!(
                    "{} 트랜잭션 {} 제거 (state={})",
                    direction,
                    tid,
                    transaction.state()
                );
                true
            }
            None => false,
        }
    }

    /// tid 순 목록
    pub fn list(&self, direction: Direction) -> Vec<TransactionSummary> {
        let mut summaries: Vec<TransactionSummary> = self
            .map(direction)
            .iter()
            .map(|entry| TransactionSummary {
                tid: *entry.key(),
                state: entry.state(),
                missing_count: entry.missing().len(),
                num_packets: entry.num_packets(),
            })
            .collect();
        summaries.sort_by_key(|s| s.tid);
        summaries
    }

    /// 진단 덤프 저장
    ///
    /// 파일명: `<unix_ts>_tid<tid>_<STATE>_<TX|RX>.json`
    pub fn dump(&self, direction: Direction, tid: TransactionId) -> Result<PathBuf> {
        let snapshot = {
            let transaction = self
                .map(direction)
                .get(&tid)
                .ok_or(Error::NotFound { direction, tid })?;
            transaction.snapshot(self.config.dump_fragments)?
        };

        std::fs::create_dir_all(&self.config.dump_dir)?;
        let filename = format!(
            "{}_tid{}_{}_{}.json",
            snapshot.stats.created_at, tid, snapshot.state_name, direction
        );
        let path = self.config.dump_dir.join(filename);

        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&path, content)?;

        debug!("트랜잭션 덤프 저장: {}", path.display());
        Ok(path)
    }

    /// 송신측 조각 배치 생성
    ///
    /// 버퍼 한도가 설정되어 있으면 배치 크기를 확인한다.
    pub fn fragment_batch(
        &self,
        tid: TransactionId,
        request: FragmentRequest,
    ) -> Result<Vec<Fragment>> {
        let mut transaction = self.get(Direction::Tx, tid)?;

        let count = match request {
            FragmentRequest::All => transaction.missing().len(),
            FragmentRequest::Next(n) => transaction.missing().len().min(n as usize),
            FragmentRequest::Single(_) => 1,
        };
        self.check_budget(
            self.buffered_bytes(),
            count * transaction.fragment_size(),
        )?;

        let fragments = match request {
            FragmentRequest::All => transaction
                .generate_all_fragments()?
                .collect::<Result<Vec<_>>>()?,
            FragmentRequest::Next(n) => transaction
                .generate_n_fragments(n as usize)?
                .collect::<Result<Vec<_>>>()?,
            FragmentRequest::Single(index) => vec![transaction.generate_fragment(index)?],
        };

        debug!("TX 트랜잭션 {} 조각 {}개 생성", tid, fragments.len());
        Ok(fragments)
    }

    /// 방향별 트랜잭션 수
    pub fn count(&self, direction: Direction) -> usize {
        self.map(direction).len()
    }

    /// 최대치 도달 여부
    pub fn is_full(&self, direction: Direction) -> bool {
        self.count(direction) >= self.capacity()
    }

    /// 상태별 tid 목록
    pub fn by_state(&self, direction: Direction, state: TransactionState) -> Vec<TransactionId> {
        let mut tids: Vec<TransactionId> = self
            .map(direction)
            .iter()
            .filter(|entry| entry.state() == state)
            .map(|entry| *entry.key())
            .collect();
        tids.sort_unstable();
        tids
    }

    /// 취소된 트랜잭션 일괄 제거
    pub fn clear_aborted(&self, direction: Direction) -> usize {
        let aborted = self.by_state(direction, TransactionState::Aborted);
        for &tid in &aborted {
            self.delete(direction, tid);
        }
        if !aborted.is_empty() {
            warn!("{} 취소 트랜잭션 {}개 제거", direction, aborted.len());
        }
        aborted.len()
    }

    /// 전체 통계
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            tx_count: self.tx.len(),
            rx_count: self.rx.len(),
            buffered_bytes: self.buffered_bytes(),
            ..Default::default()
        };

        for map in [&self.tx, &self.rx] {
            for entry in map.iter() {
                *stats
                    .by_state
                    .entry(entry.state().name().to_string())
                    .or_insert(0) += 1;
            }
        }

        stats
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
