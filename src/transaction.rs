//! 전송 트랜잭션
//!
//! 파일 하나의 전송 상태를 소유한다.
//! - 송신측(TX): 원본 파일에서 누락 조각을 생성
//! - 수신측(RX): 조각을 조립하고 누락 집합을 보고
//! - 양측: UPDATE_MISSING_FRAGMENTS로 누락 집합 동기화
//!
//! 상태 전이: Created -> Active -> Complete, 비종료 상태에서 Aborted 가능

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bitmap::{self, WindowUpdate};
use crate::fragment::{self, Assembly, FileHash, Fragment, FragmentSource, Fragments};
use crate::stats::TransactionStats;
use crate::{Error, Result};

/// 트랜잭션 ID (방향별 독립 네임스페이스)
pub type TransactionId = u8;

/// 조각 인덱스 (0부터 시작)
pub type FragmentIndex = u16;

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// 로컬이 원본
    Tx,

    /// 로컬이 목적지
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => f.write_str("TX"),
            Direction::Rx => f.write_str("RX"),
        }
    }
}

/// 트랜잭션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// 메타데이터만 확정, 누락 집합은 초기값
    Created,

    /// 조각이 한 번 이상 오감
    Active,

    /// 누락 없음, 해시 일치
    Complete,

    /// 명시적 취소 또는 해시 불일치
    Aborted,
}

impl TransactionState {
    /// 종료 상태 여부
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Complete | TransactionState::Aborted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Created => "CREATED",
            TransactionState::Active => "ACTIVE",
            TransactionState::Complete => "COMPLETE",
            TransactionState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 조립 시도 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// 아직 누락 조각이 남아 있음
    Incomplete { missing: usize },

    /// 조립 완료, 해시 일치
    Complete,
}

/// 방향별 데이터 끝점
#[derive(Debug)]
enum Endpoint {
    Source(FragmentSource),
    Destination(Assembly),
}

/// 파일 전송 트랜잭션
#[derive(Debug)]
pub struct Transaction {
    tid: TransactionId,
    direction: Direction,
    file_reference: String,
    fragment_size: usize,
    num_packets: u16,
    expected_hash: FileHash,
    missing: BTreeSet<FragmentIndex>,
    state: TransactionState,

    /// 송신측은 생성 시, 수신측은 마지막 조각 수신 시 확정
    file_size: Option<u64>,

    endpoint: Endpoint,
    stats: TransactionStats,
}

impl Transaction {
    /// 송신 트랜잭션 생성
    ///
    /// 원본을 열어 조각 수와 전체 해시를 계산한다. tid 할당은 매니저가 한다.
    pub fn init_as_sender(
        tid: TransactionId,
        file_reference: &str,
        fragment_size: usize,
    ) -> Result<Self> {
        if fragment_size == 0 {
            return Err(Error::InvalidFragmentSize { fragment_size });
        }

        let path = Path::new(file_reference);
        let unavailable = |source| Error::SourceUnavailable {
            path: file_reference.to_string(),
            source,
        };

        let mut file = std::fs::File::open(path).map_err(unavailable)?;
        let file_size = file.metadata().map_err(unavailable)?.len();
        if file_size == 0 {
            return Err(Error::Empty {
                path: file_reference.to_string(),
            });
        }

        let num_packets = fragment::packet_count(file_size, fragment_size);
        if num_packets > u16::MAX as u64 {
            return Err(Error::TooLarge {
                num_packets,
                max: u16::MAX as u64,
            });
        }
        let num_packets = num_packets as u16;

        let expected_hash = FileHash::of_reader(&mut file).map_err(unavailable)?;
        let source = FragmentSource::open(path, fragment_size, num_packets, file_size)?;

        debug!(
            "원본 준비: {} ({} bytes, {} 조각, hash={})",
            file_reference, file_size, num_packets, expected_hash
        );

        Ok(Self {
            tid,
            direction: Direction::Tx,
            file_reference: file_reference.to_string(),
            fragment_size,
            num_packets,
            expected_hash,
            missing: (0..num_packets).collect(),
            state: TransactionState::Created,
            file_size: Some(file_size),
            endpoint: Endpoint::Source(source),
            stats: TransactionStats::new(),
        })
    }

    /// 수신 트랜잭션 생성 (메모리 조립)
    pub fn init_as_receiver(
        tid: TransactionId,
        hash: FileHash,
        num_packets: u16,
        fragment_size: usize,
    ) -> Result<Self> {
        let assembly = Assembly::in_memory(num_packets as usize * fragment_size);
        Self::init_as_receiver_with(tid, hash, num_packets, fragment_size, assembly)
    }

    /// 수신 트랜잭션 생성 (조립 대상 지정)
    pub fn init_as_receiver_with(
        tid: TransactionId,
        hash: FileHash,
        num_packets: u16,
        fragment_size: usize,
        assembly: Assembly,
    ) -> Result<Self> {
        if fragment_size == 0 {
            return Err(Error::InvalidFragmentSize { fragment_size });
        }
        if num_packets == 0 {
            return Err(Error::InvalidPacketCount { num_packets });
        }

        let file_reference = assembly
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("memory:rx{}", tid));

        debug!(
            "RX 트랜잭션 {} 생성: {} 조각, hash={}",
            tid, num_packets, hash
        );

        Ok(Self {
            tid,
            direction: Direction::Rx,
            file_reference,
            fragment_size,
            num_packets,
            expected_hash: hash,
            missing: (0..num_packets).collect(),
            state: TransactionState::Created,
            file_size: None,
            endpoint: Endpoint::Destination(assembly),
            stats: TransactionStats::new(),
        })
    }

    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    /// 매니저가 할당한 tid 부여 (송신측)
    pub(crate) fn assign_tid(&mut self, tid: TransactionId) {
        self.tid = tid;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn file_reference(&self) -> &str {
        &self.file_reference
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn num_packets(&self) -> u16 {
        self.num_packets
    }

    pub fn expected_hash(&self) -> FileHash {
        self.expected_hash
    }

    pub fn missing(&self) -> &BTreeSet<FragmentIndex> {
        &self.missing
    }

    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// 수신률 (0.0 ~ 1.0)
    pub fn progress(&self) -> f64 {
        1.0 - self.missing.len() as f64 / self.num_packets as f64
    }

    /// 조립된 데이터 (메모리 조립일 때만)
    pub fn assembled(&self) -> Option<&[u8]> {
        match &self.endpoint {
            Endpoint::Destination(assembly) => assembly.bytes(),
            Endpoint::Source(_) => None,
        }
    }

    /// 조립 파일 경로 (파일 조립일 때만)
    pub fn assembly_path(&self) -> Option<&Path> {
        match &self.endpoint {
            Endpoint::Destination(assembly) => assembly.path(),
            Endpoint::Source(_) => None,
        }
    }

    /// 메모리로 잡고 있는 조립 버퍼 크기
    pub fn buffered_bytes(&self) -> usize {
        match &self.endpoint {
            Endpoint::Destination(assembly) => assembly.buffered_bytes(),
            Endpoint::Source(_) => 0,
        }
    }

    /// 첫 교환 시 Active로 전이
    fn mark_active(&mut self) {
        if self.state == TransactionState::Created {
            debug!("트랜잭션 {} {} -> ACTIVE", self.direction, self.tid);
            self.state = TransactionState::Active;
        }
    }

    fn ensure_not_aborted(&self) -> Result<()> {
        if self.state == TransactionState::Aborted {
            return Err(Error::Terminated {
                tid: self.tid,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn source_mut(&mut self, operation: &'static str) -> Result<&mut FragmentSource> {
        match &mut self.endpoint {
            Endpoint::Source(source) => Ok(source),
            Endpoint::Destination(_) => Err(Error::WrongDirection {
                operation,
                expected: Direction::Tx,
            }),
        }
    }

    /// 누락 조각 전체를 오름차순으로 생성
    ///
    /// 누락 집합은 바꾸지 않는다. 생성이 전달을 보장하지 않으므로 누락 보고만이 집합을 줄인다.
    pub fn generate_all_fragments(&mut self) -> Result<Fragments<'_>> {
        self.generate_n_fragments(usize::MAX)
    }

    /// 가장 낮은 인덱스부터 최대 n개 생성
    pub fn generate_n_fragments(&mut self, n: usize) -> Result<Fragments<'_>> {
        self.ensure_not_aborted()?;
        self.source_mut("generate_fragments")?;

        let indices: Vec<FragmentIndex> = self.missing.iter().copied().take(n).collect();
        if !indices.is_empty() {
            self.mark_active();
            self.stats.record_generated(indices.len());
        }

        let source = self.source_mut("generate_fragments")?;
        Ok(Fragments::new(source, indices))
    }

    /// 특정 인덱스의 조각 생성
    pub fn generate_fragment(&mut self, index: FragmentIndex) -> Result<Fragment> {
        self.ensure_not_aborted()?;
        self.source_mut("generate_fragment")?;

        if index >= self.num_packets || !self.missing.contains(&index) {
            return Err(Error::UnknownFragment {
                tid: self.tid,
                index,
            });
        }

        self.mark_active();
        self.stats.record_generated(1);
        self.source_mut("generate_fragment")?.read_fragment(index)
    }

    /// 인덱스의 길이 검증
    ///
    /// INIT_TRANS에 파일 크기가 없으므로 마지막 조각은 1 ~ fragment_size를 허용한다.
    /// 마지막 조각을 이미 받았다면 그 길이와 일치해야 한다.
    fn validate_length(&self, index: FragmentIndex, len: usize) -> Result<()> {
        let is_last = index + 1 == self.num_packets;

        let valid = match (is_last, self.file_size) {
            (false, _) => len == self.fragment_size,
            (true, Some(file_size)) => {
                len == fragment::expected_len(index, file_size, self.fragment_size, self.num_packets)
            }
            (true, None) => (1..=self.fragment_size).contains(&len),
        };

        if valid {
            return Ok(());
        }

        let expected = match (is_last, self.file_size) {
            (true, None) => format!("1..={}", self.fragment_size),
            (true, Some(file_size)) => {
                fragment::expected_len(index, file_size, self.fragment_size, self.num_packets)
                    .to_string()
            }
            (false, _) => self.fragment_size.to_string(),
        };

        Err(Error::LengthMismatch {
            index,
            expected,
            got: len,
        })
    }

    /// 수신 조각 반영
    ///
    /// 새로 채운 조각이면 true, 이미 보유한 조각이면 false를 반환한다.
    /// 실패 시 누락 집합은 변하지 않는다.
    pub fn ingest_fragment(&mut self, index: FragmentIndex, payload: &[u8]) -> Result<bool> {
        if self.direction != Direction::Rx {
            return Err(Error::WrongDirection {
                operation: "ingest_fragment",
                expected: Direction::Rx,
            });
        }
        self.ensure_not_aborted()?;

        if index >= self.num_packets {
            return Err(Error::UnknownFragment {
                tid: self.tid,
                index,
            });
        }
        self.validate_length(index, payload.len())?;

        let offset = index as u64 * self.fragment_size as u64;
        let already_held = !self.missing.contains(&index);

        if self.state == TransactionState::Complete {
            self.stats.record_duplicate();
            return Ok(false);
        }

        let assembly = match &mut self.endpoint {
            Endpoint::Destination(assembly) => assembly,
            Endpoint::Source(_) => {
                return Err(Error::WrongDirection {
                    operation: "ingest_fragment",
                    expected: Direction::Rx,
                })
            }
        };

        if already_held {
            if assembly.read_at(offset, payload.len())? == payload {
                debug!("트랜잭션 {} 중복 조각 {}", self.tid, index);
                self.stats.record_duplicate();
                return Ok(false);
            }
            warn!(
                "트랜잭션 {} 조각 {} 내용이 기존과 다름, 덮어씀",
                self.tid, index
            );
        }

        assembly.write_at(offset, payload)?;

        if index + 1 == self.num_packets {
            self.file_size = Some(offset + payload.len() as u64);
        }

        self.missing.remove(&index);
        self.mark_active();

        if already_held {
            self.stats.record_duplicate();
            Ok(false)
        } else {
            self.stats.record_ingested();
            Ok(true)
        }
    }

    /// 조립 완료 시도
    ///
    /// 누락이 남아 있으면 Incomplete를 반환한다. 해시가 다르면 Aborted로 전이하고
    /// 조립된 데이터는 확인용으로 남겨둔다.
    pub fn try_finalize(&mut self) -> Result<FinalizeOutcome> {
        if self.direction != Direction::Rx {
            return Err(Error::WrongDirection {
                operation: "try_finalize",
                expected: Direction::Rx,
            });
        }
        self.ensure_not_aborted()?;

        if self.state == TransactionState::Complete {
            return Ok(FinalizeOutcome::Complete);
        }

        if !self.missing.is_empty() {
            return Ok(FinalizeOutcome::Incomplete {
                missing: self.missing.len(),
            });
        }

        let file_size = self
            .file_size
            .unwrap_or(self.num_packets as u64 * self.fragment_size as u64);

        let assembly = match &mut self.endpoint {
            Endpoint::Destination(assembly) => assembly,
            Endpoint::Source(_) => {
                return Err(Error::WrongDirection {
                    operation: "try_finalize",
                    expected: Direction::Rx,
                })
            }
        };
        assembly.truncate(file_size)?;
        let actual = assembly.hash()?;

        if actual != self.expected_hash {
            warn!(
                "트랜잭션 {} 해시 검증 실패: expected {}, got {}",
                self.tid, self.expected_hash, actual
            );
            self.state = TransactionState::Aborted;
            return Err(Error::IntegrityFailure {
                tid: self.tid,
                expected: self.expected_hash.to_hex(),
                got: actual.to_hex(),
            });
        }

        info!(
            "트랜잭션 {} 조립 완료: {} bytes, hash={}",
            self.tid, file_size, actual
        );
        self.state = TransactionState::Complete;
        Ok(FinalizeOutcome::Complete)
    }

    /// 상대측 누락 보고 반영
    ///
    /// 송신측은 누락 집합이 비면 상대가 전부 보유한 것이므로 Complete로 전이한다.
    pub fn apply_update(&mut self, update: WindowUpdate) -> Result<()> {
        self.ensure_not_aborted()?;
        if self.state == TransactionState::Complete {
            return Ok(());
        }

        bitmap::apply_update(
            &mut self.missing,
            update.seq_offset,
            update.msb,
            update.lsb,
            self.num_packets,
        )?;
        self.stats.record_update();
        self.mark_active();

        if self.direction == Direction::Tx && self.missing.is_empty() {
            info!("TX 트랜잭션 {} 상대측 수신 완료", self.tid);
            self.state = TransactionState::Complete;
        }

        Ok(())
    }

    /// 현재 누락 집합 전체를 윈도우 목록으로 인코딩
    pub fn missing_report(&self) -> Vec<WindowUpdate> {
        bitmap::encode_missing_set(&self.missing, self.num_packets)
    }

    /// 명시적 취소
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            info!("트랜잭션 {} {} 취소", self.direction, self.tid);
            self.state = TransactionState::Aborted;
        }
    }

    /// 진단용 스냅샷
    ///
    /// `with_fragments`이면 보유 조각별 CRC32를 포함한다 (수신측만).
    pub fn snapshot(&self, with_fragments: bool) -> Result<TransactionSnapshot> {
        let held: Vec<FragmentIndex> = (0..self.num_packets)
            .filter(|i| !self.missing.contains(i))
            .collect();

        let fragment_crcs = match (&self.endpoint, with_fragments) {
            (Endpoint::Destination(assembly), true) => {
                let file_size = self
                    .file_size
                    .unwrap_or(self.num_packets as u64 * self.fragment_size as u64);
                let mut crcs = Vec::with_capacity(held.len());
                for &index in &held {
                    let len = fragment::expected_len(
                        index,
                        file_size,
                        self.fragment_size,
                        self.num_packets,
                    );
                    let data = assembly.read_at(index as u64 * self.fragment_size as u64, len)?;
                    crcs.push(FragmentCrc {
                        index,
                        size: len,
                        crc32: crc32fast::hash(&data),
                    });
                }
                Some(crcs)
            }
            _ => None,
        };

        Ok(TransactionSnapshot {
            tid: self.tid,
            direction: self.direction,
            state: self.state,
            state_name: self.state.name(),
            file_reference: self.file_reference.clone(),
            file_size: self.file_size,
            fragment_size: self.fragment_size,
            num_packets: self.num_packets,
            hash: self.expected_hash.to_hex(),
            missing_count: self.missing.len(),
            missing: self.missing.iter().copied().take(SNAPSHOT_LIST_LIMIT).collect(),
            held_count: held.len(),
            held: held.into_iter().take(SNAPSHOT_LIST_LIMIT).collect(),
            stats: self.stats.clone(),
            fragment_crcs,
        })
    }
}

/// 스냅샷 목록 최대 길이
const SNAPSHOT_LIST_LIMIT: usize = 100;

/// 보유 조각 CRC
#[derive(Debug, Clone, Serialize)]
pub struct FragmentCrc {
    pub index: FragmentIndex,
    pub size: usize,
    pub crc32: u32,
}

/// 진단 덤프 내용
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSnapshot {
    pub tid: TransactionId,
    pub direction: Direction,
    pub state: TransactionState,
    pub state_name: &'static str,
    pub file_reference: String,
    pub file_size: Option<u64>,
    pub fragment_size: usize,
    pub num_packets: u16,
    pub hash: String,
    pub missing_count: usize,
    pub missing: Vec<FragmentIndex>,
    pub held_count: usize,
    pub held: Vec<FragmentIndex>,
    pub stats: TransactionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment_crcs: Option<Vec<FragmentCrc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    fn source_file(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn sender(data: &[u8], fragment_size: usize) -> (tempfile::NamedTempFile, Transaction) {
        let file = source_file(data);
        let tx = Transaction::init_as_sender(0, file.path().to_str().unwrap(), fragment_size).unwrap();
        (file, tx)
    }

    fn collect(fragments: Fragments<'_>) -> Vec<Fragment> {
        fragments.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_sender_metadata() {
        let data = sample(250);
        let (_file, tx) = sender(&data, 100);
        assert_eq!(tx.num_packets(), 3);
        assert_eq!(tx.expected_hash(), FileHash::of(&data));
        assert_eq!(tx.missing().len(), 3);
        assert_eq!(tx.state(), TransactionState::Created);
        assert_eq!(tx.file_size(), Some(250));
    }

    #[test]
    fn test_sender_rejects_empty_and_missing() {
        let file = source_file(b"");
        let err = Transaction::init_as_sender(0, file.path().to_str().unwrap(), 100).unwrap_err();
        assert!(matches!(err, Error::Empty { .. }));

        let err = Transaction::init_as_sender(0, "/nonexistent/dtl/source.bin", 100).unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[test]
    fn test_generation_does_not_mutate_missing() {
        let data = sample(1000);
        let (_file, mut tx) = sender(&data, 100);

        let all = collect(tx.generate_all_fragments().unwrap());
        assert_eq!(all.len(), 10);
        assert_eq!(tx.missing().len(), 10);
        assert_eq!(tx.state(), TransactionState::Active);

        // 다시 생성해도 같은 시퀀스
        let again = collect(tx.generate_all_fragments().unwrap());
        assert_eq!(all, again);
        assert_eq!(all[3].payload.as_ref(), &data[300..400]);
    }

    #[test]
    fn test_generate_n() {
        let data = sample(1000);
        let (_file, mut tx) = sender(&data, 100);
        tx.apply_update(WindowUpdate::from_bitmap(0, 0xA000_0000)).unwrap(); // 0, 2 보유

        let first = collect(tx.generate_n_fragments(3).unwrap());
        let indices: Vec<_> = first.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 3, 4]);

        let many = collect(tx.generate_n_fragments(100).unwrap());
        let all = collect(tx.generate_all_fragments().unwrap());
        assert_eq!(many, all);
    }

    #[test]
    fn test_generate_n_empty_missing() {
        let data = sample(50);
        let (_file, mut tx) = sender(&data, 100);
        tx.apply_update(WindowUpdate::from_bitmap(0, 0x8000_0000)).unwrap();
        assert_eq!(tx.state(), TransactionState::Complete);
        assert_eq!(tx.generate_n_fragments(5).unwrap().count(), 0);
    }

    #[test]
    fn test_generate_fragment_unknown() {
        let data = sample(250);
        let (_file, mut tx) = sender(&data, 100);

        let fragment = tx.generate_fragment(2).unwrap();
        assert_eq!(fragment.payload.len(), 50);

        assert!(matches!(
            tx.generate_fragment(3),
            Err(Error::UnknownFragment { index: 3, .. })
        ));

        tx.apply_update(WindowUpdate::from_bitmap(0, 0x4000_0000)).unwrap();
        assert!(matches!(
            tx.generate_fragment(1),
            Err(Error::UnknownFragment { index: 1, .. })
        ));
    }

    #[test]
    fn test_receiver_ingest_and_finalize() {
        let data = sample(250);
        let mut rx = Transaction::init_as_receiver(4, FileHash::of(&data), 3, 100).unwrap();

        assert_eq!(
            rx.try_finalize().unwrap(),
            FinalizeOutcome::Incomplete { missing: 3 }
        );

        assert!(rx.ingest_fragment(2, &data[200..]).unwrap());
        assert!(rx.ingest_fragment(0, &data[..100]).unwrap());
        assert!(!rx.ingest_fragment(0, &data[..100]).unwrap());
        assert!(rx.ingest_fragment(1, &data[100..200]).unwrap());

        assert_eq!(rx.try_finalize().unwrap(), FinalizeOutcome::Complete);
        assert_eq!(rx.state(), TransactionState::Complete);
        assert_eq!(rx.assembled().unwrap(), data.as_slice());
        assert_eq!(rx.stats().duplicate_fragments, 1);
    }

    #[test]
    fn test_length_mismatch_leaves_missing() {
        let data = sample(250);
        let mut rx = Transaction::init_as_receiver(0, FileHash::of(&data), 3, 100).unwrap();

        let err = rx.ingest_fragment(0, &data[..99]).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { index: 0, got: 99, .. }));
        assert_eq!(rx.missing().len(), 3);

        // 마지막 조각: 0 바이트와 fragment_size 초과는 거부
        assert!(rx.ingest_fragment(2, &[]).is_err());
        assert!(rx.ingest_fragment(2, &[0u8; 101]).is_err());

        // 마지막 조각 크기 확정 후 다른 길이는 거부
        rx.ingest_fragment(2, &data[200..]).unwrap();
        assert!(matches!(
            rx.ingest_fragment(2, &data[200..240]),
            Err(Error::LengthMismatch { .. })
        ));
        assert_eq!(rx.missing(), &BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_hash_mismatch_aborts_and_retains() {
        let data = sample(200);
        let mut rx = Transaction::init_as_receiver(1, FileHash::of(b"other"), 2, 100).unwrap();
        rx.ingest_fragment(0, &data[..100]).unwrap();
        rx.ingest_fragment(1, &data[100..]).unwrap();

        let err = rx.try_finalize().unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure { tid: 1, .. }));
        assert_eq!(rx.state(), TransactionState::Aborted);
        assert_eq!(rx.assembled().unwrap(), data.as_slice());

        assert!(matches!(
            rx.ingest_fragment(0, &data[..100]),
            Err(Error::Terminated { .. })
        ));
    }

    #[test]
    fn test_any_order_with_duplicates() {
        let data = sample(1234);
        let mut rx = Transaction::init_as_receiver(0, FileHash::of(&data), 13, 100).unwrap();
        let order = [12u16, 3, 3, 7, 0, 12, 5, 1, 1, 9];
        for &index in &order {
            let start = index as usize * 100;
            let end = (start + 100).min(data.len());
            rx.ingest_fragment(index, &data[start..end]).unwrap();
        }
        let delivered: BTreeSet<u16> = order.iter().copied().collect();
        let expected: BTreeSet<u16> = (0..13).filter(|i| !delivered.contains(i)).collect();
        assert_eq!(rx.missing(), &expected);
    }

    proptest! {
        #[test]
        fn prop_ingest_any_order(
            num_packets in 1u16..40,
            last_len in 1usize..=50,
            order in proptest::collection::vec(any::<u16>(), 0..120),
        ) {
            let data = sample((num_packets as usize - 1) * 50 + last_len);
            let mut rx =
                Transaction::init_as_receiver(0, FileHash::of(&data), num_packets, 50).unwrap();

            let order: Vec<u16> = order.iter().map(|i| i % num_packets).collect();
            for &index in &order {
                let start = index as usize * 50;
                let end = (start + 50).min(data.len());
                rx.ingest_fragment(index, &data[start..end]).unwrap();
            }

            let delivered: BTreeSet<u16> = order.iter().copied().collect();
            let expected: BTreeSet<u16> =
                (0..num_packets).filter(|i| !delivered.contains(i)).collect();
            prop_assert_eq!(rx.missing(), &expected);
            prop_assert_eq!(rx.stats().fragments_ingested as usize, delivered.len());

            if expected.is_empty() {
                prop_assert_eq!(rx.try_finalize().unwrap(), FinalizeOutcome::Complete);
                prop_assert_eq!(rx.assembled().unwrap(), &data[..]);
            }
        }
    }

    #[test]
    fn test_direction_checks() {
        let data = sample(100);
        let (_file, mut tx) = sender(&data, 100);
        assert!(matches!(
            tx.ingest_fragment(0, &data),
            Err(Error::WrongDirection { .. })
        ));
        assert!(matches!(tx.try_finalize(), Err(Error::WrongDirection { .. })));

        let mut rx = Transaction::init_as_receiver(0, FileHash::of(&data), 1, 100).unwrap();
        assert!(matches!(
            rx.generate_all_fragments(),
            Err(Error::WrongDirection { .. })
        ));
    }

    #[test]
    fn test_receiver_rejects_zero_packets() {
        let err = Transaction::init_as_receiver(0, FileHash::of(b""), 0, 100).unwrap_err();
        assert!(matches!(err, Error::InvalidPacketCount { .. }));
    }

    #[test]
    fn test_missing_report_round_trip() {
        let data = sample(5000);
        let mut rx = Transaction::init_as_receiver(0, FileHash::of(&data), 50, 100).unwrap();
        for index in [0u16, 5, 33, 49] {
            let start = index as usize * 100;
            rx.ingest_fragment(index, &data[start..start + 100]).unwrap();
        }

        let file = source_file(&data);
        let mut tx = Transaction::init_as_sender(0, file.path().to_str().unwrap(), 100).unwrap();
        for window in rx.missing_report() {
            tx.apply_update(window).unwrap();
        }
        assert_eq!(tx.missing(), rx.missing());
    }

    #[test]
    fn test_snapshot_crcs() {
        let data = sample(150);
        let mut rx = Transaction::init_as_receiver(2, FileHash::of(&data), 2, 100).unwrap();
        rx.ingest_fragment(1, &data[100..]).unwrap();

        let snapshot = rx.snapshot(true).unwrap();
        assert_eq!(snapshot.missing, vec![0]);
        assert_eq!(snapshot.held, vec![1]);
        let crcs = snapshot.fragment_crcs.unwrap();
        assert_eq!(crcs[0].crc32, crc32fast::hash(&data[100..]));
        assert_eq!(crcs[0].size, 50);
    }

    #[test]
    fn test_abort() {
        let data = sample(100);
        let mut rx = Transaction::init_as_receiver(0, FileHash::of(&data), 1, 100).unwrap();
        rx.abort();
        assert_eq!(rx.state(), TransactionState::Aborted);
        assert!(rx.apply_update(WindowUpdate::from_bitmap(0, 0)).is_err());
    }
}
