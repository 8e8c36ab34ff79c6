//! 명령 처리기
//!
//! 디코딩된 메시지를 트랜잭션 매니저 호출로 바꾸고, 상대에게 보낼 응답 메시지를 돌려준다.
//! 같은 처리기가 위성(송신)과 지상국(수신) 역할을 모두 맡을 수 있다.
//!
//! 타이머는 없다. 수신이 멈췄을 때 `poll`을 부르는 것은 상위 계층의 몫이다.

use std::path::PathBuf;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fragment::FileHash;
use crate::manager::{CreateRequest, FragmentRequest, TransactionManager};
use crate::message::{
    CreateTrans, GenerateXPackets, GetSinglePacket, InitTrans, Message, TransPayload,
    UpdateMissingFragments,
};
use crate::transaction::{
    Direction, FinalizeOutcome, FragmentIndex, TransactionId, TransactionState,
};
use crate::{Error, Result};

/// 메시지 처리기
pub struct Dispatcher {
    manager: TransactionManager,

    /// 마지막 누락 보고 이후 새로 수신한 조각 수 (RX tid별)
    since_report: DashMap<TransactionId, usize>,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        Self::with_manager(TransactionManager::new(config))
    }

    pub fn with_manager(manager: TransactionManager) -> Self {
        Self {
            manager,
            since_report: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// 파일 전송 요청 메시지 (지상국 → 위성)
    pub fn request_transfer(file_reference: impl Into<String>) -> Message {
        Message::CreateTrans(CreateTrans {
            file_reference: file_reference.into(),
        })
    }

    /// 트랜잭션 제거 (누락 보고 카운터 포함)
    pub fn delete(&self, direction: Direction, tid: TransactionId) -> bool {
        if direction == Direction::Rx {
            self.since_report.remove(&tid);
        }
        self.manager.delete(direction, tid)
    }

    /// 메시지 하나 처리
    pub fn handle(&self, message: Message) -> Result<Vec<Message>> {
        match message {
            Message::CreateTrans(m) => self.on_create(&m.file_reference),
            Message::InitTrans(m) => self.on_init(m.tid, m.hash, m.num_packets),
            Message::TransPayload(m) => self.on_payload(m),
            Message::GenerateAllPackets { tid } => self.on_generate(tid, FragmentRequest::All),
            Message::GenerateXPackets(m) => self.on_generate(m.tid, FragmentRequest::Next(m.x)),
            Message::GetSinglePacket(m) => {
                self.on_generate(m.tid, FragmentRequest::Single(m.seq_number))
            }
            Message::UpdateMissingFragments(m) => self.on_update(m),
        }
    }

    /// CREATE_TRANS: 송신 트랜잭션 생성 후 INIT_TRANS 응답
    fn on_create(&self, file_reference: &str) -> Result<Vec<Message>> {
        let tid = self.manager.create(CreateRequest::Send { file_reference })?;
        let transaction = self.manager.get(Direction::Tx, tid)?;

        Ok(vec![Message::InitTrans(InitTrans {
            tid,
            hash: transaction.expected_hash(),
            num_packets: transaction.num_packets(),
        })])
    }

    /// INIT_TRANS: 수신 트랜잭션 생성 후 첫 조각 요청
    ///
    /// 같은 내용의 INIT_TRANS 재전송은 무시하고 요청만 다시 보낸다.
    /// 종료된 트랜잭션의 tid가 재사용되면 기존 것을 지우고 새로 만든다.
    fn on_init(&self, tid: TransactionId, hash: FileHash, num_packets: u16) -> Result<Vec<Message>> {
        let request = CreateRequest::Receive {
            tid,
            hash,
            num_packets,
        };
        match self.manager.create(request.clone()) {
            Ok(_) => {}
            Err(Error::DuplicateTransaction { .. }) => {
                let (same, terminal) = {
                    let existing = self.manager.get(Direction::Rx, tid)?;
                    (
                        existing.expected_hash() == hash && existing.num_packets() == num_packets,
                        existing.state().is_terminal(),
                    )
                };

                if same && !terminal {
                    debug!("RX 트랜잭션 {} INIT_TRANS 재수신", tid);
                } else if terminal {
                    info!("RX 트랜잭션 {} 종료 상태, 새 전송으로 교체", tid);
                    self.delete(Direction::Rx, tid);
                    self.manager.create(request)?;
                } else {
                    return Err(Error::DuplicateTransaction {
                        direction: Direction::Rx,
                        tid,
                    });
                }
            }
            Err(e) => return Err(e),
        }

        self.since_report.insert(tid, 0);
        Ok(self.next_request(tid)?.into_iter().collect())
    }

    /// GENERATE_* / GET_SINGLE_PACKET: 조각 생성
    fn on_generate(&self, tid: TransactionId, request: FragmentRequest) -> Result<Vec<Message>> {
        let fragments = self.manager.fragment_batch(tid, request)?;
        Ok(fragments
            .iter()
            .map(|fragment| Message::TransPayload(TransPayload::from_fragment(tid, fragment)))
            .collect())
    }

    /// TRANS_PAYLOAD: 조각 반영
    ///
    /// 누락 조각이 모두 채워졌는데 아직 완료되지 않았으면 해시 검증 후 최종 보고를 보낸다.
    /// 이전 검증이 입출력 오류로 실패했다면 다음 조각 수신 때 다시 검증한다.
    /// 그 외에는 설정된 조각 수마다 누락 보고를 보낸다.
    fn on_payload(&self, payload: TransPayload) -> Result<Vec<Message>> {
        let tid = payload.tid;
        let (newly, done, terminal) = self.manager.with(Direction::Rx, tid, |t| {
            let newly = t.ingest_fragment(payload.seq_number, &payload.fragment_data)?;
            Ok((newly, t.missing().is_empty(), t.state().is_terminal()))
        })?;

        if done {
            return if terminal {
                // 완료 후 중복 수신: 최종 보고가 유실되었을 수 있음
                self.report(tid)
            } else {
                self.finish(tid)
            };
        }

        let interval = self.manager.config().update_interval_fragments;
        if !newly || interval == 0 {
            return Ok(Vec::new());
        }

        let due = {
            let mut count = self.since_report.entry(tid).or_insert(0);
            *count += 1;
            *count >= interval
        };
        if due {
            self.report(tid)
        } else {
            Ok(Vec::new())
        }
    }

    /// UPDATE_MISSING_FRAGMENTS: 로컬 송신 트랜잭션에 반영
    fn on_update(&self, update: UpdateMissingFragments) -> Result<Vec<Message>> {
        self.manager
            .with(Direction::Tx, update.tid, |t| t.apply_update(update.window()))?;
        Ok(Vec::new())
    }

    /// 조립 완료 처리
    fn finish(&self, tid: TransactionId) -> Result<Vec<Message>> {
        match self.manager.with(Direction::Rx, tid, |t| t.try_finalize()) {
            Ok(FinalizeOutcome::Complete) => self.report(tid),
            Ok(FinalizeOutcome::Incomplete { .. }) => Ok(Vec::new()),
            Err(e @ Error::IntegrityFailure { .. }) => {
                match self.manager.dump(Direction::Rx, tid) {
                    Ok(path) => warn!("RX 트랜잭션 {} 검증 실패, 덤프: {}", tid, path.display()),
                    Err(dump_err) => warn!("RX 트랜잭션 {} 덤프 실패: {}", tid, dump_err),
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// 수신 트랜잭션의 누락 보고 메시지
    pub fn report(&self, tid: TransactionId) -> Result<Vec<Message>> {
        let windows = self.manager.get(Direction::Rx, tid)?.missing_report();
        self.since_report.insert(tid, 0);

        Ok(windows
            .into_iter()
            .map(|window| Message::UpdateMissingFragments(UpdateMissingFragments::new(tid, window)))
            .collect())
    }

    /// 다음 조각 요청 (완료 또는 취소 상태면 None)
    pub fn next_request(&self, tid: TransactionId) -> Result<Option<Message>> {
        let transaction = self.manager.get(Direction::Rx, tid)?;
        if transaction.state().is_terminal() || transaction.missing().is_empty() {
            return Ok(None);
        }

        let batch_size = self.manager.config().batch_size;
        Ok(Some(if batch_size == 0 {
            Message::GenerateAllPackets { tid }
        } else {
            Message::GenerateXPackets(GenerateXPackets { tid, x: batch_size })
        }))
    }

    /// 특정 조각 하나 요청
    pub fn request_single(&self, tid: TransactionId, index: FragmentIndex) -> Result<Message> {
        let transaction = self.manager.get(Direction::Rx, tid)?;
        if index >= transaction.num_packets() {
            return Err(Error::UnknownFragment { tid, index });
        }
        Ok(Message::GetSinglePacket(GetSinglePacket {
            tid,
            seq_number: index,
        }))
    }

    /// 수신이 멈췄을 때: 누락 보고 후 다음 요청
    pub fn poll(&self, tid: TransactionId) -> Result<Vec<Message>> {
        let mut messages = self.report(tid)?;
        messages.extend(self.next_request(tid)?);
        Ok(messages)
    }

    /// 완료된 수신 파일을 수신 폴더에 저장
    pub fn save_received(&self, tid: TransactionId, name: &str) -> Result<PathBuf> {
        let receive_dir = &self.manager.config().receive_dir;
        std::fs::create_dir_all(receive_dir)?;
        let target = receive_dir.join(name);

        let transaction = self.manager.get(Direction::Rx, tid)?;
        if transaction.state() != TransactionState::Complete {
            return Err(Error::NotComplete {
                tid,
                state: transaction.state().name().to_string(),
            });
        }

        if let Some(data) = transaction.assembled() {
            std::fs::write(&target, data)?;
        } else if let Some(path) = transaction.assembly_path() {
            std::fs::copy(path, &target)?;
        }

        info!("RX 트랜잭션 {} 저장: {}", tid, target.display());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;
    use std::io::Write;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            fragment_size: 100,
            dump_dir: dir.join("dumps"),
            receive_dir: dir.join("received"),
            update_interval_fragments: 4,
            ..Config::default()
        }
    }

    fn source_file(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        (file, data)
    }

    #[test]
    fn test_create_replies_init() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source_file(950);
        let spacecraft = Dispatcher::new(config(dir.path()));

        let replies = spacecraft
            .handle(Dispatcher::request_transfer(file.path().to_string_lossy()))
            .unwrap();
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            Message::InitTrans(init) => {
                assert_eq!(init.tid, 0);
                assert_eq!(init.num_packets, 10);
                assert_eq!(init.hash, FileHash::of(&data));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spacecraft = Dispatcher::new(config(dir.path()));
        let err = spacecraft
            .handle(Dispatcher::request_transfer("/nonexistent/dtl/image.jpg"))
            .unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert_eq!(spacecraft.manager().count(Direction::Tx), 0);
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ground = Dispatcher::new(config(dir.path()));
        let init = Message::InitTrans(InitTrans {
            tid: 2,
            hash: FileHash::of(b"x"),
            num_packets: 5,
        });

        let first = ground.handle(init.clone()).unwrap();
        let second = ground.handle(init).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].msg_type(), MessageType::GenerateAllPackets);
        assert_eq!(ground.manager().count(Direction::Rx), 1);

        let conflicting = Message::InitTrans(InitTrans {
            tid: 2,
            hash: FileHash::of(b"y"),
            num_packets: 5,
        });
        assert!(matches!(
            ground.handle(conflicting),
            Err(Error::DuplicateTransaction { tid: 2, .. })
        ));
    }

    #[test]
    fn test_batch_request() {
        let dir = tempfile::tempdir().unwrap();
        let ground = Dispatcher::new(Config {
            batch_size: 8,
            ..config(dir.path())
        });
        let replies = ground
            .handle(Message::InitTrans(InitTrans {
                tid: 0,
                hash: FileHash::of(b"x"),
                num_packets: 20,
            }))
            .unwrap();
        assert_eq!(
            replies,
            vec![Message::GenerateXPackets(GenerateXPackets { tid: 0, x: 8 })]
        );
    }

    #[test]
    fn test_periodic_report_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source_file(950);
        let spacecraft = Dispatcher::new(config(dir.path()));
        let ground = Dispatcher::new(config(dir.path()));

        let init = spacecraft
            .handle(Dispatcher::request_transfer(file.path().to_string_lossy()))
            .unwrap()
            .remove(0);
        let request = ground.handle(init).unwrap().remove(0);
        let payloads = spacecraft.handle(request).unwrap();
        assert_eq!(payloads.len(), 10);

        let mut reports = Vec::new();
        for payload in payloads {
            reports.extend(ground.handle(payload).unwrap());
        }
        // 4, 8번째 조각 후 보고 + 완료 보고
        assert_eq!(reports.len(), 3);
        assert!(reports
            .iter()
            .all(|m| m.msg_type() == MessageType::UpdateMissingFragments));

        for report in reports {
            spacecraft.handle(report).unwrap();
        }

        let tx_state = spacecraft.manager().get(Direction::Tx, 0).unwrap().state();
        let rx_state = ground.manager().get(Direction::Rx, 0).unwrap().state();
        assert_eq!(tx_state, TransactionState::Complete);
        assert_eq!(rx_state, TransactionState::Complete);

        let saved = ground.save_received(0, "image.bin").unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), data);
    }

    #[test]
    fn test_poll_requests_missing() {
        let dir = tempfile::tempdir().unwrap();
        let ground = Dispatcher::new(config(dir.path()));
        ground
            .handle(Message::InitTrans(InitTrans {
                tid: 1,
                hash: FileHash::of(b"x"),
                num_packets: 40,
            }))
            .unwrap();

        let messages = ground.poll(1).unwrap();
        // 40개 조각 = 윈도우 2개 + 요청 1개
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], Message::GenerateAllPackets { tid: 1 });

        assert!(matches!(
            ground.request_single(1, 40),
            Err(Error::UnknownFragment { tid: 1, index: 40 })
        ));
        assert!(matches!(
            ground.save_received(1, "partial.bin"),
            Err(Error::NotComplete { tid: 1, .. })
        ));
    }

    #[test]
    fn test_redelivered_fragment_retries_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let (file, data) = source_file(950);
        let spacecraft = Dispatcher::new(config(dir.path()));
        let ground = Dispatcher::new(config(dir.path()));

        let init = spacecraft
            .handle(Dispatcher::request_transfer(file.path().to_string_lossy()))
            .unwrap()
            .remove(0);
        let request = ground.handle(init).unwrap().remove(0);
        let payloads: Vec<TransPayload> = spacecraft
            .handle(request)
            .unwrap()
            .into_iter()
            .map(|message| match message {
                Message::TransPayload(payload) => payload,
                other => panic!("unexpected reply: {:?}", other),
            })
            .collect();

        // 조각은 모두 들어왔지만 검증이 끝나지 않은 상태 (검증 중 입출력 실패와 같음)
        ground
            .manager()
            .with(Direction::Rx, 0, |t| {
                for payload in &payloads {
                    t.ingest_fragment(payload.seq_number, &payload.fragment_data)?;
                }
                Ok(())
            })
            .unwrap();
        {
            let rx = ground.manager().get(Direction::Rx, 0).unwrap();
            assert!(rx.missing().is_empty());
            assert_eq!(rx.state(), TransactionState::Active);
        }
        assert_eq!(ground.next_request(0).unwrap(), None);

        // 중복 조각이 다시 검증을 일으킴
        let replies = ground
            .handle(Message::TransPayload(payloads[3].clone()))
            .unwrap();
        assert!(!replies.is_empty());
        assert!(replies
            .iter()
            .all(|m| m.msg_type() == MessageType::UpdateMissingFragments));

        let rx = ground.manager().get(Direction::Rx, 0).unwrap();
        assert_eq!(rx.state(), TransactionState::Complete);
        assert_eq!(rx.assembled().unwrap(), &data[..]);
        drop(rx);

        // 완료 후 중복은 보고만
        let replies = ground
            .handle(Message::TransPayload(payloads[0].clone()))
            .unwrap();
        assert!(replies
            .iter()
            .all(|m| m.msg_type() == MessageType::UpdateMissingFragments));
    }

    #[test]
    fn test_report_counter_cleared_with_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let ground = Dispatcher::new(config(dir.path()));
        let init = |hash: &[u8]| {
            Message::InitTrans(InitTrans {
                tid: 3,
                hash: FileHash::of(hash),
                num_packets: 10,
            })
        };
        let payload = |index: FragmentIndex| {
            Message::TransPayload(TransPayload {
                tid: 3,
                seq_number: index,
                fragment_data: vec![index as u8; 100],
            })
        };

        ground.handle(init(b"first")).unwrap();
        for index in 0..3 {
            assert!(ground.handle(payload(index)).unwrap().is_empty());
        }
        assert_eq!(*ground.since_report.get(&3).unwrap(), 3);

        assert!(ground.delete(Direction::Rx, 3));
        assert!(ground.since_report.get(&3).is_none());
        assert!(!ground.delete(Direction::Rx, 3));

        // 종료된 트랜잭션을 교체하면 카운터도 새로 시작
        ground.handle(init(b"second")).unwrap();
        for index in 0..3 {
            ground.handle(payload(index)).unwrap();
        }
        ground
            .manager()
            .with(Direction::Rx, 3, |t| {
                t.abort();
                Ok(())
            })
            .unwrap();
        ground.handle(init(b"third")).unwrap();
        assert_eq!(*ground.since_report.get(&3).unwrap(), 0);

        // 새 트랜잭션은 4개째 새 조각에서 첫 보고
        for index in 0..3 {
            assert!(ground.handle(payload(index)).unwrap().is_empty());
        }
        assert!(!ground.handle(payload(3)).unwrap().is_empty());
    }

    #[test]
    fn test_update_for_unknown_tid() {
        let dir = tempfile::tempdir().unwrap();
        let spacecraft = Dispatcher::new(config(dir.path()));
        let update = Message::UpdateMissingFragments(UpdateMissingFragments {
            tid: 9,
            seq_offset: 0,
            msb: 0xFFFF,
            lsb: 0xFFFF,
        });
        assert!(matches!(
            spacecraft.handle(update),
            Err(Error::NotFound { tid: 9, .. })
        ));
    }
}
