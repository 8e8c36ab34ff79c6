//! 명령 메시지 정의
//!
//! 비트 단위 텔레메트리 코덱은 외부에 있고, 여기서는 명령의 내용만 다룬다.
//! 헤더: magic(4, LE) + version(1) + msg_type(1), 이후 bincode 페이로드.
//! 메시지 종류는 항상 헤더의 msg_type 바이트로 구분한다.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::bitmap::WindowUpdate;
use crate::fragment::{FileHash, Fragment};
use crate::transaction::{FragmentIndex, TransactionId};
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 헤더 길이
pub const HEADER_LEN: usize = 6;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// 파일 전송 요청 (지상국 → 위성)
    CreateTrans = 1,

    /// 트랜잭션 정보 (위성 → 지상국)
    InitTrans = 2,

    /// 파일 조각
    TransPayload = 3,

    /// 누락 조각 전체 요청
    GenerateAllPackets = 4,

    /// 누락 조각 x개 요청
    GenerateXPackets = 5,

    /// 특정 조각 요청
    GetSinglePacket = 6,

    /// 보유/누락 비트맵 윈도우
    UpdateMissingFragments = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::CreateTrans,
            2 => MessageType::InitTrans,
            3 => MessageType::TransPayload,
            4 => MessageType::GenerateAllPackets,
            5 => MessageType::GenerateXPackets,
            6 => MessageType::GetSinglePacket,
            7 => MessageType::UpdateMissingFragments,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// 메시지 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type as u8);
    }

    /// 헤더 파싱 및 검증
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Truncated { len: bytes.len() });
        }

        let magic = bytes.get_u32_le();
        if magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: magic,
            });
        }

        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let msg_type = MessageType::try_from(bytes.get_u8())?;
        Ok(Self {
            magic,
            version,
            msg_type,
        })
    }
}

/// CREATE_TRANS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTrans {
    pub file_reference: String,
}

/// INIT_TRANS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTrans {
    pub tid: TransactionId,
    pub hash: FileHash,
    pub num_packets: u16,
}

/// TRANS_PAYLOAD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransPayload {
    pub tid: TransactionId,
    pub seq_number: FragmentIndex,
    pub fragment_data: Vec<u8>,
}

impl TransPayload {
    pub fn from_fragment(tid: TransactionId, fragment: &Fragment) -> Self {
        Self {
            tid,
            seq_number: fragment.index,
            fragment_data: fragment.payload.to_vec(),
        }
    }
}

/// GENERATE_X_PACKETS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateXPackets {
    pub tid: TransactionId,
    pub x: u16,
}

/// GET_SINGLE_PACKET
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSinglePacket {
    pub tid: TransactionId,
    pub seq_number: FragmentIndex,
}

/// UPDATE_MISSING_FRAGMENTS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMissingFragments {
    pub tid: TransactionId,
    pub seq_offset: u16,
    pub msb: u16,
    pub lsb: u16,
}

impl UpdateMissingFragments {
    pub fn new(tid: TransactionId, window: WindowUpdate) -> Self {
        Self {
            tid,
            seq_offset: window.seq_offset,
            msb: window.msb,
            lsb: window.lsb,
        }
    }

    pub fn window(&self) -> WindowUpdate {
        WindowUpdate::new(self.seq_offset, self.msb, self.lsb)
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CreateTrans(CreateTrans),
    InitTrans(InitTrans),
    TransPayload(TransPayload),
    GenerateAllPackets { tid: TransactionId },
    GenerateXPackets(GenerateXPackets),
    GetSinglePacket(GetSinglePacket),
    UpdateMissingFragments(UpdateMissingFragments),
}

fn encode_payload<T: Serialize>(buf: &mut BytesMut, payload: &T) -> Result<()> {
    buf.extend_from_slice(&bincode::serialize(payload)?);
    Ok(())
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::CreateTrans(_) => MessageType::CreateTrans,
            Message::InitTrans(_) => MessageType::InitTrans,
            Message::TransPayload(_) => MessageType::TransPayload,
            Message::GenerateAllPackets { .. } => MessageType::GenerateAllPackets,
            Message::GenerateXPackets(_) => MessageType::GenerateXPackets,
            Message::GetSinglePacket(_) => MessageType::GetSinglePacket,
            Message::UpdateMissingFragments(_) => MessageType::UpdateMissingFragments,
        }
    }

    /// 대상 트랜잭션 ID (CREATE_TRANS는 없음)
    pub fn tid(&self) -> Option<TransactionId> {
        match self {
            Message::CreateTrans(_) => None,
            Message::InitTrans(m) => Some(m.tid),
            Message::TransPayload(m) => Some(m.tid),
            Message::GenerateAllPackets { tid } => Some(*tid),
            Message::GenerateXPackets(m) => Some(m.tid),
            Message::GetSinglePacket(m) => Some(m.tid),
            Message::UpdateMissingFragments(m) => Some(m.tid),
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        MessageHeader::new(self.msg_type()).write_to(&mut buf);

        match self {
            Message::CreateTrans(m) => encode_payload(&mut buf, m)?,
            Message::InitTrans(m) => encode_payload(&mut buf, m)?,
            Message::TransPayload(m) => encode_payload(&mut buf, m)?,
            Message::GenerateAllPackets { tid } => buf.put_u8(*tid),
            Message::GenerateXPackets(m) => encode_payload(&mut buf, m)?,
            Message::GetSinglePacket(m) => encode_payload(&mut buf, m)?,
            Message::UpdateMissingFragments(m) => encode_payload(&mut buf, m)?,
        }

        Ok(buf.to_vec())
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = MessageHeader::parse(bytes)?;
        let payload = &bytes[HEADER_LEN..];

        Ok(match header.msg_type {
            MessageType::CreateTrans => Message::CreateTrans(decode_payload(payload)?),
            MessageType::InitTrans => Message::InitTrans(decode_payload(payload)?),
            MessageType::TransPayload => Message::TransPayload(decode_payload(payload)?),
            MessageType::GenerateAllPackets => {
                let tid = *payload.first().ok_or(Error::Truncated { len: bytes.len() })?;
                Message::GenerateAllPackets { tid }
            }
            MessageType::GenerateXPackets => Message::GenerateXPackets(decode_payload(payload)?),
            MessageType::GetSinglePacket => Message::GetSinglePacket(decode_payload(payload)?),
            MessageType::UpdateMissingFragments => {
                Message::UpdateMissingFragments(decode_payload(payload)?)
            }
        })
    }
}
