//! 누락 조각 비트맵
//!
//! 32조각 윈도우 하나를 32비트 값으로 표현한다.
//! - bit 31 = `seq_offset`, bit 30 = `seq_offset + 1` ... (MSB 우선)
//! - bit 1 = 이미 보유, bit 0 = 아직 누락
//! - `num_packets` 이상의 인덱스에 해당하는 비트는 디코딩 시 무시, 인코딩 시 0

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::transaction::FragmentIndex;
use crate::{Error, Result, WINDOW_SIZE};

/// UPDATE_MISSING_FRAGMENTS 한 건의 내용
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUpdate {
    /// 윈도우 시작 인덱스
    pub seq_offset: u16,

    /// 비트맵 상위 16비트
    pub msb: u16,

    /// 비트맵 하위 16비트
    pub lsb: u16,
}

impl WindowUpdate {
    pub fn new(seq_offset: u16, msb: u16, lsb: u16) -> Self {
        Self {
            seq_offset,
            msb,
            lsb,
        }
    }

    /// 32비트 비트맵으로 생성
    pub fn from_bitmap(seq_offset: u16, bitmap: u32) -> Self {
        Self {
            seq_offset,
            msb: (bitmap >> 16) as u16,
            lsb: bitmap as u16,
        }
    }

    /// 32비트 비트맵
    pub fn bitmap(&self) -> u32 {
        ((self.msb as u32) << 16) | self.lsb as u32
    }
}

/// 윈도우가 다루는 유효 인덱스 범위
fn window_range(seq_offset: u16, num_packets: u16) -> impl Iterator<Item = FragmentIndex> {
    let start = seq_offset as u32;
    let end = (start + WINDOW_SIZE).min(num_packets as u32);
    (start..end).map(|index| index as FragmentIndex)
}

/// 인덱스에 해당하는 비트 마스크
#[inline]
fn bit_for(seq_offset: u16, index: FragmentIndex) -> u32 {
    1 << (WINDOW_SIZE - 1 - (index - seq_offset) as u32)
}

/// 수신한 윈도우를 누락 집합에 반영
///
/// 같은 윈도우를 여러 번 적용해도 결과는 같다.
pub fn apply_update(
    missing: &mut BTreeSet<FragmentIndex>,
    seq_offset: u16,
    msb: u16,
    lsb: u16,
    num_packets: u16,
) -> Result<()> {
    if seq_offset >= num_packets {
        return Err(Error::InvalidWindow {
            seq_offset,
            num_packets,
        });
    }

    let bitmap = WindowUpdate::new(seq_offset, msb, lsb).bitmap();
    for index in window_range(seq_offset, num_packets) {
        if bitmap & bit_for(seq_offset, index) != 0 {
            missing.remove(&index);
        } else {
            missing.insert(index);
        }
    }

    Ok(())
}

/// 누락 집합의 한 윈도우를 (msb, lsb)로 인코딩
pub fn encode_window(
    missing: &BTreeSet<FragmentIndex>,
    seq_offset: u16,
    num_packets: u16,
) -> (u16, u16) {
    let bitmap = window_range(seq_offset, num_packets)
        .filter(|index| !missing.contains(index))
        .fold(0u32, |acc, index| acc | bit_for(seq_offset, index));

    let update = WindowUpdate::from_bitmap(seq_offset, bitmap);
    (update.msb, update.lsb)
}

/// 전체 전송 상태를 윈도우 목록으로 인코딩
///
/// 0부터 `num_packets`까지 32개 단위로 한 건씩 생성한다.
pub fn encode_missing_set(
    missing: &BTreeSet<FragmentIndex>,
    num_packets: u16,
) -> Vec<WindowUpdate> {
    (0..num_packets as u32)
        .step_by(WINDOW_SIZE as usize)
        .map(|offset| {
            let seq_offset = offset as u16;
            let (msb, lsb) = encode_window(missing, seq_offset, num_packets);
            WindowUpdate::new(seq_offset, msb, lsb)
        })
        .collect()
}
