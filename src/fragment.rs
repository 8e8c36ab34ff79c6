//! 조각 생성과 조립
//!
//! - FragmentSource: 송신측 원본 파일, 인덱스 단위로 필요한 부분만 읽음
//! - Fragments: 누락 인덱스 스냅샷을 따라 지연 생성되는 조각 시퀀스
//! - Assembly: 수신측 조립 대상 (메모리 버퍼 또는 사전 할당 파일)

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::transaction::FragmentIndex;
use crate::{Error, Result, HASH_LEN};

/// 파일 전체 내용 해시 (SHA-256)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash(pub [u8; HASH_LEN]);

impl FileHash {
    /// 바이트 열의 해시 계산
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// 읽기 가능한 스트림 전체의 해시 계산
    pub fn of_reader<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// 정수 필드로 전달하는 코덱을 위한 64비트 빅엔디언 분할
    pub fn to_words(&self) -> [u64; HASH_LEN / 8] {
        let mut words = [0u64; HASH_LEN / 8];
        for (word, bytes) in words.iter_mut().zip(self.0.chunks_exact(8)) {
            let mut be = [0u8; 8];
            be.copy_from_slice(bytes);
            *word = u64::from_be_bytes(be);
        }
        words
    }

    /// `to_words`의 역변환
    pub fn from_words(words: [u64; HASH_LEN / 8]) -> Self {
        let mut out = [0u8; HASH_LEN];
        for (bytes, word) in out.chunks_exact_mut(8).zip(words) {
            bytes.copy_from_slice(&word.to_be_bytes());
        }
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHash({})", self.to_hex())
    }
}

/// 조각 하나 (TRANS_PAYLOAD 내용)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: FragmentIndex,
    pub payload: Bytes,
}

/// 조각 수 계산 (올림)
pub fn packet_count(file_size: u64, fragment_size: usize) -> u64 {
    file_size.div_ceil(fragment_size as u64)
}

/// 인덱스의 기대 길이
///
/// 마지막 조각만 나머지 길이를 가진다.
pub fn expected_len(
    index: FragmentIndex,
    file_size: u64,
    fragment_size: usize,
    num_packets: u16,
) -> usize {
    if index + 1 == num_packets {
        (file_size - fragment_size as u64 * (num_packets as u64 - 1)) as usize
    } else {
        fragment_size
    }
}

/// 송신측 원본 파일
#[derive(Debug)]
pub struct FragmentSource {
    file: File,
    file_size: u64,
    fragment_size: usize,
    num_packets: u16,
}

impl FragmentSource {
    /// 원본 열기
    pub fn open(path: &Path, fragment_size: usize, num_packets: u16, file_size: u64) -> Result<Self> {
        let file = File::open(path).map_err(|source| Error::SourceUnavailable {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            file,
            file_size,
            fragment_size,
            num_packets,
        })
    }

    /// 조각 하나 읽기
    pub fn read_fragment(&mut self, index: FragmentIndex) -> Result<Fragment> {
        let len = expected_len(index, self.file_size, self.fragment_size, self.num_packets);
        let offset = index as u64 * self.fragment_size as u64;

        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;

        Ok(Fragment {
            index,
            payload: Bytes::from(buf),
        })
    }
}

/// 지연 생성 조각 시퀀스
///
/// 생성 시점의 누락 인덱스 스냅샷을 오름차순으로 순회하며, 페이로드는 `next()`에서 읽는다.
pub struct Fragments<'a> {
    source: &'a mut FragmentSource,
    indices: std::vec::IntoIter<FragmentIndex>,
}

impl<'a> Fragments<'a> {
    pub(crate) fn new(source: &'a mut FragmentSource, indices: Vec<FragmentIndex>) -> Self {
        Self {
            source,
            indices: indices.into_iter(),
        }
    }
}

impl Iterator for Fragments<'_> {
    type Item = Result<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.indices.next()?;
        Some(self.source.read_fragment(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.indices.size_hint()
    }
}

impl ExactSizeIterator for Fragments<'_> {}

/// 수신측 조립 대상
#[derive(Debug)]
pub enum Assembly {
    /// 메모리 버퍼, 최대 크기로 미리 할당
    Memory(BytesMut),

    /// 사전 할당 파일
    File { path: PathBuf, file: File },
}

impl Assembly {
    /// 메모리 조립 버퍼 생성
    pub fn in_memory(capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, 0);
        Assembly::Memory(data)
    }

    /// 파일 조립 대상 생성
    pub fn on_disk(path: &Path, capacity: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;

        Ok(Assembly::File {
            path: path.to_path_buf(),
            file,
        })
    }

    /// 버퍼로 잡고 있는 바이트 수 (파일 조립은 0)
    pub fn buffered_bytes(&self) -> usize {
        match self {
            Assembly::Memory(data) => data.len(),
            Assembly::File { .. } => 0,
        }
    }

    /// 오프셋에 기록
    pub fn write_at(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        match self {
            Assembly::Memory(data) => {
                let start = offset as usize;
                data[start..start + payload.len()].copy_from_slice(payload);
            }
            Assembly::File { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(payload)?;
            }
        }
        Ok(())
    }

    /// 오프셋에서 읽기
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            Assembly::Memory(data) => {
                let start = offset as usize;
                Ok(data[start..start + len].to_vec())
            }
            Assembly::File { file, .. } => {
                let mut file: &File = file;
                let mut buf = vec![0u8; len];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// 실제 파일 크기로 잘라냄
    pub fn truncate(&mut self, file_size: u64) -> Result<()> {
        match self {
            Assembly::Memory(data) => data.truncate(file_size as usize),
            Assembly::File { file, .. } => {
                file.set_len(file_size)?;
                file.flush()?;
            }
        }
        Ok(())
    }

    /// 조립된 내용 전체의 해시
    pub fn hash(&self) -> Result<FileHash> {
        match self {
            Assembly::Memory(data) => Ok(FileHash::of(data)),
            Assembly::File { file, .. } => {
                let mut file: &File = file;
                file.seek(SeekFrom::Start(0))?;
                Ok(FileHash::of_reader(&mut file)?)
            }
        }
    }

    /// 조립된 내용 (메모리 조립일 때만)
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Assembly::Memory(data) => Some(data),
            Assembly::File { .. } => None,
        }
    }

    /// 조립 파일 경로 (파일 조립일 때만)
    pub fn path(&self) -> Option<&Path> {
        match self {
            Assembly::Memory(_) => None,
            Assembly::File { path, .. } => Some(path),
        }
    }
}
