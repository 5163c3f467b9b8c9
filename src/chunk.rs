//! 청크 분할과 청크 상태 정의
//!
//! - ChunkLayout: 파일 크기와 청크 크기로부터 청크 경계 계산
//! - ChunkSource: 송신측 원본 (메모리 / 파일)
//! - SendChunk: 송신측 청크별 상태

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{Error, Result};

/// 청크 인덱스 (전송 내 0부터 연속)
pub type ChunkIndex = u32;

/// 청크 경계 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    /// 전체 바이트 크기
    pub total_size: u64,

    /// 고정 청크 크기
    pub chunk_size: usize,

    /// 총 청크 수 (ceil(total_size / chunk_size))
    pub total_chunks: u32,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0일 수 없음".into()));
        }

        let total_chunks = total_size.div_ceil(chunk_size as u64);
        let total_chunks = u32::try_from(total_chunks).map_err(|_| {
            Error::InvalidConfig(format!("청크 수 {} 가 u32 범위를 초과", total_chunks))
        })?;

        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    /// 청크의 바이트 범위
    pub fn range(&self, index: ChunkIndex) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index as u64 * self.chunk_size as u64;
        let end = start
            .saturating_add(self.chunk_size as u64)
            .min(self.total_size);
        Some(start..end)
    }

    /// 청크 길이
    pub fn chunk_len(&self, index: ChunkIndex) -> Option<usize> {
        self.range(index).map(|r| (r.end - r.start) as usize)
    }

    /// 마지막 청크 인덱스
    pub fn last_index(&self) -> Option<ChunkIndex> {
        self.total_chunks.checked_sub(1)
    }

    /// 중간 청크 인덱스
    pub fn middle_index(&self) -> Option<ChunkIndex> {
        (self.total_chunks > 0).then(|| self.total_chunks / 2)
    }

    /// (인덱스, 범위) 순회
    pub fn chunks(&self) -> impl Iterator<Item = (ChunkIndex, Range<u64>)> + '_ {
        (0..self.total_chunks).filter_map(move |i| self.range(i).map(|r| (i, r)))
    }

    /// 메모리 데이터를 청크로 분할 (복사 없음)
    pub fn split(&self, data: &Bytes) -> Vec<Bytes> {
        self.chunks()
            .map(|(_, r)| data.slice(r.start as usize..r.end as usize))
            .collect()
    }
}

/// 송신 원본
///
/// 파일 읽기는 블로킹 I/O이므로 송신 엔진이 `spawn_blocking`으로 호출함
pub trait ChunkSource: Send + Sync {
    /// 전체 크기
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 지정 범위 읽기
    fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes>;
}

/// 메모리 원본
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("범위 초과 읽기: {}..{} (크기 {})", start, end, self.data.len()),
            )));
        }
        Ok(self.data.slice(start..end))
    }
}

/// 파일 원본
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
    file: Mutex<File>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path,
            len,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// 송신측 청크 상태
#[derive(Debug, Clone)]
pub struct SendChunk {
    pub index: ChunkIndex,

    /// 바이트 길이
    pub len: usize,

    /// 마지막 전송 시각
    pub sent_at: Option<Instant>,

    /// 재전송 횟수
    pub retries: u32,

    /// 전송 중 (ACK 대기) 여부
    pub in_flight: bool,

    /// ACK 수신 여부
    pub acked: bool,
}

impl SendChunk {
    pub fn new(index: ChunkIndex, len: usize) -> Self {
        Self {
            index,
            len,
            sent_at: None,
            retries: 0,
            in_flight: false,
            acked: false,
        }
    }

    /// 전송 기록
    pub fn mark_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
        self.in_flight = true;
    }

    /// 타임아웃 여부
    pub fn is_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        match self.sent_at {
            Some(sent_at) if self.in_flight => now.saturating_duration_since(sent_at) >= timeout,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_layout_completeness() {
        let chunk_size = 100;
        for size in [0u64, 1, 99, 100, 101, 1000, 12345] {
            let layout = ChunkLayout::new(size, chunk_size).unwrap();
            let expected = (size + 99) / 100;
            assert_eq!(layout.total_chunks as u64, expected);

            let sum: u64 = (0..layout.total_chunks)
                .map(|i| layout.chunk_len(i).unwrap() as u64)
                .sum();
            assert_eq!(sum, size);
        }
    }

    #[test]
    fn test_layout_edges() {
        let layout = ChunkLayout::new(250, 100).unwrap();
        assert_eq!(layout.total_chunks, 3);
        assert_eq!(layout.chunk_len(2), Some(50));
        assert_eq!(layout.chunk_len(3), None);
        assert_eq!(layout.middle_index(), Some(1));
        assert_eq!(layout.last_index(), Some(2));

        let empty = ChunkLayout::new(0, 100).unwrap();
        assert_eq!(empty.total_chunks, 0);
        assert_eq!(empty.last_index(), None);
        assert_eq!(empty.middle_index(), None);
    }

    #[test]
    fn test_layout_extreme_sizes() {
        // 청크 수가 u32 를 넘으면 에러 (패닉 없음)
        assert!(matches!(
            ChunkLayout::new(u64::MAX, 100),
            Err(Error::InvalidConfig(_))
        ));

        let layout = ChunkLayout::new(u64::MAX, 1 << 33).unwrap();
        assert_eq!(layout.total_chunks, 1 << 31);
        let last = layout.last_index().unwrap();
        assert_eq!(layout.chunk_len(last), Some((1usize << 33) - 1));
        assert_eq!(layout.range(last).unwrap().end, u64::MAX);
    }

    #[test]
    fn test_split_reassembles() {
        let data: Bytes = (0..250u32).map(|i| i as u8).collect::<Vec<_>>().into();
        let layout = ChunkLayout::new(data.len() as u64, 100).unwrap();
        let parts = layout.split(&data);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts.concat(), data.to_vec());
    }

    #[test]
    fn test_memory_source_out_of_range() {
        let source = MemorySource::new(vec![1u8; 10]);
        assert_eq!(source.read_chunk(5, 5).unwrap().len(), 5);
        assert!(source.read_chunk(8, 5).is_err());
    }

    #[test]
    fn test_file_source_reads_ranges() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.len(), 1000);
        assert_eq!(source.read_chunk(900, 100).unwrap().as_ref(), &data[900..]);
        assert!(source.read_chunk(950, 100).is_err());
    }
}
