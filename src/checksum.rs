//! 체크섬 검증
//!
//! - 청크 체크섬: CRC32 (8자리 hex), 파일 크기에 따라 샘플링 검증
//! - 파일 체크섬: SHA-256 (hex), 조립 결과 전체를 항상 검증

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::chunk::{ChunkIndex, ChunkLayout, ChunkSource};
use crate::{Config, Result};

/// 파일 해시 계산 시 읽기 단위
const HASH_READ_BLOCK: usize = 64 * 1024;

/// 청크 체크섬 문자열 길이
pub const CHUNK_CHECKSUM_LEN: usize = 8;

/// 청크 CRC32 체크섬
pub fn chunk_checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// 청크 체크섬 비교 (대소문자 무시)
pub fn verify_chunk(data: &[u8], expected: &str) -> bool {
    chunk_checksum(data).eq_ignore_ascii_case(expected)
}

/// 샘플링 난수원
///
/// 테스트에서 샘플링 결정을 고정할 수 있도록 주입 가능하게 둠
pub trait SampleSource: Send {
    /// [0, 1) 구간 값
    fn next_f64(&mut self) -> f64;
}

/// `rand` 기반 난수원
#[derive(Debug, Default)]
pub struct RandomSource;

impl SampleSource for RandomSource {
    fn next_f64(&mut self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// 고정값 난수원 (0.0 = 항상 샘플, 1.0 = 필수 청크만)
#[derive(Debug, Clone, Copy)]
pub struct FixedSource(pub f64);

impl SampleSource for FixedSource {
    fn next_f64(&mut self) -> f64 {
        self.0
    }
}

/// 청크 샘플링 정책
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    /// 샘플링 비율 (0.0 ~ 1.0)
    pub rate: f64,
    first: ChunkIndex,
    middle: ChunkIndex,
    last: ChunkIndex,
    total_chunks: u32,
}

impl SamplingPolicy {
    /// 파일 크기 기반 정책 생성
    ///
    /// | 크기 | 비율 |
    /// |---|---|
    /// | < 100MB | 100% |
    /// | 100MB ~ 1GB | 10% |
    /// | >= 1GB | 1% |
    pub fn for_layout(layout: &ChunkLayout, config: &Config) -> Self {
        let rate = if layout.total_size < config.full_sampling_limit {
            1.0
        } else if layout.total_size < config.partial_sampling_limit {
            config.medium_sample_rate
        } else {
            config.large_sample_rate
        };

        Self {
            rate,
            first: 0,
            middle: layout.middle_index().unwrap_or(0),
            last: layout.last_index().unwrap_or(0),
            total_chunks: layout.total_chunks,
        }
    }

    /// 항상 검증하는 청크 (첫/중간/마지막)
    pub fn is_mandatory(&self, index: ChunkIndex) -> bool {
        self.total_chunks > 0 && (index == self.first || index == self.middle || index == self.last)
    }

    /// 이 청크를 검증할지 결정
    pub fn should_verify(&self, index: ChunkIndex, rng: &mut dyn SampleSource) -> bool {
        if index >= self.total_chunks {
            return false;
        }
        if self.is_mandatory(index) || self.rate >= 1.0 {
            return true;
        }
        rng.next_f64() < self.rate
    }
}

/// 증분 SHA-256 계산기 (조립 중 청크 순서대로 입력)
#[derive(Clone, Default)]
pub struct FileHasher {
    hasher: Sha256,
    bytes: u64,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// 지금까지 입력된 바이트 수
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// hex 문자열로 종료
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// 메모리 데이터 SHA-256
pub fn file_checksum(data: &[u8]) -> String {
    let mut hasher = FileHasher::new();
    hasher.update(data);
    hasher.finalize_hex()
}

/// 원본 전체를 블록 단위로 읽어 SHA-256 계산 (블로킹)
pub fn source_checksum(source: &dyn ChunkSource) -> Result<String> {
    let total = source.len();
    let mut hasher = FileHasher::new();
    let mut offset = 0u64;

    while offset < total {
        let len = (total - offset).min(HASH_READ_BLOCK as u64) as usize;
        let block = source.read_chunk(offset, len)?;
        hasher.update(&block);
        offset += len as u64;
    }

    Ok(hasher.finalize_hex())
}

/// 기대값과 비교 (대소문자 무시)
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MemorySource;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_checksum_format() {
        let sum = chunk_checksum(b"hello");
        assert_eq!(sum.len(), 8);
        assert!(verify_chunk(b"hello", &sum));
        assert!(verify_chunk(b"hello", &sum.to_uppercase()));
        assert!(!verify_chunk(b"hellO", &sum));
    }

    #[test]
    fn test_sha256_known_value() {
        // SHA256 of "Hello, World!"
        assert_eq!(
            file_checksum(b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_source_checksum_matches_memory() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let source = MemorySource::new(data.clone());
        assert_eq!(source_checksum(&source).unwrap(), file_checksum(&data));
    }

    #[test]
    fn test_sampling_rate_by_size() {
        let config = Config::default();
        let rate = |size: u64| {
            let layout = ChunkLayout::new(size, 64 * 1024).unwrap();
            SamplingPolicy::for_layout(&layout, &config).rate
        };

        assert_eq!(rate(10 * MB), 1.0);
        assert_eq!(rate(100 * MB), 0.10);
        assert_eq!(rate(1024 * MB - 1), 0.10);
        assert_eq!(rate(1024 * MB), 0.01);
    }

    #[test]
    fn test_mandatory_chunks_always_sampled() {
        let config = Config::default();
        let layout = ChunkLayout::new(2048 * MB, 1024 * 1024).unwrap();
        let policy = SamplingPolicy::for_layout(&layout, &config);
        let mut never = FixedSource(1.0);

        let verified: Vec<ChunkIndex> = (0..layout.total_chunks)
            .filter(|&i| policy.should_verify(i, &mut never))
            .collect();

        assert_eq!(verified, vec![0, 1024, 2047]);
    }

    #[test]
    fn test_mandatory_chunks_small_counts() {
        let config = Config::default();
        for total in 3u64..12 {
            let layout = ChunkLayout::new(total * 10, 10).unwrap();
            let mut policy = SamplingPolicy::for_layout(&layout, &config);
            policy.rate = 0.0;
            let mut never = FixedSource(1.0);

            let verified: Vec<ChunkIndex> = (0..layout.total_chunks)
                .filter(|&i| policy.should_verify(i, &mut never))
                .collect();

            let mut expected = vec![0, layout.total_chunks / 2, layout.total_chunks - 1];
            expected.dedup();
            assert_eq!(verified, expected, "total {}", total);
        }
    }

    #[test]
    fn test_injected_source_drives_sampling() {
        let config = Config::default();
        let layout = ChunkLayout::new(500 * MB, 1024 * 1024).unwrap();
        let policy = SamplingPolicy::for_layout(&layout, &config);

        assert!(policy.should_verify(10, &mut FixedSource(0.05)));
        assert!(!policy.should_verify(10, &mut FixedSource(0.5)));
        assert!(!policy.should_verify(layout.total_chunks, &mut FixedSource(0.0)));
    }
}
