//! 전송 엔진 설정
//!
//! 윈도우/타임아웃/워터마크 등은 모두 경험적 상수이므로 고정값이 아닌 설정으로 둠

use std::path::PathBuf;
use std::time::Duration;

use crate::ack::AckMode;
use crate::{Error, Result, DEFAULT_CHUNK_SIZE};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// DCFT 전송 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크 크기 (바이트, 마지막 청크는 더 짧을 수 있음)
    pub chunk_size: usize,

    /// 초기 혼잡 윈도우 (청크 수)
    pub initial_window: u32,

    /// 최소 혼잡 윈도우
    pub min_window: u32,

    /// 최대 혼잡 윈도우
    pub max_window: u32,

    /// 초기 slow-start 임계값
    pub initial_ssthresh: u32,

    /// 윈도우 축소를 유발하는 연속 타임아웃 수
    pub timeout_burst: u32,

    /// 연속 타임아웃 감시 구간 (밀리초)
    pub timeout_burst_interval_ms: u64,

    /// 청크 기본 타임아웃 (밀리초)
    pub base_timeout_ms: u64,

    /// RTT 기반 타임아웃 여유분 (밀리초)
    pub rtt_margin_ms: u64,

    /// RTT 이동 평균 샘플 수
    pub rtt_samples: usize,

    /// 청크당 최대 재전송 횟수
    pub max_retries: u32,

    /// 실패 청크 재시도 주기 (밀리초)
    pub failed_retry_interval_ms: u64,

    /// 실패 청크 집합이 비워지지 않을 때 전송을 실패 처리하기까지의 시간 (밀리초)
    pub failed_chunk_deadline_ms: u64,

    /// 윈도우 전체가 무응답일 때 강제 재전송까지의 시간 (밀리초)
    pub stall_timeout_ms: u64,

    /// 송신 루프 스케줄러 틱 (밀리초)
    pub tick_interval_ms: u64,

    /// 백프레셔 상한 (채널 버퍼 바이트)
    pub high_watermark: usize,

    /// 백프레셔 해제 하한
    pub low_watermark: usize,

    /// 백프레셔 해제 확인 주기 (밀리초)
    pub backpressure_poll_ms: u64,

    /// ACK 전달 방식
    pub ack_mode: AckMode,

    /// 진행률 보고 최소 간격 (밀리초)
    pub progress_interval_ms: u64,

    /// 진행률 보고 청크 간격
    pub progress_chunk_interval: u32,

    /// 완료 신호 중복 전송 횟수 (마지막 컨트롤 메시지 손실 대비)
    pub completion_signal_repeats: u32,

    /// 완료 신호 간격 (밀리초)
    pub completion_signal_interval_ms: u64,

    /// 이 크기 이상의 전송은 스테이징 저장소에 청크를 보관
    pub staging_threshold: u64,

    /// 조립 시 중간 버퍼를 합치는 크기
    pub aggregate_flush_threshold: usize,

    /// 수신 제안에서 허용하는 최대 청크 수
    pub max_offer_chunks: u32,

    /// 스테이징 전송의 조립 결과를 파일로 쓸 디렉토리 (없으면 메모리)
    pub assembly_dir: Option<PathBuf>,

    /// 완료 후 메타데이터 보존 시간 (밀리초)
    pub grace_period_ms: u64,

    /// 이 크기 미만이면 모든 청크 체크섬 검증
    pub full_sampling_limit: u64,

    /// 이 크기 미만이면 `medium_sample_rate`, 이상이면 `large_sample_rate`
    pub partial_sampling_limit: u64,

    /// 100MB ~ 1GB 구간 샘플링 비율
    pub medium_sample_rate: f64,

    /// 1GB 이상 샘플링 비율
    pub large_sample_rate: f64,

    /// 청크별 CRC32 체크섬 포함 여부
    pub chunk_checksums: bool,

    /// 전송 시작 전 전체 파일 SHA-256 계산 여부
    pub file_checksum: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_window: 4,
            min_window: 2,
            max_window: 128,
            initial_ssthresh: 64,
            timeout_burst: 3,
            timeout_burst_interval_ms: 2000,
            base_timeout_ms: 3000,
            rtt_margin_ms: 100,
            rtt_samples: 10,
            max_retries: 10,
            failed_retry_interval_ms: 5000,
            failed_chunk_deadline_ms: 60_000,
            stall_timeout_ms: 10_000,
            tick_interval_ms: 20,
            high_watermark: MB,               // 1MB
            low_watermark: 256 * KB,          // 256KB
            backpressure_poll_ms: 10,
            ack_mode: AckMode::Immediate,
            progress_interval_ms: 200,
            progress_chunk_interval: 50,
            completion_signal_repeats: 3,
            completion_signal_interval_ms: 100,
            staging_threshold: 100 * MB as u64,
            aggregate_flush_threshold: 50 * MB,
            max_offer_chunks: 1 << 24,
            assembly_dir: None,
            grace_period_ms: 30_000,
            full_sampling_limit: 100 * MB as u64,
            partial_sampling_limit: 1024 * MB as u64,
            medium_sample_rate: 0.10,
            large_sample_rate: 0.01,
            chunk_checksums: true,
            file_checksum: true,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            max_window: 32,
            initial_ssthresh: 16,
            high_watermark: 512 * KB,
            low_watermark: 128 * KB,
            staging_threshold: 32 * MB as u64,
            aggregate_flush_threshold: 16 * MB,
            tick_interval_ms: 50,
            ..Self::default()
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            chunk_size: 64 * KB,
            initial_window: 8,
            max_window: 128,
            initial_ssthresh: 96,
            high_watermark: 4 * MB,
            low_watermark: 512 * KB,
            base_timeout_ms: 2000,
            tick_interval_ms: 10,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            initial_window: 2,
            max_window: 64,
            initial_ssthresh: 16,
            base_timeout_ms: 5000,
            rtt_margin_ms: 300,
            max_retries: 15,
            stall_timeout_ms: 15_000,
            failed_chunk_deadline_ms: 120_000,
            ack_mode: AckMode::Batched {
                flush_interval_ms: 50,
                max_batch: 32,
            },
            ..Self::default()
        }
    }

    /// 설정 일관성 검사
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0일 수 없음".into()));
        }
        if self.min_window == 0 || self.min_window > self.max_window {
            return Err(Error::InvalidConfig(format!(
                "윈도우 범위 오류: min={}, max={}",
                self.min_window, self.max_window
            )));
        }
        if self.initial_window < self.min_window || self.initial_window > self.max_window {
            return Err(Error::InvalidConfig(format!(
                "초기 윈도우 {}가 [{}, {}] 범위 밖",
                self.initial_window, self.min_window, self.max_window
            )));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(Error::InvalidConfig(format!(
                "워터마크 오류: low={} >= high={}",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.timeout_burst == 0 || self.rtt_samples == 0 || self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "timeout_burst, rtt_samples, tick_interval_ms는 0일 수 없음".into(),
            ));
        }
        if self.full_sampling_limit > self.partial_sampling_limit {
            return Err(Error::InvalidConfig("샘플링 구간 순서 오류".into()));
        }
        if self.max_offer_chunks == 0 {
            return Err(Error::InvalidConfig("max_offer_chunks는 0일 수 없음".into()));
        }
        if let AckMode::Batched { max_batch: 0, .. } = self.ack_mode {
            return Err(Error::InvalidConfig("max_batch는 0일 수 없음".into()));
        }
        Ok(())
    }

    /// 스케줄러 틱
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// 완료 후 보존 시간
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            Config::default(),
            Config::low_spec(),
            Config::high_performance(),
            Config::unstable_network(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let config = Config {
            low_watermark: 2 * MB,
            high_watermark: MB,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_window_bounds() {
        let config = Config {
            min_window: 10,
            max_window: 4,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
