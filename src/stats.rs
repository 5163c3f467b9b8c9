//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 최근 속도 계산에 쓰는 진행 기록 수
const RATE_WINDOW: usize = 32;

/// 진행 기록
#[derive(Debug, Clone, Copy)]
struct ProgressMark {
    timestamp: Instant,
    bytes: u64,
}

/// 한 전송의 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 종료 시간
    pub finish_time: Option<Instant>,

    /// 전체 바이트
    pub total_bytes: u64,

    /// 전체 청크 수
    pub total_chunks: u32,

    /// 확인된 바이트 (송신: ACK, 수신: 저장)
    pub bytes_done: u64,

    /// 확인된 청크 수
    pub chunks_done: u32,

    /// 채널에 올린 청크 프레임 수 (재전송 포함)
    pub chunks_sent: u64,

    /// 재전송 청크 수
    pub retransmitted_chunks: u64,

    /// 중복 수신 청크 수
    pub duplicate_chunks: u64,

    /// 프로토콜 위반으로 버린 패킷 수
    pub dropped_packets: u64,

    /// 샘플 체크섬 실패 수
    pub checksum_failures: u64,

    /// 최근 진행 기록
    marks: VecDeque<ProgressMark>,
}

impl TransferStats {
    pub fn new(total_bytes: u64, total_chunks: u32) -> Self {
        Self {
            start_time: Instant::now(),
            finish_time: None,
            total_bytes,
            total_chunks,
            bytes_done: 0,
            chunks_done: 0,
            chunks_sent: 0,
            retransmitted_chunks: 0,
            duplicate_chunks: 0,
            dropped_packets: 0,
            checksum_failures: 0,
            marks: VecDeque::with_capacity(RATE_WINDOW),
        }
    }

    /// 청크 하나 확인 기록
    pub fn record_chunk(&mut self, size: usize) {
        let now = Instant::now();

        self.bytes_done += size as u64;
        self.chunks_done += 1;

        if self.marks.len() >= RATE_WINDOW {
            self.marks.pop_front();
        }
        self.marks.push_back(ProgressMark {
            timestamp: now,
            bytes: self.bytes_done,
        });
    }

    /// 전송 종료 시각 기록
    pub fn finish(&mut self) {
        if self.finish_time.is_none() {
            self.finish_time = Some(Instant::now());
        }
    }

    /// 경과 시간 (종료 후에는 고정)
    pub fn elapsed(&self) -> Duration {
        match self.finish_time {
            Some(end) => end.saturating_duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// 평균 속도 (bytes/sec)
    pub fn average_speed(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / elapsed
    }

    /// 최근 구간 속도 (bytes/sec), 기록이 부족하면 평균 속도
    pub fn current_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.marks.front(), self.marks.back()) else {
            return 0.0;
        };

        let duration = last.timestamp.saturating_duration_since(first.timestamp);
        if self.marks.len() < 2 || duration.is_zero() {
            return self.average_speed();
        }
        (last.bytes - first.bytes) as f64 / duration.as_secs_f64()
    }

    /// 남은 시간 추정
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }

        let speed = self.current_speed();
        if speed <= 0.0 || !speed.is_finite() {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    /// 진행률 (0.0 ~ 1.0)
    pub fn ratio(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.chunks_done as f64 / self.total_chunks as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Chunks: {}/{} | Bytes: {} | Speed: {:.2} MB/s | Sent: {} | Retransmit: {} | Dup: {} | Dropped: {} | Checksum fail: {}",
            self.elapsed().as_secs_f64(),
            self.chunks_done,
            self.total_chunks,
            self.bytes_done,
            self.average_speed() / 1_000_000.0,
            self.chunks_sent,
            self.retransmitted_chunks,
            self.duplicate_chunks,
            self.dropped_packets,
            self.checksum_failures,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// 진행률 보고 제한 (시간 또는 청크 수 기준)
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    chunk_interval: u32,
    last_emit: Option<Instant>,
    chunks_since: u32,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, chunk_interval: u32) -> Self {
        Self {
            interval,
            chunk_interval: chunk_interval.max(1),
            last_emit: None,
            chunks_since: 0,
        }
    }

    /// 청크 하나 진행 후 보고 여부
    pub fn should_emit(&mut self, now: Instant) -> bool {
        self.chunks_since += 1;

        let due = match self.last_emit {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= self.interval
                    || self.chunks_since >= self.chunk_interval
            }
        };

        if due {
            self.last_emit = Some(now);
            self.chunks_since = 0;
        }
        due
    }
}
