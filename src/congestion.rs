//! AIMD 혼잡 윈도우와 RTT 추정
//!
//! - slow start: 윈도우 전체가 ACK 될 때마다 2배 (ssthresh 까지)
//! - congestion avoidance: 라운드마다 +1 (max_window 까지)
//! - 감시 구간 내 연속 타임아웃 `timeout_burst` 회: 윈도우 절반, ssthresh = 새 윈도우
//!
//! 채널이 손실 신호를 주지 않으므로 타임아웃만이 혼잡 신호임

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use crate::chunk::ChunkIndex;
use crate::Config;

/// 송신측 혼잡 윈도우
#[derive(Debug, Clone)]
pub struct CongestionWindow {
    window: u32,
    ssthresh: u32,
    min_window: u32,
    max_window: u32,
    slow_start: bool,

    /// 전송 중 청크 (윈도우 크기로 제한)
    in_flight: BTreeSet<ChunkIndex>,

    /// 현재 라운드에서 ACK 된 청크 수
    acked_in_round: u32,

    consecutive_successes: u32,
    consecutive_timeouts: u32,

    timeout_burst: u32,
    burst_interval: Duration,
    burst_started: Option<Instant>,
}

impl CongestionWindow {
    pub fn new(config: &Config) -> Self {
        let window = config.initial_window.clamp(config.min_window, config.max_window);
        let ssthresh = config.initial_ssthresh.clamp(config.min_window, config.max_window);

        Self {
            window,
            ssthresh,
            min_window: config.min_window,
            max_window: config.max_window,
            slow_start: window < ssthresh,
            in_flight: BTreeSet::new(),
            acked_in_round: 0,
            consecutive_successes: 0,
            consecutive_timeouts: 0,
            timeout_burst: config.timeout_burst,
            burst_interval: Duration::from_millis(config.timeout_burst_interval_ms),
            burst_started: None,
        }
    }

    /// 현재 윈도우 크기
    pub fn size(&self) -> u32 {
        self.window
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, index: ChunkIndex) -> bool {
        self.in_flight.contains(&index)
    }

    /// 전송 중 청크 목록
    pub fn in_flight(&self) -> Vec<ChunkIndex> {
        self.in_flight.iter().copied().collect()
    }

    /// 새 청크를 보낼 여유가 있는지
    pub fn can_send(&self) -> bool {
        (self.in_flight.len() as u32) < self.window
    }

    /// 전송 기록
    ///
    /// 재전송(이미 전송 중)은 윈도우를 추가로 차지하지 않음
    pub fn on_send(&mut self, index: ChunkIndex) -> bool {
        if self.in_flight.contains(&index) {
            return true;
        }
        if !self.can_send() {
            return false;
        }
        self.in_flight.insert(index);
        true
    }

    /// ACK 처리, 전송 중이던 청크면 true
    pub fn on_ack(&mut self, index: ChunkIndex) -> bool {
        if !self.in_flight.remove(&index) {
            return false;
        }

        self.consecutive_successes += 1;
        self.consecutive_timeouts = 0;
        self.burst_started = None;

        self.acked_in_round += 1;
        if self.acked_in_round >= self.window {
            self.acked_in_round = 0;
            self.grow();
        }
        true
    }

    fn grow(&mut self) {
        if self.slow_start {
            let doubled = self.window.saturating_mul(2).min(self.ssthresh).min(self.max_window);
            self.window = doubled.max(self.window);
            if self.window >= self.ssthresh {
                self.slow_start = false;
            }
        } else {
            self.window = (self.window + 1).min(self.max_window);
        }
    }

    /// 타임아웃 처리, 윈도우가 줄었으면 true
    pub fn on_timeout(&mut self, now: Instant) -> bool {
        self.consecutive_successes = 0;

        match self.burst_started {
            Some(started) if now.saturating_duration_since(started) <= self.burst_interval => {
                self.consecutive_timeouts += 1;
            }
            _ => {
                self.burst_started = Some(now);
                self.consecutive_timeouts = 1;
            }
        }

        if self.consecutive_timeouts < self.timeout_burst {
            return false;
        }

        self.window = (self.window / 2).max(self.min_window);
        self.ssthresh = self.window;
        self.slow_start = false;
        self.acked_in_round = 0;
        self.consecutive_timeouts = 0;
        self.burst_started = None;
        true
    }

    /// ACK 없이 전송 중 집합에서 제거 (실패 청크 이동)
    pub fn release(&mut self, index: ChunkIndex) -> bool {
        self.in_flight.remove(&index)
    }

    /// 전송 중 집합 비우기
    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
        self.acked_in_round = 0;
    }
}

/// 최근 N개 RTT 샘플의 이동 평균
#[derive(Debug, Clone)]
pub struct RttEstimator {
    samples: VecDeque<Duration>,
    capacity: usize,
    base_timeout: Duration,
    margin: Duration,
}

impl RttEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.rtt_samples),
            capacity: config.rtt_samples.max(1),
            base_timeout: Duration::from_millis(config.base_timeout_ms),
            margin: Duration::from_millis(config.rtt_margin_ms),
        }
    }

    /// RTT 샘플 기록 (ackTime - sendTime)
    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// 평균 RTT
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<Duration>() / self.samples.len() as u32)
    }

    /// 청크 타임아웃 = max(base, 3 × avgRTT + margin)
    pub fn timeout(&self) -> Duration {
        match self.average() {
            Some(avg) => self.base_timeout.max(avg * 3 + self.margin),
            None => self.base_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            initial_window: 4,
            min_window: 2,
            max_window: 128,
            initial_ssthresh: 32,
            timeout_burst: 3,
            timeout_burst_interval_ms: 1000,
            ..Config::default()
        }
    }

    /// 윈도우를 가득 채우고 모두 ACK
    fn complete_round(cw: &mut CongestionWindow, next: &mut ChunkIndex) {
        let mut sent = Vec::new();
        while cw.can_send() {
            assert!(cw.on_send(*next));
            sent.push(*next);
            *next += 1;
        }
        for index in sent {
            assert!(cw.on_ack(index));
        }
    }

    #[test]
    fn test_slow_start_doubles_then_additive() {
        let mut cw = CongestionWindow::new(&config());
        let mut next = 0;

        let mut sizes = vec![cw.size()];
        for _ in 0..6 {
            complete_round(&mut cw, &mut next);
            sizes.push(cw.size());
        }

        assert_eq!(sizes, vec![4, 8, 16, 32, 33, 34, 35]);
        assert!(!cw.in_slow_start());
    }

    #[test]
    fn test_window_monotonic_and_bounded_under_success() {
        let mut cw = CongestionWindow::new(&Config {
            max_window: 20,
            ..config()
        });
        let mut next = 0;
        let mut prev = cw.size();

        for _ in 0..50 {
            complete_round(&mut cw, &mut next);
            assert!(cw.size() >= prev);
            assert!(cw.size() <= 20);
            prev = cw.size();
        }
        assert_eq!(cw.size(), 20);
    }

    #[test]
    fn test_window_halves_on_timeout_burst() {
        let mut cw = CongestionWindow::new(&config());
        let mut next = 0;
        complete_round(&mut cw, &mut next);
        complete_round(&mut cw, &mut next);
        assert_eq!(cw.size(), 16);

        let now = Instant::now();
        assert!(!cw.on_timeout(now));
        assert!(!cw.on_timeout(now + Duration::from_millis(10)));
        assert!(cw.on_timeout(now + Duration::from_millis(20)));

        assert_eq!(cw.size(), 8);
        assert_eq!(cw.ssthresh(), 8);
        assert!(!cw.in_slow_start());
    }

    #[test]
    fn test_window_floor() {
        let mut cw = CongestionWindow::new(&config());
        let now = Instant::now();
        for i in 0..30 {
            cw.on_timeout(now + Duration::from_millis(i));
        }
        assert_eq!(cw.size(), 2);
    }

    #[test]
    fn test_spread_out_timeouts_do_not_shrink() {
        let mut cw = CongestionWindow::new(&config());
        let now = Instant::now();

        assert!(!cw.on_timeout(now));
        assert!(!cw.on_timeout(now + Duration::from_millis(500)));
        // 감시 구간 밖
        assert!(!cw.on_timeout(now + Duration::from_millis(2000)));
        assert_eq!(cw.size(), 4);
        assert_eq!(cw.consecutive_timeouts(), 1);
    }

    #[test]
    fn test_ack_resets_timeout_streak() {
        let mut cw = CongestionWindow::new(&config());
        let now = Instant::now();
        cw.on_send(0);

        cw.on_timeout(now);
        cw.on_timeout(now);
        assert!(cw.on_ack(0));
        assert!(!cw.on_timeout(now));
        assert_eq!(cw.size(), 4);
    }

    #[test]
    fn test_in_flight_bounded_by_window() {
        let mut cw = CongestionWindow::new(&config());
        for i in 0..4 {
            assert!(cw.on_send(i));
        }
        assert!(!cw.can_send());
        assert!(!cw.on_send(99));
        // 재전송은 허용
        assert!(cw.on_send(2));
        assert_eq!(cw.in_flight_count(), 4);

        // 중복/미지 ACK 무시
        assert!(cw.on_ack(1));
        assert!(!cw.on_ack(1));
        assert!(!cw.on_ack(42));
    }

    #[test]
    fn test_rtt_timeout() {
        let mut rtt = RttEstimator::new(&Config {
            base_timeout_ms: 1000,
            rtt_margin_ms: 100,
            rtt_samples: 3,
            ..Config::default()
        });
        assert_eq!(rtt.timeout(), Duration::from_millis(1000));

        for ms in [100, 200, 300] {
            rtt.record(Duration::from_millis(ms));
        }
        assert_eq!(rtt.average(), Some(Duration::from_millis(200)));
        assert_eq!(rtt.timeout(), Duration::from_millis(1000));

        // 가장 오래된 샘플 밀려남
        for ms in [500, 500, 500] {
            rtt.record(Duration::from_millis(ms));
        }
        assert_eq!(rtt.sample_count(), 3);
        assert_eq!(rtt.timeout(), Duration::from_millis(1600));
    }
}
