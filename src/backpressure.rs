//! 백프레셔 감시
//!
//! 채널 송신 버퍼가 high watermark 를 넘으면 송신을 멈추고
//! low watermark 아래로 내려갈 때까지 재개하지 않음 (히스테리시스)
//!
//! 혼잡 윈도우와는 독립적: 윈도우 안의 청크라도 백프레셔로 지연될 수 있음

use std::time::Duration;

use crate::channel::DataChannel;
use crate::Config;

/// 채널 버퍼 수준 감시기
#[derive(Debug, Clone)]
pub struct BackpressureMonitor {
    high_watermark: usize,
    low_watermark: usize,
    poll_interval: Duration,
    blocked: bool,

    /// 차단 진입 횟수 (통계용)
    pauses: u64,
}

impl BackpressureMonitor {
    pub fn new(config: &Config) -> Self {
        Self {
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            poll_interval: Duration::from_millis(config.backpressure_poll_ms.max(1)),
            blocked: false,
            pauses: 0,
        }
    }

    /// 현재 버퍼 수준으로 송신 가능 여부 판단
    pub fn check(&mut self, buffered: usize) -> bool {
        if self.blocked {
            if buffered < self.low_watermark {
                self.blocked = false;
            }
        } else if buffered > self.high_watermark {
            self.blocked = true;
            self.pauses += 1;
        }
        !self.blocked
    }

    /// 송신 가능해질 때까지 대기
    pub async fn wait_until_clear<C: DataChannel + ?Sized>(&mut self, channel: &C) {
        while !self.check(channel.buffered_amount()) {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// 차단 중 재확인 주기
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BackpressureMonitor {
        BackpressureMonitor::new(&Config {
            high_watermark: 1000,
            low_watermark: 200,
            ..Config::default()
        })
    }

    #[test]
    fn test_hysteresis() {
        let mut bp = monitor();

        assert!(bp.check(0));
        assert!(bp.check(1000));
        assert!(!bp.check(1001));
        // high 아래로 내려가도 low 미만 전까지 차단 유지
        assert!(!bp.check(800));
        assert!(!bp.check(200));
        assert!(bp.check(199));
        assert!(bp.check(900));
        assert_eq!(bp.pauses(), 1);
    }

    #[tokio::test]
    async fn test_wait_until_clear() {
        use crate::channel::LoopbackChannel;
        use std::sync::Arc;

        let (channel, _rx) = LoopbackChannel::new(1024);
        channel.set_buffered_amount(5000);

        let mut bp = monitor();
        assert!(!bp.check(channel.buffered_amount()));

        let drain = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drain.set_buffered_amount(500);
            tokio::time::sleep(Duration::from_millis(30)).await;
            drain.set_buffered_amount(100);
        });

        tokio::time::timeout(Duration::from_secs(2), bp.wait_until_clear(&*channel))
            .await
            .unwrap();
        assert!(!bp.is_blocked());
        assert!(channel.buffered_amount() < 200);
    }

    #[test]
    fn test_stays_blocked_while_high() {
        let mut bp = monitor();
        for _ in 0..100 {
            assert!(!bp.check(5000));
        }
        assert!(bp.is_blocked());
        assert_eq!(bp.pauses(), 1);
    }
}
