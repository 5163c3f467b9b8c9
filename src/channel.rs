//! 데이터 채널 추상화
//!
//! 순서 보장 + 메시지 단위이지만 전달 확인/혼잡 신호가 없는 점대점 채널.
//! 수신 방향(onMessage)은 호출자가 `TransferEngine::handle_message` 로 밀어넣음

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::codec::PacketType;

/// 채널 기능
pub trait DataChannel: Send + Sync + 'static {
    /// 메시지 송신, 채널이 거부하면 false
    fn send(&self, bytes: Bytes) -> bool;

    /// 아직 전송되지 않은 송신 버퍼 바이트
    fn buffered_amount(&self) -> usize;

    /// 단일 메시지 최대 크기
    fn max_message_size(&self) -> usize;
}

/// 프로세스 내 채널 (테스트 / 데모용)
///
/// 송신한 프레임은 `new` 가 돌려준 수신기로 나옴. 버퍼 수준은 외부에서 지정하며
/// 손실률은 데이터 청크 프레임에만 적용됨
pub struct LoopbackChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    max_message_size: usize,
    buffered: AtomicUsize,
    loss_rate: Mutex<f64>,
    closed: AtomicBool,
    sent_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

impl LoopbackChannel {
    /// 채널과 송신 프레임 수신기 생성
    pub fn new(max_message_size: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            tx,
            max_message_size,
            buffered: AtomicUsize::new(0),
            loss_rate: Mutex::new(0.0),
            closed: AtomicBool::new(false),
            sent_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        });
        (channel, rx)
    }

    /// 보고할 버퍼 수준 지정
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// 청크 프레임 손실률 (0.0 ~ 1.0)
    pub fn set_loss_rate(&self, rate: f64) {
        *self.loss_rate.lock() = rate.clamp(0.0, 1.0);
    }

    /// 이후 송신 거부
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// 전달된 프레임 수
    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::Relaxed)
    }

    /// 손실 처리된 프레임 수
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl DataChannel for LoopbackChannel {
    fn send(&self, bytes: Bytes) -> bool {
        if self.closed.load(Ordering::SeqCst) || bytes.len() > self.max_message_size {
            return false;
        }

        let loss_rate = *self.loss_rate.lock();
        let is_chunk = bytes.first() == Some(&(PacketType::Chunk as u8));
        if is_chunk && loss_rate > 0.0 && rand::thread_rng().gen::<f64>() < loss_rate {
            // 채널 수준에서는 성공, 상대에게는 도착하지 않음
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if self.tx.send(bytes).is_err() {
            return false;
        }
        self.sent_frames.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
