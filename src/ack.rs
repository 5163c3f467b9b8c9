//! ACK 전달
//!
//! - Immediate: 저장된 청크마다 `Ack` 하나
//! - Batched: 인덱스를 모아 짧은 주기마다 `BatchAck` 하나로 전송
//!
//! 송신측은 두 형태를 모두 `AckSample` 로 정규화해 동일하게 처리함

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::DataChannel;
use crate::chunk::ChunkIndex;
use crate::message::ControlMessage;

/// ACK 전달 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// 청크마다 즉시
    Immediate,

    /// 일괄 전송
    Batched {
        /// 플러시 주기 (밀리초)
        flush_interval_ms: u64,

        /// 이 개수가 모이면 주기와 무관하게 플러시
        max_batch: usize,
    },
}

/// 송신측에 도착한 ACK (단일/일괄 공통)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckSample {
    pub indices: Vec<ChunkIndex>,
    pub received_at: Instant,
}

impl AckSample {
    pub fn new(indices: Vec<ChunkIndex>) -> Self {
        Self {
            indices,
            received_at: Instant::now(),
        }
    }

    /// ACK 계열 컨트롤 메시지 정규화
    pub fn from_message(msg: &ControlMessage) -> Option<(&str, AckSample)> {
        match msg {
            ControlMessage::Ack {
                transfer_id,
                chunk_index,
            } => Some((transfer_id, AckSample::new(vec![*chunk_index]))),
            ControlMessage::BatchAck {
                transfer_id,
                indices,
            } => Some((transfer_id, AckSample::new(indices.clone()))),
            _ => None,
        }
    }
}

/// 전송별 대기 인덱스 모음
#[derive(Debug, Default)]
pub struct AckBatcher {
    pending: Mutex<HashMap<String, BTreeSet<ChunkIndex>>>,
}

impl AckBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 인덱스 추가, 대기 개수 반환
    pub fn push(&self, transfer_id: &str, index: ChunkIndex) -> usize {
        let mut pending = self.pending.lock();
        let set = pending.entry(transfer_id.to_string()).or_default();
        set.insert(index);
        set.len()
    }

    /// 한 전송의 대기 ACK 꺼내기
    pub fn take(&self, transfer_id: &str) -> Option<ControlMessage> {
        let indices = self.pending.lock().remove(transfer_id)?;
        if indices.is_empty() {
            return None;
        }
        Some(ControlMessage::BatchAck {
            transfer_id: transfer_id.to_string(),
            indices: indices.into_iter().collect(),
        })
    }

    /// 모든 대기 ACK 꺼내기
    pub fn take_all(&self) -> Vec<ControlMessage> {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained
            .into_iter()
            .filter(|(_, indices)| !indices.is_empty())
            .map(|(transfer_id, indices)| ControlMessage::BatchAck {
                transfer_id,
                indices: indices.into_iter().collect(),
            })
            .collect()
    }

    /// 대기 ACK 폐기 (취소된 전송)
    pub fn discard(&self, transfer_id: &str) {
        self.pending.lock().remove(transfer_id);
    }

    pub fn pending(&self, transfer_id: &str) -> usize {
        self.pending.lock().get(transfer_id).map_or(0, BTreeSet::len)
    }
}

/// 수신측 ACK 송신기
pub struct AckEmitter<C: DataChannel> {
    channel: Arc<C>,
    mode: AckMode,
    batcher: AckBatcher,
}

impl<C: DataChannel> AckEmitter<C> {
    pub fn new(channel: Arc<C>, mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            channel,
            mode,
            batcher: AckBatcher::new(),
        })
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    /// 청크 저장 확인
    pub fn acknowledge(&self, transfer_id: &str, index: ChunkIndex) {
        match self.mode {
            AckMode::Immediate => self.send(&ControlMessage::Ack {
                transfer_id: transfer_id.to_string(),
                chunk_index: index,
            }),
            AckMode::Batched { max_batch, .. } => {
                if self.batcher.push(transfer_id, index) >= max_batch {
                    self.flush(transfer_id);
                }
            }
        }
    }

    /// 한 전송의 대기 ACK 즉시 전송
    pub fn flush(&self, transfer_id: &str) {
        if let Some(msg) = self.batcher.take(transfer_id) {
            self.send(&msg);
        }
    }

    /// 대기 ACK 폐기
    pub fn discard(&self, transfer_id: &str) {
        self.batcher.discard(transfer_id);
    }

    pub fn pending(&self, transfer_id: &str) -> usize {
        self.batcher.pending(transfer_id)
    }

    fn flush_all(&self) {
        for msg in self.batcher.take_all() {
            self.send(&msg);
        }
    }

    fn send(&self, msg: &ControlMessage) {
        match msg.to_bytes() {
            Ok(bytes) => {
                if !self.channel.send(bytes) {
                    // 손실된 ACK 은 송신측 타임아웃 재전송으로 복구됨
                    warn!("ACK 전송 실패: transfer={}", msg.transfer_id());
                }
            }
            Err(e) => warn!("ACK 직렬화 실패: {}", e),
        }
    }

    /// 일괄 모드 플러시 타이머 시작
    ///
    /// 송신기가 drop 되면 태스크도 종료됨
    pub fn spawn_flusher(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let AckMode::Batched {
            flush_interval_ms, ..
        } = self.mode
        else {
            return None;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(flush_interval_ms.max(1));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(emitter) = weak.upgrade() else {
                    debug!("ACK 플러시 태스크 종료");
                    break;
                };
                emitter.flush_all();
            }
        }))
    }
}
