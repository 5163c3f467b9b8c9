//! 전송 데이터 모델
//!
//! - 생명주기 상태와 상태 전이 검사
//! - 엔진 인스턴스가 소유하는 전송 레지스트리
//! - 호출자에게 전달되는 이벤트

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result};

/// 전송 생명주기
///
/// `Preparing -> Transferring <-> Paused -> Assembling -> Complete`,
/// `Cancelled`/`Failed` 는 종료되지 않은 어느 상태에서나 진입 가능
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Preparing,
    Transferring,
    Paused,
    Assembling,
    Complete,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Cancelled | TransferState::Failed
        )
    }

    /// 허용된 전이인지
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Preparing, Transferring) => true,
            (Transferring, Paused) | (Paused, Transferring) => true,
            (Transferring, Assembling) => true,
            // 송신측은 조립 단계 없이 완료
            (Transferring, Complete) => true,
            (Assembling, Complete) => true,
            _ => false,
        }
    }
}

/// 여러 태스크가 공유하는 전송 상태
#[derive(Debug, Clone)]
pub struct StateCell(Arc<RwLock<TransferState>>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(TransferState::Preparing)))
    }

    pub fn get(&self) -> TransferState {
        *self.0.read()
    }

    pub fn is_terminal(&self) -> bool {
        self.get().is_terminal()
    }

    /// 검사된 상태 전이
    pub fn transition(&self, next: TransferState) -> Result<()> {
        let mut state = self.0.write();
        if !state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }

    fn same_cell(&self, other: &StateCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// 실패 사유 분류
///
/// 네트워크 소진은 재시도, 무결성 실패는 파일 재선택이 필요함
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// 재시도 예산 소진
    NetworkExhausted,

    /// 최종 크기/해시 불일치
    Integrity,

    /// 소스 읽기 또는 스테이징 저장소 실패
    Storage,

    /// 채널이 송신을 거부
    Channel,

    /// 프로토콜 위반으로 진행 불가
    Protocol,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::NetworkExhausted => "네트워크/타임아웃 재시도 소진",
            FailureReason::Integrity => "무결성 검사 실패 (파일 손상)",
            FailureReason::Storage => "저장소 에러",
            FailureReason::Channel => "채널 에러",
            FailureReason::Protocol => "프로토콜 위반",
        };
        f.write_str(text)
    }
}

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// 진행률 보고
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub transfer_id: String,
    pub direction: Direction,

    /// 확인된 바이트 (송신: ACK 기준, 수신: 저장 기준)
    pub bytes: u64,
    pub total_bytes: u64,

    /// 최근 구간 속도 (bytes/sec)
    pub speed: f64,
    pub eta: Option<Duration>,
    pub chunks_done: u32,
    pub total_chunks: u32,

    /// 송신측 혼잡 윈도우
    pub window_size: Option<u32>,
}

/// 조립 결과 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledData {
    /// 제한 크기 중간 집합체 목록 (순서대로 이어붙이면 원본)
    Memory(Vec<Bytes>),

    /// 출력 파일
    File(PathBuf),
}

impl AssembledData {
    /// 메모리 결과를 하나의 버퍼로 합침
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            AssembledData::Memory(parts) if parts.len() == 1 => Some(parts[0].clone()),
            AssembledData::Memory(parts) => {
                let total = parts.iter().map(Bytes::len).sum();
                let mut buf = BytesMut::with_capacity(total);
                for part in parts {
                    buf.extend_from_slice(part);
                }
                Some(buf.freeze())
            }
            AssembledData::File(_) => None,
        }
    }
}

/// 수신측 완성 파일
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,

    /// SHA-256 (hex)
    pub checksum: String,
    pub data: AssembledData,
}

/// 완료 보고
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub transfer_id: String,
    pub direction: Direction,
    pub total_bytes: u64,

    /// 평균 속도 (bytes/sec)
    pub average_speed: f64,
    pub total_time: Duration,

    /// 수신측에만 존재
    pub file: Option<AssembledFile>,
}

/// 호출자에게 전달되는 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(Progress),
    Complete(Completion),
    Error {
        transfer_id: String,
        direction: Direction,
        reason: FailureReason,
        message: String,
    },
    Cancelled {
        transfer_id: String,
        direction: Direction,

        /// 상대가 취소를 요청했는지
        by_peer: bool,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferEvent::Progress(p) => &p.transfer_id,
            TransferEvent::Complete(c) => &c.transfer_id,
            TransferEvent::Error { transfer_id, .. } | TransferEvent::Cancelled { transfer_id, .. } => {
                transfer_id
            }
        }
    }

    /// 최종 이벤트 여부
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress(_))
    }

    /// 에러를 실패 이벤트로 변환
    pub fn failed(transfer_id: &str, direction: Direction, error: &Error) -> Self {
        TransferEvent::Error {
            transfer_id: transfer_id.to_string(),
            direction,
            reason: error.failure_reason(),
            message: error.to_string(),
        }
    }
}

/// 이벤트 송신기
pub type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// 이벤트 수신기
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// 이벤트 전달 (수신측이 사라졌으면 무시)
pub(crate) fn emit(events: &EventSender, event: TransferEvent) {
    if events.send(event).is_err() {
        debug!("이벤트 수신측 없음");
    }
}

struct RegistryEntry<T> {
    state: StateCell,
    value: T,
}

/// 전송 ID 기반 레지스트리
///
/// 엔진 인스턴스가 소유하며 타이머/메시지 콜백에서 동시에 접근됨
pub struct TransferRegistry<T> {
    entries: DashMap<String, RegistryEntry<T>>,
}

impl<T: Clone + Send + Sync + 'static> TransferRegistry<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    /// 전송 등록
    ///
    /// 같은 ID 의 전송이 아직 종료되지 않았으면 거부, 종료된 항목은 교체
    pub fn insert(&self, transfer_id: &str, state: StateCell, value: T) -> Result<()> {
        match self.entries.entry(transfer_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().state.is_terminal() {
                    return Err(Error::DuplicateTransfer {
                        transfer_id: transfer_id.to_string(),
                    });
                }
                occupied.insert(RegistryEntry { state, value });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RegistryEntry { state, value });
            }
        }
        Ok(())
    }

    pub fn get(&self, transfer_id: &str) -> Option<T> {
        self.entries.get(transfer_id).map(|entry| entry.value.clone())
    }

    pub fn state(&self, transfer_id: &str) -> Option<TransferState> {
        self.entries.get(transfer_id).map(|entry| entry.state.get())
    }

    pub fn contains(&self, transfer_id: &str) -> bool {
        self.entries.contains_key(transfer_id)
    }

    pub fn remove(&self, transfer_id: &str) -> Option<T> {
        self.entries.remove(transfer_id).map(|(_, entry)| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 모든 항목 제거
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// 유예 시간 후 제거
    ///
    /// 그 사이 같은 ID 로 새 전송이 등록되었으면 건드리지 않음
    pub fn schedule_removal(self: &Arc<Self>, transfer_id: &str, after: Duration) {
        let Some(state) = self.entries.get(transfer_id).map(|entry| entry.state.clone()) else {
            return;
        };

        let registry = Arc::downgrade(self);
        let transfer_id = transfer_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed = registry
                .entries
                .remove_if(&transfer_id, |_, entry| entry.state.same_cell(&state));
            if removed.is_some() {
                debug!("전송 메타데이터 정리: transfer={}", transfer_id);
            }
        });
    }
}
