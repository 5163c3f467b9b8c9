//! 수신 엔진
//!
//! - 청크 검증/중복 제거/저장 후 ACK
//! - 대용량 전송은 스테이징 저장소에 보관
//! - 모든 청크 도착 시 별도 태스크에서 인덱스 순서로 조립, 제한 크기 중간 집합체 단위로 처리
//! - 최종 SHA-256 검사는 항상 수행하며 불일치는 치명적 실패

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ack::AckEmitter;
use crate::channel::DataChannel;
use crate::checksum::{
    checksums_match, verify_chunk, FileHasher, RandomSource, SampleSource, SamplingPolicy,
};
use crate::chunk::{ChunkIndex, ChunkLayout};
use crate::codec::frame_overhead;
use crate::message::{ControlMessage, TransferOffer};
use crate::stats::{ProgressThrottle, TransferStats};
use crate::store::{hashed_name, ChunkStore, MemoryStore};
use crate::transfer::{
    emit, AssembledData, AssembledFile, Completion, Direction, EventSender, Progress, StateCell,
    TransferEvent, TransferRegistry, TransferState,
};
use crate::{Config, Error, Result};

/// 청크 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 저장 후 ACK
    Stored,

    /// 이미 받은 청크, ACK 만 다시 보냄
    Duplicate,

    /// ACK 없이 버림
    Dropped,
}

/// 수신 현황
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSnapshot {
    pub state: TransferState,
    pub received_chunks: u32,
    pub received_bytes: u64,
    pub total_chunks: u32,
    pub duplicate_chunks: u64,
    pub checksum_failures: u64,
    pub staged: bool,
}

/// 청크 보관 위치
enum Storage {
    /// 메모리 상주 (도착한 청크만)
    Resident(HashMap<ChunkIndex, Bytes>),

    /// 스테이징 저장소
    Staged,

    /// 조립 태스크로 넘어갔거나 취소 후 정리됨
    Released,
}

/// 수신 전송 상태
struct ReceiveTransfer {
    offer: TransferOffer,
    layout: ChunkLayout,
    sender_id: String,
    state: StateCell,
    received: Vec<bool>,
    received_count: u32,
    storage: Storage,
    sampling: SamplingPolicy,
    stats: TransferStats,
    throttle: ProgressThrottle,
}

type TransferSlot = Arc<Mutex<ReceiveTransfer>>;

/// 조립 태스크 입력
///
/// 조립 동안 전송 잠금을 잡지 않도록 필요한 값을 꺼내 옮김
struct AssemblyJob {
    transfer_id: String,
    layout: ChunkLayout,
    storage: Storage,
    file_name: String,
    mime_type: String,
    expected_checksum: Option<String>,
}

/// 조립기
///
/// 청크를 중간 버퍼에 모으다가 임계값을 넘으면 하나의 집합체로 만들어
/// 해시에 넣고 (메모리 목록 또는 출력 파일로) 내보냄
struct Assembler {
    threshold: usize,
    pending: BytesMut,
    parts: Vec<Bytes>,
    path: Option<PathBuf>,
    file: Option<File>,
    hasher: FileHasher,
}

impl Assembler {
    fn new(threshold: usize, path: Option<PathBuf>) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: BytesMut::new(),
            parts: Vec::new(),
            path,
            file: None,
            hasher: FileHasher::new(),
        }
    }

    async fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() >= self.threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// 중간 집합체 내보내기 (해시/파일 쓰기는 블로킹 스레드)
    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let part = self.pending.split().freeze();
        let mut hasher = std::mem::take(&mut self.hasher);
        let mut file = self.file.take();
        let path = self.path.clone();

        let (hasher, file, part) = tokio::task::spawn_blocking(move || -> Result<_> {
            hasher.update(&part);
            if let Some(path) = path {
                if file.is_none() {
                    file = Some(File::create(&path)?);
                }
                if let Some(out) = file.as_mut() {
                    out.write_all(&part)?;
                }
            }
            Ok((hasher, file, part))
        })
        .await??;

        self.hasher = hasher;
        self.file = file;
        if self.path.is_none() {
            self.parts.push(part);
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<(FileHasher, AssembledData)> {
        self.flush().await?;

        match self.path {
            Some(path) => {
                let file = self.file.take();
                let target = path.clone();
                tokio::task::spawn_blocking(move || -> Result<()> {
                    match file {
                        Some(file) => file.sync_all()?,
                        // 빈 파일
                        None => {
                            File::create(&target)?;
                        }
                    }
                    Ok(())
                })
                .await??;
                Ok((self.hasher, AssembledData::File(path)))
            }
            None => Ok((self.hasher, AssembledData::Memory(self.parts))),
        }
    }

    async fn abort(self) {
        if let Some(path) = self.path {
            drop(self.file);
            remove_output(path).await;
        }
    }
}

async fn remove_output(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || fs::remove_file(path)).await;
    if let Ok(Err(e)) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("조립 출력 삭제 실패: {}", e);
        }
    }
}

/// 수신 엔진과 조립 태스크가 함께 쓰는 자원
struct Shared<C: DataChannel> {
    config: Config,
    events: EventSender,
    acks: Arc<AckEmitter<C>>,
    store: Arc<dyn ChunkStore>,
    registry: Arc<TransferRegistry<TransferSlot>>,
}

impl<C: DataChannel> Shared<C> {
    /// 조립 태스크 본체
    ///
    /// 조립 중에는 전송 잠금을 잡지 않으며, 결과 반영 시점에
    /// 여전히 조립 상태일 때만 완료/실패로 전이함
    async fn run_assembly(&self, slot: TransferSlot, job: AssemblyJob) {
        let result = self.build_artifact(&job).await;
        if let Storage::Staged = job.storage {
            self.delete_staged(&job.transfer_id).await;
        }

        let mut transfer = slot.lock().await;
        if transfer.state.get() != TransferState::Assembling {
            debug!(
                "조립 중 종료된 전송, 결과 폐기: transfer={}, state={:?}",
                job.transfer_id,
                transfer.state.get()
            );
            if let Ok(AssembledFile {
                data: AssembledData::File(path),
                ..
            }) = result
            {
                remove_output(path).await;
            }
            return;
        }
        transfer.stats.finish();

        match result {
            Ok(file) => {
                if let Err(e) = transfer.state.transition(TransferState::Complete) {
                    warn!("완료 전이 실패: transfer={}, {}", job.transfer_id, e);
                    return;
                }
                info!(
                    "수신 완료: transfer={}, sha256={} | {}",
                    job.transfer_id,
                    file.checksum,
                    transfer.stats.summary()
                );
                emit(
                    &self.events,
                    TransferEvent::Complete(Completion {
                        transfer_id: job.transfer_id.clone(),
                        direction: Direction::Receive,
                        total_bytes: job.layout.total_size,
                        average_speed: transfer.stats.average_speed(),
                        total_time: transfer.stats.elapsed(),
                        file: Some(file),
                    }),
                );
            }
            Err(error) => {
                warn!(
                    "조립 실패: transfer={}, reason={}, {}",
                    job.transfer_id,
                    error.failure_reason(),
                    error
                );
                if let Err(e) = transfer.state.transition(TransferState::Failed) {
                    warn!("실패 전이 실패: transfer={}, {}", job.transfer_id, e);
                    return;
                }
                emit(
                    &self.events,
                    TransferEvent::failed(&job.transfer_id, Direction::Receive, &error),
                );
            }
        }

        self.registry
            .schedule_removal(&job.transfer_id, self.config.grace_period());
    }

    async fn build_artifact(&self, job: &AssemblyJob) -> Result<AssembledFile> {
        let output_path = match (&job.storage, &self.config.assembly_dir) {
            (Storage::Staged, Some(dir)) => {
                let target = dir.clone();
                tokio::task::spawn_blocking(move || fs::create_dir_all(target)).await??;
                Some(dir.join(hashed_name(&job.transfer_id)))
            }
            _ => None,
        };

        let mut assembler = Assembler::new(self.config.aggregate_flush_threshold, output_path);
        if let Err(e) = self.feed(&mut assembler, job).await {
            assembler.abort().await;
            return Err(e);
        }
        let (hasher, data) = assembler.finish().await?;

        let size = hasher.bytes();
        let checksum = hasher.finalize_hex();
        let verdict = if size != job.layout.total_size {
            Err(Error::SizeMismatch {
                expected: job.layout.total_size,
                got: size,
            })
        } else {
            match &job.expected_checksum {
                Some(expected) if !checksums_match(expected, &checksum) => {
                    Err(Error::IntegrityCheckFailed {
                        expected: expected.clone(),
                        got: checksum.clone(),
                    })
                }
                _ => Ok(()),
            }
        };

        if let Err(e) = verdict {
            if let AssembledData::File(path) = data {
                remove_output(path).await;
            }
            return Err(e);
        }

        Ok(AssembledFile {
            file_name: job.file_name.clone(),
            mime_type: job.mime_type.clone(),
            size,
            checksum,
            data,
        })
    }

    /// 인덱스 순서로 청크를 조립기에 공급
    async fn feed(&self, assembler: &mut Assembler, job: &AssemblyJob) -> Result<()> {
        for index in 0..job.layout.total_chunks {
            let chunk = match &job.storage {
                Storage::Resident(slots) => slots.get(&index).cloned(),
                Storage::Staged => {
                    let store = Arc::clone(&self.store);
                    let id = job.transfer_id.clone();
                    tokio::task::spawn_blocking(move || store.get(&id, index)).await??
                }
                Storage::Released => None,
            };

            let chunk =
                chunk.ok_or_else(|| Error::Storage(format!("청크 {} 를 찾을 수 없음", index)))?;
            assembler.push(&chunk).await?;
        }
        Ok(())
    }

    async fn release_storage(&self, transfer: &mut ReceiveTransfer) {
        if let Storage::Staged = std::mem::replace(&mut transfer.storage, Storage::Released) {
            self.delete_staged(&transfer.offer.transfer_id).await;
        }
    }

    async fn delete_staged(&self, transfer_id: &str) {
        let store = Arc::clone(&self.store);
        let id = transfer_id.to_string();
        match tokio::task::spawn_blocking(move || store.delete_transfer(&id)).await {
            Ok(Ok(count)) => debug!("스테이징 청크 {}개 삭제", count),
            Ok(Err(e)) => warn!("스테이징 정리 실패: {}", e),
            Err(e) => warn!("스테이징 정리 작업 실패: {}", e),
        }
    }
}

/// 수신 엔진
///
/// Tokio 런타임 안에서 생성해야 함 (일괄 ACK 플러시 태스크, 조립 태스크)
pub struct ReceiverEngine<C: DataChannel> {
    shared: Arc<Shared<C>>,
    channel: Arc<C>,
    sampler: parking_lot::Mutex<Box<dyn SampleSource>>,
}

impl<C: DataChannel> ReceiverEngine<C> {
    /// 메모리 스테이징 저장소로 생성
    pub fn new(config: Config, channel: Arc<C>, events: EventSender) -> Result<Self> {
        Self::with_store(config, channel, events, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        config: Config,
        channel: Arc<C>,
        events: EventSender,
        store: Arc<dyn ChunkStore>,
    ) -> Result<Self> {
        config.validate()?;

        let acks = AckEmitter::new(Arc::clone(&channel), config.ack_mode);
        acks.spawn_flusher();

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                events,
                acks,
                store,
                registry: TransferRegistry::new(),
            }),
            channel,
            sampler: parking_lot::Mutex::new(Box::new(RandomSource)),
        })
    }

    /// 체크섬 샘플링 난수원 교체
    pub fn with_sample_source(self, source: Box<dyn SampleSource>) -> Self {
        *self.sampler.lock() = source;
        self
    }

    /// 수신 전송 초기화
    ///
    /// 채널로 받을 수 없는 청크 크기나 상한을 넘는 청크 수의 제안은 거부
    pub fn init_transfer(&self, offer: TransferOffer, sender_id: &str) -> Result<()> {
        let config = &self.shared.config;
        let layout = self.check_offer(&offer)?;

        let staged = layout.total_size >= config.staging_threshold;
        let storage = if staged {
            Storage::Staged
        } else {
            Storage::Resident(HashMap::new())
        };

        let state = StateCell::new();
        state.transition(TransferState::Transferring)?;

        let transfer = ReceiveTransfer {
            sender_id: sender_id.to_string(),
            state: state.clone(),
            received: vec![false; layout.total_chunks as usize],
            received_count: 0,
            storage,
            sampling: SamplingPolicy::for_layout(&layout, config),
            stats: TransferStats::new(layout.total_size, layout.total_chunks),
            throttle: ProgressThrottle::new(
                Duration::from_millis(config.progress_interval_ms),
                config.progress_chunk_interval,
            ),
            layout,
            offer,
        };

        let transfer_id = transfer.offer.transfer_id.clone();
        info!(
            "수신 시작: transfer={}, {} bytes, {} chunks, staged={}, sampling={:.0}%",
            transfer_id,
            layout.total_size,
            layout.total_chunks,
            staged,
            transfer.sampling.rate * 100.0
        );
        self.shared
            .registry
            .insert(&transfer_id, state, Arc::new(Mutex::new(transfer)))
    }

    /// 받을 수 없는 제안이면 상대에게 취소를 알리고 거부
    fn check_offer(&self, offer: &TransferOffer) -> Result<ChunkLayout> {
        let rejected = |reason: String| {
            warn!("수신 제안 거부: transfer={}, {}", offer.transfer_id, reason);
            let cancel = ControlMessage::Cancel {
                transfer_id: offer.transfer_id.clone(),
                reason: Some(reason.clone()),
            };
            match cancel.to_bytes() {
                Ok(frame) => {
                    if !self.channel.send(frame) {
                        warn!("거부 알림 송신 실패: transfer={}", offer.transfer_id);
                    }
                }
                Err(e) => warn!("거부 알림 직렬화 실패: {}", e),
            }
            Error::OfferRejected {
                transfer_id: offer.transfer_id.clone(),
                reason,
            }
        };

        let layout = offer.layout().map_err(|e| rejected(e.to_string()))?;

        // 체크섬 없는 최소 프레임도 채널에 실을 수 없으면 받을 수 없음
        let max_message_size = self.channel.max_message_size();
        let frame_size = layout
            .chunk_size
            .saturating_add(frame_overhead(offer.transfer_id.len(), 0));
        if frame_size > max_message_size {
            return Err(rejected(format!(
                "청크 프레임 {} bytes > 채널 최대 {} bytes",
                frame_size, max_message_size
            )));
        }

        let max_chunks = self.shared.config.max_offer_chunks;
        if layout.total_chunks > max_chunks {
            return Err(rejected(format!(
                "청크 수 {} > 최대 {}",
                layout.total_chunks, max_chunks
            )));
        }
        Ok(layout)
    }

    /// 청크 수신
    pub async fn chunk_received(
        &self,
        transfer_id: &str,
        index: ChunkIndex,
        payload: Bytes,
        checksum: Option<&str>,
        sender_id: &str,
    ) -> Result<ChunkOutcome> {
        let Some(slot) = self.shared.registry.get(transfer_id) else {
            debug!("알 수 없는 전송의 청크 무시: transfer={}", transfer_id);
            return Ok(ChunkOutcome::Dropped);
        };
        let mut transfer = slot.lock().await;

        if transfer.sender_id != sender_id {
            transfer.stats.dropped_packets += 1;
            debug!(
                "송신자 불일치 청크 무시: transfer={}, from={}",
                transfer_id, sender_id
            );
            return Ok(ChunkOutcome::Dropped);
        }
        if index >= transfer.layout.total_chunks {
            transfer.stats.dropped_packets += 1;
            debug!(
                "범위 밖 청크 무시: transfer={}, chunk={}, total={}",
                transfer_id, index, transfer.layout.total_chunks
            );
            return Ok(ChunkOutcome::Dropped);
        }

        let state = transfer.state.get();
        if matches!(state, TransferState::Cancelled | TransferState::Failed) {
            return Ok(ChunkOutcome::Dropped);
        }

        // 중복: 카운트 없이 ACK 만 (조립 중이나 완료 후 늦게 온 재전송 포함)
        if transfer.received[index as usize] {
            transfer.stats.duplicate_chunks += 1;
            self.shared.acks.acknowledge(transfer_id, index);
            return Ok(ChunkOutcome::Duplicate);
        }
        if state != TransferState::Transferring {
            return Ok(ChunkOutcome::Dropped);
        }

        let expected_len = transfer.layout.chunk_len(index).unwrap_or_default();
        if payload.len() != expected_len {
            transfer.stats.dropped_packets += 1;
            debug!(
                "청크 길이 불일치: transfer={}, chunk={}, expected={}, got={}",
                transfer_id,
                index,
                expected_len,
                payload.len()
            );
            return Ok(ChunkOutcome::Dropped);
        }

        if let Some(expected) = checksum {
            let sampled = {
                let mut sampler = self.sampler.lock();
                transfer.sampling.should_verify(index, &mut **sampler)
            };
            if sampled && !verify_chunk(&payload, expected) {
                // 재전송을 유도하기 위해 ACK 하지 않음
                transfer.stats.checksum_failures += 1;
                warn!(
                    "청크 체크섬 불일치: transfer={}, chunk={}",
                    transfer_id, index
                );
                return Ok(ChunkOutcome::Dropped);
            }
        }

        let len = payload.len();
        match &mut transfer.storage {
            Storage::Resident(slots) => {
                slots.insert(index, payload);
            }
            Storage::Staged => {
                let store = Arc::clone(&self.shared.store);
                let id = transfer_id.to_string();
                tokio::task::spawn_blocking(move || store.put(&id, index, payload)).await??;
            }
            Storage::Released => return Ok(ChunkOutcome::Dropped),
        }

        transfer.received[index as usize] = true;
        transfer.received_count += 1;
        transfer.stats.record_chunk(len);
        self.shared.acks.acknowledge(transfer_id, index);

        if transfer.throttle.should_emit(Instant::now()) {
            self.emit_progress(&transfer);
        }

        if transfer.received_count == transfer.layout.total_chunks {
            let file_name = transfer.offer.file_name.clone();
            let mime_type = transfer.offer.mime_type.clone();
            self.start_assembly(&slot, &mut transfer, file_name, mime_type)?;
        }

        Ok(ChunkOutcome::Stored)
    }

    /// 스트림 종료 신호, 모든 청크가 있으면 조립
    pub async fn end_of_stream(&self, transfer_id: &str, total_chunks: u32) -> Result<()> {
        let slot = self.slot(transfer_id)?;
        let mut transfer = slot.lock().await;

        if total_chunks != transfer.layout.total_chunks {
            debug!(
                "종료 신호 청크 수 불일치: transfer={}, declared={}, got={}",
                transfer_id, transfer.layout.total_chunks, total_chunks
            );
        }
        if transfer.state.get() != TransferState::Transferring {
            return Ok(());
        }
        let missing = transfer.layout.total_chunks - transfer.received_count;
        if missing > 0 {
            // 남은 청크는 재전송으로 도착함
            debug!("종료 신호 수신, {}개 청크 대기: transfer={}", missing, transfer_id);
            return Ok(());
        }

        let file_name = transfer.offer.file_name.clone();
        let mime_type = transfer.offer.mime_type.clone();
        self.start_assembly(&slot, &mut transfer, file_name, mime_type)
    }

    /// 조립 요청
    ///
    /// 이미 조립 중이거나 종료된 전송이면 아무것도 하지 않음.
    /// 조립은 별도 태스크에서 진행되며 결과는 이벤트로 전달됨
    pub async fn assemble(&self, transfer_id: &str, mime_type: &str, file_name: &str) -> Result<()> {
        let slot = self.slot(transfer_id)?;
        let mut transfer = slot.lock().await;
        if transfer.state.get() != TransferState::Transferring {
            return Ok(());
        }
        self.start_assembly(&slot, &mut transfer, file_name.to_string(), mime_type.to_string())
    }

    /// 조립 상태로 전이하고 조립 태스크 시작
    ///
    /// 보관 청크는 태스크로 넘기므로 이후 잠금은 짧게만 잡힘
    fn start_assembly(
        &self,
        slot: &TransferSlot,
        transfer: &mut ReceiveTransfer,
        file_name: String,
        mime_type: String,
    ) -> Result<()> {
        let missing = transfer.layout.total_chunks - transfer.received_count;
        if missing > 0 {
            return Err(Error::Incomplete { missing });
        }

        let transfer_id = transfer.offer.transfer_id.clone();
        // 송신측이 마지막 ACK 를 기다리지 않도록 먼저 내보냄
        self.shared.acks.flush(&transfer_id);
        transfer.state.transition(TransferState::Assembling)?;
        debug!("조립 시작: transfer={}", transfer_id);

        let job = AssemblyJob {
            transfer_id,
            layout: transfer.layout,
            storage: std::mem::replace(&mut transfer.storage, Storage::Released),
            file_name,
            mime_type,
            expected_checksum: transfer.offer.file_checksum.clone(),
        };
        let shared = Arc::clone(&self.shared);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            shared.run_assembly(slot, job).await;
        });
        Ok(())
    }

    /// 로컬 취소 (상대에게도 알림)
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        self.cancel(transfer_id, false, None).await
    }

    /// 상대가 보낸 취소
    pub async fn peer_cancelled(&self, transfer_id: &str, reason: Option<String>) -> Result<()> {
        self.cancel(transfer_id, true, reason).await
    }

    async fn cancel(&self, transfer_id: &str, by_peer: bool, reason: Option<String>) -> Result<()> {
        let slot = self.slot(transfer_id)?;
        let mut transfer = slot.lock().await;

        // 조립 중 취소면 스테이징 정리는 조립 태스크가 맡음
        transfer.state.transition(TransferState::Cancelled)?;
        self.shared.acks.discard(transfer_id);
        self.shared.release_storage(&mut transfer).await;
        transfer.stats.finish();

        if !by_peer {
            let cancel = ControlMessage::Cancel {
                transfer_id: transfer_id.to_string(),
                reason,
            };
            if !self.channel.send(cancel.to_bytes()?) {
                warn!("취소 알림 송신 실패: transfer={}", transfer_id);
            }
        } else if let Some(reason) = reason {
            info!("상대 취소 사유: transfer={}, {}", transfer_id, reason);
        }

        info!(
            "수신 취소: transfer={}, by_peer={}, {}/{} chunks",
            transfer_id, by_peer, transfer.received_count, transfer.layout.total_chunks
        );
        emit(
            &self.shared.events,
            TransferEvent::Cancelled {
                transfer_id: transfer_id.to_string(),
                direction: Direction::Receive,
                by_peer,
            },
        );
        self.shared
            .registry
            .schedule_removal(transfer_id, self.shared.config.grace_period());
        Ok(())
    }

    /// 전송 상태 조회
    pub fn state(&self, transfer_id: &str) -> Option<TransferState> {
        self.shared.registry.state(transfer_id)
    }

    /// 수신 현황
    pub async fn snapshot(&self, transfer_id: &str) -> Option<ReceiveSnapshot> {
        let slot = self.shared.registry.get(transfer_id)?;
        let transfer = slot.lock().await;
        Some(ReceiveSnapshot {
            state: transfer.state.get(),
            received_chunks: transfer.received_count,
            received_bytes: transfer.stats.bytes_done,
            total_chunks: transfer.layout.total_chunks,
            duplicate_chunks: transfer.stats.duplicate_chunks,
            checksum_failures: transfer.stats.checksum_failures,
            staged: matches!(transfer.storage, Storage::Staged),
        })
    }

    /// 레지스트리에 남아 있는 전송 수
    pub fn transfer_count(&self) -> usize {
        self.shared.registry.len()
    }

    fn slot(&self, transfer_id: &str) -> Result<TransferSlot> {
        self.shared
            .registry
            .get(transfer_id)
            .ok_or_else(|| Error::UnknownTransfer {
                transfer_id: transfer_id.to_string(),
            })
    }

    fn emit_progress(&self, transfer: &ReceiveTransfer) {
        emit(
            &self.shared.events,
            TransferEvent::Progress(Progress {
                transfer_id: transfer.offer.transfer_id.clone(),
                direction: Direction::Receive,
                bytes: transfer.stats.bytes_done,
                total_bytes: transfer.layout.total_size,
                speed: transfer.stats.current_speed(),
                eta: transfer.stats.eta(),
                chunks_done: transfer.received_count,
                total_chunks: transfer.layout.total_chunks,
                window_size: None,
            }),
        );
    }
}
