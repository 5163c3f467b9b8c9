//! 송신 엔진
//!
//! - 전송마다 태스크 하나가 상태를 소유 (ACK 처리 직렬화)
//! - 혼잡 윈도우 + 백프레셔 안에서 청크 송출
//! - 적응형 타임아웃 재전송, 한도를 넘은 청크는 느린 주기로 재시도
//! - 전체 ACK 후 완료 신호를 중복 전송

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ack::AckSample;
use crate::backpressure::BackpressureMonitor;
use crate::channel::DataChannel;
use crate::checksum::{chunk_checksum, source_checksum, CHUNK_CHECKSUM_LEN};
use crate::chunk::{ChunkIndex, ChunkLayout, ChunkSource, SendChunk};
use crate::codec::{encode_chunk, encode_end_of_stream, frame_overhead, MAX_TRANSFER_ID_LEN};
use crate::congestion::{CongestionWindow, RttEstimator};
use crate::message::{ControlMessage, TransferOffer};
use crate::stats::{ProgressThrottle, TransferStats};
use crate::transfer::{
    emit, Completion, Direction, EventSender, Progress, StateCell, TransferEvent,
    TransferRegistry, TransferState,
};
use crate::{Config, Error, Result};

/// 전송 부가 정보
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferMeta {
    pub file_name: String,
    pub mime_type: String,
}

impl TransferMeta {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// 송신 태스크 명령
enum SenderCmd {
    Ack(AckSample),
    Pause,
    Resume,
    Cancel {
        notify_peer: bool,
        reason: Option<String>,
    },
}

/// 레지스트리에 보관되는 송신 태스크 핸들
#[derive(Clone)]
struct SenderHandle {
    cmd_tx: mpsc::UnboundedSender<SenderCmd>,
    state: StateCell,

    /// 송신 직전마다 확인하는 취소 플래그
    cancelled: Arc<AtomicBool>,
}

enum Outcome {
    Complete,
    Cancelled { by_peer: bool },
}

/// 다음 송신 후보 종류
#[derive(Clone, Copy, PartialEq, Eq)]
enum Candidate {
    /// 타임아웃 재전송 (이미 윈도우 안)
    Retransmit,

    /// 실패 집합에서 복귀 (새 윈도우 슬롯 필요)
    Recovered,

    /// 처음 보내는 청크
    Fresh,
}

/// 송신 태스크 상태 (단일 태스크에서만 접근)
struct SenderTask<C: DataChannel> {
    transfer_id: String,
    config: Config,
    channel: Arc<C>,
    events: EventSender,
    registry: Arc<TransferRegistry<SenderHandle>>,
    state: StateCell,
    cancelled: Arc<AtomicBool>,
    cmd_rx: mpsc::UnboundedReceiver<SenderCmd>,

    source: Arc<dyn ChunkSource>,
    layout: ChunkLayout,
    meta: TransferMeta,

    chunks: Vec<SendChunk>,
    next_index: ChunkIndex,
    acked_count: u32,

    /// 타임아웃으로 재전송 대기 중인 청크
    retransmit: VecDeque<ChunkIndex>,

    /// 재시도 한도를 넘은 청크
    failed: BTreeSet<ChunkIndex>,

    /// 실패 집합에서 복귀해 아직 ACK 되지 않은 청크
    recovering: BTreeSet<ChunkIndex>,
    recovered_queue: VecDeque<ChunkIndex>,
    failed_since: Option<Instant>,
    next_failed_retry: Option<Instant>,

    window: CongestionWindow,
    rtt: RttEstimator,
    backpressure: BackpressureMonitor,
    stats: TransferStats,
    throttle: ProgressThrottle,

    last_activity: Instant,
    send_failures: u32,
    paused: bool,
}

impl<C: DataChannel> SenderTask<C> {
    async fn run(mut self) {
        let result = self.execute().await;
        self.stats.finish();

        match result {
            Ok(Outcome::Complete) => {
                if let Err(e) = self.state.transition(TransferState::Complete) {
                    warn!("완료 전이 실패: transfer={}, {}", self.transfer_id, e);
                }
                info!(
                    "송신 완료: transfer={} | {}",
                    self.transfer_id,
                    self.stats.summary()
                );
                emit(
                    &self.events,
                    TransferEvent::Complete(Completion {
                        transfer_id: self.transfer_id.clone(),
                        direction: Direction::Send,
                        total_bytes: self.layout.total_size,
                        average_speed: self.stats.average_speed(),
                        total_time: self.stats.elapsed(),
                        file: None,
                    }),
                );
            }
            Ok(Outcome::Cancelled { by_peer }) => {
                info!(
                    "송신 취소: transfer={}, by_peer={}, {}/{} chunks",
                    self.transfer_id, by_peer, self.acked_count, self.layout.total_chunks
                );
                emit(
                    &self.events,
                    TransferEvent::Cancelled {
                        transfer_id: self.transfer_id.clone(),
                        direction: Direction::Send,
                        by_peer,
                    },
                );
            }
            Err(error) => self.fail(error),
        }

        self.registry
            .schedule_removal(&self.transfer_id, self.config.grace_period());
    }

    async fn execute(&mut self) -> Result<Outcome> {
        let file_checksum = if self.config.file_checksum {
            let source = Arc::clone(&self.source);
            Some(tokio::task::spawn_blocking(move || source_checksum(source.as_ref())).await??)
        } else {
            None
        };

        // 준비 중 들어온 취소
        if let Some(outcome) = self.drain_commands() {
            return Ok(outcome);
        }

        let offer = ControlMessage::Offer(TransferOffer {
            transfer_id: self.transfer_id.clone(),
            total_size: self.layout.total_size,
            chunk_size: self.layout.chunk_size as u32,
            total_chunks: self.layout.total_chunks,
            file_checksum,
            file_name: self.meta.file_name.clone(),
            mime_type: self.meta.mime_type.clone(),
        });
        self.send_control(&offer)?;
        self.state.transition(TransferState::Transferring)?;

        info!(
            "송신 시작: transfer={}, {} bytes, {} chunks x {} bytes",
            self.transfer_id,
            self.layout.total_size,
            self.layout.total_chunks,
            self.layout.chunk_size
        );
        self.last_activity = Instant::now();

        loop {
            if let Some(outcome) = self.drain_commands() {
                return Ok(outcome);
            }
            // 일시정지 중에는 완료하지 않음 (재개 후 완료)
            if !self.paused && self.acked_count >= self.layout.total_chunks {
                break;
            }

            if !self.paused {
                self.process_timers(Instant::now())?;
                self.dispatch().await?;
            }

            let tick = self.config.tick_interval();
            let cmd = if !self.paused && self.backpressure.is_blocked() {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Some(cmd),
                    _ = self.backpressure.wait_until_clear(self.channel.as_ref()) => None,
                    _ = tokio::time::sleep(tick) => None,
                }
            } else {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Some(cmd),
                    _ = tokio::time::sleep(tick) => None,
                }
            };

            match cmd {
                Some(Some(cmd)) => {
                    if let Some(outcome) = self.handle_command(cmd) {
                        return Ok(outcome);
                    }
                }
                Some(None) => {
                    debug!("송신 엔진 종료, 태스크 정리: transfer={}", self.transfer_id);
                    self.cancelled.store(true, Ordering::SeqCst);
                    if let Err(e) = self.state.transition(TransferState::Cancelled) {
                        debug!("취소 전이 실패: {}", e);
                    }
                    return Ok(Outcome::Cancelled { by_peer: false });
                }
                None => {}
            }
        }

        self.send_completion_signals().await;
        Ok(Outcome::Complete)
    }

    fn drain_commands(&mut self) -> Option<Outcome> {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let Some(outcome) = self.handle_command(cmd) {
                return Some(outcome);
            }
        }
        None
    }

    fn handle_command(&mut self, cmd: SenderCmd) -> Option<Outcome> {
        match cmd {
            SenderCmd::Ack(sample) => {
                self.on_ack(sample);
                None
            }
            SenderCmd::Pause => {
                match self.state.transition(TransferState::Paused) {
                    Ok(()) => {
                        self.paused = true;
                        info!("송신 일시정지: transfer={}", self.transfer_id);
                    }
                    Err(e) => debug!("일시정지 무시: {}", e),
                }
                None
            }
            SenderCmd::Resume => {
                match self.state.transition(TransferState::Transferring) {
                    Ok(()) => {
                        self.paused = false;
                        // 일시정지 동안의 시간은 타임아웃에 포함하지 않음
                        let now = Instant::now();
                        for index in self.window.in_flight() {
                            let chunk = &mut self.chunks[index as usize];
                            if chunk.sent_at.is_some() {
                                chunk.sent_at = Some(now);
                            }
                        }
                        self.last_activity = now;
                        info!("송신 재개: transfer={}", self.transfer_id);
                    }
                    Err(e) => debug!("재개 무시: {}", e),
                }
                None
            }
            SenderCmd::Cancel {
                notify_peer,
                reason,
            } => {
                self.cancelled.store(true, Ordering::SeqCst);
                if let Err(e) = self.state.transition(TransferState::Cancelled) {
                    debug!("취소 전이 실패: {}", e);
                }

                self.window.clear_in_flight();
                self.retransmit.clear();
                self.recovered_queue.clear();

                if notify_peer {
                    let cancel = ControlMessage::Cancel {
                        transfer_id: self.transfer_id.clone(),
                        reason,
                    };
                    if let Err(e) = self.send_control(&cancel) {
                        warn!("취소 알림 실패: transfer={}, {}", self.transfer_id, e);
                    }
                }
                Some(Outcome::Cancelled {
                    by_peer: !notify_peer,
                })
            }
        }
    }

    fn on_ack(&mut self, sample: AckSample) {
        let mut progressed = false;

        for index in sample.indices {
            let Some(chunk) = self.chunks.get_mut(index as usize) else {
                self.stats.dropped_packets += 1;
                debug!(
                    "범위 밖 ACK 무시: transfer={}, chunk={}",
                    self.transfer_id, index
                );
                continue;
            };
            if chunk.acked {
                continue;
            }

            if let Some(sent_at) = chunk.sent_at {
                self.rtt
                    .record(sample.received_at.saturating_duration_since(sent_at));
            }
            chunk.acked = true;
            chunk.in_flight = false;
            let len = chunk.len;

            self.window.on_ack(index);
            self.failed.remove(&index);
            self.recovering.remove(&index);
            self.acked_count += 1;
            self.stats.record_chunk(len);
            progressed = true;

            if self.throttle.should_emit(sample.received_at) {
                self.emit_progress();
            }
        }

        if progressed {
            self.last_activity = sample.received_at;
            if self.failed.is_empty() && self.recovering.is_empty() {
                self.failed_since = None;
                self.next_failed_retry = None;
            }
        }
    }

    /// 청크 타임아웃, 정체 감지, 실패 청크 재시도 주기 처리
    fn process_timers(&mut self, now: Instant) -> Result<()> {
        let timeout = self.rtt.timeout();

        let expired: Vec<ChunkIndex> = self
            .window
            .in_flight()
            .into_iter()
            .filter(|&index| self.chunks[index as usize].is_expired(now, timeout))
            .collect();

        for index in expired {
            if self.window.on_timeout(now) {
                debug!(
                    "윈도우 축소: transfer={}, window={}, ssthresh={}",
                    self.transfer_id,
                    self.window.size(),
                    self.window.ssthresh()
                );
            }
            self.schedule_retry(index, now);
        }

        // 윈도우 전체 무응답
        let stall = Duration::from_millis(self.config.stall_timeout_ms);
        if self.window.in_flight_count() > 0
            && now.saturating_duration_since(self.last_activity) >= stall
        {
            let stalled: Vec<ChunkIndex> = self
                .window
                .in_flight()
                .into_iter()
                .filter(|&index| self.chunks[index as usize].sent_at.is_some())
                .collect();
            warn!(
                "송신 정체: transfer={}, {}개 청크 강제 재전송",
                self.transfer_id,
                stalled.len()
            );
            for index in stalled {
                self.schedule_retry(index, now);
            }
            self.last_activity = now;
        }

        if let Some(due) = self.next_failed_retry {
            if now >= due && !self.failed.is_empty() {
                info!(
                    "실패 청크 재시도: transfer={}, {}개",
                    self.transfer_id,
                    self.failed.len()
                );
                for index in std::mem::take(&mut self.failed) {
                    self.chunks[index as usize].retries = 0;
                    self.recovering.insert(index);
                    self.recovered_queue.push_back(index);
                }
                self.next_failed_retry = None;
            }
        }

        if let Some(since) = self.failed_since {
            let deadline = Duration::from_millis(self.config.failed_chunk_deadline_ms);
            if now.saturating_duration_since(since) >= deadline {
                return Err(Error::RetryExhausted {
                    transfer_id: self.transfer_id.clone(),
                    failed_chunks: self.failed.len() + self.recovering.len(),
                });
            }
        }

        Ok(())
    }

    /// 재전송 예약, 한도를 넘으면 실패 집합으로 이동
    fn schedule_retry(&mut self, index: ChunkIndex, now: Instant) {
        let chunk = &mut self.chunks[index as usize];
        // 재전송 전까지 타이머 정지
        chunk.sent_at = None;

        if chunk.retries < self.config.max_retries {
            chunk.retries += 1;
            self.retransmit.push_back(index);
            return;
        }

        chunk.in_flight = false;
        self.window.release(index);
        self.recovering.remove(&index);
        self.failed.insert(index);
        self.failed_since.get_or_insert(now);
        self.next_failed_retry
            .get_or_insert(now + Duration::from_millis(self.config.failed_retry_interval_ms));

        warn!(
            "청크 재시도 한도 초과: transfer={}, chunk={}, 실패 {}개",
            self.transfer_id,
            index,
            self.failed.len()
        );
    }

    fn next_candidate(&mut self) -> Option<(ChunkIndex, Candidate)> {
        while let Some(&index) = self.retransmit.front() {
            if !self.chunks[index as usize].acked {
                return Some((index, Candidate::Retransmit));
            }
            self.retransmit.pop_front();
        }

        if !self.window.can_send() {
            return None;
        }

        while let Some(&index) = self.recovered_queue.front() {
            if !self.chunks[index as usize].acked {
                return Some((index, Candidate::Recovered));
            }
            self.recovered_queue.pop_front();
        }

        while self.next_index < self.layout.total_chunks {
            if !self.chunks[self.next_index as usize].acked {
                return Some((self.next_index, Candidate::Fresh));
            }
            self.next_index += 1;
        }
        None
    }

    /// 윈도우와 백프레셔가 허용하는 만큼 송출
    async fn dispatch(&mut self) -> Result<()> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            let Some((index, candidate)) = self.next_candidate() else {
                return Ok(());
            };

            let was_blocked = self.backpressure.is_blocked();
            if !self.backpressure.check(self.channel.buffered_amount()) {
                if !was_blocked {
                    debug!(
                        "백프레셔 대기: transfer={}, buffered={}",
                        self.transfer_id,
                        self.channel.buffered_amount()
                    );
                }
                return Ok(());
            }

            match candidate {
                Candidate::Retransmit => {
                    self.retransmit.pop_front();
                }
                Candidate::Recovered => {
                    self.recovered_queue.pop_front();
                }
                Candidate::Fresh => self.next_index += 1,
            }

            self.send_chunk(index, candidate != Candidate::Fresh).await?;
        }
    }

    async fn send_chunk(&mut self, index: ChunkIndex, is_retry: bool) -> Result<()> {
        let Some(range) = self.layout.range(index) else {
            return Ok(());
        };
        let offset = range.start;
        let len = (range.end - range.start) as usize;

        let source = Arc::clone(&self.source);
        let payload =
            tokio::task::spawn_blocking(move || source.read_chunk(offset, len)).await??;

        let checksum = self
            .config
            .chunk_checksums
            .then(|| chunk_checksum(&payload));
        let frame = encode_chunk(&self.transfer_id, index, checksum.as_deref(), &payload);

        if !self.window.on_send(index) {
            debug!(
                "윈도우 가득, 송신 보류: transfer={}, chunk={}",
                self.transfer_id, index
            );
            self.recovered_queue.push_front(index);
            return Ok(());
        }

        self.chunks[index as usize].mark_sent(Instant::now());
        self.stats.chunks_sent += 1;
        if is_retry {
            self.stats.retransmitted_chunks += 1;
        }

        if self.channel.send(frame) {
            self.send_failures = 0;
        } else {
            // 타이머가 걸려 있으므로 타임아웃 경로로 재전송됨
            self.send_failures += 1;
            warn!(
                "청크 송신 거부: transfer={}, chunk={}, 연속 {}회",
                self.transfer_id, index, self.send_failures
            );
            if self.send_failures > self.config.max_retries {
                return Err(Error::ChannelSendFailed);
            }
        }
        Ok(())
    }

    async fn send_completion_signals(&mut self) {
        let end_of_stream = encode_end_of_stream(&self.transfer_id, self.layout.total_chunks);
        let assemble = ControlMessage::AssembleRequest {
            transfer_id: self.transfer_id.clone(),
            file_name: self.meta.file_name.clone(),
            mime_type: self.meta.mime_type.clone(),
        }
        .to_bytes();

        let interval = Duration::from_millis(self.config.completion_signal_interval_ms);
        for round in 0..self.config.completion_signal_repeats.max(1) {
            if round > 0 {
                tokio::time::sleep(interval).await;
            }
            if !self.channel.send(end_of_stream.clone()) {
                warn!("종료 신호 송신 실패: transfer={}", self.transfer_id);
            }
            match &assemble {
                Ok(bytes) => {
                    if !self.channel.send(bytes.clone()) {
                        warn!("조립 요청 송신 실패: transfer={}", self.transfer_id);
                    }
                }
                Err(e) => warn!("조립 요청 직렬화 실패: {}", e),
            }
        }
    }

    fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        if self.channel.send(msg.to_bytes()?) {
            Ok(())
        } else {
            Err(Error::ChannelSendFailed)
        }
    }

    fn emit_progress(&self) {
        emit(
            &self.events,
            TransferEvent::Progress(Progress {
                transfer_id: self.transfer_id.clone(),
                direction: Direction::Send,
                bytes: self.stats.bytes_done,
                total_bytes: self.layout.total_size,
                speed: self.stats.current_speed(),
                eta: self.stats.eta(),
                chunks_done: self.acked_count,
                total_chunks: self.layout.total_chunks,
                window_size: Some(self.window.size()),
            }),
        );
    }

    fn fail(&mut self, error: Error) {
        let reason = error.failure_reason();
        warn!(
            "송신 실패: transfer={}, reason={}, {}",
            self.transfer_id, reason, error
        );

        self.cancelled.store(true, Ordering::SeqCst);
        if let Err(e) = self.state.transition(TransferState::Failed) {
            debug!("실패 전이 무시: {}", e);
        }

        // 상대가 스테이징 데이터를 정리하도록 알림
        let cancel = ControlMessage::Cancel {
            transfer_id: self.transfer_id.clone(),
            reason: Some(error.to_string()),
        };
        if let Err(e) = self.send_control(&cancel) {
            debug!("실패 알림 송신 실패: {}", e);
        }

        emit(
            &self.events,
            TransferEvent::failed(&self.transfer_id, Direction::Send, &error),
        );
    }
}

/// 송신 엔진
///
/// 전송 레지스트리를 소유하며 명령을 전송별 태스크로 전달함
pub struct SenderEngine<C: DataChannel> {
    config: Config,
    channel: Arc<C>,
    events: EventSender,
    registry: Arc<TransferRegistry<SenderHandle>>,
}

impl<C: DataChannel> SenderEngine<C> {
    pub fn new(config: Config, channel: Arc<C>, events: EventSender) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            channel,
            events,
            registry: TransferRegistry::new(),
        })
    }

    /// 전송 시작
    ///
    /// `chunk_size` 가 없으면 설정값 사용. Tokio 런타임 안에서 호출해야 함
    pub fn start_transfer(
        &self,
        source: Arc<dyn ChunkSource>,
        transfer_id: &str,
        chunk_size: Option<usize>,
        meta: TransferMeta,
    ) -> Result<()> {
        if transfer_id.is_empty() || transfer_id.len() > MAX_TRANSFER_ID_LEN {
            return Err(Error::InvalidConfig(format!(
                "전송 ID 길이 오류: {} bytes",
                transfer_id.len()
            )));
        }

        let chunk_size = chunk_size.unwrap_or(self.config.chunk_size);
        if u32::try_from(chunk_size).is_err() {
            return Err(Error::InvalidConfig(format!("청크 크기 초과: {}", chunk_size)));
        }
        let layout = ChunkLayout::new(source.len(), chunk_size)?;

        let checksum_len = if self.config.chunk_checksums {
            CHUNK_CHECKSUM_LEN
        } else {
            0
        };
        let frame_size = chunk_size + frame_overhead(transfer_id.len(), checksum_len);
        let max_message_size = self.channel.max_message_size();
        if frame_size > max_message_size {
            return Err(Error::ChunkTooLarge {
                chunk_size,
                frame_size,
                max_message_size,
            });
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = StateCell::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.registry.insert(
            transfer_id,
            state.clone(),
            SenderHandle {
                cmd_tx,
                state: state.clone(),
                cancelled: Arc::clone(&cancelled),
            },
        )?;

        let chunks = layout
            .chunks()
            .map(|(index, range)| SendChunk::new(index, (range.end - range.start) as usize))
            .collect();

        let task = SenderTask {
            transfer_id: transfer_id.to_string(),
            config: self.config.clone(),
            channel: Arc::clone(&self.channel),
            events: self.events.clone(),
            registry: Arc::clone(&self.registry),
            state,
            cancelled,
            cmd_rx,
            source,
            meta,
            chunks,
            next_index: 0,
            acked_count: 0,
            retransmit: VecDeque::new(),
            failed: BTreeSet::new(),
            recovering: BTreeSet::new(),
            recovered_queue: VecDeque::new(),
            failed_since: None,
            next_failed_retry: None,
            window: CongestionWindow::new(&self.config),
            rtt: RttEstimator::new(&self.config),
            backpressure: BackpressureMonitor::new(&self.config),
            stats: TransferStats::new(layout.total_size, layout.total_chunks),
            throttle: ProgressThrottle::new(
                Duration::from_millis(self.config.progress_interval_ms),
                self.config.progress_chunk_interval,
            ),
            layout,
            last_activity: Instant::now(),
            send_failures: 0,
            paused: false,
        };

        tokio::spawn(task.run());
        Ok(())
    }

    /// 일시정지
    pub fn pause_transfer(&self, transfer_id: &str) -> Result<()> {
        self.request(transfer_id, TransferState::Paused, SenderCmd::Pause)
    }

    /// 재개
    pub fn resume_transfer(&self, transfer_id: &str) -> Result<()> {
        self.request(transfer_id, TransferState::Transferring, SenderCmd::Resume)
    }

    /// 로컬 취소 (상대에게도 알림)
    pub fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        self.cancel(transfer_id, true, None)
    }

    /// 상대가 보낸 취소
    pub(crate) fn peer_cancelled(&self, transfer_id: &str, reason: Option<String>) -> Result<()> {
        self.cancel(transfer_id, false, reason)
    }

    fn cancel(&self, transfer_id: &str, notify_peer: bool, reason: Option<String>) -> Result<()> {
        let handle = self.handle(transfer_id)?;
        let current = handle.state.get();
        if current.is_terminal() {
            return Err(Error::InvalidTransition {
                from: current,
                to: TransferState::Cancelled,
            });
        }

        handle.cancelled.store(true, Ordering::SeqCst);
        handle
            .cmd_tx
            .send(SenderCmd::Cancel {
                notify_peer,
                reason,
            })
            .map_err(|_| Error::ChannelError)
    }

    /// 단일 ACK 수신
    pub fn ack_received(&self, transfer_id: &str, chunk_index: ChunkIndex) -> Result<()> {
        self.deliver_ack(transfer_id, AckSample::new(vec![chunk_index]))
    }

    /// 일괄 ACK 수신
    pub fn batch_ack_received(&self, transfer_id: &str, indices: Vec<ChunkIndex>) -> Result<()> {
        self.deliver_ack(transfer_id, AckSample::new(indices))
    }

    pub(crate) fn deliver_ack(&self, transfer_id: &str, sample: AckSample) -> Result<()> {
        let handle = self.handle(transfer_id)?;
        if handle.state.is_terminal() {
            // 종료 후 늦게 도착한 ACK
            return Ok(());
        }
        handle
            .cmd_tx
            .send(SenderCmd::Ack(sample))
            .map_err(|_| Error::ChannelError)
    }

    /// 전송 상태 조회
    pub fn state(&self, transfer_id: &str) -> Option<TransferState> {
        self.registry.state(transfer_id)
    }

    /// 레지스트리에 남아 있는 전송 수
    pub fn transfer_count(&self) -> usize {
        self.registry.len()
    }

    fn request(&self, transfer_id: &str, next: TransferState, cmd: SenderCmd) -> Result<()> {
        let handle = self.handle(transfer_id)?;
        let current = handle.state.get();
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: current,
                to: next,
            });
        }
        handle.cmd_tx.send(cmd).map_err(|_| Error::ChannelError)
    }

    fn handle(&self, transfer_id: &str) -> Result<SenderHandle> {
        self.registry
            .get(transfer_id)
            .ok_or_else(|| Error::UnknownTransfer {
                transfer_id: transfer_id.to_string(),
            })
    }
}

impl<C: DataChannel> Drop for SenderEngine<C> {
    fn drop(&mut self) {
        // 명령 채널이 닫혀 남은 송신 태스크가 취소로 정리됨
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::chunk::MemorySource;
    use crate::codec::{decode, Packet};
    use crate::transfer::EventReceiver;
    use bytes::Bytes;

    type Frames = mpsc::UnboundedReceiver<Bytes>;

    fn config() -> Config {
        Config {
            chunk_size: 100,
            base_timeout_ms: 5_000,
            stall_timeout_ms: 60_000,
            tick_interval_ms: 5,
            completion_signal_repeats: 2,
            completion_signal_interval_ms: 5,
            ..Config::default()
        }
    }

    fn setup(config: Config) -> (SenderEngine<LoopbackChannel>, Arc<LoopbackChannel>, Frames, EventReceiver) {
        let (channel, frames) = LoopbackChannel::new(64 * 1024);
        let (events_tx, events) = mpsc::unbounded_channel();
        let engine = SenderEngine::new(config, Arc::clone(&channel), events_tx).unwrap();
        (engine, channel, frames, events)
    }

    async fn next_packet(frames: &mut Frames) -> Packet {
        let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("frame timeout")
            .expect("channel closed");
        decode(frame).unwrap()
    }

    async fn next_chunk_index(frames: &mut Frames) -> ChunkIndex {
        loop {
            if let Packet::Chunk(chunk) = next_packet(frames).await {
                return chunk.chunk_index;
            }
        }
    }

    async fn wait_terminal(events: &mut EventReceiver) -> TransferEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("event timeout")
                .expect("events closed");
            if event.is_terminal() {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_offer_then_initial_window() {
        let (engine, _channel, mut frames, _events) = setup(config());
        let source = Arc::new(MemorySource::new(vec![7u8; 1000]));
        engine
            .start_transfer(source, "t", None, TransferMeta::new("a.bin", "application/octet-stream"))
            .unwrap();

        match next_packet(&mut frames).await {
            Packet::Control(body) => match ControlMessage::from_body(&body).unwrap() {
                ControlMessage::Offer(offer) => {
                    assert_eq!(offer.total_chunks, 10);
                    assert_eq!(offer.file_checksum, Some(crate::checksum::file_checksum(&[7u8; 1000])));
                }
                other => panic!("unexpected message: {:?}", other),
            },
            other => panic!("unexpected packet: {:?}", other),
        }

        // 초기 윈도우 4개만 송출
        let mut sent = Vec::new();
        for _ in 0..4 {
            sent.push(next_chunk_index(&mut frames).await);
        }
        assert_eq!(sent, vec![0, 1, 2, 3]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(frames.try_recv().is_err());
        assert_eq!(engine.state("t"), Some(TransferState::Transferring));
    }

    #[tokio::test]
    async fn test_completes_with_out_of_order_acks() {
        let (engine, _channel, mut frames, mut events) = setup(config());
        let source = Arc::new(MemorySource::new(vec![1u8; 450]));
        engine
            .start_transfer(source, "t", None, TransferMeta::default())
            .unwrap();

        let mut acked = 0;
        while acked < 5 {
            let index = next_chunk_index(&mut frames).await;
            // 역순 일괄 ACK 와 단일 ACK 혼합
            if index % 2 == 0 {
                engine.ack_received("t", index).unwrap();
            } else {
                engine.batch_ack_received("t", vec![index, index]).unwrap();
            }
            acked += 1;
        }

        match wait_terminal(&mut events).await {
            TransferEvent::Complete(done) => {
                assert_eq!(done.total_bytes, 450);
                assert_eq!(done.direction, Direction::Send);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(engine.state("t"), Some(TransferState::Complete));

        // 완료 신호 중복 전송
        let mut end_of_stream = 0;
        while let Ok(frame) = frames.try_recv() {
            if let Packet::EndOfStream { total_chunks, .. } = decode(frame).unwrap() {
                assert_eq!(total_chunks, 5);
                end_of_stream += 1;
            }
        }
        assert_eq!(end_of_stream, 2);
    }

    #[tokio::test]
    async fn test_retransmits_after_timeout() {
        let (engine, _channel, mut frames, _events) = setup(Config {
            base_timeout_ms: 30,
            ..config()
        });
        let source = Arc::new(MemorySource::new(vec![0u8; 100]));
        engine
            .start_transfer(source, "t", None, TransferMeta::default())
            .unwrap();

        assert_eq!(next_chunk_index(&mut frames).await, 0);
        // ACK 없이 타임아웃 후 같은 청크 재전송
        assert_eq!(next_chunk_index(&mut frames).await, 0);
        engine.ack_received("t", 0).unwrap();
    }

    #[tokio::test]
    async fn test_fails_when_failed_chunks_never_drain() {
        let (engine, _channel, mut frames, mut events) = setup(Config {
            base_timeout_ms: 10,
            max_retries: 1,
            failed_retry_interval_ms: 20,
            failed_chunk_deadline_ms: 150,
            ..config()
        });
        let source = Arc::new(MemorySource::new(vec![0u8; 100]));
        engine
            .start_transfer(source, "t", None, TransferMeta::default())
            .unwrap();

        match wait_terminal(&mut events).await {
            TransferEvent::Error { reason, .. } => {
                assert_eq!(reason, crate::transfer::FailureReason::NetworkExhausted)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(engine.state("t"), Some(TransferState::Failed));

        // 실패 집합 재시도로 여러 번 재전송됨
        let mut sends = 0;
        while let Ok(frame) = frames.try_recv() {
            if matches!(decode(frame).unwrap(), Packet::Chunk(_)) {
                sends += 1;
            }
        }
        assert!(sends >= 3, "sends = {}", sends);
    }

    #[tokio::test]
    async fn test_pause_suspends_dispatch() {
        let (engine, _channel, mut frames, mut events) = setup(config());
        let source = Arc::new(MemorySource::new(vec![0u8; 1000]));
        engine
            .start_transfer(source, "t", None, TransferMeta::default())
            .unwrap();

        for _ in 0..4 {
            next_chunk_index(&mut frames).await;
        }
        engine.pause_transfer("t").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.state("t"), Some(TransferState::Paused));
        assert!(engine.pause_transfer("t").is_err());

        // 일시정지 중 ACK 는 처리되지만 새 청크는 나가지 않음
        engine.batch_ack_received("t", vec![0, 1, 2, 3]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(frames.try_recv().is_err());

        engine.resume_transfer("t").unwrap();
        assert_eq!(next_chunk_index(&mut frames).await, 4);

        engine.cancel_transfer("t").unwrap();
        assert!(matches!(
            wait_terminal(&mut events).await,
            TransferEvent::Cancelled { by_peer: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_all_acked_while_paused_completes_on_resume() {
        let (engine, _channel, mut frames, mut events) = setup(config());
        let source = Arc::new(MemorySource::new(vec![3u8; 100]));
        engine
            .start_transfer(source, "t", None, TransferMeta::default())
            .unwrap();

        assert_eq!(next_chunk_index(&mut frames).await, 0);
        engine.pause_transfer("t").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.state("t"), Some(TransferState::Paused));

        // 마지막 ACK 이 일시정지 중 도착
        engine.ack_received("t", 0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.state("t"), Some(TransferState::Paused));
        while let Ok(event) = events.try_recv() {
            assert!(!event.is_terminal(), "terminal while paused: {:?}", event);
        }

        engine.resume_transfer("t").unwrap();
        assert!(matches!(
            wait_terminal(&mut events).await,
            TransferEvent::Complete(Completion { total_bytes: 100, .. })
        ));
        assert_eq!(engine.state("t"), Some(TransferState::Complete));
        assert!(engine.cancel_transfer("t").is_err());
    }

    #[tokio::test]
    async fn test_dropping_engine_cancels_running_transfer() {
        let (engine, _channel, mut frames, mut events) = setup(config());
        let source = Arc::new(MemorySource::new(vec![1u8; 300]));
        engine
            .start_transfer(source, "t", None, TransferMeta::default())
            .unwrap();
        assert_eq!(next_chunk_index(&mut frames).await, 0);

        drop(engine);
        assert!(matches!(
            wait_terminal(&mut events).await,
            TransferEvent::Cancelled { by_peer: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_rejects_oversized_chunk_and_duplicate_id() {
        let (channel, _frames) = LoopbackChannel::new(512);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let engine = SenderEngine::new(config(), channel, events_tx).unwrap();

        let source: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(vec![0u8; 1000]));
        assert!(matches!(
            engine.start_transfer(Arc::clone(&source), "t", Some(4096), TransferMeta::default()),
            Err(Error::ChunkTooLarge { .. })
        ));

        engine
            .start_transfer(Arc::clone(&source), "t", Some(64), TransferMeta::default())
            .unwrap();
        assert!(matches!(
            engine.start_transfer(source, "t", Some(64), TransferMeta::default()),
            Err(Error::DuplicateTransfer { .. })
        ));
        assert!(matches!(
            engine.ack_received("nope", 0),
            Err(Error::UnknownTransfer { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_source_completes_immediately() {
        let (engine, _channel, _frames, mut events) = setup(config());
        engine
            .start_transfer(Arc::new(MemorySource::new(Vec::new())), "t", None, TransferMeta::default())
            .unwrap();

        assert!(matches!(
            wait_terminal(&mut events).await,
            TransferEvent::Complete(Completion { total_bytes: 0, .. })
        ));
    }
}
