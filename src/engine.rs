//! 전송 엔진 (송신 + 수신)
//!
//! 하나의 데이터 채널에 묶인 송신/수신 엔진을 함께 소유하고
//! 채널로 들어온 메시지를 패킷 종류에 따라 분배함

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ack::AckSample;
use crate::channel::DataChannel;
use crate::chunk::{ChunkSource, FileSource, MemorySource};
use crate::codec::{decode, Packet};
use crate::message::ControlMessage;
use crate::receiver::ReceiverEngine;
use crate::sender::{SenderEngine, TransferMeta};
use crate::store::ChunkStore;
use crate::transfer::{EventSender, TransferState};
use crate::{Config, Result};

/// 채널 하나에 대한 전송 엔진
pub struct TransferEngine<C: DataChannel> {
    peer_id: String,
    sender: SenderEngine<C>,
    receiver: ReceiverEngine<C>,
}

impl<C: DataChannel> TransferEngine<C> {
    /// 엔진 생성
    ///
    /// `peer_id` 는 이 채널 건너편 상대의 식별자로, 수신 청크의 출처 검사에 쓰임
    pub fn new(
        config: Config,
        channel: Arc<C>,
        peer_id: impl Into<String>,
        events: EventSender,
    ) -> Result<Self> {
        let receiver = ReceiverEngine::new(config.clone(), Arc::clone(&channel), events.clone())?;
        Self::assemble_parts(config, channel, peer_id.into(), events, receiver)
    }

    /// 스테이징 저장소 지정
    pub fn with_store(
        config: Config,
        channel: Arc<C>,
        peer_id: impl Into<String>,
        events: EventSender,
        store: Arc<dyn ChunkStore>,
    ) -> Result<Self> {
        let receiver =
            ReceiverEngine::with_store(config.clone(), Arc::clone(&channel), events.clone(), store)?;
        Self::assemble_parts(config, channel, peer_id.into(), events, receiver)
    }

    fn assemble_parts(
        config: Config,
        channel: Arc<C>,
        peer_id: String,
        events: EventSender,
        receiver: ReceiverEngine<C>,
    ) -> Result<Self> {
        Ok(Self {
            peer_id,
            sender: SenderEngine::new(config, channel, events)?,
            receiver,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn sender(&self) -> &SenderEngine<C> {
        &self.sender
    }

    pub fn receiver(&self) -> &ReceiverEngine<C> {
        &self.receiver
    }

    /// 전송 시작
    pub fn start_transfer(
        &self,
        source: Arc<dyn ChunkSource>,
        transfer_id: &str,
        chunk_size: Option<usize>,
        meta: TransferMeta,
    ) -> Result<()> {
        self.sender
            .start_transfer(source, transfer_id, chunk_size, meta)
    }

    /// 메모리 데이터 전송
    pub fn send_bytes(&self, data: impl Into<Bytes>, transfer_id: &str, meta: TransferMeta) -> Result<()> {
        self.start_transfer(Arc::new(MemorySource::new(data)), transfer_id, None, meta)
    }

    /// 파일 전송 (파일 이름을 메타데이터로 사용)
    pub fn send_file(&self, path: impl AsRef<Path>, transfer_id: &str, mime_type: &str) -> Result<()> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = FileSource::open(path)?;
        self.start_transfer(
            Arc::new(source),
            transfer_id,
            None,
            TransferMeta::new(file_name, mime_type),
        )
    }

    pub fn pause_transfer(&self, transfer_id: &str) -> Result<()> {
        self.sender.pause_transfer(transfer_id)
    }

    pub fn resume_transfer(&self, transfer_id: &str) -> Result<()> {
        self.sender.resume_transfer(transfer_id)
    }

    /// 송신/수신 어느 쪽이든 로컬 취소
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        if self.sender.state(transfer_id).is_some() {
            return self.sender.cancel_transfer(transfer_id);
        }
        self.receiver.cancel_transfer(transfer_id).await
    }

    /// 전송 상태 조회 (송신 우선)
    pub fn state(&self, transfer_id: &str) -> Option<TransferState> {
        self.sender
            .state(transfer_id)
            .or_else(|| self.receiver.state(transfer_id))
    }

    /// 채널로 들어온 메시지 처리
    ///
    /// 잘못된 패킷과 처리 실패는 로그만 남기고 버림
    pub async fn handle_message(&self, bytes: Bytes) {
        let packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("잘못된 패킷 무시: {}", e);
                return;
            }
        };

        let result = match packet {
            Packet::Chunk(chunk) => self
                .receiver
                .chunk_received(
                    &chunk.transfer_id,
                    chunk.chunk_index,
                    chunk.payload,
                    chunk.checksum.as_deref(),
                    &self.peer_id,
                )
                .await
                .map(|_| ()),
            Packet::EndOfStream {
                transfer_id,
                total_chunks,
            } => self.receiver.end_of_stream(&transfer_id, total_chunks).await,
            Packet::Control(body) => match ControlMessage::from_body(&body) {
                Ok(msg) => self.handle_control(msg).await,
                Err(e) => Err(e),
            },
        };

        if let Err(e) = result {
            debug!("메시지 처리 실패: {}", e);
        }
    }

    async fn handle_control(&self, msg: ControlMessage) -> Result<()> {
        trace!("컨트롤 수신: {} transfer={}", msg.kind(), msg.transfer_id());

        if let Some((transfer_id, sample)) = AckSample::from_message(&msg) {
            return self.sender.deliver_ack(transfer_id, sample);
        }

        match msg {
            ControlMessage::Offer(offer) => self.receiver.init_transfer(offer, &self.peer_id),
            ControlMessage::AssembleRequest {
                transfer_id,
                file_name,
                mime_type,
            } => {
                self.receiver
                    .assemble(&transfer_id, &mime_type, &file_name)
                    .await
            }
            ControlMessage::Cancel {
                transfer_id,
                reason,
            } => {
                let live = |state: Option<TransferState>| state.is_some_and(|s| !s.is_terminal());
                let mut handled = false;

                if live(self.sender.state(&transfer_id)) {
                    self.sender.peer_cancelled(&transfer_id, reason.clone())?;
                    handled = true;
                }
                if live(self.receiver.state(&transfer_id)) {
                    self.receiver.peer_cancelled(&transfer_id, reason).await?;
                    handled = true;
                }
                if !handled {
                    debug!("취소 대상 전송 없음: transfer={}", transfer_id);
                }
                Ok(())
            }
            ControlMessage::Ack { .. } | ControlMessage::BatchAck { .. } => Ok(()),
        }
    }
}

impl<C: DataChannel> TransferEngine<C> {
    /// 수신 프레임을 엔진으로 전달하는 태스크
    ///
    /// 프레임 송신측이 닫히면 종료됨
    pub fn spawn_pump(self: &Arc<Self>, mut frames: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                engine.handle_message(frame).await;
            }
            debug!("수신 펌프 종료: peer={}", engine.peer_id);
        })
    }
}
