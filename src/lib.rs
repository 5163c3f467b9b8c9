//! # DCFT (DataChannel File Transfer)
//!
//! 순서 보장 메시지 채널 위의 P2P 신뢰성 파일 전송 엔진
//!
//! ## 핵심 특징
//! - **청크 ACK**: 수신 청크마다 (또는 일괄) ACK, 타임아웃 기반 재전송
//! - **AIMD 혼잡제어**: slow-start / 혼잡 회피, 연속 타임아웃 시 윈도우 절반
//! - **RTT 적응 타임아웃**: 이동 평균 RTT 기반
//! - **백프레셔**: 채널 버퍼 워터마크 히스테리시스
//! - **무결성**: 샘플링 CRC32 청크 검사 + 전체 SHA-256 검사
//! - **스테이징**: 대용량 수신 청크는 외부 저장소에 보관, 제한 크기 단위로 조립

pub mod ack;
pub mod backpressure;
pub mod channel;
pub mod checksum;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod congestion;
pub mod engine;
pub mod error;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod store;
pub mod transfer;

pub use ack::{AckEmitter, AckMode, AckSample};
pub use channel::{DataChannel, LoopbackChannel};
pub use chunk::{ChunkIndex, ChunkLayout, ChunkSource, FileSource, MemorySource};
pub use config::Config;
pub use engine::TransferEngine;
pub use error::{Error, Result};
pub use message::{ControlMessage, TransferOffer};
pub use receiver::{ChunkOutcome, ReceiveSnapshot, ReceiverEngine};
pub use sender::{SenderEngine, TransferMeta};
pub use stats::TransferStats;
pub use store::{ChunkStore, DiskStore, MemoryStore};
pub use transfer::{
    AssembledData, AssembledFile, Completion, Direction, EventReceiver, EventSender,
    FailureReason, Progress, TransferEvent, TransferState,
};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024; // 16KB
