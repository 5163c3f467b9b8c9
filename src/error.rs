//! 에러 타입 정의

use thiserror::Error;

use crate::codec::DecodeError;
use crate::transfer::{FailureReason, TransferState};

/// DCFT 전송 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("패킷 디코딩 실패: {0}")]
    Decode(#[from] DecodeError),

    #[error("백그라운드 작업 실패: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("알 수 없는 전송: transfer_id={transfer_id}")]
    UnknownTransfer { transfer_id: String },

    #[error("이미 진행 중인 전송: transfer_id={transfer_id}")]
    DuplicateTransfer { transfer_id: String },

    #[error("잘못된 상태 전이: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("청크 크기 초과: chunk_size={chunk_size}, 프레임 {frame_size} bytes > 채널 최대 {max_message_size} bytes")]
    ChunkTooLarge {
        chunk_size: usize,
        frame_size: usize,
        max_message_size: usize,
    },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("수신 제안 거부: transfer_id={transfer_id}, {reason}")]
    OfferRejected { transfer_id: String, reason: String },

    #[error("재시도 한도 초과: transfer_id={transfer_id}, 실패 청크 {failed_chunks}개")]
    RetryExhausted {
        transfer_id: String,
        failed_chunks: usize,
    },

    #[error("파일 크기 불일치: expected {expected} bytes, got {got} bytes")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("무결성 검사 실패: expected {expected}, got {got}")]
    IntegrityCheckFailed { expected: String, got: String },

    #[error("전송 미완료: {missing}개 청크 누락")]
    Incomplete { missing: u32 },

    #[error("스테이징 저장소 에러: {0}")]
    Storage(String),

    #[error("채널 송신 실패")]
    ChannelSendFailed,

    #[error("채널 에러")]
    ChannelError,

    #[error("전송 취소됨")]
    Cancelled,
}

impl Error {
    /// 종료 사유 분류
    ///
    /// 네트워크 소진(재시도)과 무결성 실패(파일 재선택)는 사용자 조치가 다르므로
    /// 반드시 구분되어야 함
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Error::RetryExhausted { .. } => FailureReason::NetworkExhausted,
            Error::SizeMismatch { .. } | Error::IntegrityCheckFailed { .. } => {
                FailureReason::Integrity
            }
            Error::Io(_) | Error::Storage(_) | Error::Join(_) => FailureReason::Storage,
            Error::ChannelSendFailed | Error::ChannelError => FailureReason::Channel,
            _ => FailureReason::Protocol,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_distinguishes_network_and_integrity() {
        let network = Error::RetryExhausted {
            transfer_id: "t".into(),
            failed_chunks: 2,
        };
        let integrity = Error::IntegrityCheckFailed {
            expected: "aa".into(),
            got: "bb".into(),
        };

        assert_eq!(network.failure_reason(), FailureReason::NetworkExhausted);
        assert_eq!(integrity.failure_reason(), FailureReason::Integrity);
        assert_eq!(
            Error::SizeMismatch { expected: 1, got: 2 }.failure_reason(),
            FailureReason::Integrity
        );
        assert_eq!(Error::ChannelSendFailed.failure_reason(), FailureReason::Channel);
    }
}
