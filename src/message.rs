//! 컨트롤 메시지 정의
//!
//! 데이터 청크 이외의 모든 메시지는 하나의 enum으로 표현되고
//! `[PacketType::Control][version][bincode payload]` 형태로 전송됨

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkIndex, ChunkLayout};
use crate::codec::encode_control;
use crate::{Error, Result, PROTOCOL_VERSION};

/// 전송 알림 (송신자 → 수신자)
///
/// 수신자는 이 메시지로 청크 저장소를 할당함
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub transfer_id: String,

    /// 전체 파일 크기 (바이트)
    pub total_size: u64,

    /// 청크 크기
    pub chunk_size: u32,

    /// 총 청크 수
    pub total_chunks: u32,

    /// 원본 SHA-256 (hex), 없으면 최종 무결성 검사 생략
    pub file_checksum: Option<String>,

    pub file_name: String,

    pub mime_type: String,
}

impl TransferOffer {
    /// 선언값으로 청크 경계 계산, 선언된 청크 수와 다르면 거부
    pub fn layout(&self) -> Result<ChunkLayout> {
        let layout = ChunkLayout::new(self.total_size, self.chunk_size as usize)?;
        if layout.total_chunks != self.total_chunks {
            return Err(Error::InvalidConfig(format!(
                "청크 수 불일치: 선언 {}, 계산 {}",
                self.total_chunks, layout.total_chunks
            )));
        }
        Ok(layout)
    }
}

/// 컨트롤 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// 전송 시작 알림
    Offer(TransferOffer),

    /// 단일 청크 ACK
    Ack {
        transfer_id: String,
        chunk_index: ChunkIndex,
    },

    /// 일괄 ACK
    BatchAck {
        transfer_id: String,
        indices: Vec<ChunkIndex>,
    },

    /// 조립 요청 (모든 ACK 수신 후 송신자가 중복 전송)
    AssembleRequest {
        transfer_id: String,
        file_name: String,
        mime_type: String,
    },

    /// 전송 취소
    Cancel {
        transfer_id: String,
        reason: Option<String>,
    },
}

impl ControlMessage {
    /// 대상 전송 ID
    pub fn transfer_id(&self) -> &str {
        match self {
            ControlMessage::Offer(offer) => &offer.transfer_id,
            ControlMessage::Ack { transfer_id, .. }
            | ControlMessage::BatchAck { transfer_id, .. }
            | ControlMessage::AssembleRequest { transfer_id, .. }
            | ControlMessage::Cancel { transfer_id, .. } => transfer_id,
        }
    }

    /// 로그용 메시지 이름
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Offer(_) => "offer",
            ControlMessage::Ack { .. } => "ack",
            ControlMessage::BatchAck { .. } => "batch_ack",
            ControlMessage::AssembleRequest { .. } => "assemble_request",
            ControlMessage::Cancel { .. } => "cancel",
        }
    }

    /// 와이어 프레임으로 직렬화
    pub fn to_bytes(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)?;

        let mut body = BytesMut::with_capacity(1 + payload.len());
        body.put_u8(PROTOCOL_VERSION);
        body.put_slice(&payload);
        Ok(encode_control(&body))
    }

    /// 컨트롤 프레임 본문 (타입 바이트 이후) 역직렬화
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let (&version, payload) = body
            .split_first()
            .ok_or_else(|| Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: 0,
            })?;

        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        Ok(bincode::deserialize(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, Packet};

    fn offer() -> TransferOffer {
        TransferOffer {
            transfer_id: "t-1".into(),
            total_size: 250,
            chunk_size: 100,
            total_chunks: 3,
            file_checksum: Some("ab".repeat(32)),
            file_name: "photo.png".into(),
            mime_type: "image/png".into(),
        }
    }

    #[test]
    fn test_control_frame_through_codec() {
        let msg = ControlMessage::BatchAck {
            transfer_id: "t-1".into(),
            indices: vec![4, 1, 9],
        };

        let body = match decode(msg.to_bytes().unwrap()).unwrap() {
            Packet::Control(body) => body,
            other => panic!("unexpected packet: {:?}", other),
        };

        let restored = ControlMessage::from_body(&body).unwrap();
        assert_eq!(restored, msg);
        assert_eq!(restored.transfer_id(), "t-1");
        assert_eq!(restored.kind(), "batch_ack");
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut bytes = ControlMessage::Offer(offer()).to_bytes().unwrap().to_vec();
        bytes[1] = PROTOCOL_VERSION + 1;

        assert!(matches!(
            ControlMessage::from_body(&bytes[1..]),
            Err(Error::InvalidVersion { .. })
        ));
        assert!(ControlMessage::from_body(&[]).is_err());
    }

    #[test]
    fn test_offer_layout_validation() {
        assert_eq!(offer().layout().unwrap().total_chunks, 3);

        let forged = TransferOffer {
            total_chunks: 7,
            ..offer()
        };
        assert!(forged.layout().is_err());
    }
}
