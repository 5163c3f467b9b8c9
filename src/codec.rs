//! 청크 프레이밍 코덱
//!
//! 와이어 레이아웃 (big-endian):
//!
//! ```text
//! [1 packet_type][2 id_len][id_len transfer_id][4 chunk_index]
//! [4 payload_len][2 checksum_len][checksum_len checksum][payload]
//! ```
//!
//! - `Chunk`: 데이터 청크
//! - `EndOfStream`: 같은 헤더, 페이로드 없음 (chunk_index = 총 청크 수)
//! - `Control`: `[1 packet_type][bincode 컨트롤 메시지]` (message 모듈 참고)
//!
//! 디코딩 실패는 모두 프로토콜 위반이며 호출자는 패킷을 버리고 로그만 남김

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::chunk::ChunkIndex;

/// 고정 헤더 길이 (type + id_len + chunk_index + payload_len + checksum_len)
pub const FIXED_HEADER_LEN: usize = 1 + 2 + 4 + 4 + 2;

/// transfer_id 최대 길이
pub const MAX_TRANSFER_ID_LEN: usize = u16::MAX as usize;

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// 데이터 청크
    Chunk = 1,

    /// 스트림 종료 (페이로드 없음)
    EndOfStream = 2,

    /// 컨트롤 메시지
    Control = 3,
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Chunk),
            2 => Ok(PacketType::EndOfStream),
            3 => Ok(PacketType::Control),
            other => Err(DecodeError::UnknownPacketType(other)),
        }
    }
}

/// 디코딩 에러 (프로토콜 위반, 재시도 대상 아님)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("빈 패킷")]
    Empty,

    #[error("알 수 없는 패킷 타입: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("패킷 길이 부족: {field} 에 {needed} bytes 필요, 남은 {remaining} bytes")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("페이로드 길이 불일치: 선언 {declared} bytes, 실제 {actual} bytes")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    #[error("transfer_id 가 UTF-8 문자열이 아님")]
    InvalidTransferId,

    #[error("체크섬이 UTF-8 문자열이 아님")]
    InvalidChecksum,

    #[error("다른 전송의 패킷: expected {expected}, got {got}")]
    TransferMismatch { expected: String, got: String },

    #[error("청크 인덱스 범위 초과: {index} >= {total}")]
    IndexOutOfRange { index: ChunkIndex, total: u32 },
}

/// 디코딩된 데이터 청크
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPacket {
    pub transfer_id: String,
    pub chunk_index: ChunkIndex,
    pub checksum: Option<String>,
    pub payload: Bytes,
}

impl ChunkPacket {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// 현재 활성 전송과 인덱스 범위 확인
    pub fn check_target(&self, expected_id: &str, total_chunks: u32) -> Result<(), DecodeError> {
        if self.transfer_id != expected_id {
            return Err(DecodeError::TransferMismatch {
                expected: expected_id.to_string(),
                got: self.transfer_id.clone(),
            });
        }
        if self.chunk_index >= total_chunks {
            return Err(DecodeError::IndexOutOfRange {
                index: self.chunk_index,
                total: total_chunks,
            });
        }
        Ok(())
    }
}

/// 디코딩 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Chunk(ChunkPacket),
    EndOfStream {
        transfer_id: String,
        total_chunks: u32,
    },
    /// 컨트롤 메시지 본문 (타입 바이트 제외)
    Control(Bytes),
}

/// 청크 프레임 오버헤드
pub fn frame_overhead(transfer_id_len: usize, checksum_len: usize) -> usize {
    FIXED_HEADER_LEN + transfer_id_len + checksum_len
}

fn put_header(
    buf: &mut BytesMut,
    packet_type: PacketType,
    transfer_id: &str,
    chunk_index: ChunkIndex,
    payload_len: usize,
    checksum: Option<&str>,
) {
    let checksum = checksum.unwrap_or_default();
    debug_assert!(transfer_id.len() <= MAX_TRANSFER_ID_LEN);
    debug_assert!(checksum.len() <= u16::MAX as usize);

    buf.put_u8(packet_type as u8);
    buf.put_u16(transfer_id.len() as u16);
    buf.put_slice(transfer_id.as_bytes());
    buf.put_u32(chunk_index);
    buf.put_u32(payload_len as u32);
    buf.put_u16(checksum.len() as u16);
    buf.put_slice(checksum.as_bytes());
}

/// 데이터 청크 인코딩
pub fn encode_chunk(
    transfer_id: &str,
    chunk_index: ChunkIndex,
    checksum: Option<&str>,
    payload: &[u8],
) -> Bytes {
    let checksum_len = checksum.map_or(0, str::len);
    let mut buf =
        BytesMut::with_capacity(frame_overhead(transfer_id.len(), checksum_len) + payload.len());
    put_header(
        &mut buf,
        PacketType::Chunk,
        transfer_id,
        chunk_index,
        payload.len(),
        checksum,
    );
    buf.put_slice(payload);
    buf.freeze()
}

/// 스트림 종료 패킷 인코딩
pub fn encode_end_of_stream(transfer_id: &str, total_chunks: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame_overhead(transfer_id.len(), 0));
    put_header(
        &mut buf,
        PacketType::EndOfStream,
        transfer_id,
        total_chunks,
        0,
        None,
    );
    buf.freeze()
}

/// 컨트롤 프레임 인코딩
pub fn encode_control(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(PacketType::Control as u8);
    buf.put_slice(body);
    buf.freeze()
}

fn ensure(buf: &Bytes, needed: usize, field: &'static str) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// 패킷 디코딩
pub fn decode(mut buf: Bytes) -> Result<Packet, DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::Empty);
    }

    let packet_type = PacketType::try_from(buf.get_u8())?;
    if packet_type == PacketType::Control {
        return Ok(Packet::Control(buf));
    }

    ensure(&buf, 2, "id_len")?;
    let id_len = buf.get_u16() as usize;
    ensure(&buf, id_len, "transfer_id")?;
    let id_bytes = buf.split_to(id_len);
    let transfer_id = std::str::from_utf8(&id_bytes)
        .map_err(|_| DecodeError::InvalidTransferId)?
        .to_string();

    ensure(&buf, 4 + 4 + 2, "chunk_header")?;
    let chunk_index = buf.get_u32();
    let payload_len = buf.get_u32() as usize;
    let checksum_len = buf.get_u16() as usize;

    ensure(&buf, checksum_len, "checksum")?;
    let checksum_bytes = buf.split_to(checksum_len);
    let checksum = if checksum_len == 0 {
        None
    } else {
        Some(
            std::str::from_utf8(&checksum_bytes)
                .map_err(|_| DecodeError::InvalidChecksum)?
                .to_string(),
        )
    };

    if buf.remaining() != payload_len {
        return Err(DecodeError::PayloadLengthMismatch {
            declared: payload_len,
            actual: buf.remaining(),
        });
    }

    match packet_type {
        PacketType::EndOfStream => Ok(Packet::EndOfStream {
            transfer_id,
            total_chunks: chunk_index,
        }),
        _ => Ok(Packet::Chunk(ChunkPacket {
            transfer_id,
            chunk_index,
            checksum,
            payload: buf,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkLayout;

    #[test]
    fn test_chunk_wire_layout() {
        let bytes = encode_chunk("ab", 7, Some("cafebabe"), &[9, 9, 9]);

        assert_eq!(bytes[0], PacketType::Chunk as u8);
        assert_eq!(&bytes[1..3], &[0, 2]);
        assert_eq!(&bytes[3..5], b"ab");
        assert_eq!(&bytes[5..9], &[0, 0, 0, 7]);
        assert_eq!(&bytes[9..13], &[0, 0, 0, 3]);
        assert_eq!(&bytes[13..15], &[0, 8]);
        assert_eq!(&bytes[15..23], b"cafebabe");
        assert_eq!(&bytes[23..], &[9, 9, 9]);
        assert_eq!(bytes.len(), frame_overhead(2, 8) + 3);
    }

    #[test]
    fn test_chunk_decode() {
        let bytes = encode_chunk("transfer-1", 3, Some("0011aabb"), b"hello");

        match decode(bytes).unwrap() {
            Packet::Chunk(packet) => {
                assert_eq!(packet.transfer_id, "transfer-1");
                assert_eq!(packet.chunk_index, 3);
                assert_eq!(packet.checksum.as_deref(), Some("0011aabb"));
                assert_eq!(packet.payload.as_ref(), b"hello");
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_end_of_stream_has_no_payload() {
        let bytes = encode_end_of_stream("t", 42);
        assert_eq!(bytes.len(), frame_overhead(1, 0));

        assert_eq!(
            decode(bytes).unwrap(),
            Packet::EndOfStream {
                transfer_id: "t".into(),
                total_chunks: 42
            }
        );
    }

    #[test]
    fn test_rejects_declared_length_beyond_buffer() {
        let bytes = encode_chunk("t", 0, None, &[1, 2, 3, 4]);

        // 페이로드 일부 잘림
        let truncated = bytes.slice(..bytes.len() - 2);
        assert_eq!(
            decode(truncated),
            Err(DecodeError::PayloadLengthMismatch {
                declared: 4,
                actual: 2
            })
        );

        // id_len 이 버퍼보다 큼
        let mut forged = BytesMut::new();
        forged.put_u8(PacketType::Chunk as u8);
        forged.put_u16(500);
        forged.put_slice(b"abc");
        assert!(matches!(
            decode(forged.freeze()),
            Err(DecodeError::Truncated {
                field: "transfer_id",
                ..
            })
        ));

        // 체크섬 길이가 버퍼보다 큼
        let mut forged = BytesMut::new();
        forged.put_u8(PacketType::Chunk as u8);
        forged.put_u16(1);
        forged.put_slice(b"t");
        forged.put_u32(0);
        forged.put_u32(0);
        forged.put_u16(64);
        assert!(matches!(
            decode(forged.freeze()),
            Err(DecodeError::Truncated {
                field: "checksum",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_unknown_type_and_empty() {
        assert_eq!(decode(Bytes::new()), Err(DecodeError::Empty));
        assert_eq!(
            decode(Bytes::from_static(&[0x7f, 0, 0])),
            Err(DecodeError::UnknownPacketType(0x7f))
        );
        assert!(matches!(
            decode(Bytes::from_static(&[PacketType::Chunk as u8, 0])),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_check_target() {
        let packet = match decode(encode_chunk("a", 5, None, b"x")).unwrap() {
            Packet::Chunk(packet) => packet,
            other => panic!("unexpected packet: {:?}", other),
        };

        assert!(packet.check_target("a", 6).is_ok());
        assert_eq!(
            packet.check_target("a", 5),
            Err(DecodeError::IndexOutOfRange { index: 5, total: 5 })
        );
        assert!(matches!(
            packet.check_target("b", 6),
            Err(DecodeError::TransferMismatch { .. })
        ));
    }

    #[test]
    fn test_encode_decode_reassembly() {
        let chunk_size = 64;
        for size in [0usize, 1, chunk_size - 1, chunk_size, chunk_size + 1, 10 * chunk_size] {
            let data: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
            let layout = ChunkLayout::new(size as u64, chunk_size).unwrap();

            let mut reassembled = Vec::with_capacity(size);
            for (index, part) in layout.split(&data).into_iter().enumerate() {
                let wire = encode_chunk("file", index as u32, None, &part);
                match decode(wire).unwrap() {
                    Packet::Chunk(packet) => {
                        assert_eq!(packet.chunk_index, index as u32);
                        reassembled.extend_from_slice(&packet.payload);
                    }
                    other => panic!("unexpected packet: {:?}", other),
                }
            }

            assert_eq!(reassembled, data.to_vec(), "size {}", size);
        }
    }
}
