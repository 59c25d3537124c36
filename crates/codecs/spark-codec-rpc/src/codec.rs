use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::header::{Frame, HEADER_LENGTH, MAGIC, ProtocolHeader};

/// 编码协议头并原样追加负载。
///
/// # 契约说明（What）
/// - 字段写出顺序固定：magic、kind、status、id、body_length，随后为 `payload`；
/// - `header.body_length()` 必须等于 `payload.len()`，否则返回 [`CodecError::BodyLengthMismatch`]，
///   避免对端把下一帧的头部当作本帧负载读取。
pub fn encode(header: &ProtocolHeader, payload: &[u8]) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    encode_into(header, payload, &mut out)?;
    Ok(out.freeze())
}

/// 与 [`encode`] 相同，但写入调用方提供的缓冲，便于批量编码复用内存。
///
/// 失败时 `dst` 保持不变。
pub fn encode_into(
    header: &ProtocolHeader,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    if header.body_length() as usize != payload.len() {
        return Err(CodecError::BodyLengthMismatch {
            declared: header.body_length(),
            actual: payload.len(),
        });
    }
    dst.reserve(HEADER_LENGTH + payload.len());
    dst.put_slice(&header.to_array());
    dst.put_slice(payload);
    Ok(())
}

/// 从完整字节序列中解析协议头，返回协议头与其后的剩余字节。
///
/// - 字节数不足 16 或哨兵不符时失败；
/// - 不校验 `kind` 取值，也不要求剩余字节恰好等于 `body_length`：剩余部分原样交还调用方。
pub fn decode(src: &[u8]) -> Result<(ProtocolHeader, &[u8]), CodecError> {
    let header = ProtocolHeader::parse(src)?;
    Ok((header, &src[HEADER_LENGTH..]))
}

/// 面向字节流的增量帧解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：TCP 不保留消息边界，一次读取可能包含半帧或多帧；解码器需要在缓冲中
///   累积字节，直到 `HEADER_LENGTH + body_length` 全部到达才切出一帧。
/// - **逻辑 (How)**：
///   1. 缓冲首两个字节一旦可见即校验哨兵，坏帧无需等待完整头部即可失败；
///   2. 头部到齐后读取 `body_length`，超过上限立即失败；
///   3. 负载未到齐时预留容量并返回 `Ok(None)`；
///   4. 到齐后从缓冲前部切下整帧，保持剩余字节供下一次调用。
/// - **契约 (What)**：返回 `Err` 后缓冲内容不再可信，调用方应关闭连接。
/// - **权衡 (Trade-offs)**：每次调用最多切出一帧，调用方需循环直到返回 `None`。
#[derive(Clone, Debug, Default)]
pub struct FrameDecoder {
    max_frame_length: Option<u32>,
}

impl FrameDecoder {
    /// 不限制负载长度的解码器。
    pub const fn new() -> Self {
        Self {
            max_frame_length: None,
        }
    }

    /// 限制单帧负载长度。
    pub const fn with_max_frame_length(max_frame_length: Option<u32>) -> Self {
        Self { max_frame_length }
    }

    /// 当前生效的负载长度上限。
    pub fn max_frame_length(&self) -> Option<u32> {
        self.max_frame_length
    }

    /// 尝试从 `buf` 前部切出一帧。
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() >= 2 {
            let magic = u16::from_be_bytes([buf[0], buf[1]]);
            if magic != MAGIC {
                return Err(CodecError::BadMagic { found: magic });
            }
        }
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let header = ProtocolHeader::parse(&buf[..HEADER_LENGTH])?;
        let body_length = header.body_length();
        if let Some(limit) = self.max_frame_length
            && body_length > limit
        {
            return Err(CodecError::FrameTooLarge {
                declared: u64::from(body_length),
                limit: u64::from(limit),
            });
        }

        let frame_length = HEADER_LENGTH + body_length as usize;
        if buf.len() < frame_length {
            buf.reserve(frame_length - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_length);
        frame.advance(HEADER_LENGTH);
        Frame::from_parts(header, frame.freeze()).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MessageKind;

    #[test]
    fn encode_rejects_mismatched_length() {
        let header = ProtocolHeader::new(MessageKind::REQUEST, 0, 1, 10);
        assert_eq!(
            encode(&header, b"short").unwrap_err(),
            CodecError::BodyLengthMismatch {
                declared: 10,
                actual: 5
            }
        );
    }

    #[test]
    fn decode_returns_remaining_bytes() {
        let header = ProtocolHeader::new(MessageKind::RESPONSE, 1, 77, 3);
        let wire = encode(&header, b"abc").expect("encodes");
        let (parsed, rest) = decode(&wire).expect("decodes");
        assert_eq!(parsed, header);
        assert_eq!(rest, b"abc");
    }

    #[test]
    fn truncated_header_is_malformed() {
        let err = decode(&[0xBA, 0xBE, 1, 0]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: HEADER_LENGTH,
                available: 4
            }
        );
    }

    #[test]
    fn stream_decoder_waits_for_partial_frames() {
        let first = Frame::new(MessageKind::REQUEST, 0, 1, Bytes::from_static(b"hello"))
            .expect("frame")
            .encode();
        let second = Frame::new(MessageKind::ACK, 0, 2, Bytes::new())
            .expect("frame")
            .encode();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&first[..10]);
        assert_eq!(decoder.decode(&mut buf).expect("partial header"), None);

        buf.extend_from_slice(&first[10..]);
        buf.extend_from_slice(&second[..HEADER_LENGTH - 1]);
        let frame = decoder.decode(&mut buf).expect("ok").expect("first frame");
        assert_eq!(frame.header().id(), 1);
        assert_eq!(frame.payload().as_ref(), b"hello");
        assert_eq!(decoder.decode(&mut buf).expect("partial second"), None);

        buf.extend_from_slice(&second[HEADER_LENGTH - 1..]);
        let frame = decoder.decode(&mut buf).expect("ok").expect("second frame");
        assert_eq!(frame.header().kind(), MessageKind::ACK);
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_decoder_fails_fast_on_bad_magic() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0xCA, 0xFE][..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            CodecError::BadMagic { found: 0xCAFE }
        );
    }

    #[test]
    fn stream_decoder_enforces_frame_limit() {
        let header = ProtocolHeader::new(MessageKind::REQUEST, 0, 5, 1024);
        let mut buf = BytesMut::from(&header.to_array()[..]);
        let mut decoder = FrameDecoder::with_max_frame_length(Some(512));
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            CodecError::FrameTooLarge {
                declared: 1024,
                limit: 512
            }
        );
    }
}
