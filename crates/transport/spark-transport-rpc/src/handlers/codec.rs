use bytes::BytesMut;
use parking_lot::Mutex;
use spark_codec_rpc::FrameDecoder;
use tracing::debug;

use crate::error::TransportError;
use crate::pipeline::{ChannelHandler, HandlerContext, Message};

/// 入站帧解码器，每条连接一个实例。
///
/// # 教案式说明
/// - **逻辑 (How)**：把读到的字节追加到累积缓冲，循环切帧后在锁外逐帧向后传播，
///   保证同一连接内帧的交付顺序与字节到达顺序一致；
/// - **契约 (What)**：遇到坏帧时丢弃缓冲、转入失败态并发出 `exception_caught`，
///   此后到达的字节全部忽略，由异常处理方关闭连接。
pub struct FrameDecoderHandler {
    state: Mutex<DecodeState>,
}

struct DecodeState {
    decoder: FrameDecoder,
    buffer: BytesMut,
    failed: bool,
}

impl FrameDecoderHandler {
    /// 以可选负载上限构造。
    pub fn new(max_frame_length: Option<u32>) -> Self {
        Self {
            state: Mutex::new(DecodeState {
                decoder: FrameDecoder::with_max_frame_length(max_frame_length),
                buffer: BytesMut::new(),
                failed: false,
            }),
        }
    }
}

impl ChannelHandler for FrameDecoderHandler {
    fn name(&self) -> &'static str {
        "frame-decoder"
    }

    fn channel_read(&self, ctx: &HandlerContext<'_>, msg: Message) {
        let bytes = match msg {
            Message::Bytes(bytes) => bytes,
            other => return ctx.fire_channel_read(other),
        };

        let mut frames = Vec::new();
        let mut failure = None;
        {
            let mut state = self.state.lock();
            if state.failed {
                debug!(connection = %ctx.connection().id(), "bytes after a malformed frame ignored");
                return;
            }
            state.buffer.extend_from_slice(&bytes);
            let DecodeState {
                decoder, buffer, ..
            } = &mut *state;
            loop {
                match decoder.decode(buffer) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
            if failure.is_some() {
                state.failed = true;
                state.buffer.clear();
            }
        }

        for frame in frames {
            ctx.fire_channel_read(Message::Frame(frame));
        }
        if let Some(error) = failure {
            ctx.fire_exception_caught(TransportError::Codec(error));
        }
    }
}

/// 出站帧编码器，无状态，连接间共享。
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// 构造编码器。
    pub fn new() -> Self {
        Self
    }
}

impl ChannelHandler for FrameEncoder {
    fn name(&self) -> &'static str {
        "frame-encoder"
    }

    fn write(&self, ctx: &HandlerContext<'_>, msg: Message) -> Result<(), TransportError> {
        match msg {
            Message::Frame(frame) => ctx.write(Message::Bytes(frame.encode())),
            bytes @ Message::Bytes(_) => ctx.write(bytes),
        }
    }
}
