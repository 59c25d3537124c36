#![deny(unsafe_code)]
#![warn(missing_docs)]

//! `spark-codec-rpc` 提供 RPC 传输层使用的定长协议头编解码与共享心跳内容。
//!
//! # 教案背景（Why）
//! - RPC 客户端与服务端跨语言互通，依赖一个**逐位一致**的 16 字节协议头：
//!   `magic:u16 | kind:u8 | status:u8 | id:u64 | body_length:u32`，全部为网络字节序；
//! - 将协议头、帧与心跳集中在独立 crate 中，传输实现（`spark-transport-rpc`）与潜在的服务端实现
//!   可以共享同一份线格式定义，避免双方各自维护常量导致漂移。
//!
//! # 使用概览（How）
//! - 编码：[`encode`] / [`Frame::encode`] 先写协议头，再原样追加负载；
//! - 解码：[`decode`] 面向已完整到达的字节切片；[`FrameDecoder`] 面向 TCP 流式输入，按帧增量切分；
//! - 心跳：[`heartbeat_content`] 返回共享只读字节的独立游标，任意并发调用互不影响。
//!
//! # 合约说明（What）
//! - `magic` 不匹配或头部不足 16 字节时返回 [`CodecError`]（即 MalformedFrame 族错误）；
//! - 解码**不校验** `kind` 是否属于已知枚举，未知类型原样透传给上层判定；
//! - `body_length` 必须与随后负载的实际长度一致。
//!
//! # 风险提示（Trade-offs）
//! - 协议头不含校验和，链路完整性依赖 TCP；
//! - `body_length` 最大可达 `u32::MAX`，生产环境建议通过 [`FrameDecoder::with_max_frame_length`] 设置上限。

mod codec;
mod error;
mod header;
mod heartbeat;

pub use crate::codec::{FrameDecoder, decode, encode, encode_into};
pub use crate::error::CodecError;
pub use crate::header::{Frame, HEADER_LENGTH, MAGIC, MessageKind, ProtocolHeader};
pub use crate::heartbeat::{HEARTBEAT_HEADER, heartbeat_content};
