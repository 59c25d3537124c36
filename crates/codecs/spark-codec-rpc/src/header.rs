use bytes::Bytes;
use core::fmt;

use crate::error::CodecError;

/// 协议头固定长度（字节）。
pub const HEADER_LENGTH: usize = 16;

/// 协议族哨兵值，所有帧的前两个字节。
pub const MAGIC: u16 = 0xBABE;

/// 消息类型字节。
///
/// # 教案式说明
/// - **意图 (Why)**：线格式中的 `kind` 只是一个 `u8`，新版本的对端可能追加新类型；
///   若使用封闭枚举，解码遇到未知值只能报错，违背“未知类型交由上层判定”的契约。
/// - **契约 (What)**：以新类型包装原始字节，已知取值以关联常量暴露；
///   [`MessageKind::is_known`] 可用于上层快速过滤。
/// - **权衡 (Trade-offs)**：失去 `match` 的穷尽性检查，调用方需保留兜底分支。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(u8);

impl MessageKind {
    /// RPC 请求。
    pub const REQUEST: Self = Self(1);
    /// RPC 响应。
    pub const RESPONSE: Self = Self(2);
    /// 发布服务。
    pub const PUBLISH_SERVICE: Self = Self(65);
    /// 取消发布服务。
    pub const PUBLISH_CANCEL_SERVICE: Self = Self(66);
    /// 订阅服务。
    pub const SUBSCRIBE_SERVICE: Self = Self(67);
    /// 服务下线通知。
    pub const OFFLINE_NOTICE: Self = Self(68);
    /// 确认。
    pub const ACK: Self = Self(126);
    /// 心跳。
    pub const HEARTBEAT: Self = Self(127);

    /// 由原始字节构造，不做取值校验。
    pub const fn from_u8(raw: u8) -> Self {
        Self(raw)
    }

    /// 返回原始字节。
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// 已知类型的可读名称；未知类型返回 `None`。
    pub const fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("REQUEST"),
            2 => Some("RESPONSE"),
            65 => Some("PUBLISH_SERVICE"),
            66 => Some("PUBLISH_CANCEL_SERVICE"),
            67 => Some("SUBSCRIBE_SERVICE"),
            68 => Some("OFFLINE_NOTICE"),
            126 => Some("ACK"),
            127 => Some("HEARTBEAT"),
            _ => None,
        }
    }

    /// 是否属于当前版本已知的类型集合。
    pub const fn is_known(self) -> bool {
        self.name().is_some()
    }
}

impl From<u8> for MessageKind {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown({})", self.0),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 16 字节定长协议头。
///
/// # 教案式说明
/// - **意图 (Why)**：描述一帧的类型、状态、关联 ID 与负载长度，是跨语言线契约的唯一载体。
/// - **布局 (What)**：
///   ```text
///   ┌────────┬──────┬────────┬────────────────┬─────────────┐
///   │ magic  │ kind │ status │ correlation id │ body length │
///   │ u16 BE │ u8   │ u8     │ u64 BE         │ u32 BE      │
///   └────────┴──────┴────────┴────────────────┴─────────────┘
///   ```
/// - **契约**：`magic` 恒为 [`MAGIC`]，因此不作为字段存储；值类型，可自由复制。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolHeader {
    kind: MessageKind,
    status: u8,
    id: u64,
    body_length: u32,
}

impl ProtocolHeader {
    /// 构造协议头。
    pub const fn new(kind: MessageKind, status: u8, id: u64, body_length: u32) -> Self {
        Self {
            kind,
            status,
            id,
            body_length,
        }
    }

    /// 协议哨兵值，恒等于 [`MAGIC`]。
    pub const fn magic(&self) -> u16 {
        MAGIC
    }

    /// 消息类型。
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// 状态字节，语义由 `kind` 决定。
    pub const fn status(&self) -> u8 {
        self.status
    }

    /// 关联 ID，由调用方分配，在同一连接的在途请求中唯一。
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// 随后负载的字节数。
    pub const fn body_length(&self) -> u32 {
        self.body_length
    }

    /// 以网络字节序写出协议头。
    pub const fn to_array(&self) -> [u8; HEADER_LENGTH] {
        let magic = MAGIC.to_be_bytes();
        let id = self.id.to_be_bytes();
        let len = self.body_length.to_be_bytes();
        let mut out = [0u8; HEADER_LENGTH];
        out[0] = magic[0];
        out[1] = magic[1];
        out[2] = self.kind.as_u8();
        out[3] = self.status;
        let mut i = 0;
        while i < 8 {
            out[4 + i] = id[i];
            i += 1;
        }
        let mut j = 0;
        while j < 4 {
            out[12 + j] = len[j];
            j += 1;
        }
        out
    }

    /// 从字节切片读取协议头。
    ///
    /// - **前置条件**：无；长度不足或哨兵不符时返回错误，且不消费输入；
    /// - **后置条件**：成功时仅解析前 16 字节，不检查负载是否到齐。
    pub fn parse(src: &[u8]) -> Result<Self, CodecError> {
        // 哨兵先于长度检查：前两个字节已错时无论后续内容如何都判定为坏帧。
        if src.len() >= 2 {
            let magic = u16::from_be_bytes([src[0], src[1]]);
            if magic != MAGIC {
                return Err(CodecError::BadMagic { found: magic });
            }
        }
        if src.len() < HEADER_LENGTH {
            return Err(CodecError::Truncated {
                needed: HEADER_LENGTH,
                available: src.len(),
            });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&src[4..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&src[12..16]);
        Ok(Self {
            kind: MessageKind::from_u8(src[2]),
            status: src[3],
            id: u64::from_be_bytes(id),
            body_length: u32::from_be_bytes(len),
        })
    }
}

/// 一帧：协议头加负载。
///
/// 构造入口保证 `header.body_length() == payload.len()`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    header: ProtocolHeader,
    payload: Bytes,
}

impl Frame {
    /// 以负载长度回填 `body_length` 构造帧。
    ///
    /// 负载超过 `u32::MAX` 字节时返回 [`CodecError::FrameTooLarge`]。
    pub fn new(
        kind: MessageKind,
        status: u8,
        id: u64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, CodecError> {
        let payload = payload.into();
        let body_length = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
            declared: payload.len() as u64,
            limit: u64::from(u32::MAX),
        })?;
        Ok(Self {
            header: ProtocolHeader::new(kind, status, id, body_length),
            payload,
        })
    }

    /// 由已解析的协议头与负载组装，校验二者长度一致。
    pub fn from_parts(header: ProtocolHeader, payload: Bytes) -> Result<Self, CodecError> {
        if header.body_length() as usize != payload.len() {
            return Err(CodecError::BodyLengthMismatch {
                declared: header.body_length(),
                actual: payload.len(),
            });
        }
        Ok(Self { header, payload })
    }

    /// 协议头。
    pub fn header(&self) -> &ProtocolHeader {
        &self.header
    }

    /// 负载。
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// 拆解为协议头与负载。
    pub fn into_parts(self) -> (ProtocolHeader, Bytes) {
        (self.header, self.payload)
    }

    /// 编码为完整的线格式字节。
    pub fn encode(&self) -> Bytes {
        let mut out = bytes::BytesMut::with_capacity(HEADER_LENGTH + self.payload.len());
        out.extend_from_slice(&self.header.to_array());
        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}
