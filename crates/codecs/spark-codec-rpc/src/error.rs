use thiserror::Error;

/// 帧结构违规错误（MalformedFrame 族）。
///
/// # 教案式说明
/// - **意图 (Why)**：协议违规对所在连接的解码流是致命的，传输层据此关闭连接并交由重连流程恢复；
///   统一错误类型可让上层用一个分支完成“关闭 + 记录”。
/// - **契约 (What)**：每个变体携带足够的排障上下文；[`CodecError::code`] 返回稳定错误码，
///   便于日志与指标聚合。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// 可用字节不足以构成协议头。
    #[error("truncated frame header: need {needed} bytes, {available} available")]
    Truncated {
        /// 需要的字节数。
        needed: usize,
        /// 实际可用的字节数。
        available: usize,
    },

    /// 前两个字节不是协议哨兵。
    #[error("bad magic 0x{found:04x}, expected 0xbabe")]
    BadMagic {
        /// 实际读到的值。
        found: u16,
    },

    /// 声明的负载长度与实际字节数不一致。
    #[error("body length mismatch: header declares {declared} bytes, {actual} present")]
    BodyLengthMismatch {
        /// 协议头声明的长度。
        declared: u32,
        /// 实际负载长度。
        actual: usize,
    },

    /// 负载超过可编码上限或解码器配置的上限。
    #[error("frame body of {declared} bytes exceeds limit {limit}")]
    FrameTooLarge {
        /// 声明或实际的负载长度。
        declared: u64,
        /// 生效的上限。
        limit: u64,
    },
}

impl CodecError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::Truncated { .. } => "spark.codec.rpc.truncated",
            CodecError::BadMagic { .. } => "spark.codec.rpc.bad_magic",
            CodecError::BodyLengthMismatch { .. } => "spark.codec.rpc.body_length_mismatch",
            CodecError::FrameTooLarge { .. } => "spark.codec.rpc.frame_too_large",
        }
    }
}
