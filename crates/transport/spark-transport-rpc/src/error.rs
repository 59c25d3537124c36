//! 传输层错误类型与稳定错误码。

use spark_codec_rpc::CodecError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OperationKind {
    /// 稳定错误码。
    pub code: &'static str,
    /// 默认文案。
    pub message: &'static str,
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.rpc.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.rpc.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.rpc.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.rpc.configure_failed",
    message: "tcp configure",
};
pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.transport.rpc.resolve_failed",
    message: "address resolve",
};

/// 传输层错误。
///
/// # 教案式说明
/// - **意图 (Why)**：连接建立、读写、解码与运行时启动的失败统一汇聚到一个枚举，
///   管线的 `exception_caught` 与 Watchdog 的失败路径只需处理一种类型；
/// - **契约 (What)**：[`TransportError::code`] 返回稳定错误码，日志字段 `code` 以此为准；
///   IO 类失败保留原始 [`io::Error`] 作为 `source`。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 底层 IO 失败。
    #[error("{kind}: {source}")]
    Io {
        /// 失败的操作。
        kind: OperationKind,
        /// 原始错误。
        #[source]
        source: io::Error,
    },

    /// 操作超时。
    #[error("{kind} timed out after {after:?}")]
    Timeout {
        /// 超时的操作。
        kind: OperationKind,
        /// 生效的超时时长。
        after: Duration,
    },

    /// 连接已关闭，写入被拒绝。
    #[error("connection closed")]
    Closed,

    /// 入站字节违反帧结构。
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),

    /// 未经编码的帧到达了传输出口。
    #[error("frame reached the socket without passing an encoder")]
    Unencoded,

    /// 同一远端已有一次建连在途。
    #[error("a connect attempt to {remote} is already in flight")]
    ConnectInProgress {
        /// 远端地址。
        remote: SocketAddr,
    },

    /// 服务发现未返回提供者。
    #[error("no provider registered for service `{service}`")]
    NoProvider {
        /// 服务名。
        service: String,
    },

    /// 主机名未解析出任何地址。
    #[error("`{host}:{port}` resolved to no address")]
    Unresolved {
        /// 主机名。
        host: String,
        /// 端口。
        port: u16,
    },

    /// 运行时或线程启动失败。
    #[error("failed to start {what}: {source}")]
    Runtime {
        /// 启动对象。
        what: &'static str,
        /// 原始错误。
        #[source]
        source: io::Error,
    },

    /// 连接器配置非法。
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 连接器已停止。
    #[error("connector is shut down")]
    Shutdown,
}

impl TransportError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Io { kind, .. } => kind.code,
            TransportError::Timeout { .. } => "spark.transport.rpc.timeout",
            TransportError::Closed => "spark.transport.rpc.closed",
            TransportError::Codec(err) => err.code(),
            TransportError::Unencoded => "spark.transport.rpc.unencoded",
            TransportError::ConnectInProgress { .. } => "spark.transport.rpc.connect_in_progress",
            TransportError::NoProvider { .. } => "spark.transport.rpc.no_provider",
            TransportError::Unresolved { .. } => "spark.transport.rpc.unresolved",
            TransportError::Runtime { .. } => "spark.transport.rpc.runtime_failed",
            TransportError::Config(_) => "spark.transport.rpc.invalid_config",
            TransportError::Shutdown => "spark.transport.rpc.shutdown",
        }
    }

    /// 该错误之后连接是否仍可继续使用。
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(
            self,
            TransportError::Unencoded | TransportError::ConnectInProgress { .. }
        )
    }
}

/// 将 IO 错误映射为传输层错误。
pub(crate) fn map_io_error(kind: OperationKind, source: io::Error) -> TransportError {
    TransportError::Io { kind, source }
}

/// 首次建连失败，直接返回给 `connect` 的调用方。
///
/// 首次失败不会进入重连流程；之后的断线才由 Watchdog 负责。
#[derive(Debug, Error)]
#[error("connects to [{remote}] fails")]
pub struct ConnectFailed {
    remote: String,
    #[source]
    source: TransportError,
}

impl ConnectFailed {
    pub(crate) fn new(remote: impl Into<String>, source: TransportError) -> Self {
        Self {
            remote: remote.into(),
            source,
        }
    }

    /// 建连目标的可读描述（`host:port` 或服务名）。
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// 失败原因。
    pub fn reason(&self) -> &TransportError {
        &self.source
    }

    /// 取出失败原因。
    pub fn into_reason(self) -> TransportError {
        self.source
    }
}

/// 连接器配置错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 解析失败。
    #[error("failed to parse connector config: {0}")]
    Parse(#[from] toml::de::Error),

    /// 字段取值非法。
    #[error("invalid connector config `{field}`: {reason}")]
    Invalid {
        /// 字段名。
        field: &'static str,
        /// 原因。
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let io = map_io_error(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(io.code(), "spark.transport.rpc.connect_failed");
        let codec = TransportError::from(CodecError::BadMagic { found: 1 });
        assert_eq!(codec.code(), "spark.codec.rpc.bad_magic");
        assert!(codec.is_fatal_for_connection());
        assert!(!TransportError::Unencoded.is_fatal_for_connection());
    }

    #[test]
    fn connect_failed_names_the_target() {
        let err = ConnectFailed::new("127.0.0.1:18090", TransportError::Closed);
        assert_eq!(err.to_string(), "connects to [127.0.0.1:18090] fails");
        assert_eq!(err.remote(), "127.0.0.1:18090");
        assert!(matches!(err.reason(), TransportError::Closed));
    }
}
