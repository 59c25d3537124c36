//! 服务发现协作接口。
//!
//! 连接器只需要“服务名 → 提供者地址”的一次查询；注册中心客户端实现 [`LookupService`] 即可接入。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tokio::net::lookup_host;

use crate::error::{RESOLVE, TransportError, map_io_error};

/// 提供者地址，主机名在建连前解析。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderAddress {
    /// 主机名或 IP。
    pub host: String,
    /// 端口。
    pub port: u16,
}

impl ProviderAddress {
    /// 构造。
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 解析为首个可用的套接字地址。
    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| map_io_error(RESOLVE, source))?;
        addrs.next().ok_or_else(|| TransportError::Unresolved {
            host: self.host.clone(),
            port: self.port,
        })
    }
}

impl fmt::Display for ProviderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 订阅信息。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribeInfo {
    /// 服务名。
    pub service_name: String,
    /// 服务分组。
    #[serde(default)]
    pub group: Option<String>,
    /// 服务版本。
    #[serde(default)]
    pub version: Option<String>,
}

impl SubscribeInfo {
    /// 只指定服务名。
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            group: None,
            version: None,
        }
    }
}

/// 服务发现。
pub trait LookupService: Send + Sync {
    /// 查询服务的一个提供者。
    fn lookup(&self, service_name: &str) -> Option<ProviderAddress>;
}

/// 内存中的静态服务表，适用于测试与固定拓扑部署。
#[derive(Debug, Default)]
pub struct StaticLookup {
    providers: DashMap<String, ProviderAddress>,
}

impl StaticLookup {
    /// 空表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记或替换提供者。
    pub fn register(&self, service_name: impl Into<String>, address: ProviderAddress) {
        self.providers.insert(service_name.into(), address);
    }

    /// 注销。
    pub fn unregister(&self, service_name: &str) -> Option<ProviderAddress> {
        self.providers.remove(service_name).map(|(_, address)| address)
    }
}

impl LookupService for StaticLookup {
    fn lookup(&self, service_name: &str) -> Option<ProviderAddress> {
        self.providers
            .get(service_name)
            .map(|entry| entry.value().clone())
    }
}
