//! # ChannelGroup：按远端地址登记存活连接
//!
//! ## 核心意图（Why）
//! - 连接器需要按地址枚举当前连接（负载选择、批量关闭），Watchdog 在连接激活时登记，
//!   读任务在连接关闭时注销；
//! - 以 `DashMap` 分片存储，IO 线程与调用方线程并发登记/查询时不会争用全局锁。
//!
//! ## 行为契约（What）
//! - `add`：同一连接重复登记返回 `false`，不产生重复条目；
//! - `remove`：按连接标识移除，地址下最后一条连接移除后地址键随之删除；
//! - `close_all`：关闭全部连接并清空登记，返回关闭数量。
//!
//! ## 风险提示（Trade-offs）
//! - `connections` 返回快照，调用方拿到的连接可能随后关闭，写入前应检查 [`Connection::is_active`]。

use dashmap::DashMap;
use std::net::SocketAddr;

use crate::connection::{Connection, ConnectionId};

/// 远端地址到存活连接集合的登记表。
#[derive(Debug, Default)]
pub struct ChannelGroup {
    groups: DashMap<SocketAddr, Vec<Connection>>,
}

impl ChannelGroup {
    /// 空登记表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `remote` 下登记连接。
    pub fn add(&self, remote: SocketAddr, connection: Connection) -> bool {
        let mut entry = self.groups.entry(remote).or_default();
        if entry.iter().any(|existing| existing.id() == connection.id()) {
            return false;
        }
        entry.push(connection);
        true
    }

    /// 注销连接。
    pub fn remove(&self, remote: SocketAddr, id: ConnectionId) -> Option<Connection> {
        let removed = {
            let mut entry = self.groups.get_mut(&remote)?;
            let index = entry.iter().position(|existing| existing.id() == id)?;
            entry.swap_remove(index)
        };
        self.groups.remove_if(&remote, |_, connections| connections.is_empty());
        Some(removed)
    }

    /// `remote` 下的连接快照。
    pub fn connections(&self, remote: SocketAddr) -> Vec<Connection> {
        self.groups
            .get(&remote)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// `remote` 下任意一条仍然打开的连接。
    pub fn next_active(&self, remote: SocketAddr) -> Option<Connection> {
        self.groups
            .get(&remote)?
            .iter()
            .find(|connection| connection.is_active())
            .cloned()
    }

    /// `remote` 下的连接数。
    pub fn len_of(&self, remote: SocketAddr) -> usize {
        self.groups.get(&remote).map_or(0, |entry| entry.len())
    }

    /// 全部连接数。
    pub fn len(&self) -> usize {
        self.groups.iter().map(|entry| entry.len()).sum()
    }

    /// 是否没有任何连接。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前有连接的地址。
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.groups.iter().map(|entry| *entry.key()).collect()
    }

    /// 关闭 `remote` 下的全部连接。
    pub fn close_group(&self, remote: SocketAddr) -> usize {
        let connections = self
            .groups
            .remove(&remote)
            .map(|(_, connections)| connections)
            .unwrap_or_default();
        connections
            .iter()
            .filter(|connection| connection.close())
            .count()
    }

    /// 关闭全部连接并清空登记。
    pub fn close_all(&self) -> usize {
        let addresses = self.addresses();
        addresses
            .into_iter()
            .map(|remote| self.close_group(remote))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;

    fn connection() -> Connection {
        Connection::detached(Pipeline::new(Vec::new())).0
    }

    #[test]
    fn add_is_idempotent_per_connection() {
        let group = ChannelGroup::new();
        let conn = connection();
        let remote = conn.remote_addr();
        assert!(group.add(remote, conn.clone()));
        assert!(!group.add(remote, conn.clone()));
        assert_eq!(group.len_of(remote), 1);
        assert_eq!(group.next_active(remote), Some(conn));
    }

    #[test]
    fn removing_last_connection_drops_the_address() {
        let group = ChannelGroup::new();
        let first = connection();
        let second = connection();
        let remote = first.remote_addr();
        group.add(remote, first.clone());
        group.add(remote, second.clone());

        assert_eq!(group.remove(remote, first.id()), Some(first));
        assert_eq!(group.addresses(), vec![remote]);
        assert_eq!(group.remove(remote, second.id()), Some(second.clone()));
        assert!(group.addresses().is_empty());
        assert_eq!(group.remove(remote, second.id()), None);
    }

    #[test]
    fn close_all_closes_and_clears() {
        let group = ChannelGroup::new();
        let conns: Vec<_> = (0..3).map(|_| connection()).collect();
        for conn in &conns {
            group.add(conn.remote_addr(), conn.clone());
        }
        assert_eq!(group.close_all(), 3);
        assert!(group.is_empty());
        assert!(conns.iter().all(|conn| !conn.is_active()));
    }
}
