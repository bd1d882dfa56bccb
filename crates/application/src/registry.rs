//! 连接注册表
//!
//! 只由调度器任务持有和修改，因此没有任何锁。
//! 不变式：没有连接的用户不存在条目，不存在条目即为离线。

use std::collections::HashMap;

use domain::{ConnectionId, PresenceStatus, UserId};
use serde::Serialize;

use crate::connection::ConnectionHandle;

#[derive(Debug)]
struct RegistryEntry {
    connections: Vec<ConnectionHandle>,
    status: PresenceStatus,
}

/// 移除连接的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// 移除的是该用户最后一条连接，条目已删除
    Last,
    Remaining,
    /// 用户或连接不存在
    Absent,
}

/// 快照中的单个在线用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineUser {
    pub user_id: UserId,
    pub username: String,
    pub status: PresenceStatus,
    pub connections: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<UserId, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加连接，返回是否为该用户的第一条连接
    pub fn insert(&mut self, connection: ConnectionHandle) -> bool {
        match self.entries.get_mut(&connection.user_id()) {
            Some(entry) => {
                entry.connections.push(connection);
                false
            }
            None => {
                self.entries.insert(
                    connection.user_id(),
                    RegistryEntry {
                        connections: vec![connection],
                        status: PresenceStatus::Online,
                    },
                );
                true
            }
        }
    }

    /// 用新连接替换该用户的全部旧连接，返回被替换的连接和之前的状态
    pub fn supersede(
        &mut self,
        connection: ConnectionHandle,
    ) -> (Vec<ConnectionHandle>, Option<PresenceStatus>) {
        match self.entries.get_mut(&connection.user_id()) {
            Some(entry) => {
                let previous = entry.status;
                entry.status = PresenceStatus::Online;
                let old = std::mem::replace(&mut entry.connections, vec![connection]);
                (old, Some(previous))
            }
            None => {
                self.insert(connection);
                (Vec::new(), None)
            }
        }
    }

    pub fn remove(&mut self, user_id: UserId, connection_id: ConnectionId) -> Removal {
        let Some(entry) = self.entries.get_mut(&user_id) else {
            return Removal::Absent;
        };
        let Some(index) = entry
            .connections
            .iter()
            .position(|conn| conn.id() == connection_id)
        else {
            return Removal::Absent;
        };

        entry.connections.remove(index);
        if entry.connections.is_empty() {
            self.entries.remove(&user_id);
            Removal::Last
        } else {
            Removal::Remaining
        }
    }

    pub fn connections(&self, user_id: UserId) -> &[ConnectionHandle] {
        self.entries
            .get(&user_id)
            .map(|entry| entry.connections.as_slice())
            .unwrap_or_default()
    }

    pub fn contains(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        self.connections(user_id)
            .iter()
            .any(|conn| conn.id() == connection_id)
    }

    pub fn status(&self, user_id: UserId) -> Option<PresenceStatus> {
        self.entries.get(&user_id).map(|entry| entry.status)
    }

    /// 更新在线用户的状态，返回状态是否真的变化
    pub fn set_status(&mut self, user_id: UserId, status: PresenceStatus) -> bool {
        match self.entries.get_mut(&user_id) {
            Some(entry) if entry.status != status => {
                entry.status = status;
                true
            }
            _ => false,
        }
    }

    /// 移除并返回全部连接，用于停机
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.entries
            .drain()
            .flat_map(|(_, entry)| entry.connections)
            .collect()
    }

    pub fn users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.entries.keys().copied()
    }

    pub fn snapshot(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .entries
            .iter()
            .map(|(user_id, entry)| OnlineUser {
                user_id: *user_id,
                username: entry
                    .connections
                    .first()
                    .map(|conn| conn.username().to_owned())
                    .unwrap_or_default(),
                status: entry.status,
                connections: entry.connections.len(),
            })
            .collect();
        users.sort_by_key(|user| user.user_id);
        users
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
