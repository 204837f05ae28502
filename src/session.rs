// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 客户端会话
//!
//! `ClientSession` 包装一条已接受的连接，只服务一次请求/响应周期，释放后不再复用。
//! `SessionSet` 记录所有存活的会话，服务器停止时统一中止，健康检查时清理已结束的条目。

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    task::AbortHandle,
};

use crate::exception::Exception;

pub struct ClientSession<S> {
    id: u128,
    peer: Option<SocketAddr>,
    reader: BufReader<S>,
    connected: bool,
    disposed: bool,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, id: u128, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            reader: BufReader::new(stream),
            connected: true,
            disposed: false,
        }
    }

    pub fn id(&self) -> u128 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// 读取请求头各行（不含行尾与结束空行），接受 LF 或 CRLF。
    ///
    /// 总字节数超过 `max` 时返回 `PayloadTooLarge`；非 UTF-8 内容返回 `RequestIsNotUtf8`。
    /// 首行为空时返回空列表。
    pub async fn read_head(&mut self, max: u64) -> Result<Vec<String>, Exception> {
        let mut lines = Vec::new();
        let mut total: u64 = 0;
        loop {
            let mut line = Vec::new();
            // 多读一个字节，用来区分“恰好达到上限”和“超出上限”
            let limit = max.saturating_sub(total) + 1;
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                debug!("[ID{}]请求头读取到流末尾", self.id);
                break;
            }
            total += n as u64;
            if total > max {
                warn!("[ID{}]请求头超过{}字节上限", self.id, max);
                return Err(Exception::PayloadTooLarge);
            }
            let text = match String::from_utf8(line) {
                Ok(t) => t,
                Err(_) => {
                    warn!("[ID{}]请求头不是合法的UTF-8", self.id);
                    return Err(Exception::RequestIsNotUtf8);
                }
            };
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                break;
            }
            lines.push(text.to_string());
        }
        Ok(lines)
    }

    /// 读取恰好 `len` 字节的请求体
    pub async fn read_body(&mut self, len: u64) -> Result<Bytes, Exception> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let len = usize::try_from(len).map_err(|_| Exception::PayloadTooLarge)?;
        let mut buffer = vec![0u8; len];
        self.reader.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), Exception> {
        if self.disposed {
            return Err(Exception::Io("session already disposed".to_string()));
        }
        let stream = self.reader.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// 关闭写方向并标记为已释放。重复调用无副作用。
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.connected = false;
        if let Err(e) = self.reader.get_mut().shutdown().await {
            debug!("[ID{}]关闭连接时出错：{}", self.id, e);
        }
    }
}

/// 存活会话的登记信息
#[derive(Debug)]
pub struct SessionEntry {
    pub peer: Option<SocketAddr>,
    pub since: Instant,
    abort: Option<AbortHandle>,
}

impl SessionEntry {
    fn is_finished(&self) -> bool {
        self.abort.as_ref().map_or(false, AbortHandle::is_finished)
    }
}

#[derive(Debug, Default)]
pub struct SessionSet {
    sessions: DashMap<u64, SessionEntry>,
    next_id: AtomicU64,
}

impl SessionSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 分配一个新的会话序号并登记。返回的守卫在析构时移除该条目。
    pub fn register(self: &Arc<Self>, peer: Option<SocketAddr>) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionEntry {
                peer,
                since: Instant::now(),
                abort: None,
            },
        );
        SessionGuard {
            set: Arc::clone(self),
            id,
        }
    }

    /// 为已登记的会话附加任务句柄。会话已经结束时什么也不做。
    pub fn attach(&self, id: u64, handle: AbortHandle) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.abort = Some(handle);
        }
    }

    fn remove(&self, id: u64) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 存活会话的对端地址
    pub fn peers(&self) -> Vec<Option<SocketAddr>> {
        self.sessions.iter().map(|e| e.value().peer).collect()
    }

    /// 移除任务已结束的条目，返回移除数量
    pub fn prune(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| !entry.is_finished());
        before.saturating_sub(self.sessions.len())
    }

    /// 中止全部会话任务并清空，返回中止数量
    pub fn close_all(&self) -> usize {
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                if let Some(handle) = entry.abort {
                    handle.abort();
                }
                closed += 1;
            }
        }
        closed
    }
}

/// 会话登记守卫，析构时从集合中移除对应条目
#[derive(Debug)]
pub struct SessionGuard {
    set: Arc<SessionSet>,
    id: u64,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_head_lf_and_crlf() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\nAccept: */*\r\n\r\nBODY")
            .await
            .unwrap();
        let mut session = ClientSession::new(server, 1, None);

        let lines = session.read_head(1024).await.unwrap();
        assert_eq!(lines, vec!["GET / HTTP/1.1", "Host: x", "Accept: */*"]);
        assert_eq!(&session.read_body(4).await.unwrap()[..], b"BODY");
    }

    #[tokio::test]
    async fn test_read_head_too_large() {
        let (mut client, server) = duplex(4096);
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(200));
        client.write_all(long.as_bytes()).await.unwrap();
        let mut session = ClientSession::new(server, 2, None);

        assert_eq!(session.read_head(64).await, Err(Exception::PayloadTooLarge));
    }

    #[tokio::test]
    async fn test_read_head_not_utf8() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"GET /\xff\xfe HTTP/1.1\r\n\r\n").await.unwrap();
        let mut session = ClientSession::new(server, 3, None);

        assert_eq!(session.read_head(1024).await, Err(Exception::RequestIsNotUtf8));
    }

    #[tokio::test]
    async fn test_read_head_empty_first_line() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"\r\nGET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut session = ClientSession::new(server, 4, None);

        assert!(session.read_head(1024).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (mut client, server) = duplex(1024);
        let mut session = ClientSession::new(server, 5, None);
        session.send(b"hello").await.unwrap();
        session.dispose().await;
        session.dispose().await;
        assert!(session.is_disposed());
        assert!(!session.is_connected());
        assert!(session.send(b"again").await.is_err());

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_session_guard_removes_once() {
        let set = SessionSet::new();
        let guard = set.register(None);
        let other = set.register(None);
        assert_ne!(guard.id(), other.id());
        assert_eq!(set.len(), 2);

        drop(guard);
        assert_eq!(set.len(), 1);
        drop(other);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_aborts_tasks() {
        let set = SessionSet::new();
        let guard = set.register(None);
        let id = guard.id();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        set.attach(id, handle.abort_handle());

        assert_eq!(set.close_all(), 1);
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_prune_finished_entries() {
        let set = SessionSet::new();
        let guard = set.register(None);
        let id = guard.id();
        // 守卫被泄漏到集合之外时，只能靠健康检查清理
        std::mem::forget(guard);
        let handle = tokio::spawn(async {});
        let abort = handle.abort_handle();
        handle.await.unwrap();
        set.attach(id, abort);

        assert_eq!(set.prune(), 1);
        assert!(set.is_empty());
    }
}
