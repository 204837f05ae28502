// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 监听管理模块
//!
//! `Server` 负责：
//! - 按配置选择地址并绑定监听套接字（backlog 为 `max_connections`）
//! - 在独立任务中循环接受连接，准入检查通过后为每个连接派生一个任务
//! - 周期性健康检查：未在监听时重新绑定，清理已结束的会话
//! - 停止时中止接受循环、释放套接字并关闭全部存活会话
//!
//! 每个 `Server` 拥有自己的路由表与会话集合，同一进程可以运行多个实例。

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex as StdMutex, Weak},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpSocket},
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time,
};

use crate::{
    access::AccessList,
    config::Config,
    connection::{handle_connection, Observer, Service},
    exception::Exception,
    guard::{AddressPolicy, MimeLookup, MimeTable, OpenPolicy, PathSandbox, RootSandbox},
    router::RouteRegistry,
    session::SessionSet,
};

/// 接受失败后的退避时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ListenerState {
    port: u16,
    addr: Option<SocketAddr>,
    accept: Option<JoinHandle<()>>,
}

impl ListenerState {
    fn is_listening(&self) -> bool {
        self.accept.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// 中止接受循环但不等待，仅用于无法 await 的 `Drop`
    fn abort(&mut self) {
        if let Some(handle) = self.accept.take() {
            handle.abort();
        }
        self.addr = None;
    }

    /// 中止接受循环并等待任务结束，返回时监听套接字已经释放
    async fn teardown(&mut self) {
        if let Some(handle) = self.accept.take() {
            handle.abort();
            // 被中止的任务总是返回 JoinError，忽略即可
            let _ = handle.await;
        }
        self.addr = None;
    }
}

struct Inner {
    service: Arc<Service>,
    sessions: Arc<SessionSet>,
    access: Arc<AccessList>,
    policy: Arc<dyn AddressPolicy>,
    state: Mutex<ListenerState>,
    maintenance: StdMutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state.get_mut().abort();
        let maintenance = match self.maintenance.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = maintenance {
            handle.abort();
        }
    }
}

/// 嵌入式 HTTP 服务器句柄，克隆后共享同一个实例
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// 使用默认协作者：不封禁任何地址、根目录沙箱、内置 MIME 表
    pub fn new(config: Config) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(OpenPolicy),
            Arc::new(RootSandbox),
            Arc::new(MimeTable),
        )
    }

    pub fn with_collaborators(
        config: Config,
        policy: Arc<dyn AddressPolicy>,
        sandbox: Arc<dyn PathSandbox>,
        mime: Arc<dyn MimeLookup>,
    ) -> Self {
        let access = Arc::new(AccessList::from_config(&config));
        let port = config.port();
        let routes = Arc::new(RouteRegistry::new());
        let service = Arc::new(Service::with_collaborators(config, routes, sandbox, mime));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                service,
                sessions: SessionSet::new(),
                access,
                policy,
                state: Mutex::new(ListenerState {
                    port,
                    ..Default::default()
                }),
                maintenance: StdMutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        self.inner.service.config()
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        self.inner.service.routes()
    }

    pub fn set_observer(&self, observer: Option<Observer>) {
        self.inner.service.set_observer(observer);
    }

    /// 启动健康检查，然后绑定并开始接受连接。已在监听时直接返回当前地址。
    ///
    /// 绑定失败时返回 `BindFailed`，健康检查会在之后的周期里重试。
    pub async fn start(&self) -> Result<SocketAddr, Exception> {
        self.spawn_maintenance();
        self.inner.ensure_listening().await
    }

    /// 停止接受连接，释放套接字并关闭全部存活会话
    pub async fn stop(&self) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.inner.shutdown.send(());
        let maintenance = match self.inner.maintenance.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = maintenance {
            handle.abort();
            // 等待进行中的健康检查退出，避免它在拆除之后重新绑定
            let _ = handle.await;
        }
        self.inner.state.lock().await.teardown().await;
        let closed = self.inner.sessions.close_all();
        info!("服务器已停止，关闭了{}个存活会话", closed);
    }

    /// 拆除当前套接字并改为监听新端口
    pub async fn rebind(&self, port: u16) -> Result<SocketAddr, Exception> {
        {
            let mut state = self.inner.state.lock().await;
            info!("端口变更：{} -> {}", state.port, port);
            state.teardown().await;
            state.port = port;
        }
        self.start().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().await.addr
    }

    pub async fn is_listening(&self) -> bool {
        self.inner.state.lock().await.is_listening()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn sessions(&self) -> &Arc<SessionSet> {
        &self.inner.sessions
    }

    /// 立即执行一次健康检查
    pub async fn health_check(&self) {
        self.inner.health_check().await;
    }

    /// 在任意双向字节流上完成一次请求/响应周期。
    ///
    /// 给出对端地址时同样执行准入检查。
    pub async fn serve_stream<S>(&self, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Some(addr) = peer {
            if !self.inner.access.admit(&addr.ip(), self.inner.policy.as_ref()) {
                info!("拒绝来自{}的连接", addr);
                return;
            }
        }
        let handle = spawn_session(&self.inner.service, &self.inner.sessions, stream, peer);
        if let Err(e) = handle.await {
            warn!("会话任务异常结束：{}", e);
        }
    }

    fn spawn_maintenance(&self) {
        let mut slot = match self.inner.maintenance.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = Duration::from_secs(self.config().health_check_interval());
        let shutdown = self.inner.shutdown.subscribe();
        *slot = Some(tokio::spawn(maintenance_loop(weak, period, shutdown)));
    }
}

impl Inner {
    async fn ensure_listening(&self) -> Result<SocketAddr, Exception> {
        let mut state = self.state.lock().await;
        if state.is_listening() {
            if let Some(addr) = state.addr {
                return Ok(addr);
            }
        }
        state.teardown().await;

        let config = self.service.config();
        let listener = bind_listener(config, state.port)?;
        let addr = listener.local_addr()?;
        info!("开始监听：{}", addr);

        state.addr = Some(addr);
        state.accept = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.service),
            Arc::clone(&self.sessions),
            Arc::clone(&self.access),
            Arc::clone(&self.policy),
        )));
        Ok(addr)
    }

    async fn health_check(&self) {
        let listening = self.state.lock().await.is_listening();
        if !listening {
            warn!("健康检查：服务器未在监听，尝试重新绑定");
            if let Err(e) = self.ensure_listening().await {
                error!("健康检查：重新绑定失败：{}", e);
            }
        }
        let pruned = self.sessions.prune();
        if pruned > 0 {
            debug!("健康检查：清理了{}个已结束的会话", pruned);
        }
    }
}

async fn maintenance_loop(
    inner: Weak<Inner>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(period);
    // 第一次 tick 立即完成，跳过
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match inner.upgrade() {
                    Some(inner) => inner.health_check().await,
                    None => break,
                }
            }
            _ = shutdown.recv() => {
                debug!("健康检查收到停止信号，退出");
                break;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<Service>,
    sessions: Arc<SessionSet>,
    access: Arc<AccessList>,
    policy: Arc<dyn AddressPolicy>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if !access.admit(&peer.ip(), policy.as_ref()) {
                    info!("拒绝来自{}的连接", peer);
                    drop(stream);
                    continue;
                }
                debug!("接受来自{}的连接", peer);
                spawn_session(&service, &sessions, stream, Some(peer));
            }
            Err(e) => {
                warn!("接受连接失败：{}", e);
                time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// 登记会话并在独立任务中处理，任务结束时守卫移除登记
fn spawn_session<S>(
    service: &Arc<Service>,
    sessions: &Arc<SessionSet>,
    stream: S,
    peer: Option<SocketAddr>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let guard = sessions.register(peer);
    let key = guard.id();
    let service = Arc::clone(service);
    let handle = tokio::spawn(async move {
        let _guard = guard;
        handle_connection(&service, stream, peer, key as u128).await;
    });
    sessions.attach(key, handle.abort_handle());
    handle
}

/// 候选地址：先配置的公网地址，再按 `local` 回退到回环或全部地址
fn candidate_addresses(config: &Config) -> Vec<IpAddr> {
    let mut candidates: Vec<IpAddr> = config.public_addresses().to_vec();
    let fallback = if config.local() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    if !candidates.contains(&fallback) {
        candidates.push(fallback);
    }
    candidates
}

fn bind_listener(config: &Config, port: u16) -> Result<TcpListener, Exception> {
    let mut last_error = None;
    for ip in candidate_addresses(config) {
        let addr = SocketAddr::new(ip, port);
        match try_bind(addr, config.max_connections()) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!("无法绑定{}：{}", addr, e);
                last_error = Some(e);
            }
        }
    }
    let message = match last_error {
        Some(e) => {
            match e.kind() {
                io::ErrorKind::AddrInUse => error!(
                    "端口{}已被占用。请关闭占用该端口的程序，或在配置文件中修改port",
                    port
                ),
                io::ErrorKind::PermissionDenied => error!(
                    "没有权限监听端口{}。请使用1024以上的端口，或以足够的权限运行",
                    port
                ),
                _ => error!("无法监听端口{}：{}", port, e),
            }
            e.to_string()
        }
        None => "no candidate address".to_string(),
    };
    Err(Exception::BindFailed(message))
}

fn try_bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    #[cfg(not(windows))]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        Config::new().with_port(0).with_local(true)
    }

    #[test]
    fn test_candidate_addresses() {
        let config = Config::new()
            .with_local(false)
            .with_public_addresses(vec!["192.0.2.10".parse().unwrap()]);
        assert_eq!(
            candidate_addresses(&config),
            vec![
                "192.0.2.10".parse::<IpAddr>().unwrap(),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            ]
        );
        assert_eq!(
            candidate_addresses(&Config::new().with_local(true)),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
    }

    #[tokio::test]
    async fn test_start_stop_and_restart() {
        let server = Server::new(test_config());
        server.routes().route("/ping", |ctx| {
            ctx.response.set_text("pong");
            Ok(())
        });

        let addr = server.start().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert!(server.is_listening().await);
        assert_eq!(server.start().await.unwrap(), addr);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /ping HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with(b"pong"));

        server.stop().await;
        assert!(!server.is_listening().await);
        assert_eq!(server.local_addr().await, None);

        server.start().await.unwrap();
        assert!(server.is_listening().await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_on_fixed_port() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let server = Server::new(test_config().with_port(port));

        for _ in 0..3 {
            let addr = server.start().await.unwrap();
            assert_eq!(addr.port(), port);
            server.stop().await;
            // 停止后端口立即可以被其他套接字占用
            let reuse = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
            drop(reuse);
        }

        // 重新绑定到同一端口同样先释放旧套接字
        server.start().await.unwrap();
        let addr = server.rebind(port).await.unwrap();
        assert_eq!(addr.port(), port);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let server = Server::new(test_config().with_port(port));

        let result = server.start().await;
        assert!(matches!(result, Err(Exception::BindFailed(_))));
        assert!(!server.is_listening().await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_health_check_rebinds() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let server = Server::new(test_config().with_port(port));
        assert!(server.start().await.is_err());

        drop(occupied);
        server.health_check().await;
        assert!(server.is_listening().await);
        assert_eq!(server.local_addr().await.map(|a| a.port()), Some(port));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_rebind_changes_port() {
        let server = Server::new(test_config());
        let first = server.start().await.unwrap();
        let second = server.rebind(0).await.unwrap();
        assert!(server.is_listening().await);
        assert_eq!(server.local_addr().await, Some(second));
        assert!(first.port() != 0 && second.port() != 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_serve_stream_respects_blacklist() {
        let server = Server::new(test_config().with_blacklist(vec!["10.0.0.*".to_string()]));
        server.routes().route("/", |ctx| {
            ctx.response.set_text("root");
            Ok(())
        });

        let (mut client, stream) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        server
            .serve_stream(stream, Some("10.0.0.7:5000".parse().unwrap()))
            .await;
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        let (mut client, stream) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        server
            .serve_stream(stream, Some("10.1.0.7:5000".parse().unwrap()))
            .await;
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.ends_with(b"root"));
        assert_eq!(server.active_sessions(), 0);
    }
}
