// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 连接处理模块
//!
//! 一个会话只处理一次请求/响应周期：
//! 读取请求头 → 解析 → OPTIONS 预检 / 长度检查 → 路由 → 读取请求体 → 调用处理器 →
//! 观察者回调 → 解析负载 → 压缩 → 补全头部 → 发送 → 释放会话。
//!
//! 任何分支都是终止的。协议错误直接丢弃连接，不发送任何字节。

use std::{
    any::Any,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, RwLock},
    time::Instant,
};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    config::Config,
    context::Context,
    exception::Exception,
    guard::{MimeLookup, PathSandbox},
    param::*,
    request::Request,
    resolver::Resolver,
    response::{deflate, format_date, Response},
    router::RouteRegistry,
    session::ClientSession,
};

/// 请求处理完成后的观察者，只能读取上下文
pub type Observer = Arc<dyn Fn(&Context) + Send + Sync>;

/// 预检响应在客户端未声明所需头部时通告的默认值
const DEFAULT_ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// 连接处理所需的共享状态
pub struct Service {
    config: Config,
    routes: Arc<RouteRegistry>,
    resolver: Resolver,
    observer: RwLock<Option<Observer>>,
}

impl Service {
    pub fn new(config: Config, routes: Arc<RouteRegistry>, resolver: Resolver) -> Self {
        Self {
            config,
            routes,
            resolver,
            observer: RwLock::new(None),
        }
    }

    pub fn with_collaborators(
        config: Config,
        routes: Arc<RouteRegistry>,
        sandbox: Arc<dyn PathSandbox>,
        mime: Arc<dyn MimeLookup>,
    ) -> Self {
        let resolver = Resolver::new(&config, sandbox, mime);
        Self::new(config, routes, resolver)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn set_observer(&self, observer: Option<Observer>) {
        let mut slot = match self.observer.write() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = observer;
    }

    fn observer(&self) -> Option<Observer> {
        match self.observer.read() {
            Ok(lock) => lock.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// 在任意双向字节流上完成一次请求/响应周期，结束后总是释放会话。
pub async fn handle_connection<S>(service: &Service, stream: S, peer: Option<SocketAddr>, id: u128)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut session = ClientSession::new(stream, id, peer);
    match serve(service, &mut session, started).await {
        Ok(()) => {}
        Err(e) if e.is_protocol_error() => debug!("[ID{}]{}，丢弃连接", id, e),
        Err(e) => warn!("[ID{}]连接处理中断：{}", id, e),
    }
    session.dispose().await;
}

async fn serve<S>(
    service: &Service,
    session: &mut ClientSession<S>,
    started: Instant,
) -> Result<(), Exception>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = session.id();
    let config = &service.config;

    let lines = match session.read_head(config.max_receive_size()).await {
        Ok(lines) => lines,
        Err(Exception::PayloadTooLarge) => {
            let mut response = Response::new();
            response.set_code(413);
            return send_error(config, session, response, ("-", "-", ""), started).await;
        }
        Err(e) => return Err(e),
    };
    let first = match lines.first() {
        Some(line) => line.clone(),
        None => return Err(Exception::MalformedRequest),
    };
    debug!("[ID{}]请求行：{}", id, first);

    let mut request = match Request::from_lines(&lines, id, config.legacy_charset_negotiation()) {
        Ok(request) => request,
        Err(Exception::UnSupportedRequestMethod) => {
            let mut parts = first.split_whitespace();
            let method = parts.next().unwrap_or("-");
            let uri = parts.next().unwrap_or("-");
            let mut response = Response::new();
            response.set_code(405).set_header("Allow", ALLOW_HEADER_VALUE);
            return send_error(config, session, response, (method, uri, ""), started).await;
        }
        Err(e) => return Err(e),
    };
    request.set_peer(session.peer());

    if request.method() == HttpRequestMethod::Options {
        let mut response = preflight(&request);
        finalize(&mut response, 0, config);
        session.send(&response.head_bytes()).await?;
        access_log(id, &request, &response, started);
        return Ok(());
    }

    if request.content_length() > config.max_receive_size() {
        warn!(
            "[ID{}]声明的请求体长度{}超过上限{}",
            id,
            request.content_length(),
            config.max_receive_size()
        );
        let mut response = Response::new();
        response.set_code(413);
        return send_error(config, session, response, labels(&request), started).await;
    }

    let handler = match service.routes.resolve(request.path()) {
        Some(handler) => handler,
        None => {
            debug!("[ID{}]没有匹配的路由，也没有根处理器：{}", id, request.path());
            let mut response = Response::new();
            response.set_code(404);
            return send_error(config, session, response, labels(&request), started).await;
        }
    };

    let body = session.read_body(request.content_length()).await?;
    request.set_body(body);

    let mut ctx = Context::new(id, request);
    match panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx))) {
        Ok(Ok(())) => {}
        Ok(Err(Exception::PayloadTooLarge)) => {
            warn!("[ID{}]处理器报告负载过大", id);
            ctx.response.set_code(413);
        }
        Ok(Err(e)) => {
            error!("[ID{}]处理器返回错误：{}", id, e);
            ctx.response.set_code(500);
        }
        Err(payload) => {
            error!("[ID{}]处理器发生panic：{}", id, panic_message(payload.as_ref()));
            ctx.response.set_code(500);
        }
    }

    if let Some(observer) = service.observer() {
        if panic::catch_unwind(AssertUnwindSafe(|| observer(&ctx))).is_err() {
            warn!("[ID{}]请求观察者发生panic，已忽略", id);
        }
    }

    let Context {
        request,
        mut response,
        ..
    } = ctx;

    if response.is_error() {
        return send_error(config, session, response, labels(&request), started).await;
    }

    let resolved = match service.resolver.resolve(&response, request.encoding(), id) {
        Ok(resolved) => resolved,
        Err(e) => {
            let code = e.status_code().filter(|c| *c >= 400).unwrap_or(500);
            debug!("[ID{}]解析响应负载失败：{}，返回{}", id, e, code);
            response.set_code(code);
            return send_error(config, session, response, labels(&request), started).await;
        }
    };

    let mut body = resolved.body.clone();
    if response.compress() && !body.is_empty() {
        match deflate(&body) {
            Ok(compressed) => {
                body = Bytes::from(compressed);
                response.set_header("Content-Encoding", "deflate");
            }
            Err(e) => warn!("[ID{}]压缩失败，发送未压缩内容：{}", id, e),
        }
    }

    if let Some(content_type) = &resolved.content_type {
        response.set_header_if_absent("Content-Type", content_type.clone());
    }
    if let Some(origin) = request.origin() {
        response.set_header("Access-Control-Allow-Origin", origin);
    }
    response.set_header_if_absent("Vary", "Accept-Encoding");
    match response.cache() {
        c if c < 0 => {
            response
                .set_header("Cache-Control", "no-cache, no-store, must-revalidate")
                .set_header("Pragma", "no-cache");
        }
        c if c > 0 => {
            response.set_header("Cache-Control", format!("max-age={}", c));
        }
        _ => {}
    }
    if let Some(filename) = &resolved.filename {
        let disposition = if resolved.is_inline() {
            "inline"
        } else {
            "attachment"
        };
        response.set_header(
            "Content-Disposition",
            format!("{}; filename=\"{}\"", disposition, filename.replace('"', "")),
        );
    }
    response.set_header_if_absent("Connection", "close");
    finalize(&mut response, body.len(), config);

    session.send(&response.head_bytes()).await?;
    if !body.is_empty() {
        session.send(&body).await?;
    }
    access_log(id, &request, &response, started);
    Ok(())
}

/// CORS 预检响应
fn preflight(request: &Request) -> Response {
    let mut response = Response::new();
    response
        .set_header("Access-Control-Allow-Methods", ALLOW_HEADER_VALUE)
        .set_header(
            "Access-Control-Allow-Headers",
            request
                .header_ignore_case("Access-Control-Request-Headers")
                .unwrap_or(DEFAULT_ALLOW_HEADERS),
        )
        .set_header("Access-Control-Allow-Origin", request.origin().unwrap_or("*"))
        .set_header("Vary", "Origin")
        .set_header("Keep-Alive", "timeout=5")
        .set_header("Connection", "keep-alive");
    response
}

/// 错误响应只发送状态行与头部
async fn send_error<S>(
    config: &Config,
    session: &mut ClientSession<S>,
    mut response: Response,
    labels: (&str, &str, &str),
    started: Instant,
) -> Result<(), Exception>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    response.set_header("Connection", "close");
    finalize(&mut response, 0, config);
    session.send(&response.head_bytes()).await?;
    let (method, path, user_agent) = labels;
    log_line(session.id(), method, path, &response, user_agent, started);
    Ok(())
}

/// 每个响应都携带 `Date`、`Server` 与 `Content-Length`
fn finalize(response: &mut Response, content_length: usize, config: &Config) {
    response.set_date();
    let date = format_date(response.date());
    response
        .set_header("Date", date)
        .set_header("Server", config.product())
        .set_header("Content-Length", content_length.to_string());
}

fn labels(request: &Request) -> (&str, &str, &str) {
    (
        match request.method() {
            HttpRequestMethod::Options => "OPTIONS",
            HttpRequestMethod::Get => "GET",
            HttpRequestMethod::Post => "POST",
        },
        request.path(),
        request.user_agent(),
    )
}

fn access_log(id: u128, request: &Request, response: &Response, started: Instant) {
    let (method, path, user_agent) = labels(request);
    log_line(id, method, path, response, user_agent, started);
}

fn log_line(
    id: u128,
    method: &str,
    path: &str,
    response: &Response,
    user_agent: &str,
    started: Instant,
) {
    info!(
        "[ID{}]{} {} {} {} \"{}\" {}ms",
        id,
        method,
        path,
        response.status_code(),
        response.information(),
        user_agent,
        started.elapsed().as_millis()
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
