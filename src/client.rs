// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 外发请求模块
//!
//! `OutboundManager` 持有一个共享的 `reqwest::Client`，每次调用 `begin_request`
//! 派生一个任务：构造请求 → 发送回调 → 发送观察者 → 发出请求并读完响应体 →
//! 接收回调 → 接收观察者。调用方状态随任务结束被释放且只释放一次。
//!
//! 所有失败（非法 URI、传输错误、回调 panic）都只记录日志，不重试；
//! 传输失败时接收回调不会被调用。

use std::{
    collections::{hash_map::Entry, HashMap},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, RwLock},
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error, warn};
use reqwest::{header::HeaderMap, Client};
use tokio::{runtime::Handle, task::JoinHandle};

pub use reqwest::Method;

use crate::{config::Config, exception::Exception};

/// 发送前观察者
pub type SendObserver = Arc<dyn Fn(&OutboundRequest) + Send + Sync>;
/// 接收后观察者
pub type ReceiveObserver = Arc<dyn Fn(&OutboundResponse) + Send + Sync>;

/// 可由发送回调修改的外发请求
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    /// 覆盖客户端默认的超时
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: Method::GET,
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }
}

/// 读完响应体之后的外发响应
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl OutboundResponse {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Default)]
struct Observers {
    send: RwLock<Option<SendObserver>>,
    receive: RwLock<Option<ReceiveObserver>>,
}

impl Observers {
    fn on_send(&self) -> Option<SendObserver> {
        match self.send.read() {
            Ok(lock) => lock.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn on_receive(&self) -> Option<ReceiveObserver> {
        match self.receive.read() {
            Ok(lock) => lock.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct OutboundManager {
    client: Client,
    observers: Arc<Observers>,
    runtime: Handle,
}

impl OutboundManager {
    /// 构造共享客户端：固定 User-Agent，禁用代理，使用配置的超时。
    ///
    /// 必须在 tokio 运行时内调用；之后的请求任务都派生到该运行时上，
    /// `begin_request` 可以从任意线程调用。
    pub fn new(config: &Config) -> Result<Self, Exception> {
        let runtime = Handle::try_current().map_err(|e| {
            error!("外发请求管理器需要在tokio运行时内创建：{}", e);
            Exception::OutboundFailed(e.to_string())
        })?;
        let client = Client::builder()
            .no_proxy()
            .user_agent(config.product())
            .timeout(Duration::from_secs(config.outbound_timeout()))
            .build()
            .map_err(|e| {
                error!("无法初始化HTTP客户端：{}", e);
                Exception::OutboundFailed(e.to_string())
            })?;
        Ok(Self {
            client,
            observers: Arc::new(Observers::default()),
            runtime,
        })
    }

    pub fn set_send_observer(&self, observer: Option<SendObserver>) {
        let mut slot = match self.observers.send.write() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = observer;
    }

    pub fn set_receive_observer(&self, observer: Option<ReceiveObserver>) {
        let mut slot = match self.observers.receive.write() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = observer;
    }

    /// 发起一次异步外发请求。
    ///
    /// `send` 可以修改请求（方法、头部、请求体），`receive` 拿到完整响应与调用方状态。
    pub fn begin_request<S, FS, FR>(&self, uri: &str, state: S, send: FS, receive: FR) -> OutboundHandle
    where
        S: Send + 'static,
        FS: FnOnce(&mut OutboundRequest, &S) + Send + 'static,
        FR: FnOnce(OutboundResponse, S) + Send + 'static,
    {
        let client = self.client.clone();
        let observers = Arc::clone(&self.observers);
        let uri = uri.to_string();
        let handle = self.runtime.spawn(async move {
            let result = perform(client, observers, &uri, state, send, receive).await;
            if let Err(e) = &result {
                error!("外发请求{}失败：{}", uri, e);
            }
            result
        });
        OutboundHandle { handle }
    }
}

async fn perform<S, FS, FR>(
    client: Client,
    observers: Arc<Observers>,
    uri: &str,
    state: S,
    send: FS,
    receive: FR,
) -> Result<(), Exception>
where
    FS: FnOnce(&mut OutboundRequest, &S),
    FR: FnOnce(OutboundResponse, S),
{
    let mut request = OutboundRequest::get(uri);
    if panic::catch_unwind(AssertUnwindSafe(|| send(&mut request, &state))).is_err() {
        return Err(Exception::OutboundFailed("send callback panicked".to_string()));
    }
    if let Some(observer) = observers.on_send() {
        if panic::catch_unwind(AssertUnwindSafe(|| observer(&request))).is_err() {
            warn!("外发请求的发送观察者发生panic，已忽略");
        }
    }

    debug!("外发请求：{} {}", request.method, request.url);
    let mut builder = client.request(request.method.clone(), request.url.as_str());
    for (key, value) in &request.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    if let Some(body) = request.body.take() {
        builder = builder.body(body);
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| Exception::OutboundFailed(e.to_string()))?;
    let status = response.status().as_u16();
    let url = response.url().to_string();
    let headers = collect_headers(response.headers());
    let body = response
        .bytes()
        .await
        .map_err(|e| Exception::OutboundFailed(e.to_string()))?;
    debug!("外发请求{}返回{}，{}字节", url, status, body.len());

    let response = OutboundResponse {
        status,
        url,
        headers,
        body,
    };
    let observed = observers.on_receive().map(|o| (o, response.clone()));
    if panic::catch_unwind(AssertUnwindSafe(move || receive(response, state))).is_err() {
        error!("外发请求的接收回调发生panic");
    }
    if let Some((observer, response)) = observed {
        if panic::catch_unwind(AssertUnwindSafe(|| observer(&response))).is_err() {
            warn!("外发请求的接收观察者发生panic，已忽略");
        }
    }
    Ok(())
}

/// 同名头部（如 `Set-Cookie`）按出现顺序以 `, ` 连接
fn collect_headers(map: &HeaderMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (key, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes());
        match headers.entry(key.as_str().to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.push_str(", ");
                existing.push_str(&value);
            }
            Entry::Vacant(entry) => {
                entry.insert(value.into_owned());
            }
        }
    }
    headers
}

/// 进行中的外发请求
pub struct OutboundHandle {
    handle: JoinHandle<Result<(), Exception>>,
}

impl OutboundHandle {
    /// 中止请求，调用方状态随任务一起释放
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<(), Exception> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Exception::OutboundFailed("cancelled".to_string())),
            Err(e) => Err(Exception::OutboundFailed(e.to_string())),
        }
    }
}
