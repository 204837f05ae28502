// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 负责将连接上读取到的请求头行解析为强类型的 `Request` 结构体：
//! 1. 请求行的解析（方法、URI，其余 token 忽略）。
//! 2. URI 的百分号解码与查询字符串拆分。
//! 3. 头部字段的收集，以及派生字段：`Content-Type`、`Content-Length`、
//!    压缩资格与文本编码协商。
//!
//! 请求体不在这里读取，由连接处理器在通过长度检查之后填充。

use crate::{exception::Exception, param::*};
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use log::{debug, error};
use percent_encoding::percent_decode_str;
use std::{collections::HashMap, net::SocketAddr};

/// 一个完整的 HTTP 请求。
#[derive(Debug, Clone)]
pub struct Request {
    /// 请求方法，仅 OPTIONS/GET/POST
    method: HttpRequestMethod,
    /// 原始 URI（未解码，含查询字符串）
    uri: String,
    /// 解码后的路径部分
    path: String,
    /// 解码后的查询参数，键唯一，后写入者覆盖
    query: HashMap<String, String>,
    /// 头部字段，键保持收到时的大小写
    headers: HashMap<String, String>,
    /// 请求体
    body: Bytes,
    /// 声明的 `Content-Length`，缺失或无法解析时为 0
    content_length: u64,
    /// `Content-Type` 头
    content_type: Option<String>,
    /// `Accept-Encoding` 是否包含 deflate
    accept_deflate: bool,
    /// 协商得到的文本编码
    encoding: &'static Encoding,
    /// 对端地址
    peer: Option<SocketAddr>,
}

/// 解析请求行，返回方法与原始 URI。
///
/// - 空行或方法字段不是合法 token：`MalformedRequest`，连接应被丢弃。
/// - 方法是合法 token 但不受支持：`UnSupportedRequestMethod`，应返回 405。
pub fn parse_request_line(line: &str, id: u128) -> Result<(HttpRequestMethod, String), Exception> {
    let mut parts = line.split_whitespace();
    let method_str = match parts.next() {
        Some(m) => m,
        None => {
            debug!("[ID{}]请求行为空", id);
            return Err(Exception::MalformedRequest);
        }
    };
    if !is_token(method_str) {
        error!("[ID{}]无法解析的方法字段：{:?}", id, method_str);
        return Err(Exception::MalformedRequest);
    }
    let method = match method_str.parse::<HttpRequestMethod>() {
        Ok(m) => m,
        Err(_) => {
            debug!("[ID{}]不支持的HTTP请求方法：{}", id, method_str);
            return Err(Exception::UnSupportedRequestMethod);
        }
    };
    // 剩余的 token（通常是协议版本）不参与处理
    match parts.next() {
        Some(uri) => Ok((method, uri.to_string())),
        None => {
            error!("[ID{}]请求行缺少URI：{}", id, line);
            Err(Exception::MalformedRequest)
        }
    }
}

/// RFC 9110 中的 tchar 集合
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
        })
}

/// 按 `Accept-Charset` 协商文本编码。
///
/// 默认取第一个可识别的编码；`last_wins` 为真时保留旧行为，取最后一个可识别的编码。
/// q 值与通配符 `*` 不参与排序。
pub fn negotiate_charset(value: &str, last_wins: bool) -> &'static Encoding {
    let mut chosen = None;
    for token in value.split(',') {
        let label = token.split(';').next().unwrap_or("").trim();
        if label.is_empty() || label == "*" {
            continue;
        }
        if let Some(encoding) = Encoding::for_label(label.as_bytes()) {
            chosen = Some(encoding);
            if !last_wins {
                break;
            }
        }
    }
    chosen.unwrap_or(UTF_8)
}

impl Request {
    /// 从完整的请求头字节（直到空行）构建 `Request`。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let request_string = match std::str::from_utf8(buffer) {
            Ok(string) => string,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };
        let lines: Vec<String> = request_string
            .split('\n')
            .map(|l| l.trim_end_matches('\r').to_string())
            .take_while(|l| !l.is_empty())
            .collect();
        Self::from_lines(&lines, id, false)
    }

    /// 从已经拆好的请求头行构建 `Request`，首行为请求行。
    pub fn from_lines(lines: &[String], id: u128, legacy_charset: bool) -> Result<Self, Exception> {
        let first = match lines.first() {
            Some(l) if !l.trim().is_empty() => l,
            _ => return Err(Exception::MalformedRequest),
        };
        let (method, uri) = parse_request_line(first, id)?;

        let (raw_path, raw_query) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (uri.as_str(), None),
        };
        let path = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();
        let mut query = HashMap::new();
        if let Some(q) = raw_query {
            for (key, value) in form_urlencoded::parse(q.as_bytes()) {
                query.insert(key.into_owned(), value.into_owned());
            }
        }

        let mut headers = HashMap::new();
        for line in &lines[1..] {
            match line.split_once(':') {
                Some((key, value)) => {
                    headers.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => debug!("[ID{}]忽略无法解析的头部行：{}", id, line),
            }
        }

        let mut request = Self {
            method,
            uri,
            path,
            query,
            headers,
            body: Bytes::new(),
            content_length: 0,
            content_type: None,
            accept_deflate: false,
            encoding: UTF_8,
            peer: None,
        };

        request.content_type = request.header_ignore_case("Content-Type").map(str::to_string);
        request.content_length = request
            .header_ignore_case("Content-Length")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        request.accept_deflate = request
            .header_ignore_case("Accept-Encoding")
            .map_or(false, |v| v.to_ascii_lowercase().contains("deflate"));
        if let Some(charset) = request.header_ignore_case("Accept-Charset") {
            request.encoding = negotiate_charset(charset, legacy_charset);
        }
        Ok(request)
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub(crate) fn set_peer(&mut self, peer: Option<SocketAddr>) {
        self.peer = peer;
    }
}

// --- Getter 访问器实现 ---

impl Request {
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    /// 原始 URI（含查询字符串，未解码）
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// 解码后的路径（不含查询字符串）
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// 按收到时的大小写精确查找头部
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// 忽略大小写查找头部
    pub fn header_ignore_case(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn accept_deflate(&self) -> bool {
        self.accept_deflate
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn origin(&self) -> Option<&str> {
        self.header_ignore_case("Origin")
    }

    pub fn user_agent(&self) -> &str {
        self.header_ignore_case("User-Agent").unwrap_or("")
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}
