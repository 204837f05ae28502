// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了 WebAPI 在请求处理、监听与外发请求生命周期中可能出现的各类异常。
//!
//! ## 设计意图
//! - **错误分类**：协议解析错误、方法不允许、负载过大、资源缺失、处理器失败、
//!   序列化失败、端口绑定失败以及外发请求失败。
//! - **语义映射**：`status_code()` 将变体映射为对应的 HTTP 状态码，协议错误没有状态码
//!   （连接直接丢弃，不发送任何字节）。
//! - **日志友好**：`Display` 输出只用于日志，不会被写回客户端。

use std::{fmt, io};

/// 服务器处理请求过程中发生的异常类型。
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// 请求头部字节流不是合法的 UTF-8。
    RequestIsNotUtf8,
    /// 请求行为空，或者方法字段不是合法的 token。连接直接丢弃。
    MalformedRequest,
    /// 方法不是 OPTIONS/GET/POST 之一。对应 `405 Method Not Allowed`。
    UnSupportedRequestMethod,
    /// 请求或响应超出配置的缓冲区上限。对应 `413`。
    PayloadTooLarge,
    /// 路由与根处理器都不存在，或静态资源不存在。对应 `404 Not Found`。
    FileNotFound,
    /// 请求的路径非法或试图越出沙箱根目录。对应 `400 Bad Request`。
    InvalidPath,
    /// 已注册的处理器返回错误或发生 panic。对应 `500`。
    HandlerFailed(String),
    /// JSON 或 PNG 编码失败。响应会降级为纯文本错误描述。
    SerializationFailed(String),
    /// 监听端口绑定失败。记录日志后由健康检查重试。
    BindFailed(String),
    /// 外发 HTTP 请求在发送、传输或接收阶段失败。
    OutboundFailed(String),
    /// 配置文件无法读取或解析。
    ConfigInvalid(String),
    /// 连接中途的套接字读写错误。
    Io(String),
}

use Exception::*;

impl Exception {
    /// 该异常在线路上对应的状态码。协议错误与内部错误返回 `None`。
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UnSupportedRequestMethod => Some(405),
            PayloadTooLarge => Some(413),
            FileNotFound => Some(404),
            InvalidPath => Some(400),
            HandlerFailed(_) => Some(500),
            SerializationFailed(_) => Some(200),
            RequestIsNotUtf8 | MalformedRequest | BindFailed(_) | OutboundFailed(_)
            | ConfigInvalid(_) | Io(_) => None,
        }
    }

    /// 是否属于协议层错误（连接应被静默丢弃）。
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, RequestIsNotUtf8 | MalformedRequest)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            MalformedRequest => write!(f, "Malformed request line"),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            PayloadTooLarge => write!(f, "Payload too large (413)"),
            FileNotFound => write!(f, "File not found (404)"),
            InvalidPath => write!(f, "Invalid path (400)"),
            HandlerFailed(msg) => write!(f, "Handler failed: {}", msg),
            SerializationFailed(msg) => write!(f, "Serialization failed: {}", msg),
            BindFailed(msg) => write!(f, "Couldn't bind listener: {}", msg),
            OutboundFailed(msg) => write!(f, "Outbound request failed: {}", msg),
            ConfigInvalid(msg) => write!(f, "Invalid configuration: {}", msg),
            Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Exception {}

impl From<io::Error> for Exception {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::InvalidData => RequestIsNotUtf8,
            _ => Io(e.to_string()),
        }
    }
}
