// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 协议参数与常量模块
//!
//! 该模块定义了 WebAPI 遵循的 HTTP 协议相关常量和数据结构，包括：
//! - 常见的 HTTP 状态码及其原因短语（Reason Phrase）。
//! - MIME 类型映射表，以及基于它的文本类型判断与反查扩展名。
//! - 受支持的 HTTP 方法枚举。

use lazy_static::lazy_static;
use std::{collections::HashMap, fmt, str::FromStr};

/// HTTP 协议规定的换行符（Carriage Return Line Feed）
pub const CRLF: &str = "\r\n";

/// 405 响应以及 CORS 预检中通告的方法列表
pub const ALLOW_HEADER_VALUE: &str = "OPTIONS, GET, POST";

/// 目录请求时优先尝试的首页文件名
pub const HTML_INDEX: &str = "index.html";

/// 无法识别类型时使用的兜底 MIME
pub const OCTET_STREAM: &str = "application/octet-stream";

/// 纯文本负载的默认 MIME
pub const TEXT_PLAIN: &str = "text/plain";

/// JSON 负载的 MIME
pub const APPLICATION_JSON: &str = "application/json";

lazy_static! {
    /// HTTP 状态码与其对应的原因短语映射表。
    pub static ref STATUS_CODES: HashMap<u16, &'static str> = {
        let mut map = HashMap::new();
        map.insert(100, "Continue");
        map.insert(101, "Switching Protocols");

        map.insert(200, "OK");
        map.insert(201, "Created");
        map.insert(202, "Accepted");
        map.insert(203, "Non-Authoritative Information");
        map.insert(204, "No Content");
        map.insert(205, "Reset Content");
        map.insert(206, "Partial Content");

        map.insert(300, "Multiple Choices");
        map.insert(301, "Moved Permanently");
        map.insert(302, "Found");
        map.insert(303, "See Other");
        map.insert(304, "Not Modified");
        map.insert(307, "Temporary Redirect");
        map.insert(308, "Permanent Redirect");

        map.insert(400, "Bad Request");
        map.insert(401, "Unauthorized");
        map.insert(402, "Payment Required");
        map.insert(403, "Forbidden");
        map.insert(404, "Not Found");
        map.insert(405, "Method Not Allowed");
        map.insert(406, "Not Acceptable");
        map.insert(408, "Request Timeout");
        map.insert(409, "Conflict");
        map.insert(410, "Gone");
        map.insert(411, "Length Required");
        map.insert(412, "Precondition Failed");
        map.insert(413, "Request Entity Too Large");
        map.insert(414, "URI Too Long");
        map.insert(415, "Unsupported Media Type");
        map.insert(416, "Range Not Satisfiable");
        map.insert(417, "Expectation Failed");
        map.insert(418, "I'm a teapot");
        map.insert(422, "Unprocessable Content");
        map.insert(426, "Upgrade Required");
        map.insert(429, "Too Many Requests");

        map.insert(500, "Internal Server Error");
        map.insert(501, "Not Implemented");
        map.insert(502, "Bad Gateway");
        map.insert(503, "Service Unavailable");
        map.insert(504, "Gateway Timeout");
        map.insert(505, "HTTP Version Not Supported");
        map
    };
}

lazy_static! {
    /// 文件后缀名到 MIME 类型的映射表。
    pub static ref MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("aac", "audio/aac");
        map.insert("avi", "video/x-msvideo");
        map.insert("avif", "image/avif");
        map.insert("bin", OCTET_STREAM);
        map.insert("bmp", "image/bmp");
        map.insert("bz2", "application/x-bzip2");
        map.insert("css", "text/css;charset=utf-8");
        map.insert("csv", "text/csv");
        map.insert("doc", "application/msword");
        map.insert(
            "docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        );
        map.insert("epub", "application/epub+zip");
        map.insert("gif", "image/gif");
        map.insert("gz", "application/gzip");
        map.insert("htm", "text/html;charset=utf-8");
        map.insert("html", "text/html;charset=utf-8");
        map.insert("ico", "image/x-icon");
        map.insert("ics", "text/calendar");
        map.insert("jar", "application/java-archive");
        map.insert("js", "text/javascript;charset=utf-8");
        map.insert("json", APPLICATION_JSON);
        map.insert("jsonld", "application/ld+json");
        map.insert("jpg", "image/jpeg");
        map.insert("jpeg", "image/jpeg");
        map.insert("md", "text/markdown");
        map.insert("mjs", "text/javascript");
        map.insert("mp3", "audio/mpeg");
        map.insert("mp4", "video/mp4");
        map.insert("mpeg", "video/mpeg");
        map.insert("oga", "audio/ogg");
        map.insert("ogv", "video/ogg");
        map.insert("otf", "font/otf");
        map.insert("pdf", "application/pdf");
        map.insert("png", "image/png");
        map.insert("rar", "application/x-rar-compressed");
        map.insert("rtf", "application/rtf");
        map.insert("sh", "application/x-sh");
        map.insert("svg", "image/svg+xml");
        map.insert("tar", "application/x-tar");
        map.insert("tif", "image/tiff");
        map.insert("tiff", "image/tiff");
        map.insert("txt", TEXT_PLAIN);
        map.insert("ttf", "font/ttf");
        map.insert("wav", "audio/wav");
        map.insert("wasm", "application/wasm");
        map.insert("webm", "video/webm");
        map.insert("webp", "image/webp");
        map.insert("woff", "font/woff");
        map.insert("woff2", "font/woff2");
        map.insert("xhtml", "application/xhtml+xml");
        map.insert("xml", "text/xml");
        map.insert("zip", "application/zip");
        map.insert("7z", "application/x-7z-compressed");
        map
    };
}

/// 反查扩展名时优先使用的映射，避免 `htm`/`html` 之类的歧义。
const PREFERRED_EXTENSIONS: [(&str, &str); 8] = [
    (TEXT_PLAIN, "txt"),
    ("text/html", "html"),
    (APPLICATION_JSON, "json"),
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("text/javascript", "js"),
    ("image/tiff", "tif"),
    (OCTET_STREAM, "bin"),
];

/// 非 `text/*` 但仍按文本处理的类型
const TEXTUAL_APPLICATION_TYPES: [&str; 6] = [
    APPLICATION_JSON,
    "application/ld+json",
    "application/javascript",
    "application/xml",
    "application/xhtml+xml",
    "image/svg+xml",
];

/// 去掉 `;charset=...` 等参数，返回小写的主类型。
pub fn base_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// 是否为常见的文本类型。
pub fn is_text_mime(content_type: &str) -> bool {
    let base = base_mime(content_type);
    base.starts_with("text/") || TEXTUAL_APPLICATION_TYPES.contains(&base.as_str())
}

/// 是否为已知的（表中出现过的）类型。
pub fn is_known_mime(content_type: &str) -> bool {
    let base = base_mime(content_type);
    if base.is_empty() {
        return false;
    }
    is_text_mime(&base) || MIME_TYPES.values().any(|v| base_mime(v) == base)
}

/// 由扩展名查找 MIME 类型，未知扩展名返回 `application/octet-stream`。
pub fn mime_for_extension(extension: &str) -> &'static str {
    MIME_TYPES
        .get(extension.to_ascii_lowercase().as_str())
        .copied()
        .unwrap_or(OCTET_STREAM)
}

/// 由 MIME 类型反查规范扩展名。
pub fn extension_for(content_type: &str) -> &'static str {
    let base = base_mime(content_type);
    if let Some((_, ext)) = PREFERRED_EXTENSIONS.iter().find(|(m, _)| *m == base) {
        return ext;
    }
    let mut candidates: Vec<&'static str> = MIME_TYPES
        .iter()
        .filter(|(_, v)| base_mime(v) == base)
        .map(|(k, _)| *k)
        .collect();
    // HashMap 迭代顺序不稳定，排序保证同一类型总是得到同一扩展名
    candidates.sort_unstable();
    candidates.first().copied().unwrap_or("bin")
}

/// 受支持的 HTTP 请求方法。其他方法在生成 `Request` 之前即被拒绝。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRequestMethod {
    /// CORS 预检
    Options,
    /// 获取资源
    Get,
    /// 提交数据
    Post,
}

impl FromStr for HttpRequestMethod {
    type Err = ();

    /// 方法名区分大小写，只接受标准大写形式。
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPTIONS" => Ok(HttpRequestMethod::Options),
            "GET" => Ok(HttpRequestMethod::Get),
            "POST" => Ok(HttpRequestMethod::Post),
            _ => Err(()),
        }
    }
}

impl fmt::Display for HttpRequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpRequestMethod::Options => write!(f, "OPTIONS"),
            HttpRequestMethod::Get => write!(f, "GET"),
            HttpRequestMethod::Post => write!(f, "POST"),
        }
    }
}
