// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use crate::{
    param::*,
    payload::{Bitmap, Payload},
};

use bytes::Bytes;
use chrono::prelude::*;
use flate2::{write::DeflateEncoder, Compression};
use log::{debug, warn};
use serde::Serialize;

use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::PathBuf,
};

/// 处理器可以修改的响应对象。
///
/// 负载、内容类型、缓存指令和文件名由 `Resolver` 与连接处理器在发送前统一转换成头部和字节。
#[derive(Debug, Clone)]
pub struct Response {
    status_code: u16,
    information: String,
    headers: BTreeMap<String, String>,
    data: Payload,
    content_type: Option<String>,
    compress: bool,
    /// 负数表示禁止缓存，正数为 max-age 秒数，0 表示不指定
    cache: i64,
    filename: Option<String>,
    date: DateTime<Utc>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status_code: 200,
            information: "OK".to_string(),
            headers: BTreeMap::new(),
            data: Payload::Empty,
            content_type: None,
            compress: false,
            cache: 0,
            filename: None,
            date: Utc::now(),
        }
    }

    /// 设置状态码与对应的原因短语。未知状态码使用通用短语。
    pub fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = match STATUS_CODES.get(&code) {
            Some(&info) => info.to_string(),
            None => {
                warn!("未知的状态码：{}，使用通用原因短语", code);
                match code {
                    200..=299 => "OK",
                    400..=499 => "Client Error",
                    500..=599 => "Server Error",
                    _ => "Unknown",
                }
                .to_string()
            }
        };
        self
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 仅在头部不存在时设置
    pub fn set_header_if_absent(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        if !self.headers.contains_key(key) {
            self.headers.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn remove_header(&mut self, key: &str) -> Option<String> {
        self.headers.remove(key)
    }

    pub fn set_data(&mut self, data: impl Into<Payload>) -> &mut Self {
        self.data = data.into();
        self
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.data = Payload::Text(text.into());
        self
    }

    pub fn set_bytes(&mut self, bytes: impl Into<Bytes>) -> &mut Self {
        self.data = Payload::Bytes(bytes.into());
        self
    }

    /// 将任意可序列化的值作为 JSON 负载。
    ///
    /// 转换失败时负载降级为错误描述文本，内容类型强制为 `text/plain`。
    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> &mut Self {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.data = Payload::Json(v);
            }
            Err(e) => {
                warn!("无法将处理器结果转换为JSON：{}，降级为纯文本", e);
                self.data = Payload::Text(e.to_string());
                self.content_type = Some(TEXT_PLAIN.to_string());
            }
        }
        self
    }

    pub fn set_image(&mut self, bitmap: Bitmap) -> &mut Self {
        self.data = Payload::Image(bitmap);
        self
    }

    pub fn set_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.data = Payload::StaticFile(path.into());
        self
    }

    pub fn set_directory(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.data = Payload::StaticDirectory(path.into());
        self
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// 由请求的 `Accept-Encoding` 决定，处理器不能修改
    pub(crate) fn set_compress(&mut self, compress: bool) -> &mut Self {
        self.compress = compress;
        self
    }

    pub fn set_cache(&mut self, cache: i64) -> &mut Self {
        self.cache = cache;
        self
    }

    pub fn set_filename(&mut self, filename: impl Into<String>) -> &mut Self {
        self.filename = Some(filename.into());
        self
    }

    pub(crate) fn set_date(&mut self) -> &mut Self {
        self.date = Utc::now();
        self
    }

    /// 状态行与全部头部，以空行结尾
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        head.push_str("HTTP/1.1 ");
        head.push_str(&self.status_code.to_string());
        head.push(' ');
        head.push_str(&self.information);
        head.push_str(CRLF);
        for (key, value) in &self.headers {
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str(CRLF);
        }
        head.push_str(CRLF);
        head.into_bytes()
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn cache(&self) -> i64 {
        self.cache
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn date(&self) -> &DateTime<Utc> {
        &self.date
    }
}

/// IMF-fixdate 格式，例如 `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// 原始 deflate 压缩
pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    debug!(
        "压缩完成: 原始大小: {} bytes, 压缩后: {} bytes",
        data.len(),
        compressed.len()
    );
    Ok(compressed)
}
