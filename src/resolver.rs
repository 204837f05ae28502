// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 响应解析模块
//!
//! 把处理器写入的 `Payload` 转换为最终发送的字节、内容类型与文件名。
//! 静态文件通过 `FileCache` 读取，目录在没有首页时可以生成文件列表。

use std::{
    fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use log::{debug, error, warn};
use sha2::{Digest, Sha256};

use crate::{
    cache::FileCache,
    config::Config,
    exception::Exception,
    guard::{MimeLookup, PathSandbox},
    json::to_spaced_vec,
    param::*,
    payload::{Bitmap, Payload},
    response::Response,
    util::HtmlBuilder,
};

/// 单个缓存条目的大小上限
const CACHE_ENTRY_LIMIT: u64 = 4 * 1024 * 1024;

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// 内容是否为文本
    pub text: bool,
    pub filename: Option<String>,
}

impl Resolved {
    fn new(body: impl Into<Bytes>, content_type: Option<String>) -> Self {
        let text = content_type.as_deref().map_or(false, is_text_mime);
        Self {
            body: body.into(),
            content_type,
            text,
            filename: None,
        }
    }

    /// 文本或图片以内联方式展示，其余类型作为附件
    pub fn is_inline(&self) -> bool {
        self.text
            || self
                .content_type
                .as_deref()
                .map_or(false, |ct| base_mime(ct).starts_with("image/"))
    }
}

pub struct Resolver {
    www_root: PathBuf,
    directory_index: bool,
    max_send_size: u64,
    sandbox: Arc<dyn PathSandbox>,
    mime: Arc<dyn MimeLookup>,
    cache: Mutex<FileCache>,
}

impl Resolver {
    pub fn new(config: &Config, sandbox: Arc<dyn PathSandbox>, mime: Arc<dyn MimeLookup>) -> Self {
        Self {
            www_root: PathBuf::from(config.www_root()),
            directory_index: config.directory_index(),
            max_send_size: config.max_send_size(),
            sandbox,
            mime,
            cache: Mutex::new(FileCache::from_capacity(
                config.cache_size(),
                CACHE_ENTRY_LIMIT.min(config.max_send_size()),
            )),
        }
    }

    pub fn www_root(&self) -> &Path {
        &self.www_root
    }

    /// 把响应负载转换为字节。
    ///
    /// 返回 `FileNotFound`、`InvalidPath` 或 `PayloadTooLarge` 时，调用方应改发对应的错误状态码。
    pub fn resolve(
        &self,
        response: &Response,
        encoding: &'static Encoding,
        id: u128,
    ) -> Result<Resolved, Exception> {
        let mut resolved = match response.data() {
            Payload::Empty => Resolved::new(Bytes::new(), response.content_type().map(str::to_string)),
            Payload::Bytes(bytes) => {
                let content_type = response.content_type().unwrap_or(OCTET_STREAM).to_string();
                Resolved::new(bytes.clone(), Some(content_type))
            }
            Payload::Text(text) => resolve_text(text, response.content_type(), encoding),
            Payload::Json(value) => match to_spaced_vec(value) {
                Ok(body) => Resolved::new(body, Some(APPLICATION_JSON.to_string())),
                Err(e) => {
                    warn!("[ID{}]JSON序列化失败：{}，降级为纯文本", id, e);
                    Resolved::new(e.to_string(), Some(TEXT_PLAIN.to_string()))
                }
            },
            Payload::Image(bitmap) => match encode_png_with_retry(bitmap, self.max_send_size, id) {
                Ok(body) => Resolved::new(body, Some("image/png".to_string())),
                Err(e) => {
                    error!("[ID{}]{}", id, e);
                    Resolved::new(e.to_string(), Some(TEXT_PLAIN.to_string()))
                }
            },
            Payload::StaticFile(path) => {
                if path.is_dir() {
                    self.resolve_directory(path, None, id)?
                } else {
                    self.resolve_file(path, response.content_type(), id)?
                }
            }
            Payload::StaticDirectory(dir) => self.resolve_directory(dir, response.filename(), id)?,
        };

        // 目录负载中的文件名用于定位文件，这里不再覆盖
        if !matches!(response.data(), Payload::StaticDirectory(_)) {
            if let Some(name) = response.filename() {
                resolved.filename = Some(name.to_string());
            }
        }
        if resolved.filename.is_none() && !resolved.body.is_empty() {
            resolved.filename = Some(hashed_filename(&resolved.body, resolved.content_type.as_deref()));
        }
        if resolved.body.len() as u64 > self.max_send_size {
            warn!(
                "[ID{}]响应体大小{}超过发送上限{}",
                id,
                resolved.body.len(),
                self.max_send_size
            );
            return Err(Exception::PayloadTooLarge);
        }
        Ok(resolved)
    }

    fn resolve_directory(
        &self,
        dir: &Path,
        filename: Option<&str>,
        id: u128,
    ) -> Result<Resolved, Exception> {
        if let Some(name) = filename {
            let target = match self.sandbox.resolve(dir, name) {
                Some(p) => p,
                None => {
                    warn!("[ID{}]目录内文件名非法：{}", id, name);
                    return Err(Exception::InvalidPath);
                }
            };
            if target.is_file() {
                return self.resolve_file(&target, None, id);
            }
            // 指定的文件不存在时继续尝试首页与目录列表
            debug!("[ID{}]目录内文件{}不存在，回退到首页", id, name);
        }
        if !dir.is_dir() {
            debug!("[ID{}]目录不存在：{}", id, dir.display());
            return Err(Exception::FileNotFound);
        }
        let index = dir.join(HTML_INDEX);
        if index.is_file() {
            return self.resolve_file(&index, None, id);
        }
        if !self.directory_index {
            debug!("[ID{}]目录{}没有首页且未开启目录列表", id, dir.display());
            return Err(Exception::FileNotFound);
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        let url_path = self.url_path(dir);
        let show_parent = url_path != "/";
        debug!("[ID{}]生成目录列表：{}", id, url_path);
        let html = HtmlBuilder::from_dir(&url_path, &mut entries, show_parent).build();
        Ok(Resolved::new(html, Some(mime_for_extension("html").to_string())))
    }

    fn resolve_file(
        &self,
        path: &Path,
        content_type: Option<&str>,
        id: u128,
    ) -> Result<Resolved, Exception> {
        let metadata = match fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            _ => {
                debug!("[ID{}]文件不存在：{}", id, path.display());
                return Err(Exception::FileNotFound);
            }
        };
        let file_size = metadata.len();
        if file_size > self.max_send_size {
            warn!(
                "[ID{}]文件{}大小{}超过发送上限{}",
                id,
                path.display(),
                file_size,
                self.max_send_size
            );
            return Err(Exception::PayloadTooLarge);
        }

        let body = match metadata.modified() {
            Ok(modified) => {
                let mut cache_lock = match self.cache.lock() {
                    Ok(lock) => lock,
                    Err(poisoned) => {
                        warn!("[ID{}]缓存锁被污染，恢复并继续", id);
                        poisoned.into_inner()
                    }
                };
                match cache_lock.find(path, modified) {
                    Some(bytes) => {
                        debug!("[ID{}]缓存命中：{}", id, path.display());
                        bytes
                    }
                    None => {
                        let bytes = Bytes::from(fs::read(path)?);
                        if cache_lock.push(path, bytes.clone(), modified) {
                            debug!("[ID{}]已缓存：{}", id, path.display());
                        }
                        bytes
                    }
                }
            }
            // 不支持修改时间的文件系统上不使用缓存
            Err(_) => Bytes::from(fs::read(path)?),
        };

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let content_type = match content_type {
            Some(ct) => ct.to_string(),
            None => self.mime.mime_for(extension),
        };
        let mut resolved = Resolved::new(body, Some(content_type));
        resolved.filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Ok(resolved)
    }

    /// 目录相对于网站根目录的 URL 路径
    fn url_path(&self, dir: &Path) -> String {
        let relative = match dir.strip_prefix(&self.www_root) {
            Ok(r) => Some(r.to_path_buf()),
            Err(_) => match (dir.canonicalize(), self.www_root.canonicalize()) {
                (Ok(d), Ok(r)) => d.strip_prefix(&r).ok().map(Path::to_path_buf),
                _ => None,
            },
        };
        let segments: Vec<String> = relative
            .iter()
            .flat_map(|r| r.components())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", segments.join("/"))
    }
}

fn resolve_text(text: &str, content_type: Option<&str>, encoding: &'static Encoding) -> Resolved {
    let (bytes, actual, _) = encoding.encode(text);
    let base = match content_type {
        Some(ct) if is_known_mime(ct) => ct.to_string(),
        _ => TEXT_PLAIN.to_string(),
    };
    let content_type = if actual == UTF_8 {
        base
    } else {
        format!("{};charset={}", base_mime(&base), actual.name().to_ascii_lowercase())
    };
    let mut resolved = Resolved::new(bytes.into_owned(), Some(content_type));
    resolved.text = true;
    resolved
}

fn encode_png(bitmap: &Bitmap) -> Result<Vec<u8>, png::EncodingError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, bitmap.width, bitmap.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&bitmap.pixels)?;
        writer.finish()?;
    }
    Ok(out)
}

/// 编码失败时对规范化后的副本重试一次。
///
/// 像素缓冲区按尺寸计算超过 `limit` 字节（或计算溢出）时不尝试编码。
fn encode_png_with_retry(bitmap: &Bitmap, limit: u64, id: u128) -> Result<Vec<u8>, Exception> {
    match bitmap.normalized_len() {
        Some(len) if len <= limit => {}
        _ => {
            warn!(
                "[ID{}]位图尺寸{}x{}超出发送上限{}，放弃编码",
                id, bitmap.width, bitmap.height, limit
            );
            return Err(Exception::SerializationFailed(format!(
                "bitmap {}x{} exceeds {} bytes",
                bitmap.width, bitmap.height, limit
            )));
        }
    }
    match guarded_encode(bitmap) {
        Ok(bytes) => Ok(bytes),
        Err(first) => {
            warn!("[ID{}]PNG编码失败：{}，规范化后重试", id, first);
            guarded_encode(&bitmap.normalized())
                .map_err(|e| Exception::SerializationFailed(format!("PNG encoding failed: {}", e)))
        }
    }
}

/// 编码器内部的 panic 按编码失败处理
fn guarded_encode(bitmap: &Bitmap) -> Result<Vec<u8>, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| encode_png(bitmap))) {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("encoder panicked".to_string()),
    }
}

/// `<sha256 前 16 位十六进制>.<扩展名>`
pub fn hashed_filename(body: &[u8], content_type: Option<&str>) -> String {
    let digest = Sha256::digest(body);
    let prefix: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}.{}", prefix, extension_for(content_type.unwrap_or(OCTET_STREAM)))
}
