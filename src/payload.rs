// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 处理器写入 `Response` 的负载类型。
//!
//! 负载是一个带标签的联合体，由 `Resolver` 用一次穷尽匹配转换成字节。

use bytes::Bytes;
use std::path::PathBuf;

/// RGBA8 位图，按行存储，每像素 4 字节。
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// 纯色位图
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 4);
        for _ in 0..count {
            pixels.extend_from_slice(&rgba);
        }
        Self::new(width, height, pixels)
    }

    /// 像素缓冲区长度是否与尺寸一致
    pub fn is_consistent(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.normalized_len() == Some(self.pixels.len() as u64)
    }

    /// 规范化后像素缓冲区的字节数，溢出时返回 `None`
    pub fn normalized_len(&self) -> Option<u64> {
        u64::from(self.width.max(1))
            .checked_mul(u64::from(self.height.max(1)))?
            .checked_mul(4)
    }

    /// 返回一份尺寸至少为 1x1、像素缓冲区被补齐或截断到正确长度的副本。
    pub fn normalized(&self) -> Self {
        let width = self.width.max(1);
        let height = self.height.max(1);
        let mut pixels = self.pixels.clone();
        pixels.resize(width as usize * height as usize * 4, 0);
        Self::new(width, height, pixels)
    }
}

/// 响应负载
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// 无响应体
    #[default]
    Empty,
    /// 原样发送的字节
    Bytes(Bytes),
    /// 文本，按协商得到的编码发送
    Text(String),
    /// 结构化数据，编码为 JSON
    Json(serde_json::Value),
    /// 位图，编码为 PNG
    Image(Bitmap),
    /// 磁盘上的单个文件
    StaticFile(PathBuf),
    /// 磁盘上的目录
    StaticDirectory(PathBuf),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(v))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

impl From<Bitmap> for Payload {
    fn from(b: Bitmap) -> Self {
        Payload::Image(b)
    }
}
