// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;

#[derive(Clone)]
struct CacheEntry {
    content: Bytes,
    modified_time: SystemTime,
}

/// 静态文件内容缓存，按路径和修改时间判断是否有效。
///
/// 容量为 0 时缓存被禁用，所有查询都未命中。
pub struct FileCache {
    cache: Option<LruCache<PathBuf, CacheEntry>>,
    size_limit: u64,
}

impl FileCache {
    // 根据容量构造，单个条目不超过 size_limit 字节
    pub fn from_capacity(capacity: usize, size_limit: u64) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
            size_limit,
        }
    }

    // 放入，超过单条上限的内容直接忽略
    pub fn push(&mut self, path: &Path, bytes: Bytes, modified_time: SystemTime) -> bool {
        if !self.should_cache(bytes.len() as u64) {
            return false;
        }
        match self.cache.as_mut() {
            Some(cache) => {
                let entry = CacheEntry {
                    content: bytes,
                    modified_time,
                };
                cache.put(path.to_path_buf(), entry);
                true
            }
            None => false,
        }
    }

    // 检查文件大小是否适合缓存
    pub fn should_cache(&self, file_size: u64) -> bool {
        self.cache.is_some() && file_size <= self.size_limit
    }

    // 查询有效缓存，修改时间不一致时视为过期并移除
    pub fn find(&mut self, path: &Path, current_modified_time: SystemTime) -> Option<Bytes> {
        let cache = self.cache.as_mut()?;
        let entry = cache.get(path)?;
        if entry.modified_time == current_modified_time {
            Some(entry.content.clone())
        } else {
            cache.pop(path);
            None
        }
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.cap().get())
    }
}
