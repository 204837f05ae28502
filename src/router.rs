// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由表
//!
//! 规范化路径到处理器的映射。每个服务器实例拥有自己的路由表，
//! 读多写少，使用并发哈希表存储。

use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use crate::{context::Context, exception::Exception};

/// 处理器：同步执行，修改上下文中的响应。
///
/// 返回 `Err(Exception::PayloadTooLarge)` 时响应 413，其他错误响应 500。
pub type Handler = Arc<dyn Fn(&mut Context) -> Result<(), Exception> + Send + Sync>;

/// 把路径规范化为以单个 `/` 开头、不以 `/` 结尾的形式。根路径为 `/`。
/// 查询字符串会被去掉。
pub fn normalize_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or("").trim();
    let trimmed = path.trim_start_matches('/');
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    format!("/{}", trimmed)
}

#[derive(Default)]
pub struct RouteRegistry {
    routes: DashMap<String, Handler>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或替换处理器，后注册者覆盖先注册者。
    ///
    /// 返回表中现存的处理器是否正是传入的这一个。
    pub fn register(&self, path: &str, handler: Handler) -> bool {
        let key = normalize_path(path);
        debug!("注册路由：{}", key);
        self.routes.insert(key.clone(), Arc::clone(&handler));
        self.routes
            .get(&key)
            .map_or(false, |stored| Arc::ptr_eq(stored.value(), &handler))
    }

    /// 以闭包形式注册
    pub fn route<F>(&self, path: &str, f: F) -> bool
    where
        F: Fn(&mut Context) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.register(path, Arc::new(f))
    }

    /// 移除路由，返回之前是否存在
    pub fn unregister(&self, path: &str) -> bool {
        let key = normalize_path(path);
        debug!("移除路由：{}", key);
        self.routes.remove(&key).is_some()
    }

    pub fn get(&self, path: &str) -> Option<Handler> {
        self.routes
            .get(&normalize_path(path))
            .map(|h| Arc::clone(h.value()))
    }

    /// 精确匹配，未命中时回退到根路径 `/` 的处理器
    pub fn resolve(&self, path: &str) -> Option<Handler> {
        self.get(path).or_else(|| self.get("/"))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.routes.contains_key(&normalize_path(path))
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
