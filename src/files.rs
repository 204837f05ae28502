// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 根路径 `/` 上默认挂载的静态文件处理器。

use std::{path::PathBuf, sync::Arc};

use log::{debug, warn};

use crate::{context::Context, guard::PathSandbox, router::Handler};

/// 从 `root` 下提供静态资源。
///
/// - 目录：交给解析器处理首页或目录列表
/// - 文件：按文件发送
/// - 越出根目录：400
/// - 不存在且没有扩展名：400；有扩展名：404
pub fn static_handler(root: impl Into<PathBuf>, sandbox: Arc<dyn PathSandbox>) -> Handler {
    let root = root.into();
    Arc::new(move |ctx: &mut Context| {
        let id = ctx.id;
        let relative = ctx.request.path().to_string();
        let target = match sandbox.resolve(&root, &relative) {
            Some(p) => p,
            None => {
                warn!("[ID{}]拒绝越出网站根目录的请求：{}", id, relative);
                ctx.response.set_code(400);
                return Ok(());
            }
        };
        if target.is_dir() {
            debug!("[ID{}]请求目录：{}", id, target.display());
            ctx.response.set_directory(target);
        } else if target.is_file() {
            debug!("[ID{}]请求文件：{}", id, target.display());
            ctx.response.set_file(target);
        } else if target.extension().is_none() {
            debug!("[ID{}]路径不存在且没有扩展名：{}", id, relative);
            ctx.response.set_code(400);
        } else {
            debug!("[ID{}]文件不存在：{}", id, relative);
            ctx.response.set_code(404);
        }
        Ok(())
    })
}
