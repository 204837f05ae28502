// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use crate::{request::Request, response::Response};

/// 一次请求/响应周期中流转的上下文
#[derive(Debug, Clone)]
pub struct Context {
    /// 连接序号，用于日志追踪
    pub id: u128,
    pub request: Request,
    pub response: Response,
}

impl Context {
    /// 响应的压缩标记取自请求是否接受 deflate
    pub fn new(id: u128, request: Request) -> Self {
        let mut response = Response::new();
        response.set_compress(request.accept_deflate());
        Self {
            id,
            request,
            response,
        }
    }
}
