// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # WebAPI 服务端
//!
//! 独立运行的嵌入式 HTTP 服务器：
//! - 从 `config/development.toml` 读取配置，`config/log4rs.yaml` 配置日志
//! - 根路径 `/` 提供网站根目录下的静态资源
//! - `/status` 以 JSON 返回运行状态
//! - 后台管理控制台（stop / status / help）

use std::{sync::Arc, time::Instant};

use log::{error, info, warn};
use serde_derive::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
};

use webapi::{static_handler, Config, Exception, RootSandbox, Server};

#[derive(Serialize)]
struct StatusReport {
    service: String,
    uptime_secs: u64,
    active_sessions: usize,
    routes: Vec<String>,
}

fn main() {
    // 日志配置缺失时继续运行，只是没有日志输出
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法加载日志配置config/log4rs.yaml：{}", e);
    }

    let config = match Config::from_toml("config/development.toml") {
        Ok(config) => {
            info!("配置文件已载入");
            config
        }
        Err(e) => {
            warn!("{}，使用默认配置", e);
            Config::new()
        }
    };
    info!("www root: {}", config.www_root());

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建异步运行时：{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("服务器异常退出：{}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Exception> {
    let started = Instant::now();
    let server = Server::new(config.clone());

    server.routes().register(
        "/",
        static_handler(config.www_root(), Arc::new(RootSandbox)),
    );
    let sessions = Arc::clone(server.sessions());
    let routes = Arc::downgrade(server.routes());
    let product = config.product();
    server.routes().route("/status", move |ctx| {
        let report = StatusReport {
            service: product.clone(),
            uptime_secs: started.elapsed().as_secs(),
            active_sessions: sessions.len(),
            routes: routes.upgrade().map(|r| r.paths()).unwrap_or_default(),
        };
        ctx.response.set_json(&report).set_cache(-1);
        Ok(())
    });

    match server.start().await {
        Ok(addr) => info!("服务端已在{}上监听", addr),
        // 健康检查会继续尝试绑定
        Err(e) => warn!("{}", e),
    }

    console(&server).await;
    server.stop().await;
    Ok(())
}

/// 后台管理控制台，返回即表示应当停机
async fn console(server: &Server) {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut input) => read,
            _ = tokio::signal::ctrl_c() => {
                info!("收到Ctrl+C，正在停机");
                return;
            }
        };
        match read {
            Ok(0) => {
                info!("控制台输入已关闭，按Ctrl+C停机");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("无法监听停机信号：{}", e);
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("读取控制台输入失败：{}", e);
                return;
            }
        }
        match input.trim() {
            "stop" => {
                println!("停机指令已激活，正在关闭服务器...");
                return;
            }
            "help" => {
                println!("== WebAPI Help ==");
                println!("stop   - 停止服务器");
                println!("status - 查看当前服务器运行状态");
                println!("help   - 显示此帮助信息");
                println!("=================");
            }
            "status" => {
                println!("== WebAPI 状态 ==");
                match server.local_addr().await {
                    Some(addr) => println!("监听地址: {}", addr),
                    None => println!("监听地址: 未绑定"),
                }
                println!("当前存活会话数: {}", server.active_sessions());
                println!("已注册路由: {}", server.routes().paths().join(", "));
                println!("=================");
            }
            "" => {}
            cmd => println!("无效的命令：{}", cmd),
        }
    }
}
