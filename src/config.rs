// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use num_cpus;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::{fs, net::IpAddr, path::Path};

use crate::exception::Exception;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_www_root")]
    www_root: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_cache_size")]
    cache_size: usize,
    #[serde(default = "default_local")]
    local: bool,
    /// 宿主已知的公网地址，绑定时优先尝试
    #[serde(default)]
    public_addresses: Vec<IpAddr>,
    #[serde(default = "default_max_connections")]
    max_connections: u32,
    #[serde(default = "default_max_receive_size")]
    max_receive_size: u64,
    #[serde(default = "default_max_send_size")]
    max_send_size: u64,
    #[serde(default)]
    whitelist_mode: bool,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default = "default_directory_index")]
    directory_index: bool,
    #[serde(default = "default_service_name")]
    service_name: String,
    #[serde(default = "default_service_version")]
    service_version: String,
    #[serde(default = "default_health_check_interval")]
    health_check_interval: u64,
    #[serde(default = "default_outbound_timeout")]
    outbound_timeout: u64,
    #[serde(default)]
    legacy_charset_negotiation: bool,
}

fn default_www_root() -> String {
    "web".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cache_size() -> usize {
    16
}

fn default_local() -> bool {
    true
}

fn default_max_connections() -> u32 {
    128
}

fn default_max_receive_size() -> u64 {
    1048576 // 1MB
}

fn default_max_send_size() -> u64 {
    52428800 // 50MB
}

fn default_directory_index() -> bool {
    true
}

fn default_service_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_outbound_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            www_root: default_www_root(),
            port: default_port(),
            worker_threads: 0,
            cache_size: default_cache_size(),
            local: default_local(),
            public_addresses: Vec::new(),
            max_connections: default_max_connections(),
            max_receive_size: default_max_receive_size(),
            max_send_size: default_max_send_size(),
            whitelist_mode: false,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            directory_index: default_directory_index(),
            service_name: default_service_name(),
            service_version: default_service_version(),
            health_check_interval: default_health_check_interval(),
            outbound_timeout: default_outbound_timeout(),
            legacy_charset_negotiation: false,
        }
    }

    pub fn from_toml<P: AsRef<Path>>(filename: P) -> Result<Self, Exception> {
        let filename = filename.as_ref();
        let str_val = fs::read_to_string(filename).map_err(|e| {
            error!("无法读取配置文件{}：{}", filename.display(), e);
            Exception::ConfigInvalid(format!("{}: {}", filename.display(), e))
        })?;
        Self::from_toml_str(&str_val)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, Exception> {
        let mut raw_config: Config = toml::from_str(content).map_err(|e| {
            error!("无法成功从配置文件构建配置对象：{}", e);
            Exception::ConfigInvalid(e.to_string())
        })?;
        raw_config.normalize();
        Ok(raw_config)
    }

    fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = num_cpus::get();
        }
        if self.max_connections == 0 {
            warn!("max_connections被设置为0，将使用默认值{}", default_max_connections());
            self.max_connections = default_max_connections();
        }
        if self.health_check_interval == 0 {
            warn!("health_check_interval不能为0，将使用默认值60秒");
            self.health_check_interval = default_health_check_interval();
        }
    }
}

// --- 构建器风格的设置方法，便于嵌入与测试 ---

impl Config {
    pub fn with_www_root(mut self, root: impl Into<String>) -> Self {
        self.www_root = root.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn with_public_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.public_addresses = addresses;
        self
    }

    pub fn with_max_receive_size(mut self, size: u64) -> Self {
        self.max_receive_size = size;
        self
    }

    pub fn with_max_send_size(mut self, size: u64) -> Self {
        self.max_send_size = size;
        self
    }

    pub fn with_whitelist_mode(mut self, enabled: bool) -> Self {
        self.whitelist_mode = enabled;
        self
    }

    pub fn with_whitelist(mut self, patterns: Vec<String>) -> Self {
        self.whitelist = patterns;
        self
    }

    pub fn with_blacklist(mut self, patterns: Vec<String>) -> Self {
        self.blacklist = patterns;
        self
    }

    pub fn with_directory_index(mut self, enabled: bool) -> Self {
        self.directory_index = enabled;
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.service_name = name.into();
        self.service_version = version.into();
        self
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_health_check_interval(mut self, secs: u64) -> Self {
        self.health_check_interval = secs.max(1);
        self
    }

    pub fn with_outbound_timeout(mut self, secs: u64) -> Self {
        self.outbound_timeout = secs;
        self
    }

    pub fn with_legacy_charset_negotiation(mut self, enabled: bool) -> Self {
        self.legacy_charset_negotiation = enabled;
        self
    }
}

impl Config {
    pub fn www_root(&self) -> &str {
        &self.www_root
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn public_addresses(&self) -> &[IpAddr] {
        &self.public_addresses
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn max_receive_size(&self) -> u64 {
        self.max_receive_size
    }

    pub fn max_send_size(&self) -> u64 {
        self.max_send_size
    }

    pub fn whitelist_mode(&self) -> bool {
        self.whitelist_mode
    }

    pub fn whitelist(&self) -> &[String] {
        &self.whitelist
    }

    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    pub fn directory_index(&self) -> bool {
        self.directory_index
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    /// `Server` 与 `User-Agent` 头使用的产品标识
    pub fn product(&self) -> String {
        format!("{}/{}", self.service_name, self.service_version)
    }

    pub fn health_check_interval(&self) -> u64 {
        self.health_check_interval
    }

    pub fn outbound_timeout(&self) -> u64 {
        self.outbound_timeout
    }

    pub fn legacy_charset_negotiation(&self) -> bool {
        self.legacy_charset_negotiation
    }
}
