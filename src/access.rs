// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 连接准入控制：黑名单、白名单以及外部封禁判断。
//!
//! 名单条目可以是精确地址，也可以含 `*` 通配符，例如 `192.168.*`。

use std::net::IpAddr;

use log::{debug, warn};
use regex::Regex;

use crate::{config::Config, guard::AddressPolicy};

pub struct AccessList {
    whitelist: Vec<Regex>,
    blacklist: Vec<Regex>,
    whitelist_mode: bool,
}

impl AccessList {
    pub fn new(whitelist: &[String], blacklist: &[String], whitelist_mode: bool) -> Self {
        Self {
            whitelist: compile(whitelist),
            blacklist: compile(blacklist),
            whitelist_mode,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.whitelist(), config.blacklist(), config.whitelist_mode())
    }

    pub fn is_whitelisted(&self, addr: &IpAddr) -> bool {
        matches_any(&self.whitelist, addr)
    }

    pub fn is_blacklisted(&self, addr: &IpAddr) -> bool {
        matches_any(&self.blacklist, addr)
    }

    /// 准入判断。被黑名单或外部策略封禁的地址一律拒绝；
    /// 白名单模式下还必须显式命中白名单。
    pub fn admit(&self, addr: &IpAddr, policy: &dyn AddressPolicy) -> bool {
        if self.is_blacklisted(addr) {
            debug!("地址{}命中黑名单", addr);
            return false;
        }
        if policy.is_blocked(addr) {
            debug!("地址{}被外部策略封禁", addr);
            return false;
        }
        if self.whitelist_mode && !self.is_whitelisted(addr) {
            debug!("白名单模式下地址{}未命中白名单", addr);
            return false;
        }
        true
    }
}

fn compile(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter(|p| !p.trim().is_empty())
        .filter_map(|p| {
            let expr = format!("^{}$", regex::escape(p.trim()).replace(r"\*", ".*"));
            match Regex::new(&expr) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("无法解析地址名单条目{}：{}，已忽略", p, e);
                    None
                }
            }
        })
        .collect()
}

fn matches_any(list: &[Regex], addr: &IpAddr) -> bool {
    // IPv4 映射的 IPv6 地址按 IPv4 形式匹配
    let addr = match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*addr),
        IpAddr::V4(_) => *addr,
    };
    let text = addr.to_string();
    list.iter().any(|re| re.is_match(&text))
}
