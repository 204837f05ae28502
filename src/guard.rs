// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 宿主协作者接口
//!
//! 服务器只通过这几个窄接口与宿主应用交互：
//! - `AddressPolicy`：远端地址是否被封禁（防火墙、封禁名单等外部判断）。
//! - `PathSandbox`：保证请求的相对路径不会逃出指定根目录。
//! - `MimeLookup`：按扩展名查询 MIME 类型。
//!
//! 每个接口都附带一个默认实现，日志统一走 `log` 门面。

use std::{
    net::IpAddr,
    path::{Component, Path, PathBuf},
};

use log::warn;

use crate::param::mime_for_extension;

/// 远端地址封禁判断
#[cfg_attr(test, mockall::automock)]
pub trait AddressPolicy: Send + Sync {
    fn is_blocked(&self, addr: &IpAddr) -> bool;
}

/// 不封禁任何地址
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenPolicy;

impl AddressPolicy for OpenPolicy {
    fn is_blocked(&self, _addr: &IpAddr) -> bool {
        false
    }
}

/// 路径沙箱
#[cfg_attr(test, mockall::automock)]
pub trait PathSandbox: Send + Sync {
    /// 将 `relative` 解析到 `root` 之下。越界时返回 `None`；
    /// 返回的路径不保证存在。
    fn resolve(&self, root: &Path, relative: &str) -> Option<PathBuf>;
}

/// 基于路径分量检查与规范化路径前缀比较的默认沙箱
#[derive(Debug, Default, Clone, Copy)]
pub struct RootSandbox;

impl PathSandbox for RootSandbox {
    fn resolve(&self, root: &Path, relative: &str) -> Option<PathBuf> {
        if relative.contains('\0') {
            warn!("路径中包含空字节，拒绝访问：{:?}", relative);
            return None;
        }
        let mut clean = PathBuf::new();
        for component in Path::new(relative.trim_start_matches('/')).components() {
            match component {
                Component::Normal(c) => clean.push(c),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    warn!("路径试图越出根目录：{:?}", relative);
                    return None;
                }
            }
        }
        let candidate = root.join(&clean);
        // 已存在的路径再用规范化结果确认没有借助符号链接逃逸
        if candidate.exists() {
            let root_canonical = root.canonicalize().ok()?;
            let candidate_canonical = candidate.canonicalize().ok()?;
            if !candidate_canonical.starts_with(&root_canonical) {
                warn!("路径经符号链接越出根目录：{:?}", relative);
                return None;
            }
        }
        Some(candidate)
    }
}

/// MIME 类型查询
pub trait MimeLookup: Send + Sync {
    fn mime_for(&self, extension: &str) -> String;
}

/// 使用内置映射表的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct MimeTable;

impl MimeLookup for MimeTable {
    fn mime_for(&self, extension: &str) -> String {
        mime_for_extension(extension).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sandbox_rejects_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = RootSandbox;
        assert!(sandbox.resolve(dir.path(), "../etc/passwd").is_none());
        assert!(sandbox.resolve(dir.path(), "a/../../b").is_none());
        assert!(sandbox.resolve(dir.path(), "index.html\0.jpg").is_none());
    }

    #[test]
    fn test_sandbox_resolves_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let sandbox = RootSandbox;

        assert_eq!(sandbox.resolve(dir.path(), "/a.txt"), Some(dir.path().join("a.txt")));
        assert_eq!(sandbox.resolve(dir.path(), "./missing"), Some(dir.path().join("missing")));
        assert_eq!(sandbox.resolve(dir.path(), ""), Some(dir.path().to_path_buf()));
    }

    #[cfg(unix)]
    #[test]
    fn test_sandbox_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        assert!(RootSandbox.resolve(root.path(), "link/secret").is_none());
    }

    #[test]
    fn test_open_policy_blocks_nothing() {
        assert!(!OpenPolicy.is_blocked(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_mime_table() {
        assert_eq!(MimeTable.mime_for("png"), "image/png");
        assert_eq!(MimeTable.mime_for("nope"), "application/octet-stream");
    }
}
