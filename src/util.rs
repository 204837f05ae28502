// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// 目录列表链接中需要转义的字符
const HREF_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?');

pub struct HtmlBuilder {
    title: String,
    css: String,
    script: String,
    body: String,
}

impl HtmlBuilder {
    /// 生成目录列表页面。
    ///
    /// `url_path` 是该目录相对于网站根目录的 URL 路径，链接均为以它为前缀的绝对路径；
    /// `show_parent` 为假时（即位于网站根目录）不生成上级目录链接。
    pub fn from_dir(url_path: &str, dir_vec: &mut Vec<PathBuf>, show_parent: bool) -> Self {
        let mut body = String::new();
        sort_dir_entries(dir_vec);

        let trimmed = url_path.trim_end_matches('/');
        let base = format!("{}/", trimmed);
        let display = if trimmed.is_empty() { "/" } else { trimmed };
        body.push_str(&format!("<h1>{}的文件列表</h1><hr>", escape_html(display)));
        body.push_str("<table>");
        body.push_str(
            r#"
            <tr>
                <td>文件名</td>
                <td>大小</td>
                <td>修改时间</td>
            </tr>
            "#,
        );
        if show_parent {
            let parent = match trimmed.rfind('/') {
                Some(i) => &trimmed[..=i],
                None => "/",
            };
            body.push_str(&format!(
                r#"
            <tr>
                <td><a href="{}">..</a></td>
                <td></td>
                <td></td>
            </tr>
            "#,
                utf8_percent_encode(parent, HREF_ESCAPE)
            ));
        }
        for entry in dir_vec.iter() {
            // 读取元数据失败的条目（例如刚被删除）直接跳过
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let filename = match entry.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            let formatted_time = match metadata.modified() {
                Ok(time) => {
                    let local_time: DateTime<Local> = time.into();
                    local_time.format("%Y-%m-%d %H:%M:%S %Z").to_string()
                }
                Err(_) => String::new(),
            };
            let href = format!("{}{}", base, filename);

            if metadata.is_dir() {
                body.push_str(&format!(
                    r#"
                    <tr>
                        <td><a href="{}/">{}/</a></td>
                        <td>文件夹</td>
                        <td>{}</td>
                    </tr>
                    "#,
                    utf8_percent_encode(&href, HREF_ESCAPE),
                    escape_html(&filename),
                    &formatted_time
                ));
            } else {
                body.push_str(&format!(
                    r#"
                    <tr>
                        <td><a href="{}">{}</a></td>
                        <td>{}</td>
                        <td>{}</td>
                    </tr>
                    "#,
                    utf8_percent_encode(&href, HREF_ESCAPE),
                    escape_html(&filename),
                    format_file_size(metadata.len()),
                    &formatted_time
                ));
            }
        }
        body.push_str("</table>");
        let title = format!("{}的文件列表", escape_html(display));
        let css = r"
            table {
                border-collapse: collapse;
                width: 100%;
            }

            td {
                padding: 8px;
                white-space: pre-wrap;
                border: none;
            }

            th {
                padding: 8px;
                border: none;
            }"
        .to_string();
        HtmlBuilder {
            title,
            css,
            script: "".to_string(),
            body,
        }
    }

    pub fn build(&self) -> String {
        format!(
            r##"<!DOCTYPE html>
            <html>
                <head>
                    <meta charset="utf-8">
                    <script>{}</script>
                    <title>{}</title>
                    <style>{}</style>
                </head>
                <body>
                {}
                </body>
            </html>"##,
            self.script, self.title, self.css, self.body
        )
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn format_file_size(size: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < units.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.1} {}", size, units[unit_index])
}

/// 目录在前，其余按路径排序
fn sort_dir_entries(vec: &mut [PathBuf]) {
    vec.sort_by(|a, b| {
        let a_is_dir = a.is_dir();
        let b_is_dir = b.is_dir();

        if a_is_dir && !b_is_dir {
            std::cmp::Ordering::Less
        } else if !a_is_dir && b_is_dir {
            std::cmp::Ordering::Greater
        } else {
            a.cmp(b)
        }
    });
}
