// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 单行、带空格的 JSON 输出格式，例如 `{ "a": 1, "b": [ true, null ] }`。
//! 空容器输出为 `{}` 与 `[]`。

use serde::Serialize;
use serde_json::ser::Formatter;
use std::io;

#[derive(Debug, Default)]
pub struct SpacedFormatter {
    has_value: bool,
}

impl SpacedFormatter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formatter for SpacedFormatter {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.has_value = false;
        writer.write_all(b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.has_value {
            writer.write_all(b" ]")
        } else {
            writer.write_all(b"]")
        }
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        writer.write_all(if first { b" " } else { b", " })
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.has_value = false;
        writer.write_all(b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.has_value {
            writer.write_all(b" }")
        } else {
            writer.write_all(b"}")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        writer.write_all(if first { b" " } else { b", " })
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }
}

/// 使用 `SpacedFormatter` 序列化
pub fn to_spaced_vec<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter::new());
    value.serialize(&mut ser)?;
    Ok(out)
}

pub fn to_spaced_string<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let bytes = to_spaced_vec(value)?;
    // serde_json 只会输出合法的 UTF-8
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
