//! 二进制 DXF 分词器。

use tracing::debug;
use zdxf_core::codes::{self, ValueKind};

use crate::error::StructureError;
use crate::tokenizer::{RawTag, RawValue};

/// 二进制 DXF 文件头。
pub const BINARY_DXF_SENTINEL: &[u8] = b"AutoCAD Binary DXF\r\n\x1a\x00";

/// 版本探测只扫描文件开头的这一段。
const HEADER_SCAN_LIMIT: usize = 1024;

#[inline]
pub fn is_binary_dxf(data: &[u8]) -> bool {
    data.starts_with(BINARY_DXF_SENTINEL)
}

/// 二进制 DXF 的标签迭代器，`RawTag::line` 为记录序号。
///
/// R12 及更早版本使用单字节组码（255 引出双字节扩展组码），之后的版本统一为双字节小端组码。
/// 字符串以 `\0` 结尾并保持为字节，解码在编译阶段进行。
pub struct BinaryTagger<'a> {
    data: &'a [u8],
    index: usize,
    r12: bool,
    record: usize,
    skip_comments: bool,
    finished: bool,
}

impl<'a> BinaryTagger<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, StructureError> {
        if !is_binary_dxf(data) {
            return Err(StructureError::NotBinaryDxf);
        }
        let version = scan_version(data);
        let r12 = version.as_deref().is_none_or(|v| v <= "AC1009");
        debug!(version = version.as_deref(), r12, "检测到二进制 DXF");
        Ok(Self {
            data,
            index: BINARY_DXF_SENTINEL.len(),
            r12,
            record: 0,
            skip_comments: true,
            finished: false,
        })
    }

    /// 保留注释标签（组码 999）。
    pub fn with_comments(self) -> Self {
        self.skip_comments(false)
    }

    pub fn skip_comments(mut self, skip: bool) -> Self {
        self.skip_comments = skip;
        self
    }

    /// 是否使用单字节组码。
    pub fn is_r12(&self) -> bool {
        self.r12
    }

    fn take(&mut self, count: usize) -> Option<&'a [u8]> {
        let end = self.index.checked_add(count)?;
        let slice = self.data.get(self.index..end)?;
        self.index = end;
        Some(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N).and_then(|bytes| bytes.try_into().ok())
    }

    fn read_code(&mut self) -> Option<i32> {
        if self.r12 {
            let [first] = self.take_array::<1>()?;
            if first == 255 {
                let bytes = self.take_array::<2>()?;
                Some(i32::from(u16::from_le_bytes(bytes)))
            } else {
                Some(i32::from(first))
            }
        } else {
            let bytes = self.take_array::<2>()?;
            Some(i32::from(u16::from_le_bytes(bytes)))
        }
    }

    fn read_value(&mut self, code: i32) -> Option<RawValue> {
        let value = match codes::value_kind(code) {
            ValueKind::Binary => {
                let [length] = self.take_array::<1>()?;
                RawValue::Binary(self.take(usize::from(length))?.to_vec())
            }
            ValueKind::Int16 => RawValue::Int(i64::from(i16::from_le_bytes(self.take_array()?))),
            ValueKind::Int32 => RawValue::Int(i64::from(i32::from_le_bytes(self.take_array()?))),
            ValueKind::Int64 => RawValue::Int(i64::from_le_bytes(self.take_array()?)),
            ValueKind::Bool => {
                let [byte] = self.take_array::<1>()?;
                RawValue::Int(i64::from(byte))
            }
            // 坐标分量在二进制格式中是独立的 double 标签
            ValueKind::Float | ValueKind::Point => {
                RawValue::Float(f64::from_le_bytes(self.take_array()?))
            }
            ValueKind::String => {
                let rest = self.data.get(self.index..)?;
                let end = rest.iter().position(|&b| b == 0)?;
                let bytes = rest[..end].to_vec();
                self.index += end + 1;
                RawValue::Bytes(bytes)
            }
        };
        Some(value)
    }
}

impl Iterator for BinaryTagger<'_> {
    type Item = Result<RawTag, StructureError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished || self.index >= self.data.len() {
                return None;
            }
            let tag = self.read_code().and_then(|code| {
                self.read_value(code).map(|value| RawTag {
                    code,
                    value,
                    line: self.record + 1,
                })
            });
            let Some(tag) = tag else {
                debug!(offset = self.index, record = self.record, "二进制 DXF 数据被截断");
                self.finished = true;
                return None;
            };
            self.record += 1;
            if tag.code == codes::STRUCTURE && tag.value.is_eof_marker() {
                self.finished = true;
            }
            if tag.code == codes::COMMENT && self.skip_comments {
                continue;
            }
            return Some(Ok(tag));
        }
    }
}

/// 从 `$ACADVER` 之后读取版本字符串，例如 `AC1009`。
pub(crate) fn scan_version(data: &[u8]) -> Option<String> {
    scan_header_string(data, b"$ACADVER").map(|text| text.chars().take(6).collect())
}

/// 从 `$DWGCODEPAGE` 之后读取代码页名称，例如 `ANSI_1252`。
pub(crate) fn scan_codepage(data: &[u8]) -> Option<String> {
    scan_header_string(data, b"$DWGCODEPAGE")
}

fn scan_header_string(data: &[u8], name: &[u8]) -> Option<String> {
    let limit = data.len().min(HEADER_SCAN_LIMIT);
    let window = data.get(BINARY_DXF_SENTINEL.len()..limit)?;
    let position = window.windows(name.len()).position(|w| w == name)?;
    // 变量名之后是结尾 0 与下一个组码（单字节或双字节）
    let mut start = BINARY_DXF_SENTINEL.len() + position + name.len() + 2;
    if *data.get(start)? != b'A' {
        start += 1;
    }
    let rest = data.get(start..)?;
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).ok().map(str::to_string)
}
