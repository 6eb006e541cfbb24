//! 底层分词：把字符流或字节流切分为 `(组码, 原始值)` 对，不做任何语义解释。

use std::borrow::Cow;
use std::io::BufRead;

use tracing::debug;
use zdxf_core::codes;

use crate::error::StructureError;

/// 尚未按组码类型转换的原始值。
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// 文本流中的一行。
    Text(String),
    /// 字节流中的一行（或二进制 DXF 中的零结尾字符串），解码推迟到编译阶段。
    Bytes(Vec<u8>),
    /// 二进制 DXF 中已是原始字节的数据块。
    Binary(Vec<u8>),
    Int(i64),
    Float(f64),
}

impl RawValue {
    /// 文本视图，仅用于错误信息和结构判断，字节按 UTF-8 宽松解释。
    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        match self {
            RawValue::Text(text) => Cow::Borrowed(text),
            RawValue::Bytes(bytes) | RawValue::Binary(bytes) => String::from_utf8_lossy(bytes),
            RawValue::Int(value) => Cow::Owned(value.to_string()),
            RawValue::Float(value) => Cow::Owned(value.to_string()),
        }
    }

    /// 文本或字节形式的原始内容。
    pub fn as_raw_bytes(&self) -> Option<&[u8]> {
        match self {
            RawValue::Text(text) => Some(text.as_bytes()),
            RawValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub(crate) fn is_eof_marker(&self) -> bool {
        self.as_raw_bytes()
            .is_some_and(|bytes| bytes.trim_ascii() == b"EOF")
    }
}

/// 分词结果，`line` 为组码所在的近似行号。
#[derive(Debug, Clone, PartialEq)]
pub struct RawTag {
    pub code: i32,
    pub value: RawValue,
    pub line: usize,
}

impl RawTag {
    pub fn text(code: i32, value: impl Into<String>) -> Self {
        Self {
            code,
            value: RawValue::Text(value.into()),
            line: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    Text,
    Bytes,
}

/// 行式 DXF 分词器：每个标签占两行，组码行与值行。
///
/// 迭代器是惰性的、有限的且不可重启：遇到 `(0, EOF)`、流结束或致命错误后即停止。
/// 流在组码行之后结束（缺少值行）视为文件截断，安静地结束序列。
pub struct Tagger<R> {
    reader: R,
    mode: LineMode,
    skip_comments: bool,
    line: usize,
    finished: bool,
    buffer: Vec<u8>,
}

impl<R: BufRead> Tagger<R> {
    /// 文本模式：值按 UTF-8 读取为字符串。
    pub fn text(reader: R) -> Self {
        Self::with_mode(reader, LineMode::Text)
    }

    /// 字节模式：仅剥离行结束符，不做解码。
    pub fn bytes(reader: R) -> Self {
        Self::with_mode(reader, LineMode::Bytes)
    }

    fn with_mode(reader: R, mode: LineMode) -> Self {
        Self {
            reader,
            mode,
            skip_comments: true,
            line: 0,
            finished: false,
            buffer: Vec::new(),
        }
    }

    /// 保留注释标签（组码 999）。
    pub fn with_comments(self) -> Self {
        self.skip_comments(false)
    }

    pub fn skip_comments(mut self, skip: bool) -> Self {
        self.skip_comments = skip;
        self
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>, StructureError> {
        self.buffer.clear();
        let read = self.reader.read_until(b'\n', &mut self.buffer)?;
        if read == 0 {
            return Ok(None);
        }
        self.line += 1;
        let mut end = self.buffer.len();
        if self.buffer[..end].ends_with(b"\n") {
            end -= 1;
        }
        if self.buffer[..end].ends_with(b"\r") {
            end -= 1;
        }
        Ok(Some(self.buffer[..end].to_vec()))
    }

    fn next_tag(&mut self) -> Result<Option<RawTag>, StructureError> {
        loop {
            let Some(code_record) = self.read_record()? else {
                return Ok(None);
            };
            let code_line = self.line;
            let code = parse_group_code(&code_record).ok_or_else(|| {
                StructureError::InvalidGroupCode {
                    text: String::from_utf8_lossy(&code_record).trim().to_string(),
                    line: code_line,
                }
            })?;

            let Some(value_record) = self.read_record()? else {
                debug!(line = code_line, code, "组码之后没有值行，按截断处理");
                return Ok(None);
            };
            let value = match self.mode {
                LineMode::Text => {
                    let text = String::from_utf8(value_record).map_err(|_| {
                        StructureError::Decoding {
                            code,
                            encoding: "UTF-8",
                            line: self.line,
                        }
                    })?;
                    RawValue::Text(text)
                }
                LineMode::Bytes => RawValue::Bytes(value_record),
            };

            if code == codes::STRUCTURE && value.is_eof_marker() {
                // EOF 之后的任何内容都忽略
                self.finished = true;
            }
            if code == codes::COMMENT && self.skip_comments {
                if self.finished {
                    return Ok(None);
                }
                continue;
            }
            return Ok(Some(RawTag {
                code,
                value,
                line: code_line,
            }));
        }
    }
}

impl<R: BufRead> Iterator for Tagger<R> {
    type Item = Result<RawTag, StructureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_tag() {
            Ok(Some(tag)) => Some(Ok(tag)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

fn parse_group_code(record: &[u8]) -> Option<i32> {
    let text = std::str::from_utf8(record).ok()?;
    text.trim().parse::<i32>().ok().filter(|code| *code >= 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(source: &str) -> Result<Vec<RawTag>, StructureError> {
        Tagger::text(source.as_bytes()).collect()
    }

    #[test]
    fn splits_code_and_value_records() {
        let tags = collect("  0\r\nSECTION\r\n  2\r\nENTITIES\r\n").expect("valid tags");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].code, 0);
        assert_eq!(tags[0].value, RawValue::Text("SECTION".into()));
        assert_eq!(tags[0].line, 1);
        assert_eq!(tags[1].code, 2);
        assert_eq!(tags[1].value, RawValue::Text("ENTITIES".into()));
        assert_eq!(tags[1].line, 3);
    }

    #[test]
    fn invalid_group_code_is_fatal_with_line() {
        let err = collect("0\nSECTION\nabc\nENTITIES\n").unwrap_err();
        match err {
            StructureError::InvalidGroupCode { text, line } => {
                assert_eq!(text, "abc");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn dangling_code_record_ends_sequence() {
        let tags = collect("0\nSECTION\n2\n").expect("truncation is tolerated");
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn comments_are_filtered_unless_requested() {
        let source = "999\nmade by hand\n0\nEOF\n";
        assert_eq!(collect(source).unwrap().len(), 1);

        let with_comments: Vec<_> = Tagger::text(source.as_bytes())
            .with_comments()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(with_comments.len(), 2);
        assert_eq!(with_comments[0].code, 999);
    }

    #[test]
    fn content_after_eof_is_ignored() {
        let tags = collect("0\nEOF\ngarbage\nmore garbage\n").expect("eof stops the tagger");
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn byte_mode_keeps_values_undecoded() {
        let data: &[u8] = b"1\n\xe4\xf6\xfc\r\n";
        let tags: Vec<_> = Tagger::bytes(data).collect::<Result<_, _>>().unwrap();
        assert_eq!(tags[0].value, RawValue::Bytes(vec![0xe4, 0xf6, 0xfc]));
    }

    #[test]
    fn negative_group_code_is_rejected() {
        assert!(matches!(
            collect("-1\nX\n").unwrap_err(),
            StructureError::InvalidGroupCode { .. }
        ));
    }
}
