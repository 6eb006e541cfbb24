//! 标签编译：把原始标签转换为类型化的 [`Tag`]。
//!
//! 坐标族（x, y[, z]）合并为一个点标签，十六进制数据块转换为字节，
//! 其余标签按组码类型表转换为整数、浮点或字符串。

use std::iter::Peekable;

use encoding_rs::{Encoding, UTF_8};
use glam::{DVec2, DVec3};
use once_cell::sync::Lazy;
use regex::Regex;
use zdxf_config::RecoveryPolicy;
use zdxf_core::codes::{self, ValueKind};
use zdxf_core::diagnostics::{DiagnosticKind, Diagnostics};
use zdxf_core::tags::{Tag, TagValue};

use crate::encoding::{decode_bytes, decode_dxf_unicode, has_dxf_unicode};
use crate::error::StructureError;
use crate::tokenizer::{RawTag, RawValue};

static INT_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[+-]?\d+").unwrap());
static FLOAT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[+-]?\d+(?:\.\d*)?(?:[eE][+-]?\d+)?").unwrap());

/// 类型化标签迭代器。遇到致命错误后不再产生任何标签。
pub struct TagCompiler<I>
where
    I: Iterator<Item = Result<RawTag, StructureError>>,
{
    tags: Peekable<I>,
    encoding: &'static Encoding,
    policy: RecoveryPolicy,
    diagnostics: Diagnostics,
    finished: bool,
}

impl<I> TagCompiler<I>
where
    I: Iterator<Item = Result<RawTag, StructureError>>,
{
    pub fn new(tags: I) -> Self {
        Self {
            tags: tags.peekable(),
            encoding: UTF_8,
            policy: RecoveryPolicy::default(),
            diagnostics: Diagnostics::new(),
            finished: false,
        }
    }

    /// 字节值的解码编码，文本流的值已是字符串，不受影响。
    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Diagnostics {
        self.diagnostics
    }

    fn compile(&mut self, raw: RawTag) -> Result<Option<Tag>, StructureError> {
        match codes::value_kind(raw.code) {
            ValueKind::Point => self.compile_point(raw),
            ValueKind::Binary => self.compile_binary(raw).map(Some),
            ValueKind::String => self.compile_string(raw).map(Some),
            ValueKind::Float => {
                let value = self.parse_float(&raw).ok_or_else(|| invalid_value(&raw))?;
                Ok(Some(Tag::new(raw.code, value)))
            }
            _ => {
                let value = self.parse_int(&raw).ok_or_else(|| invalid_value(&raw))?;
                Ok(Some(Tag::new(raw.code, value)))
            }
        }
    }

    fn compile_point(&mut self, x: RawTag) -> Result<Option<Tag>, StructureError> {
        let code = x.code;
        let y = match self.tags.next() {
            Some(Ok(tag)) if tag.code == code + 10 => tag,
            Some(Ok(tag)) => {
                return Err(StructureError::MissingYCoordinate {
                    code,
                    expected: code + 10,
                    found: tag.code.to_string(),
                    line: tag.line,
                });
            }
            Some(Err(err)) => return Err(err),
            None => {
                self.diagnostics.info(
                    DiagnosticKind::TruncatedContent,
                    format!("第 {} 行附近的坐标在 X 分量之后被截断", x.line),
                );
                return Ok(None);
            }
        };

        // Z 分量可选，其他标签留给下一轮
        let z = self
            .tags
            .next_if(|tag| matches!(tag, Ok(tag) if tag.code == code + 20))
            .and_then(Result::ok);

        let px = self.coordinate(&x)?;
        let py = self.coordinate(&y)?;
        let value = match z {
            Some(z) => TagValue::Point3(DVec3::new(px, py, self.coordinate(&z)?)),
            None => TagValue::Point2(DVec2::new(px, py)),
        };
        Ok(Some(Tag::new(code, value)))
    }

    fn coordinate(&mut self, raw: &RawTag) -> Result<f64, StructureError> {
        self.parse_float(raw)
            .ok_or_else(|| StructureError::InvalidCoordinate {
                code: raw.code,
                value: raw.value.to_text_lossy().into_owned(),
                line: raw.line,
            })
    }

    fn compile_binary(&mut self, raw: RawTag) -> Result<Tag, StructureError> {
        let bytes = match raw.value {
            RawValue::Binary(bytes) => bytes,
            ref other => {
                let text = other.to_text_lossy();
                hex::decode(text.trim()).map_err(|_| StructureError::InvalidBinaryData {
                    code: raw.code,
                    line: raw.line,
                })?
            }
        };
        Ok(Tag::new(raw.code, TagValue::Binary(bytes)))
    }

    fn compile_string(&mut self, raw: RawTag) -> Result<Tag, StructureError> {
        let code = raw.code;
        let mut text = match raw.value {
            RawValue::Text(text) => text,
            RawValue::Bytes(bytes) => {
                let decoded = decode_bytes(&bytes, self.encoding, self.policy).ok_or(
                    StructureError::Decoding {
                        code,
                        encoding: self.encoding.name(),
                        line: raw.line,
                    },
                )?;
                if decoded.recovered {
                    self.diagnostics.fixed(
                        DiagnosticKind::DecodingError,
                        format!(
                            "第 {} 行附近的文本无法按 {} 解码，已按 {} 策略恢复",
                            raw.line,
                            self.encoding.name(),
                            self.policy
                        ),
                        None,
                    );
                }
                decoded.text.into_owned()
            }
            other => other.to_text_lossy().into_owned(),
        };

        if code == codes::STRUCTURE {
            text = text.trim().to_ascii_uppercase();
        } else if has_dxf_unicode(&text) {
            text = decode_dxf_unicode(&text).into_owned();
        }
        Ok(Tag::new(code, TagValue::String(text)))
    }

    fn parse_int(&mut self, raw: &RawTag) -> Option<i64> {
        let text = match &raw.value {
            RawValue::Int(value) => return Some(*value),
            RawValue::Float(value) => return Some(value.trunc() as i64),
            other => other.to_text_lossy(),
        };
        let trimmed = text.trim();
        if let Ok(value) = trimmed.parse::<i64>() {
            return Some(value);
        }
        // 部分程序把整数写成浮点数
        let recovered = trimmed
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(|value| value.trunc() as i64)
            // 最后尝试截取数字片段，如 "12mm"
            .or_else(|| {
                INT_PREFIX
                    .find(trimmed)
                    .and_then(|m| m.as_str().parse::<i64>().ok())
            })?;
        self.diagnostics.fixed(
            DiagnosticKind::InvalidValue,
            format!(
                "第 {} 行附近的整数值 \"{}\"（组码 {}）已恢复为 {}",
                raw.line, trimmed, raw.code, recovered
            ),
            None,
        );
        Some(recovered)
    }

    fn parse_float(&mut self, raw: &RawTag) -> Option<f64> {
        let text = match &raw.value {
            RawValue::Float(value) => return Some(*value),
            RawValue::Int(value) => return Some(*value as f64),
            other => other.to_text_lossy(),
        };
        let trimmed = text.trim();
        if let Ok(value) = trimmed.parse::<f64>() {
            return Some(value);
        }
        let recovered = FLOAT_PREFIX
            .find(trimmed)
            .and_then(|m| m.as_str().parse::<f64>().ok())?;
        self.diagnostics.fixed(
            DiagnosticKind::InvalidValue,
            format!(
                "第 {} 行附近的浮点值 \"{}\"（组码 {}）已恢复为 {}",
                raw.line, trimmed, raw.code, recovered
            ),
            None,
        );
        Some(recovered)
    }
}

fn invalid_value(raw: &RawTag) -> StructureError {
    StructureError::InvalidValue {
        code: raw.code,
        value: raw.value.to_text_lossy().into_owned(),
        line: raw.line,
    }
}

impl<I> Iterator for TagCompiler<I>
where
    I: Iterator<Item = Result<RawTag, StructureError>>,
{
    type Item = Result<Tag, StructureError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let raw = match self.tags.next()? {
                Ok(raw) => raw,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };
            match self.compile(raw) {
                Ok(Some(tag)) => return Some(Ok(tag)),
                Ok(None) => self.finished = true,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}
