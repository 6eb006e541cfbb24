//! 文本编码：代码页探测、带恢复策略的解码以及 DXF Unicode 转义。

use std::borrow::Cow;
use std::io::BufRead;

use encoding_rs::{
    BIG5, DecoderResult, EUC_KR, Encoding, EncoderResult, GBK, SHIFT_JIS, UTF_8, WINDOWS_874,
    WINDOWS_1250, WINDOWS_1251, WINDOWS_1252, WINDOWS_1253, WINDOWS_1254, WINDOWS_1255,
    WINDOWS_1256, WINDOWS_1257, WINDOWS_1258,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use zdxf_config::RecoveryPolicy;
use zdxf_core::codes;

use crate::binary;
use crate::tokenizer::{RawTag, Tagger};

/// 从 AC1021（DXF 2007）起文本一律为 UTF-8。
pub const DXF2007: &str = "AC1021";

/// 保留非法字节时使用的私有区起点，`U+10FF00 + byte`。
const ESCAPE_BASE: u32 = 0x10_FF00;

static DXF_UNICODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[Uu]\+([0-9A-Fa-f]{4})").unwrap());

/// 编码探测结果。
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingInfo {
    pub encoding: &'static Encoding,
    pub dxfversion: Option<String>,
    pub codepage: Option<String>,
}

impl Default for EncodingInfo {
    fn default() -> Self {
        Self {
            encoding: WINDOWS_1252,
            dxfversion: None,
            codepage: None,
        }
    }
}

impl EncodingInfo {
    fn resolve(dxfversion: Option<String>, codepage: Option<String>) -> Self {
        let encoding = if dxfversion.as_deref().is_some_and(|v| v >= DXF2007) {
            UTF_8
        } else {
            codepage
                .as_deref()
                .map(encoding_for_codepage)
                .unwrap_or(WINDOWS_1252)
        };
        Self {
            encoding,
            dxfversion,
            codepage,
        }
    }
}

/// `$DWGCODEPAGE` 的值（如 `ANSI_1251`）对应的编码，未知代码页按 `windows-1252` 处理。
pub fn encoding_for_codepage(codepage: &str) -> &'static Encoding {
    let normalized = codepage.trim().to_ascii_uppercase();
    let number = normalized
        .strip_prefix("ANSI_")
        .or_else(|| normalized.strip_prefix("CP"))
        .unwrap_or(&normalized);
    match number {
        "874" => WINDOWS_874,
        "932" => SHIFT_JIS,
        "936" => GBK,
        "949" => EUC_KR,
        "950" => BIG5,
        "1250" => WINDOWS_1250,
        "1251" => WINDOWS_1251,
        "1252" => WINDOWS_1252,
        "1253" => WINDOWS_1253,
        "1254" => WINDOWS_1254,
        "1255" => WINDOWS_1255,
        "1256" => WINDOWS_1256,
        "1257" => WINDOWS_1257,
        "1258" => WINDOWS_1258,
        "UTF8" | "UTF-8" => UTF_8,
        _ => WINDOWS_1252,
    }
}

/// 解析用户给出的编码标签，既接受 WHATWG 标签（`windows-1251`、`utf-8`），也接受 `ANSI_xxxx`。
pub fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    if let Some(encoding) = Encoding::for_label(label.trim().as_bytes()) {
        return Some(encoding);
    }
    let upper = label.trim().to_ascii_uppercase();
    upper
        .starts_with("ANSI_")
        .then(|| encoding_for_codepage(&upper))
}

/// 从字节行标签流中预扫描 `$ACADVER` 与 `$DWGCODEPAGE`。
///
/// 头部变量可能出现在流中任意位置，因此扫描到两者都找到或流结束为止。
pub fn detect_encoding_from_tags<I>(tags: I) -> EncodingInfo
where
    I: IntoIterator<Item = RawTag>,
{
    #[derive(PartialEq)]
    enum Expect {
        Nothing,
        Version,
        Codepage,
    }

    let mut expect = Expect::Nothing;
    let mut dxfversion = None;
    let mut codepage = None;
    for tag in tags {
        let text = tag.value.to_text_lossy();
        match tag.code {
            codes::HEADER_VAR => {
                expect = match text.trim() {
                    "$ACADVER" => Expect::Version,
                    "$DWGCODEPAGE" => Expect::Codepage,
                    _ => Expect::Nothing,
                }
            }
            codes::TEXT if expect == Expect::Version => {
                dxfversion = Some(text.trim().to_string());
                expect = Expect::Nothing;
            }
            codes::NAME_ALT if expect == Expect::Codepage => {
                codepage = Some(text.trim().to_string());
                expect = Expect::Nothing;
            }
            _ => {}
        }
        if dxfversion.is_some() && codepage.is_some() {
            break;
        }
    }
    let info = EncodingInfo::resolve(dxfversion, codepage);
    debug!(
        encoding = info.encoding.name(),
        version = info.dxfversion.as_deref(),
        codepage = info.codepage.as_deref(),
        "探测文本编码"
    );
    info
}

/// 探测原始数据的文本编码，文本与二进制 DXF 均可。
pub fn detect_encoding(data: &[u8]) -> EncodingInfo {
    if binary::is_binary_dxf(data) {
        return EncodingInfo::resolve(binary::scan_version(data), binary::scan_codepage(data));
    }
    detect_encoding_in(data)
}

fn detect_encoding_in(reader: impl BufRead) -> EncodingInfo {
    // 预扫描遇到结构错误时停止，错误留给正式加载报告
    detect_encoding_from_tags(Tagger::bytes(reader).map_while(Result::ok))
}

/// 解码结果。`recovered` 表示严格解码失败、已按恢复策略处理。
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<'a> {
    pub text: Cow<'a, str>,
    pub recovered: bool,
}

/// 先严格解码，失败后按策略恢复；`Strict` 策略下返回 `None`。
pub fn decode_bytes<'a>(
    bytes: &'a [u8],
    encoding: &'static Encoding,
    policy: RecoveryPolicy,
) -> Option<Decoded<'a>> {
    if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
        return Some(Decoded {
            text,
            recovered: false,
        });
    }
    if policy == RecoveryPolicy::Strict {
        return None;
    }

    let mut decoder = encoding.new_decoder_without_bom_handling();
    let mut text = String::with_capacity(
        decoder
            .max_utf8_buffer_length_without_replacement(bytes.len())
            .unwrap_or(bytes.len() * 3),
    );
    let mut src = bytes;
    loop {
        let (result, read) = decoder.decode_to_string_without_replacement(src, &mut text, true);
        match result {
            DecoderResult::InputEmpty => break,
            DecoderResult::OutputFull => {
                text.reserve(src.len().saturating_sub(read) * 3 + 4);
            }
            DecoderResult::Malformed(bad, extra) => {
                if policy == RecoveryPolicy::ReplacePreservingBytes {
                    let end = read.saturating_sub(usize::from(extra));
                    let start = end.saturating_sub(usize::from(bad));
                    text.extend(src[start..end].iter().map(|&byte| escape_byte(byte)));
                }
            }
        }
        src = &src[read..];
    }
    Some(Decoded {
        text: Cow::Owned(text),
        recovered: true,
    })
}

/// 把一个无法解码的字节映射为私有区字符。
#[inline]
pub fn escape_byte(byte: u8) -> char {
    char::from_u32(ESCAPE_BASE + u32::from(byte)).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// `escape_byte` 的逆操作。
#[inline]
pub fn escaped_byte(ch: char) -> Option<u8> {
    let value = u32::from(ch);
    (ESCAPE_BASE..=ESCAPE_BASE + 0xFF)
        .contains(&value)
        .then(|| (value - ESCAPE_BASE) as u8)
}

#[inline]
pub fn has_dxf_unicode(text: &str) -> bool {
    DXF_UNICODE.is_match(text)
}

/// 把 `\U+XXXX` 转义还原为字符，无效码点保持原样。
pub fn decode_dxf_unicode(text: &str) -> Cow<'_, str> {
    DXF_UNICODE.replace_all(text, |caps: &regex::Captures<'_>| {
        u32::from_str_radix(&caps[1], 16)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    })
}

/// 按目标编码编码文本：保留的原始字节原样写回，目标编码无法表示的字符写成 `\U+XXXX`。
pub fn encode_text(text: &str, encoding: &'static Encoding) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut segment_start = 0;
    for (index, ch) in text.char_indices() {
        if let Some(byte) = escaped_byte(ch) {
            encode_segment(&text[segment_start..index], encoding, &mut out);
            out.push(byte);
            segment_start = index + ch.len_utf8();
        }
    }
    encode_segment(&text[segment_start..], encoding, &mut out);
    out
}

fn encode_segment(text: &str, encoding: &'static Encoding, out: &mut Vec<u8>) {
    if text.is_empty() {
        return;
    }
    let mut encoder = encoding.new_encoder();
    let mut src = text;
    loop {
        let needed = encoder
            .max_buffer_length_from_utf8_without_replacement(src.len())
            .unwrap_or(src.len() * 4);
        out.reserve(needed);
        let (result, read) = encoder.encode_from_utf8_to_vec_without_replacement(src, out, true);
        src = &src[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::OutputFull => {}
            EncoderResult::Unmappable(ch) => {
                out.extend_from_slice(format!("\\U+{:04X}", u32::from(ch)).as_bytes());
            }
        }
    }
}
