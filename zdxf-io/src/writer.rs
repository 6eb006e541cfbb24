use std::io::{self, Write};

use encoding_rs::{Encoding, UTF_8};
use zdxf_core::tags::{Tag, TagValue};

use crate::encoding::encode_text;

/// 文本 DXF 标签写出器，每个标签写成组码行与值行。
///
/// 点值展开为各分量组码，二进制数据写成大写十六进制，字符串按目标编码写出并还原保留的原始字节。
pub struct TagWriter<W> {
    writer: W,
    encoding: &'static Encoding,
}

impl<W: Write> TagWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            encoding: UTF_8,
        }
    }

    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn write_tag(&mut self, tag: &Tag) -> io::Result<()> {
        let mut record = Vec::new();
        encode_tag(tag, self.encoding, &mut record);
        self.writer.write_all(&record)
    }

    pub fn write_tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a Tag>) -> io::Result<()> {
        for tag in tags {
            self.write_tag(tag)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// 把标签编码为组码行与值行，追加到 `out`。
fn encode_tag(tag: &Tag, encoding: &'static Encoding, out: &mut Vec<u8>) {
    match &tag.value {
        TagValue::Point2(point) => {
            push_record(out, tag.code, point.x.to_string().as_bytes());
            push_record(out, tag.code + 10, point.y.to_string().as_bytes());
        }
        TagValue::Point3(point) => {
            push_record(out, tag.code, point.x.to_string().as_bytes());
            push_record(out, tag.code + 10, point.y.to_string().as_bytes());
            push_record(out, tag.code + 20, point.z.to_string().as_bytes());
        }
        TagValue::Binary(bytes) => push_record(out, tag.code, hex::encode_upper(bytes).as_bytes()),
        TagValue::String(text) => push_record(out, tag.code, &encode_text(text, encoding)),
        TagValue::Int(value) => push_record(out, tag.code, value.to_string().as_bytes()),
        TagValue::Float(value) => push_record(out, tag.code, value.to_string().as_bytes()),
    }
}

fn push_record(out: &mut Vec<u8>, code: i32, value: &[u8]) {
    out.extend_from_slice(format!("{code:>3}\n").as_bytes());
    out.extend_from_slice(value);
    out.push(b'\n');
}

/// 以 UTF-8 写出标签，便于检查与重新加载。
pub fn tags_to_string<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> String {
    let mut out = Vec::new();
    for tag in tags {
        encode_tag(tag, UTF_8, &mut out);
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use encoding_rs::WINDOWS_1252;
    use glam::{DVec2, DVec3};

    use super::*;
    use crate::encoding::escape_byte;

    #[test]
    fn writes_right_aligned_codes() {
        let text = tags_to_string(&[Tag::new(0, "LINE"), Tag::new(8, "0"), Tag::new(62, 7i64)]);
        assert_eq!(text, "  0\nLINE\n  8\n0\n 62\n7\n");
    }

    #[test]
    fn points_expand_to_component_codes() {
        let text = tags_to_string(&[
            Tag::new(10, DVec3::new(1.0, 2.5, 0.0)),
            Tag::new(11, DVec2::new(-1.0, 3.0)),
        ]);
        assert_eq!(text, " 10\n1\n 20\n2.5\n 30\n0\n 11\n-1\n 21\n3\n");
    }

    #[test]
    fn binary_values_are_upper_hex() {
        let text = tags_to_string(&[Tag::new(310, vec![0x0a, 0xff])]);
        assert_eq!(text, "310\n0AFF\n");
    }

    #[test]
    fn preserved_bytes_are_restored() {
        let value: String = ['a', escape_byte(0xe4), 'b'].into_iter().collect();
        let mut writer = TagWriter::new(Vec::new()).with_encoding(WINDOWS_1252);
        writer.write_tag(&Tag::new(1, value)).unwrap();
        assert_eq!(writer.into_inner(), b"  1\na\xe4b\n".to_vec());
    }
}
