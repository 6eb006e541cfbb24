//! DXF 标签流的读取：分词、编译、编码探测与结构划分，以及反向的标签写出。

pub mod binary;
pub mod compiler;
pub mod encoding;
pub mod error;
pub mod structure;
pub mod tokenizer;
pub mod writer;

use std::fs;
use std::io::{BufRead, Read};
use std::path::Path;

use encoding_rs::{Encoding, UTF_8};
use tracing::debug;
use zdxf_config::LoadOptions;
use zdxf_core::diagnostics::Diagnostics;

pub use binary::{BINARY_DXF_SENTINEL, BinaryTagger, is_binary_dxf};
pub use compiler::TagCompiler;
pub use encoding::{EncodingInfo, detect_encoding};
pub use error::{IoError, StructureError};
pub use structure::{Block, Node, Section, StructureBuilder, StructureDatabase, Table};
pub use tokenizer::{RawTag, RawValue, Tagger};
pub use writer::{TagWriter, tags_to_string};

/// 结构加载的结果：结构数据库、加载期诊断以及实际使用的编码。
#[derive(Debug)]
pub struct LoadedStructure {
    pub database: StructureDatabase,
    pub diagnostics: Diagnostics,
    pub encoding: EncodingInfo,
}

fn forced_encoding(options: &LoadOptions) -> Result<Option<&'static Encoding>, IoError> {
    options
        .encoding
        .as_deref()
        .map(|label| {
            encoding::encoding_for_label(label).ok_or_else(|| IoError::UnknownEncoding(label.to_string()))
        })
        .transpose()
}

fn build<I>(
    tags: I,
    encoding: EncodingInfo,
    options: &LoadOptions,
) -> Result<LoadedStructure, IoError>
where
    I: Iterator<Item = Result<RawTag, StructureError>>,
{
    let mut compiler = TagCompiler::new(tags)
        .with_encoding(encoding.encoding)
        .with_policy(options.errors);
    let mut diagnostics = Diagnostics::new();
    let database = StructureBuilder::new(&mut compiler).build(&mut diagnostics)?;

    // 编译期诊断先于结构诊断
    let mut all = compiler.into_diagnostics();
    all.append(diagnostics);
    Ok(LoadedStructure {
        database,
        diagnostics: all,
        encoding,
    })
}

/// 从已解码的文本加载结构。
pub fn structure_from_str(source: &str, options: &LoadOptions) -> Result<LoadedStructure, IoError> {
    let encoding = EncodingInfo {
        encoding: UTF_8,
        ..EncodingInfo::default()
    };
    let tags = Tagger::text(source.as_bytes()).skip_comments(options.skip_comments);
    build(tags, encoding, options)
}

/// 从原始字节加载结构：自动识别二进制 DXF，文本 DXF 先预扫描编码。
pub fn structure_from_bytes(data: &[u8], options: &LoadOptions) -> Result<LoadedStructure, IoError> {
    let mut encoding = detect_encoding(data);
    if let Some(forced) = forced_encoding(options)? {
        encoding.encoding = forced;
    }
    debug!(
        encoding = encoding.encoding.name(),
        binary = is_binary_dxf(data),
        bytes = data.len(),
        "开始加载结构"
    );

    if is_binary_dxf(data) {
        let tags = BinaryTagger::new(data)?.skip_comments(options.skip_comments);
        build(tags, encoding, options)
    } else {
        let tags = Tagger::bytes(data).skip_comments(options.skip_comments);
        build(tags, encoding, options)
    }
}

/// 从任意读取器加载结构。编码预扫描需要完整数据，因此先读入内存。
pub fn structure_from_reader(
    mut reader: impl BufRead,
    options: &LoadOptions,
) -> Result<LoadedStructure, IoError> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(StructureError::from)?;
    structure_from_bytes(&data, options)
}

/// 读取 DXF 文件的全部字节，文件句柄在返回前释放。
pub fn read_file(path: &Path) -> Result<Vec<u8>, IoError> {
    let mut file = fs::File::open(path).map_err(|source| IoError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(data)
}
