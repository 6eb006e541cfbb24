use std::path::PathBuf;

use thiserror::Error;

/// 致命错误：输入已无法再按 DXF 标签流解释，加载立即终止。
#[derive(Debug, Error)]
pub enum StructureError {
    #[error("第 {line} 行的组码 \"{text}\" 无法解析为整数")]
    InvalidGroupCode { text: String, line: usize },
    #[error("第 {line} 行附近缺少 Y 坐标：组码 {code} 之后期望组码 {expected}，实际为 {found}")]
    MissingYCoordinate {
        code: i32,
        expected: i32,
        found: String,
        line: usize,
    },
    #[error("第 {line} 行附近的坐标值无效（组码 {code}，值 \"{value}\"）")]
    InvalidCoordinate { code: i32, value: String, line: usize },
    #[error("第 {line} 行附近的二进制数据无效（组码 {code}）")]
    InvalidBinaryData { code: i32, line: usize },
    #[error("第 {line} 行附近的标签无效（组码 {code}，值 \"{value}\"）")]
    InvalidValue { code: i32, value: String, line: usize },
    #[error("第 {line} 行附近的文本无法按 {encoding} 解码（组码 {code}）")]
    Decoding {
        code: i32,
        encoding: &'static str,
        line: usize,
    },
    #[error("第 {line} 行附近的 SECTION 缺少名称（组码 2）")]
    MissingSectionName { line: usize },
    #[error("结构标记不匹配（约第 {line} 行）：{message}")]
    Unbalanced { message: String, line: usize },
    #[error("缺少二进制 DXF 文件头，不是二进制 DXF 数据")]
    NotBinaryDxf,
    #[error("读取标签流失败: {0}")]
    Io(#[from] std::io::Error),
}

impl StructureError {
    pub(crate) fn unbalanced(message: impl Into<String>, line: usize) -> Self {
        Self::Unbalanced {
            message: message.into(),
            line,
        }
    }
}

/// 文件层面的错误：读写失败或结构错误。
#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("未知的文本编码 \"{0}\"")]
    UnknownEncoding(String),
    #[error(transparent)]
    Structure(#[from] StructureError),
}
