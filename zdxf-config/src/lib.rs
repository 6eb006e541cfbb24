use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 配置文件的根结构，目前只有 `[loader]` 一节。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZdxfConfig {
    #[serde(default)]
    pub loader: LoadOptions,
}

impl ZdxfConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 自动发现配置文件：优先读取环境变量 `ZDXF_CONFIG`，否则寻找 `./config/zdxf.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os("ZDXF_CONFIG") {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("zdxf.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// 文本解码失败时的恢复策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryPolicy {
    /// 遇到第一个非法字节序列即终止加载。
    Strict,
    /// 丢弃非法字节。
    Ignore,
    /// 以可逆转义保留非法字节，保存时还原。
    #[default]
    ReplacePreservingBytes,
}

impl RecoveryPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryPolicy::Strict => "strict",
            RecoveryPolicy::Ignore => "ignore",
            RecoveryPolicy::ReplacePreservingBytes => "replace-preserving-bytes",
        }
    }
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "strict" => Ok(RecoveryPolicy::Strict),
            "ignore" => Ok(RecoveryPolicy::Ignore),
            "replace-preserving-bytes" => Ok(RecoveryPolicy::ReplacePreservingBytes),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// 加载选项，显式地沿加载调用链传递，不存在进程级全局状态。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    #[serde(default)]
    pub errors: RecoveryPolicy,
    #[serde(default = "LoadOptions::default_skip_comments")]
    pub skip_comments: bool,
    /// 强制使用的文本编码标签（如 `windows-1251`），为空时根据文件头自动探测。
    #[serde(default)]
    pub encoding: Option<String>,
}

impl LoadOptions {
    fn default_skip_comments() -> bool {
        true
    }

    /// 读取自动发现的配置中的 `[loader]` 一节。
    pub fn discover() -> Result<Self, ConfigError> {
        ZdxfConfig::discover().map(|cfg| cfg.loader)
    }

    pub fn with_policy(mut self, errors: RecoveryPolicy) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_comments(mut self) -> Self {
        self.skip_comments = false;
        self
    }

    pub fn with_encoding(mut self, label: impl Into<String>) -> Self {
        self.encoding = Some(label.into());
        self
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            errors: RecoveryPolicy::default(),
            skip_comments: Self::default_skip_comments(),
            encoding: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("未知的解码恢复策略 \"{0}\"（可选 strict / ignore / replace-preserving-bytes）")]
    UnknownPolicy(String),
}
