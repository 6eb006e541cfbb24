pub mod codes {
    //! DXF 组码常量与组码 → 值类型查找表。

    pub const STRUCTURE: i32 = 0;
    pub const TEXT: i32 = 1;
    pub const NAME: i32 = 2;
    pub const NAME_ALT: i32 = 3;
    pub const HANDLE: i32 = 5;
    pub const LINETYPE: i32 = 6;
    pub const LAYER: i32 = 8;
    pub const HEADER_VAR: i32 = 9;
    pub const PAPERSPACE: i32 = 67;
    pub const SUBCLASS: i32 = 100;
    pub const APP_DATA: i32 = 102;
    pub const DIMSTYLE_HANDLE: i32 = 105;
    pub const OWNER: i32 = 330;
    pub const SOFT_OWNER: i32 = 350;
    pub const HARD_OWNER: i32 = 360;
    pub const COMMENT: i32 = 999;
    pub const XDATA_APPID: i32 = 1001;

    /// 组码对应的语义类型。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ValueKind {
        String,
        Int16,
        Int32,
        Int64,
        /// 二进制 DXF 中以单字节存储的布尔/字节值，文本中按整数处理。
        Bool,
        Float,
        /// 坐标族的 X 分量，后随 Y（+10）与可选的 Z（+20）。
        Point,
        Binary,
    }

    impl ValueKind {
        #[inline]
        pub fn is_integer(self) -> bool {
            matches!(
                self,
                ValueKind::Int16 | ValueKind::Int32 | ValueKind::Int64 | ValueKind::Bool
            )
        }
    }

    /// 组码 → 类型的静态表，按连续区间匹配，未列出的组码一律视为字符串。
    pub const fn value_kind(code: i32) -> ValueKind {
        match code {
            10..=18 | 110..=112 | 210..=213 | 1010..=1013 => ValueKind::Point,
            310..=319 | 1004 => ValueKind::Binary,
            60..=79 | 170..=179 | 270..=289 | 370..=389 | 400..=409 | 1060..=1070 => {
                ValueKind::Int16
            }
            90..=99 | 420..=429 | 440..=459 | 1071 => ValueKind::Int32,
            160..=169 => ValueKind::Int64,
            290..=299 => ValueKind::Bool,
            19..=59 | 113..=149 | 214..=239 | 460..=469 | 1014..=1059 => ValueKind::Float,
            _ => ValueKind::String,
        }
    }

    #[inline]
    pub const fn is_point_code(code: i32) -> bool {
        matches!(value_kind(code), ValueKind::Point)
    }

    #[inline]
    pub const fn is_binary_code(code: i32) -> bool {
        matches!(value_kind(code), ValueKind::Binary)
    }
}

pub mod tags {
    use std::fmt;

    use glam::{DVec2, DVec3};
    use serde::{Deserialize, Serialize};

    use crate::codes;

    /// 编译后的标签值。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum TagValue {
        String(String),
        Int(i64),
        Float(f64),
        Point2(DVec2),
        Point3(DVec3),
        Binary(Vec<u8>),
    }

    impl TagValue {
        #[inline]
        pub fn as_str(&self) -> Option<&str> {
            match self {
                TagValue::String(value) => Some(value),
                _ => None,
            }
        }

        #[inline]
        pub fn as_int(&self) -> Option<i64> {
            match self {
                TagValue::Int(value) => Some(*value),
                _ => None,
            }
        }

        /// 浮点值；整数值也可按浮点读取。
        #[inline]
        pub fn as_float(&self) -> Option<f64> {
            match self {
                TagValue::Float(value) => Some(*value),
                TagValue::Int(value) => Some(*value as f64),
                _ => None,
            }
        }

        /// 坐标值，二维点的 Z 分量按 0 处理。
        #[inline]
        pub fn as_point(&self) -> Option<DVec3> {
            match self {
                TagValue::Point2(point) => Some(point.extend(0.0)),
                TagValue::Point3(point) => Some(*point),
                _ => None,
            }
        }

        #[inline]
        pub fn as_bytes(&self) -> Option<&[u8]> {
            match self {
                TagValue::Binary(bytes) => Some(bytes),
                _ => None,
            }
        }
    }

    impl fmt::Display for TagValue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                TagValue::String(value) => f.write_str(value),
                TagValue::Int(value) => write!(f, "{value}"),
                TagValue::Float(value) => write!(f, "{value}"),
                TagValue::Point2(p) => write!(f, "({}, {})", p.x, p.y),
                TagValue::Point3(p) => write!(f, "({}, {}, {})", p.x, p.y, p.z),
                TagValue::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            }
        }
    }

    impl From<&str> for TagValue {
        fn from(value: &str) -> Self {
            TagValue::String(value.to_string())
        }
    }

    impl From<String> for TagValue {
        fn from(value: String) -> Self {
            TagValue::String(value)
        }
    }

    impl From<i64> for TagValue {
        fn from(value: i64) -> Self {
            TagValue::Int(value)
        }
    }

    impl From<i32> for TagValue {
        fn from(value: i32) -> Self {
            TagValue::Int(value as i64)
        }
    }

    impl From<f64> for TagValue {
        fn from(value: f64) -> Self {
            TagValue::Float(value)
        }
    }

    impl From<DVec2> for TagValue {
        fn from(value: DVec2) -> Self {
            TagValue::Point2(value)
        }
    }

    impl From<DVec3> for TagValue {
        fn from(value: DVec3) -> Self {
            TagValue::Point3(value)
        }
    }

    impl From<Vec<u8>> for TagValue {
        fn from(value: Vec<u8>) -> Self {
            TagValue::Binary(value)
        }
    }

    /// 不可变的 `(组码, 值)` 对。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Tag {
        pub code: i32,
        pub value: TagValue,
    }

    impl Tag {
        #[inline]
        pub fn new(code: i32, value: impl Into<TagValue>) -> Self {
            Self {
                code,
                value: value.into(),
            }
        }

        /// 判断是否为指定名称的结构标签，例如 `(0, "SECTION")`。
        #[inline]
        pub fn is_structure(&self, name: &str) -> bool {
            self.code == codes::STRUCTURE && self.value.as_str() == Some(name)
        }

        #[inline]
        pub fn as_str(&self) -> Option<&str> {
            self.value.as_str()
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "({}, {})", self.code, self.value)
        }
    }

    /// 以 `(0, TYPE)` 开头、直到下一个组码 0 之前的一段标签。
    pub type TagRun = Vec<Tag>;
}

pub mod handle {
    use std::fmt;

    use serde::{Deserialize, Serialize};

    /// 实体句柄。DXF 中以十六进制字符串表示，`0` 保留为“无所有者”哨兵。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct Handle(u64);

    impl Handle {
        pub const NULL: Handle = Handle(0);

        #[inline]
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        #[inline]
        pub fn get(self) -> u64 {
            self.0
        }

        #[inline]
        pub fn is_null(self) -> bool {
            self.0 == 0
        }

        /// 解析十六进制句柄文本，非法或超长时返回 `None`。
        pub fn parse(text: &str) -> Option<Self> {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.len() > 16 {
                return None;
            }
            u64::from_str_radix(trimmed, 16).ok().map(Self)
        }
    }

    impl fmt::Display for Handle {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:X}", self.0)
        }
    }

    /// 单调递增的句柄发生器，可用 `$HANDSEED` 重置起点。
    ///
    /// 发出 `u64::MAX` 之后发生器耗尽，不会回绕。
    #[derive(Debug, Clone)]
    pub struct HandleGenerator {
        next: Option<u64>,
    }

    impl HandleGenerator {
        pub fn new() -> Self {
            Self { next: Some(1) }
        }

        pub fn from_seed(seed: Handle) -> Self {
            let mut generator = Self::new();
            generator.reset(seed);
            generator
        }

        /// 重置起点；种子为 0 时退回到 1。
        pub fn reset(&mut self, seed: Handle) {
            self.next = Some(seed.get().max(1));
        }

        /// 下一个尚未发出的句柄，不推进发生器。
        #[inline]
        pub fn peek(&self) -> Option<Handle> {
            self.next.map(Handle)
        }

        #[inline]
        pub fn is_exhausted(&self) -> bool {
            self.next.is_none()
        }

        pub fn next_handle(&mut self) -> Option<Handle> {
            let current = self.next?;
            self.next = current.checked_add(1);
            Some(Handle(current))
        }
    }

    impl Default for HandleGenerator {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub mod diagnostics {
    use serde::{Deserialize, Serialize};
    use tracing::{debug, warn};

    use crate::handle::Handle;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Severity {
        /// 仅作记录，数据未被改动。
        Info,
        /// 已自动修复。
        Fixed,
        /// 无法修复，相关实体已销毁。
        Destroyed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DiagnosticKind {
        InvalidValue,
        DecodingError,
        TagOutsideSection,
        TruncatedContent,
        InvalidHandle,
        DuplicateHandle,
        MissingResource,
        ReferenceDropped,
        OwnerMismatch,
        UnlinkableEntity,
        UnrecoverableEntity,
        MissingRequiredStructure,
        InvalidBootstrapEntry,
        DeadReference,
    }

    /// 可恢复问题的结构化记录。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Diagnostic {
        pub severity: Severity,
        pub kind: DiagnosticKind,
        pub message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub handle: Option<Handle>,
    }

    /// 加载过程中收集（而非抛出）的诊断列表。
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct Diagnostics {
        records: Vec<Diagnostic>,
    }

    impl Diagnostics {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, diagnostic: Diagnostic) {
            let handle = diagnostic.handle.map(|h| h.to_string());
            match diagnostic.severity {
                Severity::Info => debug!(
                    kind = ?diagnostic.kind,
                    handle = handle.as_deref(),
                    "{}",
                    diagnostic.message
                ),
                Severity::Fixed | Severity::Destroyed => warn!(
                    kind = ?diagnostic.kind,
                    severity = ?diagnostic.severity,
                    handle = handle.as_deref(),
                    "{}",
                    diagnostic.message
                ),
            }
            self.records.push(diagnostic);
        }

        pub fn record(
            &mut self,
            severity: Severity,
            kind: DiagnosticKind,
            message: impl Into<String>,
            handle: Option<Handle>,
        ) {
            self.push(Diagnostic {
                severity,
                kind,
                message: message.into(),
                handle,
            });
        }

        #[inline]
        pub fn info(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
            self.record(Severity::Info, kind, message, None);
        }

        #[inline]
        pub fn fixed(
            &mut self,
            kind: DiagnosticKind,
            message: impl Into<String>,
            handle: Option<Handle>,
        ) {
            self.record(Severity::Fixed, kind, message, handle);
        }

        #[inline]
        pub fn destroyed(&mut self, kind: DiagnosticKind, message: impl Into<String>, handle: Handle) {
            self.record(Severity::Destroyed, kind, message, Some(handle));
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.records.len()
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.records.is_empty()
        }

        pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
            self.records.iter()
        }

        pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> + '_ {
            self.records.iter().filter(move |d| d.kind == kind)
        }

        /// 合并另一阶段产生的诊断，保持原有顺序，不重复记录日志。
        pub fn append(&mut self, other: Diagnostics) {
            self.records.extend(other.records);
        }
    }

    impl IntoIterator for Diagnostics {
        type Item = Diagnostic;
        type IntoIter = std::vec::IntoIter<Diagnostic>;

        fn into_iter(self) -> Self::IntoIter {
            self.records.into_iter()
        }
    }
}
