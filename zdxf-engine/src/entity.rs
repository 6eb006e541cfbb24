//! 实体：公共核心、生命周期状态以及各类型的属性。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::DVec3;
use zdxf_core::codes;
use zdxf_core::diagnostics::{DiagnosticKind, Diagnostics};
use zdxf_core::handle::Handle;
use zdxf_core::tags::{Tag, TagValue};

use crate::errors::EngineError;

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// 文档标识，实体绑定后据此确认归属。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(u64);

impl DocumentId {
    pub(crate) fn next() -> Self {
        Self(NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 实体生命周期。状态只会沿 `Virtual → Bound → Linked` 前进或后退一步，`Destroyed` 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    /// 无句柄、无所有者，不在任何数据库中。
    #[default]
    Virtual,
    /// 已分配句柄并登记到文档，尚无所有者。
    Bound,
    /// 已挂到父容器下，写出时会被序列化。
    Linked,
    /// 已销毁，只保留墓碑。
    Destroyed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Virtual => "VIRTUAL",
            Lifecycle::Bound => "BOUND",
            Lifecycle::Linked => "LINKED",
            Lifecycle::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// 未识别标签在实体结构中的位置，写出时据此放回原处。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// 句柄之后、所有者之前的 `102` 应用数据组。
    Header,
    /// 所有者之后、第一个已识别的子类标记之前。
    Body,
    /// 已识别的子类标记之内，跟在该子类的已识别属性之后。
    Subclass(&'static str),
    /// 扩展数据，总在最后。
    Xdata,
}

/// 每种实体都内嵌的公共部分。
///
/// 不变量：`owner` 有值时 `handle` 必有值，`handle` 有值时 `doc` 必有值。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCore {
    pub(crate) handle: Option<Handle>,
    pub(crate) owner: Option<Handle>,
    pub(crate) doc: Option<DocumentId>,
    pub(crate) state: Lifecycle,
    /// 文件中声明的句柄与所有者，仅在加载期使用。
    pub(crate) declared_handle: Option<Handle>,
    pub(crate) declared_owner: Option<Handle>,
    /// 扩展字典（`{ACAD_XDICTIONARY` 组中的 360）。
    pub(crate) xdict: Option<Handle>,
    /// 未识别的标签，连同所在位置按原顺序保留。
    pub(crate) unknown: Vec<(Anchor, Tag)>,
}

impl EntityCore {
    #[inline]
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    #[inline]
    pub fn owner(&self) -> Option<Handle> {
        self.owner
    }

    #[inline]
    pub fn doc(&self) -> Option<DocumentId> {
        self.doc
    }

    #[inline]
    pub fn state(&self) -> Lifecycle {
        self.state
    }

    #[inline]
    pub fn declared_handle(&self) -> Option<Handle> {
        self.declared_handle
    }

    #[inline]
    pub fn declared_owner(&self) -> Option<Handle> {
        self.declared_owner
    }

    #[inline]
    pub fn xdict(&self) -> Option<Handle> {
        self.xdict
    }

    pub fn unknown_tags(&self) -> impl Iterator<Item = &Tag> + '_ {
        self.unknown.iter().map(|(_, tag)| tag)
    }

    /// 某个位置上保留的标签。
    pub fn unknown_at<'a>(&'a self, anchor: &'a Anchor) -> impl Iterator<Item = &'a Tag> + 'a {
        self.unknown
            .iter()
            .filter(move |(at, _)| at == anchor)
            .map(|(_, tag)| tag)
    }

    pub(crate) fn keep(&mut self, anchor: Anchor, tag: Tag) {
        self.unknown.push((anchor, tag));
    }
}

/// 调用方构造实体时提供的属性，名称即属性名（如 `layer`、`start`）。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribs {
    values: Vec<(String, TagValue)>,
}

impl Attribs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<TagValue>) -> Self {
        self.values.push((name.to_string(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> + '_ {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

fn invalid(name: &str, value: &TagValue) -> EngineError {
    EngineError::InvalidAttribute {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn expect_str(name: &str, value: &TagValue) -> Result<String, EngineError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(name, value))
}

fn expect_int(name: &str, value: &TagValue) -> Result<i64, EngineError> {
    value.as_int().ok_or_else(|| invalid(name, value))
}

fn expect_float(name: &str, value: &TagValue) -> Result<f64, EngineError> {
    value.as_float().ok_or_else(|| invalid(name, value))
}

fn expect_point(name: &str, value: &TagValue) -> Result<DVec3, EngineError> {
    value.as_point().ok_or_else(|| invalid(name, value))
}

/// 每种实体需要实现的行为。公共的加载与写出逻辑在 [`Entity`] 上。
pub trait DxfEntity {
    fn dxftype(&self) -> &str;
    fn core(&self) -> &EntityCore;
    fn core_mut(&mut self) -> &mut EntityCore;

    /// 加载时丢弃、写出时重新生成的子类标记（组码 100）。
    fn subclasses(&self) -> &'static [&'static str] {
        &[]
    }

    /// 处理一个属性标签，返回 `false` 表示未识别，标签将原样保留。
    fn load_tag(&mut self, _tag: &Tag) -> bool {
        false
    }

    /// 按 DXF 顺序写出已识别的属性（含子类标记）。
    fn export_attribs(&self, _out: &mut Vec<Tag>) {}

    fn set_attrib(&mut self, name: &str, _value: &TagValue) -> Result<(), EngineError> {
        Err(EngineError::UnknownAttribute {
            dxftype: self.dxftype().to_string(),
            name: name.to_string(),
        })
    }
}

/// 图形实体共有的属性。
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicAttribs {
    pub layer: String,
    pub linetype: Option<String>,
    pub color: Option<i64>,
    pub paperspace: bool,
}

impl Default for GraphicAttribs {
    fn default() -> Self {
        Self {
            layer: "0".to_string(),
            linetype: None,
            color: None,
            paperspace: false,
        }
    }
}

impl GraphicAttribs {
    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, &tag.value) {
            (codes::LAYER, TagValue::String(layer)) => self.layer = layer.clone(),
            (codes::LINETYPE, TagValue::String(linetype)) => self.linetype = Some(linetype.clone()),
            (62, TagValue::Int(color)) => self.color = Some(*color),
            (codes::PAPERSPACE, TagValue::Int(flag)) => self.paperspace = *flag == 1,
            _ => return false,
        }
        true
    }

    fn export(&self, out: &mut Vec<Tag>) {
        out.push(Tag::new(codes::SUBCLASS, "AcDbEntity"));
        if self.paperspace {
            out.push(Tag::new(codes::PAPERSPACE, 1i64));
        }
        out.push(Tag::new(codes::LAYER, self.layer.as_str()));
        if let Some(linetype) = &self.linetype {
            out.push(Tag::new(codes::LINETYPE, linetype.as_str()));
        }
        if let Some(color) = self.color {
            out.push(Tag::new(62, color));
        }
    }

    /// 返回 `Ok(false)` 表示不是公共属性。
    fn set(&mut self, name: &str, value: &TagValue) -> Result<bool, EngineError> {
        match name {
            "layer" => self.layer = expect_str(name, value)?,
            "linetype" => self.linetype = Some(expect_str(name, value)?),
            "color" => self.color = Some(expect_int(name, value)?),
            "paperspace" => self.paperspace = expect_int(name, value)? == 1,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

macro_rules! unknown_attrib {
    ($self:ident, $name:ident) => {
        Err(EngineError::UnknownAttribute {
            dxftype: $self.dxftype().to_string(),
            name: $name.to_string(),
        })
    };
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Line {
    pub core: EntityCore,
    pub graphic: GraphicAttribs,
    pub start: DVec3,
    pub end: DVec3,
}

impl DxfEntity for Line {
    fn dxftype(&self) -> &str {
        "LINE"
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn subclasses(&self) -> &'static [&'static str] {
        &["AcDbEntity", "AcDbLine"]
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, tag.value.as_point()) {
            (10, Some(point)) => self.start = point,
            (11, Some(point)) => self.end = point,
            _ => return self.graphic.load_tag(tag),
        }
        true
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        self.graphic.export(out);
        out.push(Tag::new(codes::SUBCLASS, "AcDbLine"));
        out.push(Tag::new(10, self.start));
        out.push(Tag::new(11, self.end));
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        match name {
            "start" => self.start = expect_point(name, value)?,
            "end" => self.end = expect_point(name, value)?,
            _ if self.graphic.set(name, value)? => {}
            _ => return unknown_attrib!(self, name),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Circle {
    pub core: EntityCore,
    pub graphic: GraphicAttribs,
    pub center: DVec3,
    pub radius: f64,
}

impl Default for Circle {
    fn default() -> Self {
        Self {
            core: EntityCore::default(),
            graphic: GraphicAttribs::default(),
            center: DVec3::ZERO,
            radius: 1.0,
        }
    }
}

impl DxfEntity for Circle {
    fn dxftype(&self) -> &str {
        "CIRCLE"
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn subclasses(&self) -> &'static [&'static str] {
        &["AcDbEntity", "AcDbCircle"]
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, &tag.value) {
            (10, TagValue::Point2(_) | TagValue::Point3(_)) => {
                self.center = tag.value.as_point().unwrap_or(self.center);
            }
            (40, TagValue::Float(radius)) => self.radius = *radius,
            _ => return self.graphic.load_tag(tag),
        }
        true
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        self.graphic.export(out);
        out.push(Tag::new(codes::SUBCLASS, "AcDbCircle"));
        out.push(Tag::new(10, self.center));
        out.push(Tag::new(40, self.radius));
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        match name {
            "center" => self.center = expect_point(name, value)?,
            "radius" => self.radius = expect_float(name, value)?,
            _ if self.graphic.set(name, value)? => {}
            _ => return unknown_attrib!(self, name),
        }
        Ok(())
    }
}

/// 块引用。
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub core: EntityCore,
    pub graphic: GraphicAttribs,
    pub block: String,
    pub insert: DVec3,
    pub scale: DVec3,
    pub rotation: f64,
}

impl Default for Insert {
    fn default() -> Self {
        Self {
            core: EntityCore::default(),
            graphic: GraphicAttribs::default(),
            block: String::new(),
            insert: DVec3::ZERO,
            scale: DVec3::ONE,
            rotation: 0.0,
        }
    }
}

impl DxfEntity for Insert {
    fn dxftype(&self) -> &str {
        "INSERT"
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn subclasses(&self) -> &'static [&'static str] {
        &["AcDbEntity", "AcDbBlockReference"]
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, &tag.value) {
            (codes::NAME, TagValue::String(block)) => self.block = block.clone(),
            (10, TagValue::Point2(_) | TagValue::Point3(_)) => {
                self.insert = tag.value.as_point().unwrap_or(self.insert);
            }
            (41, TagValue::Float(x)) => self.scale.x = *x,
            (42, TagValue::Float(y)) => self.scale.y = *y,
            (43, TagValue::Float(z)) => self.scale.z = *z,
            (50, TagValue::Float(rotation)) => self.rotation = *rotation,
            _ => return self.graphic.load_tag(tag),
        }
        true
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        self.graphic.export(out);
        out.push(Tag::new(codes::SUBCLASS, "AcDbBlockReference"));
        out.push(Tag::new(codes::NAME, self.block.as_str()));
        out.push(Tag::new(10, self.insert));
        if self.scale != DVec3::ONE {
            out.push(Tag::new(41, self.scale.x));
            out.push(Tag::new(42, self.scale.y));
            out.push(Tag::new(43, self.scale.z));
        }
        if self.rotation != 0.0 {
            out.push(Tag::new(50, self.rotation));
        }
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        match name {
            "name" => self.block = expect_str(name, value)?,
            "insert" => self.insert = expect_point(name, value)?,
            "xscale" => self.scale.x = expect_float(name, value)?,
            "yscale" => self.scale.y = expect_float(name, value)?,
            "zscale" => self.scale.z = expect_float(name, value)?,
            "rotation" => self.rotation = expect_float(name, value)?,
            _ if self.graphic.set(name, value)? => {}
            _ => return unknown_attrib!(self, name),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub core: EntityCore,
    pub name: String,
    pub flags: i64,
    pub color: i64,
    pub linetype: String,
}

impl Default for Layer {
    fn default() -> Self {
        Self {
            core: EntityCore::default(),
            name: String::new(),
            flags: 0,
            color: 7,
            linetype: "Continuous".to_string(),
        }
    }
}

impl DxfEntity for Layer {
    fn dxftype(&self) -> &str {
        "LAYER"
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn subclasses(&self) -> &'static [&'static str] {
        &["AcDbSymbolTableRecord", "AcDbLayerTableRecord"]
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, &tag.value) {
            (codes::NAME, TagValue::String(name)) => self.name = name.clone(),
            (70, TagValue::Int(flags)) => self.flags = *flags,
            (62, TagValue::Int(color)) => self.color = *color,
            (codes::LINETYPE, TagValue::String(linetype)) => self.linetype = linetype.clone(),
            _ => return false,
        }
        true
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        out.push(Tag::new(codes::SUBCLASS, "AcDbSymbolTableRecord"));
        out.push(Tag::new(codes::SUBCLASS, "AcDbLayerTableRecord"));
        out.push(Tag::new(codes::NAME, self.name.as_str()));
        out.push(Tag::new(70, self.flags));
        out.push(Tag::new(62, self.color));
        out.push(Tag::new(codes::LINETYPE, self.linetype.as_str()));
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        match name {
            "name" => self.name = expect_str(name, value)?,
            "flags" => self.flags = expect_int(name, value)?,
            "color" => self.color = expect_int(name, value)?,
            "linetype" => self.linetype = expect_str(name, value)?,
            _ => return unknown_attrib!(self, name),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Linetype {
    pub core: EntityCore,
    pub name: String,
    pub flags: i64,
    pub description: String,
}

impl DxfEntity for Linetype {
    fn dxftype(&self) -> &str {
        "LTYPE"
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn subclasses(&self) -> &'static [&'static str] {
        &["AcDbSymbolTableRecord", "AcDbLinetypeTableRecord"]
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, &tag.value) {
            (codes::NAME, TagValue::String(name)) => self.name = name.clone(),
            (70, TagValue::Int(flags)) => self.flags = *flags,
            (codes::NAME_ALT, TagValue::String(description)) => {
                self.description = description.clone();
            }
            _ => return false,
        }
        true
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        out.push(Tag::new(codes::SUBCLASS, "AcDbSymbolTableRecord"));
        out.push(Tag::new(codes::SUBCLASS, "AcDbLinetypeTableRecord"));
        out.push(Tag::new(codes::NAME, self.name.as_str()));
        out.push(Tag::new(70, self.flags));
        out.push(Tag::new(codes::NAME_ALT, self.description.as_str()));
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        match name {
            "name" => self.name = expect_str(name, value)?,
            "flags" => self.flags = expect_int(name, value)?,
            "description" => self.description = expect_str(name, value)?,
            _ => return unknown_attrib!(self, name),
        }
        Ok(())
    }
}

/// 块记录，同时充当布局（`*Model_Space`、`*Paper_Space`）中实体的容器。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockRecord {
    pub core: EntityCore,
    pub name: String,
}

impl DxfEntity for BlockRecord {
    fn dxftype(&self) -> &str {
        "BLOCK_RECORD"
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn subclasses(&self) -> &'static [&'static str] {
        &["AcDbSymbolTableRecord", "AcDbBlockTableRecord"]
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, &tag.value) {
            (codes::NAME, TagValue::String(name)) => self.name = name.clone(),
            _ => return false,
        }
        true
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        out.push(Tag::new(codes::SUBCLASS, "AcDbSymbolTableRecord"));
        out.push(Tag::new(codes::SUBCLASS, "AcDbBlockTableRecord"));
        out.push(Tag::new(codes::NAME, self.name.as_str()));
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        match name {
            "name" => self.name = expect_str(name, value)?,
            _ => return unknown_attrib!(self, name),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DictionaryEntry {
    pub key: String,
    pub handle: Handle,
    /// 360 为硬所有，350 为软所有。
    pub hard: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    pub core: EntityCore,
    pub entries: Vec<DictionaryEntry>,
    pub hard_owned: bool,
    pending_key: Option<String>,
}

impl Dictionary {
    pub fn get(&self, key: &str) -> Option<Handle> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.handle)
    }
}

impl DxfEntity for Dictionary {
    fn dxftype(&self) -> &str {
        "DICTIONARY"
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn subclasses(&self) -> &'static [&'static str] {
        &["AcDbDictionary"]
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        match (tag.code, &tag.value) {
            (codes::NAME_ALT, TagValue::String(key)) => self.pending_key = Some(key.clone()),
            (codes::SOFT_OWNER | codes::HARD_OWNER, TagValue::String(text)) => {
                let (Some(key), Some(handle)) = (self.pending_key.take(), Handle::parse(text))
                else {
                    return false;
                };
                self.entries.push(DictionaryEntry {
                    key,
                    handle,
                    hard: tag.code == codes::HARD_OWNER,
                });
            }
            (280, TagValue::Int(flag)) => self.hard_owned = *flag == 1,
            _ => return false,
        }
        true
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        out.push(Tag::new(codes::SUBCLASS, "AcDbDictionary"));
        if self.hard_owned {
            out.push(Tag::new(280, 1i64));
        }
        for entry in &self.entries {
            out.push(Tag::new(codes::NAME_ALT, entry.key.as_str()));
            let code = if entry.hard {
                codes::HARD_OWNER
            } else {
                codes::SOFT_OWNER
            };
            out.push(Tag::new(code, entry.handle.to_string()));
        }
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        match name {
            "hard_owned" => self.hard_owned = expect_int(name, value)? == 1,
            _ => return unknown_attrib!(self, name),
        }
        Ok(())
    }
}

/// 未实现的类型：全部标签原样保存。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagStorage {
    pub core: EntityCore,
    pub dxftype: String,
}

impl TagStorage {
    pub fn new(dxftype: impl Into<String>) -> Self {
        Self {
            core: EntityCore::default(),
            dxftype: dxftype.into(),
        }
    }

    /// 第一个组码 2 的值，TABLE/BLOCK 等结构实体用它作名称。
    pub fn name(&self) -> Option<&str> {
        self.core
            .unknown_tags()
            .find(|tag| tag.code == codes::NAME)
            .and_then(Tag::as_str)
    }
}

impl DxfEntity for TagStorage {
    fn dxftype(&self) -> &str {
        &self.dxftype
    }

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }
}

/// 所有实体类型的封闭集合。
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Line(Line),
    Circle(Circle),
    Insert(Insert),
    Layer(Layer),
    Linetype(Linetype),
    BlockRecord(BlockRecord),
    Dictionary(Dictionary),
    TagStorage(TagStorage),
}

macro_rules! dispatch {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            Entity::Line($inner) => $body,
            Entity::Circle($inner) => $body,
            Entity::Insert($inner) => $body,
            Entity::Layer($inner) => $body,
            Entity::Linetype($inner) => $body,
            Entity::BlockRecord($inner) => $body,
            Entity::Dictionary($inner) => $body,
            Entity::TagStorage($inner) => $body,
        }
    };
}

impl DxfEntity for Entity {
    fn dxftype(&self) -> &str {
        dispatch!(self, entity => entity.dxftype())
    }

    fn core(&self) -> &EntityCore {
        dispatch!(self, entity => entity.core())
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        dispatch!(self, entity => entity.core_mut())
    }

    fn subclasses(&self) -> &'static [&'static str] {
        dispatch!(self, entity => entity.subclasses())
    }

    fn load_tag(&mut self, tag: &Tag) -> bool {
        dispatch!(self, entity => entity.load_tag(tag))
    }

    fn export_attribs(&self, out: &mut Vec<Tag>) {
        dispatch!(self, entity => entity.export_attribs(out))
    }

    fn set_attrib(&mut self, name: &str, value: &TagValue) -> Result<(), EngineError> {
        dispatch!(self, entity => entity.set_attrib(name, value))
    }
}

impl Entity {
    #[inline]
    pub fn handle(&self) -> Option<Handle> {
        self.core().handle
    }

    #[inline]
    pub fn owner(&self) -> Option<Handle> {
        self.core().owner
    }

    #[inline]
    pub fn state(&self) -> Lifecycle {
        self.core().state
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), Lifecycle::Destroyed)
    }

    /// 句柄所在的组码，DIMSTYLE 表项使用 105。
    fn handle_code(&self) -> i32 {
        if self.dxftype() == "DIMSTYLE" {
            codes::DIMSTYLE_HANDLE
        } else {
            codes::HANDLE
        }
    }

    pub fn graphic(&self) -> Option<&GraphicAttribs> {
        match self {
            Entity::Line(line) => Some(&line.graphic),
            Entity::Circle(circle) => Some(&circle.graphic),
            Entity::Insert(insert) => Some(&insert.graphic),
            _ => None,
        }
    }

    pub fn graphic_mut(&mut self) -> Option<&mut GraphicAttribs> {
        match self {
            Entity::Line(line) => Some(&mut line.graphic),
            Entity::Circle(circle) => Some(&mut circle.graphic),
            Entity::Insert(insert) => Some(&mut insert.graphic),
            _ => None,
        }
    }

    /// 表项与块记录的名称。
    pub fn name(&self) -> Option<&str> {
        match self {
            Entity::Layer(layer) => Some(&layer.name),
            Entity::Linetype(linetype) => Some(&linetype.name),
            Entity::BlockRecord(record) => Some(&record.name),
            _ => None,
        }
    }

    /// 依次应用调用方属性。
    pub fn apply(&mut self, attribs: &Attribs) -> Result<(), EngineError> {
        for (name, value) in attribs.iter() {
            self.set_attrib(name, value)?;
        }
        Ok(())
    }

    /// 从编译后的标签段加载，第一个标签是 `(0, TYPE)`。
    ///
    /// 句柄与所有者只记为文件声明值；`102` 应用数据组、扩展数据以及所有未识别的标签连同位置原样保留。
    /// 第一个子类标记之前的 `102` 组属于头部，之后的算作所在子类的普通标签。
    pub(crate) fn load_tags(&mut self, run: &[Tag], diagnostics: &mut Diagnostics) {
        let handle_code = self.handle_code();
        let subclasses = self.subclasses();
        let mut anchor = Anchor::Body;
        let mut group: Option<(String, Anchor)> = None;
        let mut marker_seen = false;
        let mut handle_seen = false;
        let mut owner_seen = false;
        let mut in_xdata = false;

        for tag in run.iter().skip(1) {
            if tag.code >= codes::XDATA_APPID {
                in_xdata = true;
            }
            if in_xdata {
                self.core_mut().keep(Anchor::Xdata, tag.clone());
                continue;
            }
            if tag.code == codes::APP_DATA {
                let marker = tag.as_str().unwrap_or_default().trim();
                let at = match &group {
                    Some((_, at)) => at.clone(),
                    None if marker_seen => anchor.clone(),
                    None => Anchor::Header,
                };
                if marker.starts_with('{') {
                    group = Some((marker.to_string(), at.clone()));
                } else if marker == "}" {
                    group = None;
                }
                self.core_mut().keep(at, tag.clone());
                continue;
            }
            if let Some((name, at)) = &group {
                if name == "{ACAD_XDICTIONARY" && tag.code == codes::HARD_OWNER {
                    let xdict = tag.as_str().and_then(Handle::parse);
                    self.core_mut().xdict = xdict;
                }
                let at = at.clone();
                self.core_mut().keep(at, tag.clone());
                continue;
            }

            if tag.code == handle_code && !handle_seen {
                handle_seen = true;
                match tag.as_str().and_then(Handle::parse) {
                    Some(handle) => self.core_mut().declared_handle = Some(handle),
                    None => diagnostics.fixed(
                        DiagnosticKind::InvalidHandle,
                        format!("{} 的句柄 \"{}\" 无效，绑定时重新分配", self.dxftype(), tag.value),
                        None,
                    ),
                }
                continue;
            }
            if tag.code == codes::OWNER && !owner_seen {
                owner_seen = true;
                match tag.as_str().and_then(Handle::parse) {
                    Some(owner) => self.core_mut().declared_owner = Some(owner),
                    None => diagnostics.fixed(
                        DiagnosticKind::InvalidHandle,
                        format!("{} 的所有者句柄 \"{}\" 无效，已忽略", self.dxftype(), tag.value),
                        None,
                    ),
                }
                continue;
            }
            if tag.code == codes::SUBCLASS {
                marker_seen = true;
                let known = tag
                    .as_str()
                    .and_then(|marker| subclasses.iter().find(|known| **known == marker));
                if let Some(known) = known {
                    anchor = Anchor::Subclass(*known);
                    continue;
                }
            }
            if !self.load_tag(tag) {
                self.core_mut().keep(anchor.clone(), tag.clone());
            }
        }
    }

    /// 写回标签：类型、句柄、头部应用数据组、所有者，随后是各子类的已识别属性，
    /// 未识别的标签插回各自的子类末尾，扩展数据在最后。
    pub fn export_tags(&self) -> Vec<Tag> {
        let core = self.core();
        let subclasses = self.subclasses();
        let mut out = vec![Tag::new(codes::STRUCTURE, self.dxftype())];
        if let Some(handle) = core.handle {
            out.push(Tag::new(self.handle_code(), handle.to_string()));
        }
        out.extend(core.unknown_at(&Anchor::Header).cloned());
        if let Some(owner) = core.owner {
            out.push(Tag::new(codes::OWNER, owner.to_string()));
        }
        out.extend(core.unknown_at(&Anchor::Body).cloned());

        let mut attribs = Vec::new();
        self.export_attribs(&mut attribs);
        let mut written: Vec<&'static str> = Vec::new();
        for tag in attribs {
            let marker = (tag.code == codes::SUBCLASS)
                .then(|| tag.as_str())
                .flatten()
                .and_then(|marker| subclasses.iter().find(|known| **known == marker).copied());
            if let Some(marker) = marker {
                if let Some(open) = written.last() {
                    out.extend(core.unknown_at(&Anchor::Subclass(*open)).cloned());
                }
                written.push(marker);
            }
            out.push(tag);
        }
        if let Some(open) = written.last() {
            out.extend(core.unknown_at(&Anchor::Subclass(*open)).cloned());
        }
        // 子类标记未被写出时，其标签仍要保留
        out.extend(core.unknown.iter().filter_map(|(at, tag)| match at {
            Anchor::Subclass(marker) if !written.contains(marker) => Some(tag.clone()),
            _ => None,
        }));
        out.extend(core.unknown_at(&Anchor::Xdata).cloned());
        out
    }

    /// 不带句柄、所有者与扩展字典的虚拟副本，可再绑定到任一文档。
    ///
    /// 头部的应用数据组引用原实体所在文档的对象，不随副本复制。
    pub fn copy(&self) -> Entity {
        let mut copy = self.clone();
        let core = copy.core_mut();
        core.handle = None;
        core.owner = None;
        core.doc = None;
        core.state = Lifecycle::Virtual;
        core.declared_handle = None;
        core.declared_owner = None;
        core.xdict = None;
        core.unknown.retain(|(at, _)| *at != Anchor::Header);
        copy
    }

    /// 销毁调用方持有的实体：丢弃全部属性，只保留类型与句柄。重复调用无副作用。
    pub fn destroy(&mut self) {
        if !self.is_alive() {
            return;
        }
        let dxftype = self.dxftype().to_string();
        let previous = std::mem::take(self.core_mut());
        let core = EntityCore {
            handle: previous.handle,
            doc: previous.doc,
            state: Lifecycle::Destroyed,
            ..EntityCore::default()
        };
        *self = Entity::TagStorage(TagStorage { core, dxftype });
    }
}
