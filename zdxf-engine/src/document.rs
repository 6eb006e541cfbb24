//! 文档：持有实体数据库，实现 BIND / LINK / UNLINK / UNBIND / DESTROY 生命周期操作。

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};
use zdxf_core::codes;
use zdxf_core::diagnostics::{DiagnosticKind, Diagnostics, Severity};
use zdxf_core::handle::Handle;
use zdxf_core::tags::{Tag, TagValue};
use zdxf_io::Section;

use crate::entity::{
    Anchor, Attribs, BlockRecord, Dictionary, DocumentId, DxfEntity, Entity, Layer, Lifecycle, Linetype,
    TagStorage,
};
use crate::entitydb::{AuditIssue, BindOutcome, EntityDatabase};
use crate::errors::EngineError;
use crate::factory::EntityFactory;

pub const MODEL_SPACE: &str = "*Model_Space";
pub const PAPER_SPACE: &str = "*Paper_Space";

const LAYER: &str = "LAYER";
const LTYPE: &str = "LTYPE";
const BLOCK_RECORD: &str = "BLOCK_RECORD";

/// `$HANDSEED` 之后至少要留出的可分配句柄数。
const HANDSEED_HEADROOM: u64 = 1 << 32;

/// 绑定时对引用资源的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPolicy {
    /// 当前会话创建的实体：缺少图层、线型或块时报错。
    Strict,
    /// 从文件加载或从其他文档复制的实体：自动修复并记录诊断。
    Lenient,
    /// 文档自身的引导结构：只检查名称与句柄。
    Bootstrap,
}

fn is_logical_linetype(name: &str) -> bool {
    name.eq_ignore_ascii_case("BYLAYER") || name.eq_ignore_ascii_case("BYBLOCK")
}

/// `HEADER` 段的变量表，保持文件顺序。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderVars {
    vars: Vec<(String, Vec<Tag>)>,
}

impl HeaderVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以组码 9 划分变量；第一个变量名之前的标签被忽略。
    pub fn from_tags(tags: &[Tag]) -> Self {
        let mut header = Self::new();
        for tag in tags {
            if tag.code == codes::HEADER_VAR {
                let name = tag.as_str().unwrap_or_default().to_string();
                header.vars.push((name, Vec::new()));
            } else if let Some((_, values)) = header.vars.last_mut() {
                values.push(tag.clone());
            }
        }
        header
    }

    pub fn get(&self, name: &str) -> Option<&[Tag]> {
        self.vars
            .iter()
            .find(|(var, _)| var == name)
            .map(|(_, tags)| tags.as_slice())
    }

    /// 变量的第一个值。
    pub fn value(&self, name: &str) -> Option<&TagValue> {
        self.get(name)?.first().map(|tag| &tag.value)
    }

    pub fn set(&mut self, name: &str, tags: Vec<Tag>) {
        match self.vars.iter_mut().find(|(var, _)| var == name) {
            Some((_, values)) => *values = tags,
            None => self.vars.push((name.to_string(), tags)),
        }
    }

    pub fn handseed(&self) -> Option<Handle> {
        self.value("$HANDSEED")?.as_str().and_then(Handle::parse)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.vars.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn export(&self) -> Vec<Tag> {
        let mut out = Vec::new();
        for (name, values) in &self.vars {
            out.push(Tag::new(codes::HEADER_VAR, name.as_str()));
            out.extend(values.iter().cloned());
        }
        out
    }
}

/// 内存中的文档图。
#[derive(Debug)]
pub struct Document {
    id: DocumentId,
    db: EntityDatabase,
    factory: EntityFactory,
    header: HeaderVars,
    raw_sections: Vec<Section>,
    tables: BTreeMap<String, Handle>,
    resources: HashMap<(&'static str, String), Handle>,
    rootdict: Option<Handle>,
    diagnostics: Diagnostics,
}

impl Document {
    /// 新建文档并创建必需的引导结构。
    pub fn new() -> Self {
        Self::with_factory(EntityFactory::with_defaults())
    }

    pub fn with_factory(factory: EntityFactory) -> Self {
        let mut doc = Self::blank(factory);
        doc.header
            .set("$ACADVER", vec![Tag::new(codes::TEXT, "AC1015")]);

        let layers = doc.bootstrap_table(LAYER);
        let linetypes = doc.bootstrap_table(LTYPE);
        let records = doc.bootstrap_table(BLOCK_RECORD);

        for name in ["ByBlock", "ByLayer", "Continuous"] {
            let linetype = Linetype {
                name: name.to_string(),
                ..Linetype::default()
            };
            doc.bootstrap_entity(Entity::Linetype(linetype), linetypes);
        }
        let layer = Layer {
            name: "0".to_string(),
            ..Layer::default()
        };
        doc.bootstrap_entity(Entity::Layer(layer), layers);
        for name in [MODEL_SPACE, PAPER_SPACE] {
            let record = BlockRecord {
                name: name.to_string(),
                ..BlockRecord::default()
            };
            doc.bootstrap_entity(Entity::BlockRecord(record), records);
        }
        doc.rootdict = doc.bootstrap_entity(Entity::Dictionary(Dictionary::default()), None);
        debug!(doc = doc.id.get(), entities = doc.db.len(), "新文档已初始化");
        doc
    }

    /// 不含任何结构的空文档，供加载器填充。
    pub(crate) fn blank(factory: EntityFactory) -> Self {
        Self {
            id: DocumentId::next(),
            db: EntityDatabase::new(),
            factory,
            header: HeaderVars::new(),
            raw_sections: Vec::new(),
            tables: BTreeMap::new(),
            resources: HashMap::new(),
            rootdict: None,
            diagnostics: Diagnostics::new(),
        }
    }

    fn bootstrap_table(&mut self, name: &str) -> Option<Handle> {
        let mut head = TagStorage::new("TABLE");
        head.core.keep(Anchor::Body, Tag::new(codes::NAME, name));
        head.core.keep(Anchor::Body, Tag::new(70, 0i64));
        let handle = self.bootstrap_entity(Entity::TagStorage(head), None)?;
        self.tables.insert(name.to_string(), handle);
        Some(handle)
    }

    /// 以引导策略绑定并挂到 `parent` 下，失败时记为诊断。
    pub(crate) fn bootstrap_entity(
        &mut self,
        entity: Entity,
        parent: Option<Handle>,
    ) -> Option<Handle> {
        match self.bind(entity, BindPolicy::Bootstrap) {
            Ok(handle) => {
                if let Some(parent) = parent {
                    if let Err(err) = self.db.link(handle, parent) {
                        warn!(handle = %handle, parent = %parent, "引导实体无法链接: {err}");
                    }
                }
                Some(handle)
            }
            Err(err) => {
                self.diagnostics
                    .info(DiagnosticKind::InvalidBootstrapEntry, err.to_string());
                None
            }
        }
    }

    #[inline]
    pub fn id(&self) -> DocumentId {
        self.id
    }

    #[inline]
    pub fn db(&self) -> &EntityDatabase {
        &self.db
    }

    #[inline]
    pub fn factory(&self) -> &EntityFactory {
        &self.factory
    }

    /// 用于后期注册自定义实体类型。
    #[inline]
    pub fn factory_mut(&mut self) -> &mut EntityFactory {
        &mut self.factory
    }

    #[inline]
    pub fn header(&self) -> &HeaderVars {
        &self.header
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut HeaderVars {
        &mut self.header
    }

    /// 采用文件头；`$HANDSEED` 过于靠近句柄上限时不采用，新句柄从已用句柄之外分配。
    pub(crate) fn set_header(&mut self, header: HeaderVars) {
        match header.handseed() {
            Some(seed) if u64::MAX - seed.get() < HANDSEED_HEADROOM => {
                self.diagnostics.fixed(
                    DiagnosticKind::InvalidHandle,
                    format!("$HANDSEED {seed} 超出可分配范围，已忽略"),
                    None,
                );
            }
            Some(seed) => self.db.seed(seed),
            None => {}
        }
        self.header = header;
    }

    /// 当前应写回 `$HANDSEED` 的值；句柄空间用尽时为 `None`。
    pub fn handseed(&self) -> Option<Handle> {
        self.db.next_free()
    }

    #[inline]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Diagnostics {
        std::mem::take(&mut self.diagnostics)
    }

    /// 原样保留的段（`CLASSES` 与未知段）。
    pub fn raw_sections(&self) -> &[Section] {
        &self.raw_sections
    }

    pub fn raw_section(&self, name: &str) -> Option<&Section> {
        self.raw_sections.iter().find(|section| section.name == name)
    }

    pub(crate) fn push_raw_section(&mut self, section: Section) {
        self.raw_sections.push(section);
    }

    /// 表头（`TABLE` 实体）的句柄，按表名查找。
    pub fn table(&self, name: &str) -> Option<Handle> {
        self.tables
            .get(&name.to_ascii_uppercase())
            .copied()
            .filter(|handle| self.db.is_alive(*handle))
    }

    pub(crate) fn register_table(&mut self, name: &str, handle: Handle) {
        self.tables
            .entry(name.to_ascii_uppercase())
            .or_insert(handle);
    }

    pub fn rootdict(&self) -> Option<Handle> {
        self.rootdict.filter(|handle| self.db.is_alive(*handle))
    }

    pub(crate) fn set_rootdict(&mut self, handle: Handle) {
        self.rootdict = Some(handle);
    }

    #[inline]
    pub fn lookup(&self, handle: Handle) -> Option<&Entity> {
        self.db.lookup(handle)
    }

    #[inline]
    pub fn lookup_mut(&mut self, handle: Handle) -> Option<&mut Entity> {
        self.db.lookup_mut(handle)
    }

    #[inline]
    pub fn is_alive(&self, handle: Handle) -> bool {
        self.db.is_alive(handle)
    }

    pub fn entities(&self) -> impl Iterator<Item = (Handle, &Entity)> + '_ {
        self.db.iter()
    }

    fn resource_kind(entity: &Entity) -> Option<&'static str> {
        match entity {
            Entity::Layer(_) => Some(LAYER),
            Entity::Linetype(_) => Some(LTYPE),
            Entity::BlockRecord(_) => Some(BLOCK_RECORD),
            _ => None,
        }
    }

    fn index_resource(&mut self, handle: Handle) {
        let Some(entity) = self.db.lookup(handle) else {
            return;
        };
        let (Some(kind), Some(name)) = (Self::resource_kind(entity), entity.name()) else {
            return;
        };
        let key = (kind, name.to_uppercase());
        let stale = self
            .resources
            .get(&key)
            .is_some_and(|existing| !self.db.is_alive(*existing));
        if stale || !self.resources.contains_key(&key) {
            self.resources.insert(key, handle);
        }
    }

    /// 按类型（`LAYER`、`LTYPE`、`BLOCK_RECORD`）和名称查找存活的资源，名称不区分大小写。
    pub fn resource(&self, kind: &str, name: &str) -> Option<Handle> {
        let matches = |entity: &Entity| {
            Self::resource_kind(entity) == Some(kind)
                && entity
                    .name()
                    .is_some_and(|candidate| candidate.eq_ignore_ascii_case(name))
        };
        let indexed = self
            .resources
            .iter()
            .find(|((key_kind, key_name), _)| *key_kind == kind && key_name.eq_ignore_ascii_case(name))
            .map(|(_, handle)| *handle)
            .filter(|handle| self.db.lookup(*handle).is_some_and(matches));
        indexed.or_else(|| {
            self.db
                .iter()
                .find(|(_, entity)| matches(*entity))
                .map(|(handle, _)| handle)
        })
    }

    pub fn layout(&self, name: &str) -> Option<Handle> {
        self.resource(BLOCK_RECORD, name)
    }

    pub fn modelspace(&self) -> Option<Handle> {
        self.layout(MODEL_SPACE)
    }

    pub fn paperspace(&self) -> Option<Handle> {
        self.layout(PAPER_SPACE)
    }

    /// 布局或块记录下的实体，不含 `BLOCK`/`ENDBLK` 结构实体。
    pub fn layout_entities(&self, layout: Handle) -> impl Iterator<Item = (Handle, &Entity)> + '_ {
        self.db
            .children(layout)
            .iter()
            .filter_map(|handle| self.db.lookup(*handle).map(|entity| (*handle, entity)))
            .filter(|(_, entity)| !matches!(entity.dxftype(), "BLOCK" | "ENDBLK"))
    }

    pub fn export_entity(&self, handle: Handle) -> Option<Vec<Tag>> {
        self.db.lookup(handle).map(Entity::export_tags)
    }

    /// 按文档的工厂加载一个标签段，加载期诊断记入文档。
    pub(crate) fn load_entity(&mut self, run: &[Tag]) -> Entity {
        self.factory.load(run, &mut self.diagnostics)
    }

    /// 由工厂构造一个虚拟实体。
    pub fn create(&self, dxftype: &str, attribs: &Attribs) -> Result<Entity, EngineError> {
        self.factory.create(dxftype, attribs)
    }

    /// 严格绑定后挂到布局下。
    pub fn add(&mut self, entity: Entity, layout: Handle) -> Result<Handle, EngineError> {
        if !self.db.is_alive(layout) {
            return Err(EngineError::EntityNotFound(layout));
        }
        let handle = self.bind(entity, BindPolicy::Strict)?;
        self.link(handle, layout)?;
        Ok(handle)
    }

    pub fn add_to_modelspace(&mut self, entity: Entity) -> Result<Handle, EngineError> {
        let layout = self
            .modelspace()
            .ok_or_else(|| EngineError::MissingResource {
                kind: BLOCK_RECORD,
                name: MODEL_SPACE.to_string(),
            })?;
        self.add(entity, layout)
    }

    /// VIRTUAL → BOUND。
    pub fn bind(&mut self, entity: Entity, policy: BindPolicy) -> Result<Handle, EngineError> {
        if entity.state() != Lifecycle::Virtual {
            return Err(EngineError::InvalidTransition {
                handle: entity.handle(),
                action: "bind",
                state: entity.state(),
            });
        }
        match policy {
            BindPolicy::Strict => self.check_resources(&entity)?,
            BindPolicy::Bootstrap => self.validate_bootstrap(&entity)?,
            BindPolicy::Lenient => {}
        }
        let handle = self.register(entity)?;
        if policy == BindPolicy::Lenient {
            self.repair_resources(handle)?;
        }
        Ok(handle)
    }

    /// 只登记、不校验资源，加载期先于所有权解析使用。
    pub(crate) fn register(&mut self, entity: Entity) -> Result<Handle, EngineError> {
        let dxftype = entity.dxftype().to_string();
        let outcome = self.db.bind(entity, self.id)?;
        if let BindOutcome::Reassigned {
            requested,
            assigned,
        } = outcome
        {
            self.diagnostics.fixed(
                DiagnosticKind::DuplicateHandle,
                format!("{dxftype} 的句柄 {requested} 已被占用，改为 {assigned}"),
                Some(assigned),
            );
        }
        let handle = outcome.handle();
        self.index_resource(handle);
        Ok(handle)
    }

    fn check_resources(&self, entity: &Entity) -> Result<(), EngineError> {
        let Some(graphic) = entity.graphic() else {
            return Ok(());
        };
        if self.resource(LAYER, &graphic.layer).is_none() {
            return Err(EngineError::MissingResource {
                kind: LAYER,
                name: graphic.layer.clone(),
            });
        }
        if let Some(linetype) = &graphic.linetype {
            if !is_logical_linetype(linetype) && self.resource(LTYPE, linetype).is_none() {
                return Err(EngineError::MissingResource {
                    kind: LTYPE,
                    name: linetype.clone(),
                });
            }
        }
        if let Entity::Insert(insert) = entity {
            if self.resource(BLOCK_RECORD, &insert.block).is_none() {
                return Err(EngineError::MissingResource {
                    kind: BLOCK_RECORD,
                    name: insert.block.clone(),
                });
            }
        }
        Ok(())
    }

    /// 引导实体只做自包含的检查：名称非空、声明的句柄可用。
    pub(crate) fn validate_bootstrap(&self, entity: &Entity) -> Result<(), EngineError> {
        let needs_name = match entity {
            Entity::Layer(_) | Entity::Linetype(_) | Entity::BlockRecord(_) => true,
            Entity::TagStorage(storage) => storage.dxftype == "TABLE",
            _ => false,
        };
        let name = match entity {
            Entity::TagStorage(storage) => storage.name(),
            other => other.name(),
        };
        if needs_name && name.is_none_or(|name| name.trim().is_empty()) {
            return Err(EngineError::InvalidBootstrapEntry(format!(
                "{} 缺少名称",
                entity.dxftype()
            )));
        }
        if let Some(handle) = entity.core().declared_handle() {
            if self.db.is_reserved(handle) {
                return Err(EngineError::HandleInUse(handle));
            }
        }
        Ok(())
    }

    /// 宽松修复：补占位图层、丢弃无效线型引用；引用的块不存在时销毁实体。
    pub(crate) fn repair_resources(&mut self, handle: Handle) -> Result<(), EngineError> {
        let Some(entity) = self.db.lookup(handle) else {
            return Ok(());
        };
        let Some(graphic) = entity.graphic() else {
            return Ok(());
        };
        let dxftype = entity.dxftype().to_string();
        let layer = graphic.layer.clone();
        let linetype = graphic.linetype.clone();
        let block = match entity {
            Entity::Insert(insert) => Some(insert.block.clone()),
            _ => None,
        };

        if let Some(block) = block {
            if self.resource(BLOCK_RECORD, &block).is_none() {
                self.diagnostics.destroyed(
                    DiagnosticKind::UnrecoverableEntity,
                    format!("{dxftype} 引用的块 \"{block}\" 不存在"),
                    handle,
                );
                return self.destroy(handle);
            }
        }

        if layer.trim().is_empty() {
            self.set_layer(handle, "0");
            self.diagnostics.fixed(
                DiagnosticKind::ReferenceDropped,
                format!("{dxftype} 的图层名为空，改为 0"),
                Some(handle),
            );
            return self.repair_resources(handle);
        }
        if self.resource(LAYER, &layer).is_none() {
            self.placeholder_layer(&layer)?;
            self.diagnostics.fixed(
                DiagnosticKind::MissingResource,
                format!("{dxftype} 引用的图层 \"{layer}\" 不存在，已创建占位图层"),
                Some(handle),
            );
        }

        if let Some(linetype) = linetype {
            if !is_logical_linetype(&linetype) && self.resource(LTYPE, &linetype).is_none() {
                if let Some(graphic) = self.db.lookup_mut(handle).and_then(Entity::graphic_mut) {
                    graphic.linetype = Some("BYLAYER".to_string());
                }
                self.diagnostics.fixed(
                    DiagnosticKind::ReferenceDropped,
                    format!("{dxftype} 引用的线型 \"{linetype}\" 不存在，改为 BYLAYER"),
                    Some(handle),
                );
            }
        }
        Ok(())
    }

    fn set_layer(&mut self, handle: Handle, layer: &str) {
        if let Some(graphic) = self.db.lookup_mut(handle).and_then(Entity::graphic_mut) {
            graphic.layer = layer.to_string();
        }
    }

    fn placeholder_layer(&mut self, name: &str) -> Result<Handle, EngineError> {
        let layer = Layer {
            name: name.to_string(),
            ..Layer::default()
        };
        let handle = self.register(Entity::Layer(layer))?;
        if let Some(table) = self.table(LAYER) {
            self.db.link(handle, table)?;
        }
        Ok(handle)
    }

    /// 补齐缺失的模型空间与图纸空间块记录。
    pub(crate) fn ensure_layouts(&mut self) {
        let records = self.table(BLOCK_RECORD);
        for name in [MODEL_SPACE, PAPER_SPACE] {
            if self.layout(name).is_some() {
                continue;
            }
            let record = BlockRecord {
                name: name.to_string(),
                ..BlockRecord::default()
            };
            if let Some(handle) = self.bootstrap_entity(Entity::BlockRecord(record), records) {
                self.diagnostics.fixed(
                    DiagnosticKind::MissingRequiredStructure,
                    format!("缺少布局 {name}，已创建"),
                    Some(handle),
                );
            }
        }
    }

    /// BOUND → LINKED。
    pub fn link(&mut self, child: Handle, parent: Handle) -> Result<(), EngineError> {
        self.db.link(child, parent)
    }

    /// LINKED → BOUND。
    pub fn unlink(&mut self, child: Handle) -> Result<(), EngineError> {
        self.db.unlink(child)
    }

    /// BOUND/LINKED → VIRTUAL，实体交还调用方，句柄不再复用。
    pub fn unbind(&mut self, handle: Handle) -> Result<Entity, EngineError> {
        let entity = self.db.take(handle)?;
        if self.rootdict == Some(handle) {
            self.rootdict = None;
        }
        Ok(entity)
    }

    /// 任意状态 → DESTROYED，可重复调用。
    pub fn destroy(&mut self, handle: Handle) -> Result<(), EngineError> {
        self.db.discard(handle)
    }

    /// 复制存活实体并以宽松策略绑定到本文档，副本得到新句柄，不挂到任何容器下。
    pub fn duplicate(&mut self, handle: Handle) -> Result<Handle, EngineError> {
        let copy = self
            .db
            .lookup(handle)
            .map(Entity::copy)
            .ok_or(EngineError::EntityNotFound(handle))?;
        self.bind(copy, BindPolicy::Lenient)
    }

    /// 接收来自其他文档的实体：复制后宽松绑定，缺少的资源按修复规则补齐。
    pub fn import(&mut self, entity: &Entity) -> Result<Handle, EngineError> {
        self.bind(entity.copy(), BindPolicy::Lenient)
    }

    /// 检查失效引用并逐条记为诊断，不改动数据。
    pub fn audit(&mut self) -> Vec<AuditIssue> {
        let issues = self.db.audit();
        for issue in &issues {
            self.diagnostics.record(
                Severity::Info,
                DiagnosticKind::DeadReference,
                issue.to_string(),
                Some(issue.handle()),
            );
        }
        debug!(issues = issues.len(), "审计完成");
        issues
    }

    /// 按句柄重新编号，见 [`EntityDatabase::remap`]。
    pub fn remap(&mut self, old: Handle, new: Handle) -> Result<(), EngineError> {
        self.db.remap(old, new)?;
        for handle in self.tables.values_mut().filter(|handle| **handle == old) {
            *handle = new;
        }
        for handle in self.resources.values_mut().filter(|handle| **handle == old) {
            *handle = new;
        }
        if self.rootdict == Some(old) {
            self.rootdict = Some(new);
        }
        Ok(())
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::*;

    fn line(layer: &str) -> Entity {
        Document::new()
            .create(
                "LINE",
                &Attribs::new()
                    .set("layer", layer)
                    .set("end", DVec3::new(1.0, 1.0, 0.0)),
            )
            .unwrap()
    }

    #[test]
    fn new_document_has_required_structures() {
        let doc = Document::new();
        assert!(doc.diagnostics().is_empty());
        for table in [LAYER, LTYPE, BLOCK_RECORD] {
            let head = doc.table(table).unwrap();
            assert_eq!(doc.lookup(head).unwrap().state(), Lifecycle::Bound);
        }
        let layer = doc.resource(LAYER, "0").unwrap();
        assert_eq!(doc.lookup(layer).unwrap().owner(), doc.table(LAYER));
        assert!(doc.resource(LTYPE, "continuous").is_some());
        let msp = doc.modelspace().unwrap();
        assert_eq!(doc.lookup(msp).unwrap().state(), Lifecycle::Linked);
        assert!(doc.paperspace().is_some());
        assert_eq!(
            doc.lookup(doc.rootdict().unwrap()).unwrap().dxftype(),
            "DICTIONARY"
        );
    }

    #[test]
    fn lifecycle_walks_every_state_in_order() {
        let mut doc = Document::new();
        let entity = line("0");
        assert_eq!(entity.state(), Lifecycle::Virtual);

        let handle = doc.bind(entity, BindPolicy::Strict).unwrap();
        assert_eq!(doc.lookup(handle).unwrap().state(), Lifecycle::Bound);
        assert_eq!(doc.lookup(handle).unwrap().core().doc(), Some(doc.id()));

        let msp = doc.modelspace().unwrap();
        doc.link(handle, msp).unwrap();
        assert_eq!(doc.lookup(handle).unwrap().state(), Lifecycle::Linked);
        assert_eq!(doc.layout_entities(msp).count(), 1);

        doc.unlink(handle).unwrap();
        assert_eq!(doc.lookup(handle).unwrap().state(), Lifecycle::Bound);

        doc.link(handle, msp).unwrap();
        let entity = doc.unbind(handle).unwrap();
        assert_eq!(entity.state(), Lifecycle::Virtual);
        assert_eq!(entity.owner(), None);
        assert_eq!(doc.layout_entities(msp).count(), 0);

        let again = doc.bind(entity, BindPolicy::Strict).unwrap();
        assert_ne!(again, handle);
        doc.destroy(again).unwrap();
        doc.destroy(again).unwrap();
        assert!(!doc.is_alive(again));
        assert_eq!(doc.db().state(again), Some(Lifecycle::Destroyed));
        assert!(doc.entities().all(|(h, _)| h != again));
    }

    #[test]
    fn transitions_cannot_skip_states() {
        let mut doc = Document::new();
        let msp = doc.modelspace().unwrap();
        let handle = doc.add(line("0"), msp).unwrap();

        let err = doc.link(handle, msp).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert!(matches!(
            doc.link(Handle::new(0xFFFF), msp),
            Err(EngineError::EntityNotFound(_))
        ));

        let mut destroyed = line("0");
        destroyed.destroy();
        assert!(matches!(
            doc.bind(destroyed, BindPolicy::Lenient),
            Err(EngineError::InvalidTransition { action: "bind", .. })
        ));
    }

    #[test]
    fn strict_bind_rejects_missing_resources() {
        let mut doc = Document::new();
        let before = doc.entities().count();
        let err = doc.bind(line("Walls"), BindPolicy::Strict).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingResource { kind: "LAYER", ref name } if name == "Walls"
        ));

        let insert = doc
            .create("INSERT", &Attribs::new().set("name", "DOOR"))
            .unwrap();
        assert!(matches!(
            doc.bind(insert, BindPolicy::Strict),
            Err(EngineError::MissingResource { kind: "BLOCK_RECORD", .. })
        ));
        assert_eq!(doc.entities().count(), before);

        let bylayer = doc
            .create("CIRCLE", &Attribs::new().set("linetype", "ByLayer"))
            .unwrap();
        assert!(doc.bind(bylayer, BindPolicy::Strict).is_ok());
    }

    #[test]
    fn lenient_bind_repairs_and_records() {
        let mut doc = Document::new();
        let circle = doc
            .create(
                "CIRCLE",
                &Attribs::new().set("layer", "Walls").set("linetype", "DASHED"),
            )
            .unwrap();
        let handle = doc.bind(circle, BindPolicy::Lenient).unwrap();

        let layer = doc.resource(LAYER, "WALLS").unwrap();
        assert_eq!(doc.lookup(layer).unwrap().owner(), doc.table(LAYER));
        let graphic = doc.lookup(handle).unwrap().graphic().unwrap();
        assert_eq!(graphic.linetype.as_deref(), Some("BYLAYER"));
        assert_eq!(doc.diagnostics().of_kind(DiagnosticKind::MissingResource).count(), 1);
        assert_eq!(doc.diagnostics().of_kind(DiagnosticKind::ReferenceDropped).count(), 1);

        let insert = doc
            .create("INSERT", &Attribs::new().set("name", "DOOR"))
            .unwrap();
        let orphan = doc.bind(insert, BindPolicy::Lenient).unwrap();
        assert_eq!(doc.db().state(orphan), Some(Lifecycle::Destroyed));
        assert_eq!(
            doc.diagnostics().of_kind(DiagnosticKind::UnrecoverableEntity).count(),
            1
        );
    }

    #[test]
    fn bootstrap_bind_checks_names_only() {
        let mut doc = Document::new();
        let unnamed = Entity::Layer(Layer::default());
        assert!(matches!(
            doc.bind(unnamed, BindPolicy::Bootstrap),
            Err(EngineError::InvalidBootstrapEntry(_))
        ));

        let mut taken = Entity::BlockRecord(BlockRecord {
            name: "*Paper_Space0".into(),
            ..BlockRecord::default()
        });
        taken.core_mut().declared_handle = doc.modelspace();
        assert!(matches!(
            doc.bind(taken, BindPolicy::Bootstrap),
            Err(EngineError::HandleInUse(_))
        ));
    }

    #[test]
    fn remap_keeps_lookups_consistent() {
        let mut doc = Document::new();
        let msp = doc.modelspace().unwrap();
        let handle = doc.add(line("0"), msp).unwrap();
        let new = Handle::new(0x4000);
        doc.remap(msp, new).unwrap();
        assert_eq!(doc.modelspace(), Some(new));
        assert_eq!(doc.lookup(handle).unwrap().owner(), Some(new));
        assert_eq!(doc.layout_entities(new).count(), 1);
    }

    #[test]
    fn duplicates_get_fresh_handles_and_repaired_resources() {
        let mut doc = Document::new();
        let msp = doc.modelspace().unwrap();
        let original = doc.add(line("0"), msp).unwrap();
        let copy = doc.duplicate(original).unwrap();
        assert_ne!(copy, original);
        assert_eq!(doc.lookup(copy).unwrap().state(), Lifecycle::Bound);
        assert_eq!(doc.layout_entities(msp).count(), 1);

        let mut foreign = Document::new();
        let circle = foreign
            .create("CIRCLE", &Attribs::new().set("layer", "Imported"))
            .unwrap();
        let source = foreign.bind(circle, BindPolicy::Lenient).unwrap();
        let imported = doc.import(foreign.lookup(source).unwrap()).unwrap();
        assert_eq!(doc.lookup(imported).unwrap().core().doc(), Some(doc.id()));
        assert!(doc.resource(LAYER, "Imported").is_some());

        assert!(matches!(
            doc.duplicate(Handle::new(0xFFFF)),
            Err(EngineError::EntityNotFound(_))
        ));
    }

    #[test]
    fn audit_records_dead_dictionary_entries() {
        let mut doc = Document::new();
        let target = doc.bind(line("0"), BindPolicy::Strict).unwrap();
        let mut dict = Dictionary::default();
        dict.entries.push(crate::entity::DictionaryEntry {
            key: "LINK".into(),
            handle: target,
            hard: false,
        });
        let dict = doc.bind(Entity::Dictionary(dict), BindPolicy::Strict).unwrap();
        assert!(doc.audit().is_empty());

        doc.destroy(target).unwrap();
        let issues = doc.audit();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].handle(), dict);
        let recorded: Vec<_> = doc.diagnostics().of_kind(DiagnosticKind::DeadReference).collect();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].severity, Severity::Info);
        assert_eq!(recorded[0].handle, Some(dict));
    }

    #[test]
    fn header_vars_keep_file_order() {
        let header = HeaderVars::from_tags(&[
            Tag::new(9, "$ACADVER"),
            Tag::new(1, "AC1015"),
            Tag::new(9, "$EXTMIN"),
            Tag::new(10, DVec3::ZERO),
            Tag::new(9, "$HANDSEED"),
            Tag::new(5, "2A"),
        ]);
        assert_eq!(
            header.names().collect::<Vec<_>>(),
            vec!["$ACADVER", "$EXTMIN", "$HANDSEED"]
        );
        assert_eq!(header.handseed(), Some(Handle::new(0x2A)));
        assert_eq!(header.value("$ACADVER").and_then(TagValue::as_str), Some("AC1015"));
        assert_eq!(header.export().len(), 6);
    }
}
