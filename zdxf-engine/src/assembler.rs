//! 文档组装：消费一次结构数据库，先按文件顺序绑定全部实体，再解析所有权并链接，最后做资源修复。

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;
use zdxf_core::codes;
use zdxf_core::diagnostics::{DiagnosticKind, Severity};
use zdxf_core::handle::Handle;
use zdxf_core::tags::{Tag, TagValue};
use zdxf_io::{Block, LoadedStructure, Node, Section, Table};

use crate::document::{Document, HeaderVars};
use crate::entity::{BlockRecord, DxfEntity, Entity};
use crate::errors::EngineError;
use crate::factory::EntityFactory;

/// 绑定阶段记下的、等待链接的句柄。
#[derive(Debug, Default)]
struct Pending {
    table_entries: Vec<(Handle, Handle)>,
    blocks: Vec<(String, Vec<Handle>)>,
    entities: Vec<Handle>,
    objects: Vec<Handle>,
    strays: Vec<Handle>,
}

struct Assembler {
    doc: Document,
    pending: Pending,
}

/// 由结构数据库组装文档。结构加载期的诊断排在组装诊断之前。
///
/// 顺序：绑定、补齐布局、链接表项与块、资源修复、链接图形实体与对象图、处理错位实体。
pub fn assemble(loaded: LoadedStructure, factory: EntityFactory) -> Result<Document, EngineError> {
    let LoadedStructure {
        database,
        diagnostics,
        ..
    } = loaded;
    let mut doc = Document::blank(factory);
    doc.diagnostics_mut().append(diagnostics);

    let mut assembler = Assembler {
        doc,
        pending: Pending::default(),
    };
    for section in database.sections {
        assembler.bind_section(section)?;
    }
    assembler.doc.ensure_layouts();

    assembler.link_table_entries()?;
    assembler.link_blocks()?;
    // 修复可能销毁实体，须在对象图链接之前，使其扩展字典按无主对象处理
    assembler.repair()?;
    assembler.link_entities()?;
    assembler.link_objects()?;
    assembler.link_strays()?;

    let Assembler { doc, .. } = assembler;
    debug!(
        entities = doc.db().len(),
        diagnostics = doc.diagnostics().len(),
        "文档组装完成"
    );
    Ok(doc)
}

fn in_paperspace(entity: &Entity) -> bool {
    match entity.graphic() {
        Some(graphic) => graphic.paperspace,
        None => entity
            .core()
            .unknown_tags()
            .any(|tag| tag.code == codes::PAPERSPACE && tag.value == TagValue::Int(1)),
    }
}

impl Assembler {
    fn bind_run(&mut self, run: &[Tag], bootstrap: bool) -> Result<Handle, EngineError> {
        let entity = self.doc.load_entity(run);
        self.bind_loaded(entity, bootstrap)
    }

    fn bind_loaded(&mut self, entity: Entity, bootstrap: bool) -> Result<Handle, EngineError> {
        if bootstrap {
            if let Err(err) = self.doc.validate_bootstrap(&entity) {
                let declared = entity.core().declared_handle();
                self.doc.diagnostics_mut().fixed(
                    DiagnosticKind::InvalidBootstrapEntry,
                    format!("{}：{err}，按普通实体登记", entity.dxftype()),
                    declared,
                );
            }
        }
        self.doc.register(entity)
    }

    fn bind_section(&mut self, section: Section) -> Result<(), EngineError> {
        debug!(section = %section.name, nodes = section.nodes.len(), "绑定段");
        match section.name.as_str() {
            "HEADER" => self.doc.set_header(HeaderVars::from_tags(&section.preamble)),
            "TABLES" => {
                for node in section.nodes {
                    match node {
                        Node::Table(table) => self.bind_table(table)?,
                        other => self.bind_stray(other)?,
                    }
                }
            }
            "BLOCKS" => {
                for node in section.nodes {
                    match node {
                        Node::Block(block) => self.bind_block(block)?,
                        other => self.bind_stray(other)?,
                    }
                }
            }
            "ENTITIES" => {
                for node in section.nodes {
                    match node {
                        Node::Entity(run) => {
                            let handle = self.bind_run(&run, false)?;
                            self.pending.entities.push(handle);
                        }
                        other => self.bind_stray(other)?,
                    }
                }
            }
            "OBJECTS" => {
                for node in section.nodes {
                    match node {
                        Node::Entity(run) => self.bind_object(&run)?,
                        other => self.bind_stray(other)?,
                    }
                }
            }
            _ => self.doc.push_raw_section(section),
        }
        Ok(())
    }

    fn bind_table(&mut self, table: Table) -> Result<(), EngineError> {
        let head = self.bind_run(&table.head, true)?;
        self.doc.register_table(&table.name, head);
        let bootstrap = table.name.eq_ignore_ascii_case("BLOCK_RECORD");
        for entry in &table.entries {
            let handle = self.bind_run(entry, bootstrap)?;
            self.pending.table_entries.push((handle, head));
        }
        Ok(())
    }

    fn bind_block(&mut self, block: Block) -> Result<(), EngineError> {
        let mut handles = Vec::with_capacity(block.entities.len() + 2);
        for run in std::iter::once(&block.head)
            .chain(&block.entities)
            .chain(std::iter::once(&block.end))
            .filter(|run| !run.is_empty())
        {
            handles.push(self.bind_run(run, false)?);
        }
        self.pending.blocks.push((block.name, handles));
        Ok(())
    }

    /// 第一个没有所有者的字典作为根字典，按引导策略校验。
    fn bind_object(&mut self, run: &[Tag]) -> Result<(), EngineError> {
        let entity = self.doc.load_entity(run);
        let root = self.doc.rootdict().is_none()
            && matches!(entity, Entity::Dictionary(_))
            && entity.core().declared_owner().is_none_or(Handle::is_null);
        let handle = self.bind_loaded(entity, root)?;
        if root {
            self.doc.set_rootdict(handle);
        } else {
            self.pending.objects.push(handle);
        }
        Ok(())
    }

    /// 出现在容器之外或不该出现的位置的节点，链接时按声明的所有者处理。
    fn bind_stray(&mut self, node: Node) -> Result<(), EngineError> {
        let runs = match node {
            Node::Entity(run) => vec![run],
            Node::Table(table) => std::iter::once(table.head).chain(table.entries).collect(),
            Node::Block(block) => std::iter::once(block.head)
                .chain(block.entities)
                .chain(std::iter::once(block.end))
                .collect(),
        };
        for run in runs.iter().filter(|run| !run.is_empty()) {
            let handle = self.bind_run(run, false)?;
            self.pending.strays.push(handle);
        }
        Ok(())
    }

    fn declared_owner(&self, handle: Handle) -> Option<Handle> {
        self.doc
            .lookup(handle)
            .and_then(|entity| entity.core().declared_owner())
    }

    fn link_table_entries(&mut self) -> Result<(), EngineError> {
        for (entry, head) in std::mem::take(&mut self.pending.table_entries) {
            if !self.doc.is_alive(entry) {
                continue;
            }
            if let Some(declared) = self.declared_owner(entry) {
                if declared != head {
                    self.doc.diagnostics_mut().record(
                        Severity::Info,
                        DiagnosticKind::OwnerMismatch,
                        format!("表项声明的所有者 {declared} 与所在表 {head} 不符"),
                        Some(entry),
                    );
                }
            }
            self.doc.link(entry, head)?;
        }
        Ok(())
    }

    /// 块内容挂到同名块记录下，缺少块记录时创建占位记录。
    fn link_blocks(&mut self) -> Result<(), EngineError> {
        for (name, handles) in std::mem::take(&mut self.pending.blocks) {
            let record = match self.doc.layout(&name) {
                Some(record) => record,
                None if name.trim().is_empty() => {
                    for handle in handles {
                        self.destroy_unlinkable(handle, "块没有名称");
                    }
                    continue;
                }
                None => self.placeholder_block_record(&name)?,
            };
            for handle in handles {
                if self.doc.is_alive(handle) {
                    self.doc.link(handle, record)?;
                }
            }
        }
        Ok(())
    }

    fn placeholder_block_record(&mut self, name: &str) -> Result<Handle, EngineError> {
        let record = BlockRecord {
            name: name.to_string(),
            ..BlockRecord::default()
        };
        let handle = self.doc.register(Entity::BlockRecord(record))?;
        if let Some(table) = self.doc.table("BLOCK_RECORD") {
            self.doc.link(handle, table)?;
        }
        self.doc.diagnostics_mut().fixed(
            DiagnosticKind::MissingResource,
            format!("块 \"{name}\" 没有块记录，已创建"),
            Some(handle),
        );
        Ok(handle)
    }

    /// 图形实体：声明的所有者是块记录时沿用，否则按组码 67 放入图纸空间或模型空间。
    fn link_entities(&mut self) -> Result<(), EngineError> {
        let msp = self.doc.modelspace();
        let psp = self.doc.paperspace();
        for handle in std::mem::take(&mut self.pending.entities) {
            let Some(entity) = self.doc.lookup(handle) else {
                continue;
            };
            let declared = entity.core().declared_owner();
            let fallback = if in_paperspace(entity) { psp } else { msp };
            let owner = match declared {
                Some(owner)
                    if matches!(self.doc.lookup(owner), Some(Entity::BlockRecord(_))) =>
                {
                    Some(owner)
                }
                Some(owner) if !owner.is_null() => {
                    self.doc.diagnostics_mut().record(
                        Severity::Info,
                        DiagnosticKind::OwnerMismatch,
                        format!("声明的所有者 {owner} 不是块记录，改挂到布局"),
                        Some(handle),
                    );
                    fallback
                }
                _ => fallback,
            };
            match owner {
                Some(owner) => self.doc.link(handle, owner)?,
                None => self.destroy_unlinkable(handle, "找不到所属布局"),
            }
        }
        Ok(())
    }

    /// 对象图：从根字典和所有非对象实体出发，按声明的父对象逐层链接；未被到达的对象销毁。
    fn link_objects(&mut self) -> Result<(), EngineError> {
        let objects = std::mem::take(&mut self.pending.objects);
        let object_set: HashSet<Handle> = objects.iter().copied().collect();

        let mut by_owner: HashMap<Handle, Vec<Handle>> = HashMap::new();
        for handle in &objects {
            if let Some(owner) = self.declared_owner(*handle).filter(|owner| !owner.is_null()) {
                by_owner.entry(owner).or_default().push(*handle);
            }
        }

        let mut queue: VecDeque<Handle> = self.doc.rootdict().into_iter().collect();
        queue.extend(
            self.doc
                .db()
                .handles()
                .filter(|handle| !object_set.contains(handle) && by_owner.contains_key(handle)),
        );
        let mut reached: HashSet<Handle> = queue.iter().copied().collect();

        while let Some(parent) = queue.pop_front() {
            let Some(children) = by_owner.get(&parent) else {
                continue;
            };
            for child in children {
                if !reached.insert(*child) || !self.doc.is_alive(*child) {
                    continue;
                }
                self.doc.link(*child, parent)?;
                queue.push_back(*child);
            }
        }

        for handle in objects {
            if reached.contains(&handle) {
                continue;
            }
            let reason = match self.declared_owner(handle) {
                Some(owner) if !owner.is_null() && !self.doc.is_alive(owner) => {
                    format!("所有者 {owner} 不存在")
                }
                Some(owner) if !owner.is_null() => format!("所有者链 {owner} 无法到达根字典"),
                _ => "多余的根对象".to_string(),
            };
            self.destroy_unlinkable(handle, &reason);
        }

        if self.doc.rootdict().is_none() {
            let root = self
                .doc
                .bootstrap_entity(Entity::Dictionary(Default::default()), None);
            if let Some(root) = root {
                self.doc.set_rootdict(root);
                self.doc.diagnostics_mut().fixed(
                    DiagnosticKind::MissingRequiredStructure,
                    "缺少根字典，已创建",
                    Some(root),
                );
            }
        }
        Ok(())
    }

    /// 沿声明的所有者向上走，是否回到起点。
    fn in_owner_cycle(&self, start: Handle) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = Some(start);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return current == start;
            }
            cursor = self.declared_owner(current).filter(|owner| !owner.is_null());
        }
        false
    }

    fn link_strays(&mut self) -> Result<(), EngineError> {
        let strays = std::mem::take(&mut self.pending.strays);
        let cyclic: Vec<Handle> = strays
            .iter()
            .copied()
            .filter(|handle| self.in_owner_cycle(*handle))
            .collect();
        for handle in cyclic {
            self.destroy_unlinkable(handle, "所有者链成环");
        }

        for handle in strays {
            if !self.doc.is_alive(handle) {
                continue;
            }
            let Some(owner) = self
                .declared_owner(handle)
                .filter(|owner| self.doc.is_alive(*owner))
            else {
                self.destroy_unlinkable(handle, "位置不合法且没有有效的所有者");
                continue;
            };
            match self.doc.link(handle, owner) {
                Ok(()) => {}
                Err(EngineError::OwnerCycle { .. }) => {
                    self.destroy_unlinkable(handle, "所有者链成环");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn destroy_unlinkable(&mut self, handle: Handle, reason: &str) {
        let dxftype = self
            .doc
            .lookup(handle)
            .map(|entity| entity.dxftype().to_string())
            .unwrap_or_default();
        if self.doc.destroy(handle).is_ok() {
            self.doc.diagnostics_mut().destroyed(
                DiagnosticKind::UnlinkableEntity,
                format!("{dxftype} 无法链接：{reason}"),
                handle,
            );
        }
    }

    /// 宽松策略下的资源修复。
    fn repair(&mut self) -> Result<(), EngineError> {
        let graphics: Vec<Handle> = self
            .doc
            .entities()
            .filter(|(_, entity)| entity.graphic().is_some())
            .map(|(handle, _)| handle)
            .collect();
        for handle in graphics {
            self.doc.repair_resources(handle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use zdxf_config::LoadOptions;
    use zdxf_io::structure_from_str;

    use super::*;
    use crate::entity::Lifecycle;

    fn load(source: &str) -> Document {
        let loaded = structure_from_str(source, &LoadOptions::default()).unwrap();
        assemble(loaded, EntityFactory::with_defaults()).unwrap()
    }

    fn linked(doc: &Document) -> Vec<Handle> {
        doc.entities()
            .filter(|(_, entity)| entity.state() == Lifecycle::Linked)
            .map(|(handle, _)| handle)
            .collect()
    }

    #[test]
    fn single_entity_lands_in_modelspace() {
        let doc = load("0\nSECTION\n2\nENTITIES\n0\nLINE\n10\n0\n20\n0\n11\n1\n21\n1\n0\nENDSEC\n0\nEOF\n");
        let linked = linked(&doc);
        assert_eq!(linked.len(), 1);
        let line = doc.lookup(linked[0]).unwrap();
        assert_eq!(line.dxftype(), "LINE");
        assert_eq!(line.owner(), doc.modelspace());
        assert_eq!(doc.layout_entities(doc.modelspace().unwrap()).count(), 1);
        // 缺少的布局、根字典与图层都已补齐
        assert!(doc.paperspace().is_some());
        assert!(doc.rootdict().is_some());
        assert!(doc.resource("LAYER", "0").is_some());
    }

    #[test]
    fn header_seed_drives_new_handles() {
        let doc = load(
            "0\nSECTION\n2\nHEADER\n9\n$HANDSEED\n5\n400\n0\nENDSEC\n\
0\nSECTION\n2\nENTITIES\n0\nLINE\n8\n0\n0\nENDSEC\n0\nEOF\n",
        );
        let line = linked(&doc)[0];
        assert!(line.get() >= 0x400);
        assert_eq!(doc.header().handseed(), Some(Handle::new(0x400)));
        assert!(doc.handseed().is_some_and(|seed| seed > line));
    }

    #[test]
    fn destroyed_insert_takes_its_extension_dictionary_along() {
        let doc = load(
            "0\nSECTION\n2\nENTITIES\n\
0\nINSERT\n5\n30\n102\n{ACAD_XDICTIONARY\n360\n40\n102\n}\n2\nNOPE\n0\nENDSEC\n\
0\nSECTION\n2\nOBJECTS\n\
0\nDICTIONARY\n5\nC\n330\n0\n\
0\nDICTIONARY\n5\n40\n330\n30\n\
0\nENDSEC\n0\nEOF\n",
        );
        assert_eq!(doc.db().state(Handle::new(0x30)), Some(Lifecycle::Destroyed));
        assert_eq!(doc.db().state(Handle::new(0x40)), Some(Lifecycle::Destroyed));
        let unlinkable: Vec<_> = doc
            .diagnostics()
            .of_kind(DiagnosticKind::UnlinkableEntity)
            .collect();
        assert_eq!(unlinkable.len(), 1);
        assert_eq!(unlinkable[0].handle, Some(Handle::new(0x40)));
        assert!(doc.entities().all(|(_, entity)| entity.dxftype() != "DICTIONARY"
            || entity.handle() == doc.rootdict()));
    }

    #[test]
    fn self_owned_and_cyclic_strays_are_destroyed() {
        let doc = load(
            "0\nSECTION\n2\nTABLES\n\
0\nXRECORD\n5\n70\n330\n70\n\
0\nXRECORD\n5\n71\n330\n72\n\
0\nXRECORD\n5\n72\n330\n71\n\
0\nXRECORD\n5\n73\n330\n71\n\
0\nENDSEC\n0\nEOF\n",
        );
        for handle in [0x70, 0x71, 0x72, 0x73] {
            assert_eq!(
                doc.db().state(Handle::new(handle)),
                Some(Lifecycle::Destroyed),
                "{handle:X}"
            );
        }
        assert_eq!(doc.diagnostics().of_kind(DiagnosticKind::UnlinkableEntity).count(), 4);
        assert!(doc.db().audit().is_empty());
    }

    #[test]
    fn paperspace_flag_and_declared_block_records() {
        let doc = load(
            "0\nSECTION\n2\nTABLES\n0\nTABLE\n2\nBLOCK_RECORD\n5\n1\n0\nBLOCK_RECORD\n5\n1F\n330\n1\n2\nDOOR\n0\nENDTAB\n0\nENDSEC\n\
0\nSECTION\n2\nENTITIES\n\
0\nCIRCLE\n5\n30\n67\n1\n40\n2.0\n\
0\nCIRCLE\n5\n31\n330\n1F\n\
0\nCIRCLE\n5\n32\n330\n1\n\
0\nENDSEC\n0\nEOF\n",
        );
        let door = doc.layout("DOOR").unwrap();
        assert_eq!(door, Handle::new(0x1F));
        assert_eq!(doc.lookup(door).unwrap().owner(), doc.table("BLOCK_RECORD"));
        assert_eq!(doc.lookup(Handle::new(0x30)).unwrap().owner(), doc.paperspace());
        assert_eq!(doc.lookup(Handle::new(0x31)).unwrap().owner(), Some(door));
        assert_eq!(doc.lookup(Handle::new(0x32)).unwrap().owner(), doc.modelspace());
        assert_eq!(doc.diagnostics().of_kind(DiagnosticKind::OwnerMismatch).count(), 1);
    }

    #[test]
    fn blocks_link_to_their_records() {
        let doc = load(
            "0\nSECTION\n2\nBLOCKS\n0\nBLOCK\n5\n40\n2\nDOOR\n0\nLINE\n5\n41\n0\nENDBLK\n5\n42\n0\nENDSEC\n\
0\nSECTION\n2\nENTITIES\n0\nINSERT\n5\n50\n2\nDOOR\n0\nINSERT\n5\n51\n2\nWINDOW\n0\nENDSEC\n0\nEOF\n",
        );
        let door = doc.layout("DOOR").unwrap();
        let members: Vec<Handle> = doc.layout_entities(door).map(|(handle, _)| handle).collect();
        assert_eq!(members, vec![Handle::new(0x41)]);
        assert_eq!(doc.lookup(Handle::new(0x40)).unwrap().owner(), Some(door));
        assert_eq!(doc.db().children(door).len(), 3);

        assert!(doc.is_alive(Handle::new(0x50)));
        assert_eq!(doc.db().state(Handle::new(0x51)), Some(Lifecycle::Destroyed));
        let destroyed: Vec<_> = doc
            .diagnostics()
            .iter()
            .filter(|d| d.severity == Severity::Destroyed)
            .collect();
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0].kind, DiagnosticKind::UnrecoverableEntity);
    }

    #[test]
    fn object_graph_links_from_root_and_drops_the_rest() {
        let doc = load(
            "0\nSECTION\n2\nENTITIES\n0\nLINE\n5\n20\n102\n{ACAD_XDICTIONARY\n360\n25\n102\n}\n0\nENDSEC\n\
0\nSECTION\n2\nOBJECTS\n\
0\nDICTIONARY\n5\nC\n330\n0\n3\nACAD_GROUP\n350\nD\n\
0\nDICTIONARY\n5\nD\n330\nC\n\
0\nXRECORD\n5\nE\n330\nD\n\
0\nDICTIONARY\n5\n25\n330\n20\n\
0\nXRECORD\n5\n60\n330\n61\n\
0\nXRECORD\n5\n61\n330\n60\n\
0\nXRECORD\n5\n62\n330\nFFF\n\
0\nENDSEC\n0\nEOF\n",
        );
        assert_eq!(doc.rootdict(), Some(Handle::new(0xC)));
        assert_eq!(doc.lookup(Handle::new(0xC)).unwrap().state(), Lifecycle::Bound);
        assert_eq!(doc.lookup(Handle::new(0xD)).unwrap().owner(), Some(Handle::new(0xC)));
        assert_eq!(doc.lookup(Handle::new(0xE)).unwrap().owner(), Some(Handle::new(0xD)));
        assert_eq!(doc.lookup(Handle::new(0x25)).unwrap().owner(), Some(Handle::new(0x20)));
        assert_eq!(doc.lookup(Handle::new(0x20)).unwrap().core().xdict(), Some(Handle::new(0x25)));

        for dropped in [0x60, 0x61, 0x62] {
            assert_eq!(
                doc.db().state(Handle::new(dropped)),
                Some(Lifecycle::Destroyed)
            );
        }
        assert_eq!(doc.diagnostics().of_kind(DiagnosticKind::UnlinkableEntity).count(), 3);
    }

    #[test]
    fn duplicate_handles_are_reassigned() {
        let doc = load(
            "0\nSECTION\n2\nENTITIES\n0\nLINE\n5\nA0\n0\nCIRCLE\n5\nA0\n0\nENDSEC\n0\nEOF\n",
        );
        let graphics: Vec<(Handle, &Entity)> = doc
            .entities()
            .filter(|(_, entity)| entity.graphic().is_some())
            .collect();
        assert_eq!(graphics.len(), 2);
        assert_ne!(graphics[0].0, graphics[1].0);
        assert_eq!(doc.lookup(Handle::new(0xA0)).unwrap().dxftype(), "LINE");
        assert_eq!(doc.diagnostics().of_kind(DiagnosticKind::DuplicateHandle).count(), 1);
        assert!(graphics.iter().all(|(_, e)| e.state() == Lifecycle::Linked));
    }

    #[test]
    fn classes_and_unknown_sections_are_kept_raw() {
        let doc = load(
            "0\nSECTION\n2\nCLASSES\n0\nCLASS\n1\nACDBDICTIONARYWDFLT\n0\nENDSEC\n\
0\nSECTION\n2\nACDSDATA\n0\nACDSSCHEMA\n0\nENDSEC\n0\nEOF\n",
        );
        assert_eq!(doc.raw_sections().len(), 2);
        assert_eq!(doc.raw_section("CLASSES").unwrap().nodes.len(), 1);
        assert!(doc.entities().all(|(_, entity)| entity.dxftype() != "CLASS"));
    }
}
