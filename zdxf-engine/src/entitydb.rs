use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::debug;
use zdxf_core::handle::{Handle, HandleGenerator};

use crate::entity::{DocumentId, DxfEntity, Entity, Lifecycle};
use crate::errors::EngineError;

/// 绑定时句柄的来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// 沿用了文件声明的句柄。
    Kept(Handle),
    /// 实体没有句柄，分配了新句柄。
    Assigned(Handle),
    /// 声明的句柄已被占用或保留，改用新句柄。
    Reassigned { requested: Handle, assigned: Handle },
}

impl BindOutcome {
    pub fn handle(self) -> Handle {
        match self {
            BindOutcome::Kept(handle) | BindOutcome::Assigned(handle) => handle,
            BindOutcome::Reassigned { assigned, .. } => assigned,
        }
    }
}

/// 审计发现的失效引用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditIssue {
    /// 所有者已销毁或不存在。
    DeadOwner { handle: Handle, owner: Handle },
    /// 扩展字典已销毁或不存在。
    DeadXdict { handle: Handle, xdict: Handle },
    /// 字典条目指向已销毁或不存在的对象。
    DeadEntry {
        dictionary: Handle,
        key: String,
        target: Handle,
    },
}

impl AuditIssue {
    /// 持有失效引用的实体。
    pub fn handle(&self) -> Handle {
        match self {
            AuditIssue::DeadOwner { handle, .. } | AuditIssue::DeadXdict { handle, .. } => *handle,
            AuditIssue::DeadEntry { dictionary, .. } => *dictionary,
        }
    }
}

impl fmt::Display for AuditIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditIssue::DeadOwner { handle, owner } => {
                write!(f, "实体 {handle} 的所有者 {owner} 不存在")
            }
            AuditIssue::DeadXdict { handle, xdict } => {
                write!(f, "实体 {handle} 的扩展字典 {xdict} 不存在")
            }
            AuditIssue::DeadEntry {
                dictionary,
                key,
                target,
            } => write!(f, "字典 {dictionary} 的条目 \"{key}\" 指向不存在的 {target}"),
        }
    }
}

/// 单个文档的句柄 → 实体映射。
///
/// 已销毁的实体以墓碑形式留在表中，解绑的句柄进入退役集合；文档存续期间两者都不会再被分配。
#[derive(Debug, Default)]
pub struct EntityDatabase {
    entities: BTreeMap<Handle, Entity>,
    retired: BTreeSet<Handle>,
    children: HashMap<Handle, Vec<Handle>>,
    generator: HandleGenerator,
}

impl EntityDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 `$HANDSEED` 重置句柄起点。
    pub fn seed(&mut self, seed: Handle) {
        self.generator.reset(seed);
    }

    /// 下一个可分配的句柄，可写回 `$HANDSEED`。句柄空间用尽时为 `None`。
    pub fn next_free(&self) -> Option<Handle> {
        self.allocate(&mut self.generator.clone())
    }

    /// 句柄是否不可再分配：正在使用、墓碑、已退役或为 `0`。
    pub fn is_reserved(&self, handle: Handle) -> bool {
        handle.is_null() || self.entities.contains_key(&handle) || self.retired.contains(&handle)
    }

    /// 从发生器当前位置向上找空闲句柄；到达上限后从 1 重新找一次。
    fn allocate(&self, generator: &mut HandleGenerator) -> Option<Handle> {
        let mut wrapped = false;
        loop {
            match generator.next_handle() {
                Some(handle) if self.is_reserved(handle) => continue,
                Some(handle) => return Some(handle),
                None if wrapped => return None,
                None => {
                    debug!("句柄发生器到达上限，从 1 重新查找空闲句柄");
                    generator.reset(Handle::new(1));
                    wrapped = true;
                }
            }
        }
    }

    fn next_handle(&mut self) -> Result<Handle, EngineError> {
        let mut generator = std::mem::take(&mut self.generator);
        let handle = self.allocate(&mut generator);
        self.generator = generator;
        handle.ok_or(EngineError::HandlesExhausted)
    }

    /// VIRTUAL → BOUND：分配或校验句柄并登记。
    pub fn bind(&mut self, mut entity: Entity, doc: DocumentId) -> Result<BindOutcome, EngineError> {
        if entity.state() != Lifecycle::Virtual {
            return Err(EngineError::InvalidTransition {
                handle: entity.handle(),
                action: "bind",
                state: entity.state(),
            });
        }

        let outcome = match entity.core().declared_handle() {
            Some(requested) if !self.is_reserved(requested) => BindOutcome::Kept(requested),
            Some(requested) => BindOutcome::Reassigned {
                requested,
                assigned: self.next_handle()?,
            },
            None => BindOutcome::Assigned(self.next_handle()?),
        };

        let handle = outcome.handle();
        let core = entity.core_mut();
        core.handle = Some(handle);
        core.doc = Some(doc);
        core.owner = None;
        core.state = Lifecycle::Bound;
        debug!(handle = %handle, dxftype = entity.dxftype(), "实体已绑定");
        self.entities.insert(handle, entity);
        Ok(outcome)
    }

    #[inline]
    pub fn lookup(&self, handle: Handle) -> Option<&Entity> {
        self.entities.get(&handle).filter(|entity| entity.is_alive())
    }

    #[inline]
    pub fn lookup_mut(&mut self, handle: Handle) -> Option<&mut Entity> {
        self.entities
            .get_mut(&handle)
            .filter(|entity| entity.is_alive())
    }

    #[inline]
    pub fn is_alive(&self, handle: Handle) -> bool {
        self.lookup(handle).is_some()
    }

    /// 包括墓碑在内的状态；从未登记或已解绑时为 `None`。
    pub fn state(&self, handle: Handle) -> Option<Lifecycle> {
        self.entities.get(&handle).map(Entity::state)
    }

    /// 按句柄顺序遍历存活实体。
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Entity)> + '_ {
        self.entities
            .iter()
            .filter(|(_, entity)| entity.is_alive())
            .map(|(handle, entity)| (*handle, entity))
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.iter().map(|(handle, _)| handle)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 父容器下按链接顺序排列的子实体。
    pub fn children(&self, parent: Handle) -> &[Handle] {
        self.children
            .get(&parent)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn alive_mut(&mut self, handle: Handle) -> Result<&mut Entity, EngineError> {
        self.lookup_mut(handle)
            .ok_or(EngineError::EntityNotFound(handle))
    }

    /// BOUND → LINKED。父容器沿所有者链向上不能回到子实体自身。
    pub fn link(&mut self, child: Handle, parent: Handle) -> Result<(), EngineError> {
        if !self.is_alive(parent) {
            return Err(EngineError::EntityNotFound(parent));
        }
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == child {
                return Err(EngineError::OwnerCycle { child, parent });
            }
            cursor = self.entities.get(&current).and_then(Entity::owner);
        }
        let entity = self.alive_mut(child)?;
        if entity.state() != Lifecycle::Bound {
            return Err(EngineError::InvalidTransition {
                handle: Some(child),
                action: "link",
                state: entity.state(),
            });
        }
        let core = entity.core_mut();
        core.owner = Some(parent);
        core.state = Lifecycle::Linked;
        self.children.entry(parent).or_default().push(child);
        Ok(())
    }

    /// LINKED → BOUND。父容器已不存在时同样成功；已是 BOUND 时什么也不做。
    pub fn unlink(&mut self, child: Handle) -> Result<(), EngineError> {
        let entity = self.alive_mut(child)?;
        let Some(parent) = entity.owner() else {
            return Ok(());
        };
        let core = entity.core_mut();
        core.owner = None;
        core.state = Lifecycle::Bound;
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|handle| *handle != child);
        }
        Ok(())
    }

    /// 容器离开数据库前，把它的子实体变回 BOUND。
    fn orphan_children(&mut self, parent: Handle) {
        let Some(children) = self.children.remove(&parent) else {
            return;
        };
        for child in children {
            if let Some(entity) = self.lookup_mut(child) {
                let core = entity.core_mut();
                core.owner = None;
                core.state = Lifecycle::Bound;
            }
        }
    }

    /// DESTROY：解除链接、丢弃属性，只留墓碑。对墓碑重复调用无副作用。
    pub fn discard(&mut self, handle: Handle) -> Result<(), EngineError> {
        match self.state(handle) {
            None => return Err(EngineError::EntityNotFound(handle)),
            Some(Lifecycle::Destroyed) => return Ok(()),
            Some(_) => {}
        }
        self.unlink(handle)?;
        self.orphan_children(handle);
        if let Some(entity) = self.entities.get_mut(&handle) {
            entity.destroy();
            debug!(handle = %handle, dxftype = entity.dxftype(), "实体已销毁");
        }
        Ok(())
    }

    /// UNBIND：移出数据库并交还调用方，句柄永久退役。
    pub fn take(&mut self, handle: Handle) -> Result<Entity, EngineError> {
        self.unlink(handle)?;
        self.orphan_children(handle);
        let mut entity = self
            .entities
            .remove(&handle)
            .ok_or(EngineError::EntityNotFound(handle))?;
        self.retired.insert(handle);

        let core = entity.core_mut();
        core.handle = None;
        core.doc = None;
        core.state = Lifecycle::Virtual;
        core.declared_handle = None;
        core.declared_owner = None;
        debug!(handle = %handle, "实体已解绑，句柄退役");
        Ok(entity)
    }

    /// 列出存活实体中指向已销毁或不存在实体的所有者、扩展字典与字典条目。
    pub fn audit(&self) -> Vec<AuditIssue> {
        let mut issues = Vec::new();
        for (handle, entity) in self.iter() {
            if let Some(owner) = entity.owner().filter(|owner| !self.is_alive(*owner)) {
                issues.push(AuditIssue::DeadOwner { handle, owner });
            }
            if let Some(xdict) = entity.core().xdict().filter(|xdict| !self.is_alive(*xdict)) {
                issues.push(AuditIssue::DeadXdict { handle, xdict });
            }
            if let Entity::Dictionary(dict) = entity {
                for entry in dict.entries.iter().filter(|entry| !self.is_alive(entry.handle)) {
                    issues.push(AuditIssue::DeadEntry {
                        dictionary: handle,
                        key: entry.key.clone(),
                        target: entry.handle,
                    });
                }
            }
        }
        issues
    }

    /// 把存活实体从 `old` 改挂到 `new`，同时改写所有者引用、子列表与字典条目，`old` 随即退役。
    pub fn remap(&mut self, old: Handle, new: Handle) -> Result<(), EngineError> {
        if !self.is_alive(old) {
            return Err(EngineError::EntityNotFound(old));
        }
        if self.is_reserved(new) {
            return Err(EngineError::HandleInUse(new));
        }

        if let Some(mut entity) = self.entities.remove(&old) {
            entity.core_mut().handle = Some(new);
            self.entities.insert(new, entity);
        }
        self.retired.insert(old);

        if let Some(children) = self.children.remove(&old) {
            self.children.insert(new, children);
        }
        for siblings in self.children.values_mut() {
            for handle in siblings.iter_mut().filter(|handle| **handle == old) {
                *handle = new;
            }
        }
        for entity in self.entities.values_mut().filter(|entity| entity.is_alive()) {
            let core = entity.core_mut();
            if core.owner == Some(old) {
                core.owner = Some(new);
            }
            if core.xdict == Some(old) {
                core.xdict = Some(new);
            }
            if let Entity::Dictionary(dict) = entity {
                for entry in dict.entries.iter_mut().filter(|entry| entry.handle == old) {
                    entry.handle = new;
                }
            }
        }
        debug!(old = %old, new = %new, "句柄已重映射");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Dictionary, DictionaryEntry, Layer, Line, TagStorage};

    fn line_with_handle(handle: Option<u64>) -> Entity {
        let mut entity = Entity::Line(Line::default());
        entity.core_mut().declared_handle = handle.map(Handle::new);
        entity
    }

    #[test]
    fn bind_keeps_or_assigns_unique_handles() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        let kept = db.bind(line_with_handle(Some(0x20)), doc).unwrap();
        let duplicate = db.bind(line_with_handle(Some(0x20)), doc).unwrap();
        let fresh = db.bind(line_with_handle(None), doc).unwrap();
        let null = db.bind(line_with_handle(Some(0)), doc).unwrap();

        assert_eq!(kept, BindOutcome::Kept(Handle::new(0x20)));
        assert!(matches!(duplicate, BindOutcome::Reassigned { requested, .. } if requested == Handle::new(0x20)));
        assert!(matches!(fresh, BindOutcome::Assigned(_)));
        assert!(matches!(null, BindOutcome::Reassigned { .. }));

        let handles: BTreeSet<Handle> = db.handles().collect();
        assert_eq!(handles.len(), 4);
        assert_eq!(db.len(), 4);
        for (handle, entity) in db.iter() {
            assert_eq!(entity.handle(), Some(handle));
            assert_eq!(entity.state(), Lifecycle::Bound);
            assert_eq!(entity.core().doc(), Some(doc));
        }
    }

    #[test]
    fn bind_rejects_non_virtual_entities() {
        let mut db = EntityDatabase::new();
        let mut entity = line_with_handle(None);
        entity.destroy();
        let err = db.bind(entity, DocumentId::next()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { action: "bind", state: Lifecycle::Destroyed, .. }
        ));
    }

    #[test]
    fn seed_moves_the_generator() {
        let mut db = EntityDatabase::new();
        db.seed(Handle::new(0x100));
        assert_eq!(db.next_free(), Some(Handle::new(0x100)));
        let outcome = db.bind(line_with_handle(None), DocumentId::next()).unwrap();
        assert_eq!(outcome.handle(), Handle::new(0x100));
        assert_eq!(db.next_free(), Some(Handle::new(0x101)));
    }

    #[test]
    fn generator_at_the_top_falls_back_to_free_low_handles() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        db.bind(line_with_handle(Some(1)), doc).unwrap();
        db.bind(line_with_handle(Some(u64::MAX)), doc).unwrap();
        db.seed(Handle::new(u64::MAX));

        assert_eq!(db.next_free(), Some(Handle::new(2)));
        let first = db.bind(line_with_handle(None), doc).unwrap().handle();
        let second = db.bind(line_with_handle(None), doc).unwrap().handle();
        assert_eq!((first, second), (Handle::new(2), Handle::new(3)));
    }

    #[test]
    fn link_rejects_self_and_cyclic_owners() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        let outer = db.bind(Entity::Dictionary(Dictionary::default()), doc).unwrap().handle();
        let inner = db.bind(Entity::Dictionary(Dictionary::default()), doc).unwrap().handle();

        assert!(matches!(
            db.link(outer, outer),
            Err(EngineError::OwnerCycle { .. })
        ));
        db.link(inner, outer).unwrap();
        let err = db.link(outer, inner).unwrap_err();
        assert!(matches!(err, EngineError::OwnerCycle { child, parent } if child == outer && parent == inner));
        assert_eq!(db.state(outer), Some(Lifecycle::Bound));
        assert_eq!(db.children(inner), &[] as &[Handle]);
    }

    #[test]
    fn audit_reports_dead_references() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        let target = db.bind(line_with_handle(None), doc).unwrap().handle();
        let mut dict = Dictionary::default();
        dict.entries.push(DictionaryEntry {
            key: "GONE".into(),
            handle: target,
            hard: false,
        });
        let dict = db.bind(Entity::Dictionary(dict), doc).unwrap().handle();
        let mut owned = line_with_handle(None);
        owned.core_mut().xdict = Some(Handle::new(0x777));
        let owned = db.bind(owned, doc).unwrap().handle();
        let dead_xdict = AuditIssue::DeadXdict {
            handle: owned,
            xdict: Handle::new(0x777),
        };
        assert_eq!(db.audit(), vec![dead_xdict.clone()]);

        db.discard(target).unwrap();
        db.lookup_mut(owned).unwrap().core_mut().owner = Some(Handle::new(0x888));
        assert_eq!(
            db.audit(),
            vec![
                AuditIssue::DeadEntry {
                    dictionary: dict,
                    key: "GONE".into(),
                    target,
                },
                AuditIssue::DeadOwner {
                    handle: owned,
                    owner: Handle::new(0x888),
                },
                dead_xdict,
            ]
        );
    }

    #[test]
    fn link_requires_bound_and_live_parent() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        let parent = db
            .bind(Entity::TagStorage(TagStorage::new("BLOCK_RECORD")), doc)
            .unwrap()
            .handle();
        let child = db.bind(line_with_handle(None), doc).unwrap().handle();

        assert!(matches!(
            db.link(child, Handle::new(0xDEAD)),
            Err(EngineError::EntityNotFound(_))
        ));
        db.link(child, parent).unwrap();
        assert_eq!(db.lookup(child).unwrap().owner(), Some(parent));
        assert_eq!(db.children(parent), &[child]);

        let err = db.link(child, parent).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { action: "link", .. }));

        db.unlink(child).unwrap();
        assert_eq!(db.state(child), Some(Lifecycle::Bound));
        assert!(db.children(parent).is_empty());
        // 已是 BOUND，再次解除链接不报错
        db.unlink(child).unwrap();
    }

    #[test]
    fn discard_leaves_a_tombstone_and_orphans_children() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        let parent = db
            .bind(Entity::Dictionary(Dictionary::default()), doc)
            .unwrap()
            .handle();
        let child = db.bind(line_with_handle(None), doc).unwrap().handle();
        db.link(child, parent).unwrap();

        db.discard(parent).unwrap();
        db.discard(parent).unwrap();
        assert_eq!(db.state(parent), Some(Lifecycle::Destroyed));
        assert!(db.lookup(parent).is_none());
        assert_eq!(db.state(child), Some(Lifecycle::Bound));
        assert_eq!(db.len(), 1);
        assert!(db.is_reserved(parent));

        assert!(matches!(
            db.discard(Handle::new(0x999)),
            Err(EngineError::EntityNotFound(_))
        ));
    }

    #[test]
    fn unbound_handles_are_never_reused() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        let handle = db.bind(line_with_handle(None), doc).unwrap().handle();
        let entity = db.take(handle).unwrap();
        assert_eq!(entity.state(), Lifecycle::Virtual);
        assert_eq!(entity.handle(), None);
        assert_eq!(db.state(handle), None);

        let again = db.bind(entity, doc).unwrap().handle();
        assert_ne!(again, handle);
        let mut stale = line_with_handle(None);
        stale.core_mut().declared_handle = Some(handle);
        assert!(matches!(db.bind(stale, doc).unwrap(), BindOutcome::Reassigned { .. }));
    }

    #[test]
    fn remap_rewrites_every_reference() {
        let doc = DocumentId::next();
        let mut db = EntityDatabase::new();
        let layer = db
            .bind(Entity::Layer(Layer::default()), doc)
            .unwrap()
            .handle();
        let mut dict = Dictionary::default();
        dict.entries.push(DictionaryEntry {
            key: "KEY".into(),
            handle: layer,
            hard: false,
        });
        let dict = db.bind(Entity::Dictionary(dict), doc).unwrap().handle();
        let child = db.bind(line_with_handle(None), doc).unwrap().handle();
        db.link(child, layer).unwrap();

        let new = Handle::new(0x500);
        db.remap(layer, new).unwrap();
        assert!(db.lookup(layer).is_none());
        assert_eq!(db.lookup(new).unwrap().handle(), Some(new));
        assert_eq!(db.lookup(child).unwrap().owner(), Some(new));
        assert_eq!(db.children(new), &[child]);
        let Some(Entity::Dictionary(dict)) = db.lookup(dict) else {
            panic!("expected dictionary");
        };
        assert_eq!(dict.get("KEY"), Some(new));

        assert!(matches!(db.remap(new, child), Err(EngineError::HandleInUse(_))));
        assert!(matches!(
            db.remap(layer, Handle::new(0x600)),
            Err(EngineError::EntityNotFound(_))
        ));
    }
}
