use std::collections::HashMap;
use std::fmt;

use tracing::debug;
use zdxf_core::diagnostics::Diagnostics;
use zdxf_core::tags::Tag;

use crate::entity::{
    Attribs, BlockRecord, Circle, Dictionary, Entity, Insert, Layer, Line, Linetype, TagStorage,
};
use crate::errors::EngineError;

/// 某一 DXF 类型的构造器。
pub trait EntityConstructor: Send + Sync {
    fn dxftype(&self) -> &'static str;

    /// 新建一个全部取默认值的虚拟实体。
    fn new_entity(&self) -> Entity;

    /// 由调用方属性构造，未知或类型不符的属性是调用错误。
    fn create(&self, attribs: &Attribs) -> Result<Entity, EngineError> {
        let mut entity = self.new_entity();
        entity.apply(attribs)?;
        Ok(entity)
    }

    /// 由编译后的标签段构造，未识别的标签原样保留。
    fn load(&self, tags: &[Tag], diagnostics: &mut Diagnostics) -> Entity {
        let mut entity = self.new_entity();
        entity.load_tags(tags, diagnostics);
        entity
    }
}

/// 以函数指针描述的内置构造器。
struct Builtin {
    dxftype: &'static str,
    make: fn() -> Entity,
}

impl EntityConstructor for Builtin {
    fn dxftype(&self) -> &'static str {
        self.dxftype
    }

    fn new_entity(&self) -> Entity {
        (self.make)()
    }
}

/// DXF 类型名到构造器的显式注册表。
pub struct EntityFactory {
    constructors: HashMap<&'static str, Box<dyn EntityConstructor>>,
}

impl EntityFactory {
    /// 空注册表，所有类型都按 [`TagStorage`] 加载。
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// 注册全部内置类型。
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        factory.register(Builtin {
            dxftype: "LINE",
            make: || Entity::Line(Line::default()),
        });
        factory.register(Builtin {
            dxftype: "CIRCLE",
            make: || Entity::Circle(Circle::default()),
        });
        factory.register(Builtin {
            dxftype: "INSERT",
            make: || Entity::Insert(Insert::default()),
        });
        factory.register(Builtin {
            dxftype: "LAYER",
            make: || Entity::Layer(Layer::default()),
        });
        factory.register(Builtin {
            dxftype: "LTYPE",
            make: || Entity::Linetype(Linetype::default()),
        });
        factory.register(Builtin {
            dxftype: "BLOCK_RECORD",
            make: || Entity::BlockRecord(BlockRecord::default()),
        });
        factory.register(Builtin {
            dxftype: "DICTIONARY",
            make: || Entity::Dictionary(Dictionary::default()),
        });
        factory
    }

    /// 注册构造器；同名的已有构造器被替换。
    pub fn register<C: EntityConstructor + 'static>(&mut self, constructor: C) {
        debug!(dxftype = constructor.dxftype(), "注册实体构造器");
        self.constructors
            .insert(constructor.dxftype(), Box::new(constructor));
    }

    pub fn is_registered(&self, dxftype: &str) -> bool {
        self.constructors.contains_key(dxftype)
    }

    pub fn registered_types(&self) -> impl Iterator<Item = &&'static str> {
        self.constructors.keys()
    }

    pub fn create(&self, dxftype: &str, attribs: &Attribs) -> Result<Entity, EngineError> {
        self.constructors
            .get(dxftype)
            .ok_or_else(|| EngineError::UnknownType(dxftype.to_string()))?
            .create(attribs)
    }

    /// 按标签段的类型加载，未注册的类型原样保存为 [`TagStorage`]。
    pub fn load(&self, tags: &[Tag], diagnostics: &mut Diagnostics) -> Entity {
        let dxftype = tags.first().and_then(Tag::as_str).unwrap_or_default();
        match self.constructors.get(dxftype) {
            Some(constructor) => constructor.load(tags, diagnostics),
            None => {
                let mut entity = Entity::TagStorage(TagStorage::new(dxftype));
                entity.load_tags(tags, diagnostics);
                entity
            }
        }
    }
}

impl fmt::Debug for EntityFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("EntityFactory").field("types", &types).finish()
    }
}

impl Default for EntityFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::*;
    use crate::entity::{DxfEntity, Lifecycle};

    struct PointConstructor;

    impl EntityConstructor for PointConstructor {
        fn dxftype(&self) -> &'static str {
            "POINT"
        }

        fn new_entity(&self) -> Entity {
            Entity::TagStorage(TagStorage::new("POINT"))
        }
    }

    #[test]
    fn creates_registered_types_as_virtual() {
        let factory = EntityFactory::with_defaults();
        let entity = factory
            .create(
                "LINE",
                &Attribs::new()
                    .set("start", DVec3::ZERO)
                    .set("end", DVec3::new(1.0, 0.0, 0.0)),
            )
            .unwrap();
        assert_eq!(entity.dxftype(), "LINE");
        assert_eq!(entity.state(), Lifecycle::Virtual);
        assert!(entity.handle().is_none());

        let err = factory.create("SPLINE", &Attribs::new()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownType(name) if name == "SPLINE"));
    }

    #[test]
    fn unknown_types_load_verbatim() {
        let factory = EntityFactory::with_defaults();
        let run = vec![
            Tag::new(0, "ACDBPLACEHOLDER"),
            Tag::new(5, "A1"),
            Tag::new(330, "B"),
            Tag::new(100, "AcDbPlaceholder"),
        ];
        let entity = factory.load(&run, &mut Diagnostics::new());
        assert!(matches!(entity, Entity::TagStorage(_)));
        assert_eq!(entity.export_tags(), vec![
            Tag::new(0, "ACDBPLACEHOLDER"),
            Tag::new(100, "AcDbPlaceholder"),
        ]);
    }

    #[test]
    fn late_registration_replaces_and_extends() {
        let mut factory = EntityFactory::with_defaults();
        assert!(!factory.is_registered("POINT"));
        factory.register(PointConstructor);
        assert!(factory.is_registered("POINT"));
        assert_eq!(factory.registered_types().count(), 8);
        let point = factory.create("POINT", &Attribs::new()).unwrap();
        assert_eq!(point.dxftype(), "POINT");
    }
}
