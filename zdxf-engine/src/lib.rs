//! 实体生命周期与文档组装：工厂、实体数据库、文档以及从结构数据库到文档的两遍组装。

pub mod assembler;
pub mod document;
pub mod entity;
pub mod entitydb;
pub mod factory;
pub mod loader;

pub mod errors {
    use thiserror::Error;
    use zdxf_core::handle::Handle;

    use crate::entity::Lifecycle;

    /// 调用方的使用错误。文件中的缺陷只产生诊断，不会走到这里。
    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("句柄 {0} 对应的实体不存在或已销毁")]
        EntityNotFound(Handle),
        #[error("实体 {handle:?} 处于 {state} 状态，不能执行 {action}")]
        InvalidTransition {
            handle: Option<Handle>,
            action: &'static str,
            state: Lifecycle,
        },
        #[error("缺少 {kind} 资源 \"{name}\"")]
        MissingResource { kind: &'static str, name: String },
        #[error("未注册的实体类型 {0}")]
        UnknownType(String),
        #[error("{dxftype} 没有属性 {name}")]
        UnknownAttribute { dxftype: String, name: String },
        #[error("属性 {name} 的值 {value} 类型不符")]
        InvalidAttribute { name: String, value: String },
        #[error("句柄 {0} 已被占用")]
        HandleInUse(Handle),
        #[error("句柄空间已用尽")]
        HandlesExhausted,
        #[error("实体 {child} 不能挂到 {parent} 下：所有者链成环")]
        OwnerCycle { child: Handle, parent: Handle },
        #[error("引导实体无效：{0}")]
        InvalidBootstrapEntry(String),
        #[error(transparent)]
        Io(#[from] zdxf_io::IoError),
    }
}

pub use assembler::assemble;
pub use document::{BindPolicy, Document, HeaderVars};
pub use entity::{Attribs, DocumentId, DxfEntity, Entity, EntityCore, Lifecycle};
pub use entitydb::{BindOutcome, EntityDatabase};
pub use errors::EngineError;
pub use factory::{EntityConstructor, EntityFactory};
pub use loader::{DocumentLoader, DxfFacade};
