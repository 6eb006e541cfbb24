use std::io::BufRead;
use std::path::Path;

use tracing::debug;
use zdxf_config::{ConfigError, LoadOptions};
use zdxf_io::{LoadedStructure, read_file, structure_from_bytes, structure_from_reader, structure_from_str};

use crate::assembler::assemble;
use crate::document::Document;
use crate::errors::EngineError;
use crate::factory::EntityFactory;

pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Document, EngineError>;
}

/// DXF 加载入口：结构加载与文档组装，选项显式传递。
#[derive(Debug, Clone, Default)]
pub struct DxfFacade {
    options: LoadOptions,
}

impl DxfFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LoadOptions) -> Self {
        Self { options }
    }

    /// 使用 `ZDXF_CONFIG` 或 `./config/zdxf.toml` 中的加载选项。
    pub fn discover() -> Result<Self, ConfigError> {
        LoadOptions::discover().map(Self::with_options)
    }

    #[inline]
    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    fn finish(&self, loaded: LoadedStructure) -> Result<Document, EngineError> {
        debug!(
            encoding = loaded.encoding.encoding.name(),
            version = loaded.encoding.dxfversion.as_deref().unwrap_or("?"),
            sections = loaded.database.sections.len(),
            policy = %self.options.errors,
            "结构加载完成，开始组装"
        );
        assemble(loaded, EntityFactory::with_defaults())
    }

    pub fn load_str(&self, source: &str) -> Result<Document, EngineError> {
        let loaded = structure_from_str(source, &self.options)?;
        self.finish(loaded)
    }

    pub fn load_bytes(&self, data: &[u8]) -> Result<Document, EngineError> {
        let loaded = structure_from_bytes(data, &self.options)?;
        self.finish(loaded)
    }

    pub fn load_reader(&self, reader: impl BufRead) -> Result<Document, EngineError> {
        let loaded = structure_from_reader(reader, &self.options)?;
        self.finish(loaded)
    }

    /// 读取文件；文件在结构解析之前就已关闭。
    pub fn readfile(&self, path: &Path) -> Result<Document, EngineError> {
        let data = read_file(path)?;
        self.load_bytes(&data)
    }
}

impl DocumentLoader for DxfFacade {
    fn load(&self, path: &Path) -> Result<Document, EngineError> {
        self.readfile(path)
    }
}

#[cfg(test)]
mod tests {
    use zdxf_config::RecoveryPolicy;
    use crate::entity::DxfEntity;
    use zdxf_io::{IoError, StructureError};

    use super::*;

    #[test]
    fn fatal_structure_errors_surface() {
        let facade = DxfFacade::new();
        let err = facade
            .load_str("0\nSECTION\n2\nENTITIES\n0\nLINE\n10\n1.0\n21\n2.0\n0\nENDSEC\n0\nEOF\n")
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Io(IoError::Structure(StructureError::MissingYCoordinate { .. }))
        ));

        let err = facade.load_str("0\nENDSEC\n").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Io(IoError::Structure(StructureError::Unbalanced { .. }))
        ));
    }

    #[test]
    fn options_are_threaded_through() {
        let strict = DxfFacade::with_options(LoadOptions::default().with_policy(RecoveryPolicy::Strict));
        assert_eq!(strict.options().errors, RecoveryPolicy::Strict);
        let data = b"9\n$ACADVER\n1\nAC1027\n0\nSECTION\n2\nENTITIES\n0\nLINE\n8\n\xff\n0\nENDSEC\n0\nEOF\n";
        assert!(strict.load_bytes(data).is_err());

        let doc = DxfFacade::new().load_bytes(data).unwrap();
        assert!(!doc.diagnostics().is_empty());
        assert_eq!(doc.entities().filter(|(_, e)| e.dxftype() == "LINE").count(), 1);
    }

    #[test]
    fn reader_input_is_accepted() {
        let source: &[u8] = b"0\nSECTION\n2\nENTITIES\n0\nCIRCLE\n40\n3.5\n0\nENDSEC\n0\nEOF\n";
        let doc = DxfFacade::new().load_reader(source).unwrap();
        let msp = doc.modelspace().unwrap();
        assert_eq!(doc.layout_entities(msp).count(), 1);
    }
}
