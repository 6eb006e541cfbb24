//! 结构数据库：按 `SECTION/ENDSEC`、`TABLE/ENDTAB`、`BLOCK/ENDBLK` 划分编译后的标签流。

use tracing::debug;
use zdxf_core::codes;
use zdxf_core::diagnostics::{DiagnosticKind, Diagnostics};
use zdxf_core::tags::{Tag, TagRun};

use crate::error::StructureError;

/// 加载期的段落树，只被装配器消费一次。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructureDatabase {
    pub sections: Vec<Section>,
}

impl StructureDatabase {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    /// `(2, name)` 之后、第一个组码 0 之前的标签，HEADER 段的变量即在此。
    pub preamble: Vec<Tag>,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Entity(TagRun),
    Table(Table),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub head: TagRun,
    pub entries: Vec<TagRun>,
    /// `ENDTAB` 标签段；隐式闭合时为空。
    pub end: TagRun,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub head: TagRun,
    pub entities: Vec<TagRun>,
    /// `ENDBLK` 标签段；隐式闭合时为空。
    pub end: TagRun,
}

enum Container {
    Table(Table),
    Block(Block),
}

impl Container {
    fn kind(&self) -> &'static str {
        match self {
            Container::Table(_) => "TABLE",
            Container::Block(_) => "BLOCK",
        }
    }

    fn name(&self) -> &str {
        match self {
            Container::Table(table) => &table.name,
            Container::Block(block) => &block.name,
        }
    }

    fn push(&mut self, run: TagRun) {
        match self {
            Container::Table(table) => table.entries.push(run),
            Container::Block(block) => block.entities.push(run),
        }
    }

    fn close(self, end: TagRun) -> Node {
        match self {
            Container::Table(mut table) => {
                table.end = end;
                Node::Table(table)
            }
            Container::Block(mut block) => {
                block.end = end;
                Node::Block(block)
            }
        }
    }
}

/// 结构构建器。每个标签段以组码 0 开始，延续到下一个组码 0 之前。
pub struct StructureBuilder<I> {
    tags: I,
    pending: Option<Tag>,
    consumed: usize,
}

impl<I> StructureBuilder<I>
where
    I: Iterator<Item = Result<Tag, StructureError>>,
{
    pub fn new(tags: I) -> Self {
        Self {
            tags,
            pending: None,
            consumed: 0,
        }
    }

    /// 近似行号：文本 DXF 中每个标签占两行。
    fn line(&self) -> usize {
        (self.consumed * 2).saturating_sub(1)
    }

    fn next_run(&mut self) -> Result<Option<TagRun>, StructureError> {
        let mut run: TagRun = self.pending.take().into_iter().collect();
        loop {
            match self.tags.next() {
                None => return Ok((!run.is_empty()).then_some(run)),
                Some(Err(err)) => return Err(err),
                Some(Ok(tag)) => {
                    self.consumed += 1;
                    if tag.code == codes::STRUCTURE && !run.is_empty() {
                        self.pending = Some(tag);
                        return Ok(Some(run));
                    }
                    run.push(tag);
                }
            }
        }
    }

    pub fn build(mut self, diagnostics: &mut Diagnostics) -> Result<StructureDatabase, StructureError> {
        let mut database = StructureDatabase::default();
        let mut section: Option<Section> = None;
        let mut container: Option<Container> = None;

        while let Some(run) = self.next_run()? {
            let line = self.line();
            let marker = match run.first() {
                Some(tag) if tag.code == codes::STRUCTURE => tag.as_str().unwrap_or_default(),
                _ => "",
            };

            match marker {
                "SECTION" => {
                    if let Some(open) = &section {
                        return Err(StructureError::unbalanced(
                            format!("SECTION 嵌套在段 {} 之内", open.name),
                            line,
                        ));
                    }
                    let name = run
                        .get(1)
                        .filter(|tag| tag.code == codes::NAME)
                        .and_then(Tag::as_str)
                        .map(|name| name.trim().to_string())
                        .ok_or(StructureError::MissingSectionName { line })?;
                    debug!(section = %name, line, "进入段");
                    section = Some(Section {
                        name,
                        preamble: run[2..].to_vec(),
                        nodes: Vec::new(),
                    });
                }
                "ENDSEC" => {
                    let Some(done) = section.take() else {
                        return Err(StructureError::unbalanced("ENDSEC 之前没有 SECTION", line));
                    };
                    if let Some(open) = &container {
                        return Err(StructureError::unbalanced(
                            format!("{} {} 尚未结束时遇到 ENDSEC", open.kind(), open.name()),
                            line,
                        ));
                    }
                    debug!(section = %done.name, nodes = done.nodes.len(), "段结束");
                    database.sections.push(done);
                }
                "EOF" => {
                    if let Some(open) = &section {
                        return Err(StructureError::unbalanced(
                            format!("段 {} 尚未结束时遇到 EOF", open.name),
                            line,
                        ));
                    }
                    break;
                }
                _ if section.is_none() => {
                    diagnostics.info(
                        DiagnosticKind::TagOutsideSection,
                        format!(
                            "第 {line} 行附近的标签 {} 不属于任何段，已丢弃",
                            run.first().map(ToString::to_string).unwrap_or_default()
                        ),
                    );
                }
                "TABLE" | "BLOCK" => {
                    if let Some(open) = &container {
                        return Err(StructureError::unbalanced(
                            format!("{marker} 嵌套在 {} {} 之内", open.kind(), open.name()),
                            line,
                        ));
                    }
                    let name = first_name(&run);
                    container = Some(if marker == "TABLE" {
                        Container::Table(Table {
                            name,
                            head: run,
                            entries: Vec::new(),
                            end: Vec::new(),
                        })
                    } else {
                        Container::Block(Block {
                            name,
                            head: run,
                            entities: Vec::new(),
                            end: Vec::new(),
                        })
                    });
                }
                "ENDTAB" | "ENDBLK" => {
                    let expected = if marker == "ENDTAB" { "TABLE" } else { "BLOCK" };
                    match container.take() {
                        Some(open) if open.kind() == expected => {
                            if let Some(current) = section.as_mut() {
                                current.nodes.push(open.close(run));
                            }
                        }
                        Some(open) => {
                            return Err(StructureError::unbalanced(
                                format!("{marker} 与 {} {} 不匹配", open.kind(), open.name()),
                                line,
                            ));
                        }
                        None => {
                            return Err(StructureError::unbalanced(
                                format!("{marker} 之前没有 {expected}"),
                                line,
                            ));
                        }
                    }
                }
                _ => match (container.as_mut(), section.as_mut()) {
                    (Some(open), _) => open.push(run),
                    (None, Some(current)) => current.nodes.push(Node::Entity(run)),
                    (None, None) => {}
                },
            }
        }

        // 流在容器未闭合时结束：视为截断，隐式闭合
        if let Some(open) = container.take() {
            diagnostics.info(
                DiagnosticKind::TruncatedContent,
                format!("{} {} 未以结束标记闭合，已隐式闭合", open.kind(), open.name()),
            );
            if let Some(current) = section.as_mut() {
                current.nodes.push(open.close(Vec::new()));
            }
        }
        if let Some(open) = section.take() {
            diagnostics.info(
                DiagnosticKind::TruncatedContent,
                format!("段 {} 未以 ENDSEC 闭合，已隐式闭合", open.name),
            );
            database.sections.push(open);
        }

        debug!(sections = database.sections.len(), "结构数据库构建完成");
        Ok(database)
    }
}

fn first_name(run: &[Tag]) -> String {
    run.iter()
        .find(|tag| tag.code == codes::NAME)
        .and_then(Tag::as_str)
        .unwrap_or_default()
        .to_string()
}
