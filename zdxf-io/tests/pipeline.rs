use std::io::Write;

use zdxf_config::LoadOptions;
use zdxf_core::tags::Tag;
use zdxf_io::{Node, TagWriter, read_file, structure_from_bytes, tags_to_string};

const DRAWING: &str = "  0
SECTION
  2
HEADER
  9
$ACADVER
  1
AC1015
  9
$HANDSEED
  5
FF
  0
ENDSEC
  0
SECTION
  2
TABLES
  0
TABLE
  2
LAYER
  5
2
 70
1
  0
LAYER
  5
10
330
2
  2
Walls
 70
0
 62
3
  6
CONTINUOUS
  0
ENDTAB
  0
ENDSEC
  0
SECTION
  2
ENTITIES
999
exported by a test
  0
LINE
  5
20
  8
Walls
 10
0.0
 20
0.0
 30
0.0
 11
10.0
 21
5.0
 31
0.0
1001
MY_APP
1000
extra payload
  0
ENDSEC
  0
EOF
";

fn entities(data: &[u8]) -> Vec<Vec<Tag>> {
    let loaded = structure_from_bytes(data, &LoadOptions::default()).expect("load structure");
    loaded
        .database
        .section("ENTITIES")
        .expect("entities section")
        .nodes
        .iter()
        .filter_map(|node| match node {
            Node::Entity(run) => Some(run.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn file_round_trip_keeps_every_tag() {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(DRAWING.as_bytes()).expect("write drawing");

    let data = read_file(file.path()).expect("read drawing");
    let loaded = structure_from_bytes(&data, &LoadOptions::default()).expect("load structure");
    assert_eq!(loaded.database.sections.len(), 3);
    assert!(loaded.diagnostics.is_empty());
    assert_eq!(
        loaded.encoding.dxfversion.as_deref(),
        Some("AC1015"),
        "version is picked up by the pre-scan"
    );

    let header = loaded.database.section("HEADER").expect("header");
    assert_eq!(header.preamble.len(), 4);

    let first = entities(&data);
    assert_eq!(first.len(), 1);
    let line = &first[0];
    assert_eq!(line.len(), 7);
    assert_eq!(line[5], Tag::new(1001, "MY_APP"));

    // 写出后重新加载，标签保持一致
    let mut writer = TagWriter::new(Vec::new());
    writer.write_tags(line).expect("write tags");
    let mut rebuilt = b"0\nSECTION\n2\nENTITIES\n".to_vec();
    rebuilt.extend_from_slice(&writer.into_inner());
    rebuilt.extend_from_slice(b"0\nENDSEC\n0\nEOF\n");
    assert_eq!(entities(&rebuilt), first);
}

#[test]
fn comments_survive_when_requested() {
    let options = LoadOptions::default().with_comments();
    let loaded = structure_from_bytes(DRAWING.as_bytes(), &options).expect("load structure");
    let section = loaded.database.section("ENTITIES").expect("entities");
    // 注释位于段头与 LINE 之间，归入段的前导标签
    assert_eq!(section.preamble, vec![Tag::new(999, "exported by a test")]);
    assert_eq!(
        tags_to_string(&section.preamble),
        "999\nexported by a test\n"
    );
}

fn binary_drawing() -> Vec<u8> {
    let mut data = zdxf_io::BINARY_DXF_SENTINEL.to_vec();
    let mut tag = |code: u16, value: &[u8]| {
        data.extend_from_slice(&code.to_le_bytes());
        data.extend_from_slice(value);
    };
    tag(0, b"SECTION\0");
    tag(2, b"HEADER\0");
    tag(9, b"$ACADVER\0");
    tag(1, b"AC1015\0");
    tag(0, b"ENDSEC\0");
    tag(0, b"SECTION\0");
    tag(2, b"ENTITIES\0");
    tag(999, b"binary comment\0");
    tag(0, b"LINE\0");
    tag(5, b"20\0");
    tag(8, b"0\0");
    for (code, value) in [(10, 0.0f64), (20, 0.0), (30, 0.0), (11, 3.0), (21, 4.0), (31, 0.0)] {
        tag(code, &value.to_le_bytes());
    }
    tag(0, b"ENDSEC\0");
    tag(0, b"EOF\0");
    data
}

#[test]
fn binary_comments_follow_the_load_options() {
    let data = binary_drawing();

    let loaded = structure_from_bytes(&data, &LoadOptions::default()).expect("load binary");
    let section = loaded.database.section("ENTITIES").expect("entities");
    assert!(section.preamble.is_empty());
    assert_eq!(entities(&data).len(), 1);

    let options = LoadOptions::default().with_comments();
    let loaded = structure_from_bytes(&data, &options).expect("load binary");
    let section = loaded.database.section("ENTITIES").expect("entities");
    assert_eq!(section.preamble, vec![Tag::new(999, "binary comment")]);
    assert_eq!(section.nodes.len(), 1);
}
