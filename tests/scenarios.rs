//! End-to-end scenarios: whole files through the registry, the loader,
//! the editors and back out.

use blockform::{
    find, insert_parent, walk, Error, Format, Graph, Instance, Order, Registry, Schema, Value,
};
use proptest::prelude::*;
use std::sync::Arc;

const SCENE_SCHEMA: &str = r#"
    <schema>
      <basic name="u8" size="1" kind="uint" />
      <basic name="u16" size="2" kind="uint" />
      <basic name="u32" size="4" kind="uint" />
      <enum name="BlendMode" storage="u16">
        <option name="OPAQUE" value="0" />
        <option name="ALPHA" value="1" />
      </enum>
      <compound name="Node">
        <field name="legacy_flag" type="u8" until="4.0.0.0" />
        <field name="num_children" type="u32" />
        <field name="children" type="ref" target="Node" length="num_children" />
        <field name="back" type="ptr" target="Node" />
      </compound>
      <compound name="Mesh" inherit="Node">
        <field name="blend_mode" type="BlendMode" />
      </compound>
      <compound name="Texture">
        <field name="levels" type="u8" />
      </compound>
      <compound name="Material">
        <field name="mesh" type="ref" target="Mesh" />
      </compound>
    </schema>"#;

const SCENE_SIG: &[u8] = b"SCN\x01";

fn scene_registry() -> Registry {
    let schema = Arc::new(Schema::parse(SCENE_SCHEMA).unwrap());
    let mut registry = Registry::new();
    registry.register(Format::block_table(
        "scene",
        SCENE_SIG,
        schema,
        0x0300_0000,
        0x0500_0000,
    ));
    registry
}

fn tga_registry() -> Registry {
    let schema = Arc::new(Schema::parse(include_str!("../schemas/tga.xml")).unwrap());
    let mut registry = Registry::new();
    registry.register(Format::flat_root("tga", b"", schema, "Tga"));
    registry
}

/// Assembles a block-table stream by hand, the way a conformant writer
/// would lay it out.
struct FileBytes(Vec<u8>);

impl FileBytes {
    fn new(signature: &[u8]) -> Self {
        FileBytes(signature.to_vec())
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn sized_str(&mut self, s: &str) -> &mut Self {
        self.u32(s.len() as u32);
        self.0.extend_from_slice(s.as_bytes());
        self
    }
}

/// A scene file: version, typed blocks (type name, body bytes), roots.
fn scene_file(version: u32, blocks: &[(&str, Vec<u8>)], roots: &[i32]) -> Vec<u8> {
    let mut types: Vec<&str> = Vec::new();
    for (name, _) in blocks {
        if !types.contains(name) {
            types.push(name);
        }
    }

    let mut f = FileBytes::new(SCENE_SIG);
    f.u32(version).u32(0);
    f.u32(blocks.len() as u32);
    f.u16(types.len() as u16);
    for name in &types {
        f.sized_str(name);
    }
    for (name, _) in blocks {
        f.u16(types.iter().position(|t| t == name).unwrap() as u16);
    }
    for (_, body) in blocks {
        f.0.extend_from_slice(body);
    }
    f.u32(roots.len() as u32);
    for &root in roots {
        f.i32(root);
    }
    f.0
}

fn node_body(legacy: Option<u8>, children: &[i32], back: i32) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(flag) = legacy {
        body.push(flag);
    }
    body.extend_from_slice(&(children.len() as u32).to_le_bytes());
    for &child in children {
        body.extend_from_slice(&child.to_le_bytes());
    }
    body.extend_from_slice(&back.to_le_bytes());
    body
}

// Scenario 1: minimal TGA write, reload, byte-identical, pixels equal.
#[test]
fn tga_write_read_round_trip() {
    let registry = tga_registry();
    let mut graph = registry.new_graph("tga").unwrap();

    let pixels = [
        (255u8, 0u8, 0u8, 255u8),
        (0, 255, 0, 255),
        (0, 0, 255, 255),
        (255, 255, 255, 255),
    ];

    let root = build_tga(&graph, 2, 2, &pixels);
    let root_id = graph.add_block(root).unwrap();
    graph.add_root(root_id);

    let bytes = graph.save_bytes().unwrap();
    // 18-byte header plus 2x2 32-bit pixels.
    assert_eq!(bytes.len(), 18 + 16);

    let reloaded = registry.open(&bytes[..]).unwrap();
    assert!(reloaded.diagnostics.is_empty());
    assert_eq!(reloaded.save_bytes().unwrap(), bytes);

    let tga = reloaded.block(reloaded.roots()[0]).unwrap();
    let rows = tga.get_array("pixels").unwrap();
    let mut seen = Vec::new();
    for row in rows {
        let Value::Array(cells) = row else { panic!() };
        for cell in cells {
            let Value::Struct(pixel) = cell else { panic!() };
            seen.push((
                pixel.get_int("r").unwrap() as u8,
                pixel.get_int("g").unwrap() as u8,
                pixel.get_int("b").unwrap() as u8,
                pixel.get_int("a").unwrap() as u8,
            ));
        }
    }
    assert_eq!(seen, pixels);
}

// Scenario 2: a version gate flips field presence without consuming bytes.
#[test]
fn versioned_field_presence() {
    let registry = scene_registry();

    let old = scene_file(
        0x0400_0000,
        &[("Node", node_body(Some(7), &[], -1))],
        &[0],
    );
    let graph = registry.open(&old[..]).unwrap();
    let node = graph.block(graph.roots()[0]).unwrap();
    assert_eq!(node.get_int("legacy_flag"), Some(7));

    let new = scene_file(0x0400_0001, &[("Node", node_body(None, &[], -1))], &[0]);
    let graph = registry.open(&new[..]).unwrap();
    assert!(graph.diagnostics.is_empty(), "no trailing bytes misread");
    let node = graph.block(graph.roots()[0]).unwrap();
    assert_eq!(node.get_int("legacy_flag"), None);
    assert_eq!(node.get_int("num_children"), Some(0));
}

// Scenario 3: strong/weak cycle loads, traverses once, saves identically.
#[test]
fn weak_link_cycle_tolerated() {
    let registry = scene_registry();
    let bytes = scene_file(
        0x0400_0001,
        &[
            ("Node", node_body(None, &[1], -1)),
            ("Node", node_body(None, &[], 0)),
        ],
        &[0],
    );

    let graph = registry.open(&bytes[..]).unwrap();
    assert!(graph.diagnostics.is_empty());

    let a = graph.roots()[0];
    let strong: Vec<_> = walk(&graph, Order::Pre, false).collect();
    assert_eq!(strong.len(), 2);
    assert_eq!(strong[0], a);
    let with_weak: Vec<_> = walk(&graph, Order::Pre, true).collect();
    assert_eq!(with_weak, strong, "visit-once holds across weak edges");

    assert_eq!(graph.save_bytes().unwrap(), bytes);
}

// Scenario 4: insert_parent splices a node between a root and its child.
#[test]
fn insert_parent_end_to_end() {
    let registry = scene_registry();
    let bytes = scene_file(
        0x0400_0001,
        &[
            ("Node", node_body(None, &[1], -1)),
            ("Node", node_body(None, &[], -1)),
        ],
        &[0],
    );
    let mut graph = registry.open(&bytes[..]).unwrap();
    let root = graph.roots()[0];
    let child = walk(&graph, Order::Pre, false).nth(1).unwrap();

    let new_parent = Instance::new(graph.schema(), "Node").unwrap();
    let parent = insert_parent(&mut graph, child, new_parent).unwrap();

    let order: Vec<_> = walk(&graph, Order::Pre, false).collect();
    assert_eq!(order, vec![root, parent, child]);

    // The old root now links the new parent, the child is unchanged.
    let root_children = graph.block(root).unwrap().get_array("children").unwrap();
    assert_eq!(
        root_children[0],
        Value::Link {
            target: Some(parent),
            weak: false
        }
    );

    // The edited graph still writes and reloads cleanly.
    let saved = graph.save_bytes().unwrap();
    let reloaded = registry.open(&saved[..]).unwrap();
    assert_eq!(reloaded.block_count(), 3);
    assert_eq!(walk(&reloaded, Order::Pre, false).count(), 3);
}

// Scenario 5: enum value outside the declared set warns and round-trips.
#[test]
fn unknown_enum_value_preserved() {
    let registry = scene_registry();
    let mut body = node_body(None, &[], -1);
    body.extend_from_slice(&7u16.to_le_bytes()); // blend_mode = 7
    let bytes = scene_file(0x0400_0001, &[("Mesh", body)], &[0]);

    let graph = registry.open(&bytes[..]).unwrap();
    assert_eq!(graph.diagnostics.len(), 1);
    assert!(graph.diagnostics[0].message.contains("BlendMode"));

    let mesh = graph.block(graph.roots()[0]).unwrap();
    assert_eq!(
        mesh.get("blend_mode"),
        Some(&Value::Enum {
            decl: "BlendMode".into(),
            raw: 7
        })
    );
    assert_eq!(graph.save_bytes().unwrap(), bytes);
}

// Scenario 6: a strong link to the wrong block type aborts the load.
#[test]
fn link_type_mismatch_fails_load() {
    let registry = scene_registry();
    let bytes = scene_file(
        0x0400_0001,
        &[
            ("Material", 1i32.to_le_bytes().to_vec()),
            ("Texture", vec![0]),
        ],
        &[0],
    );
    match registry.open(&bytes[..]) {
        Err(Error::LinkTypeMismatch {
            expected, found, ..
        }) => {
            assert_eq!(expected, "Mesh");
            assert_eq!(found, "Texture");
        }
        other => panic!("expected LinkTypeMismatch, got {other:?}"),
    }
}

#[test]
fn link_out_of_range_fails_load() {
    let registry = scene_registry();
    let bytes = scene_file(
        0x0400_0001,
        &[("Node", node_body(None, &[9], -1))],
        &[0],
    );
    match registry.open(&bytes[..]) {
        Err(Error::LinkOutOfRange { index, len }) => {
            assert_eq!(index, 9);
            assert_eq!(len, 1);
        }
        other => panic!("expected LinkOutOfRange, got {other:?}"),
    }
}

#[test]
fn strong_cycle_fails_load() {
    let registry = scene_registry();
    let bytes = scene_file(
        0x0400_0001,
        &[
            ("Node", node_body(None, &[1], -1)),
            ("Node", node_body(None, &[0], -1)),
        ],
        &[0],
    );
    match registry.open(&bytes[..]) {
        Err(Error::CorruptBlock(msg)) => assert!(msg.contains("cycle")),
        other => panic!("expected CorruptBlock, got {other:?}"),
    }
}

#[test]
fn uncovered_version_fails_load() {
    let registry = scene_registry();
    let bytes = scene_file(0x0600_0000, &[], &[]);
    assert!(matches!(
        registry.open(&bytes[..]),
        Err(Error::UnsupportedVersion(_))
    ));
}

#[test]
fn unreachable_blocks_dropped_on_save() {
    let registry = scene_registry();
    // Block 1 is neither a root nor linked from one.
    let bytes = scene_file(
        0x0400_0001,
        &[
            ("Node", node_body(None, &[], -1)),
            ("Node", node_body(None, &[], -1)),
        ],
        &[0],
    );
    let graph = registry.open(&bytes[..]).unwrap();
    // Non-canonical order is reported, which exempts this file from the
    // byte-exact contract.
    assert!(!graph.diagnostics.is_empty());

    let saved = graph.save_bytes().unwrap();
    let reloaded = registry.open(&saved[..]).unwrap();
    assert_eq!(reloaded.block_count(), 1);
}

#[test]
fn trailing_bytes_warn_but_load() {
    let registry = scene_registry();
    let mut bytes = scene_file(0x0400_0001, &[("Node", node_body(None, &[], -1))], &[0]);
    bytes.extend_from_slice(b"junk");
    let graph = registry.open(&bytes[..]).unwrap();
    assert!(graph
        .diagnostics
        .iter()
        .any(|d| d.message.contains("trailing")));
    assert_eq!(graph.block_count(), 1);
}

#[test]
fn find_by_type_over_a_loaded_file() {
    let registry = scene_registry();
    let mut mesh_body = node_body(None, &[], -1);
    mesh_body.extend_from_slice(&0u16.to_le_bytes());
    let bytes = scene_file(
        0x0400_0001,
        &[
            ("Node", node_body(None, &[1, 2], -1)),
            ("Mesh", mesh_body.clone()),
            ("Mesh", mesh_body),
        ],
        &[0],
    );
    let graph = registry.open(&bytes[..]).unwrap();
    assert_eq!(find(&graph, |name| name == "Mesh").count(), 2);
    assert_eq!(find(&graph, |name| name == "Node").count(), 1);
}

const NAMED_SCHEMA: &str = r#"
    <schema>
      <basic name="u8" size="1" kind="uint" />
      <basic name="u32" size="4" kind="uint" />
      <compound name="FileHeader">
        <field name="endian" type="u8" />
      </compound>
      <compound name="Named">
        <field name="name" type="string" />
        <field name="next" type="ref" target="Named" />
      </compound>
    </schema>"#;

fn named_registry() -> Registry {
    let schema = Arc::new(Schema::parse(NAMED_SCHEMA).unwrap());
    let mut format = Format::block_table("named", b"NAM\x01", schema, 0, u32::MAX);
    format.header_compound = Some("FileHeader".into());
    format.endian_field = Some("endian".into());
    format.has_string_table = true;
    let mut registry = Registry::new();
    registry.register(format);
    registry
}

// String fields become table indices; duplicates share one entry and the
// whole file round-trips byte-exactly.
#[test]
fn string_table_round_trip() {
    let registry = named_registry();

    let mut f = FileBytes::new(b"NAM\x01");
    f.u32(7).u32(0); // version, user_version
    f.u8(1); // header: little endian
    f.u32(2).u16(1); // two blocks, one type
    f.sized_str("Named");
    f.u16(0).u16(0); // both blocks are Named
    f.u32(2); // string table
    f.sized_str("alpha");
    f.sized_str("beta");
    f.i32(0).i32(1); // block 0: name=alpha, next -> block 1
    f.i32(1).i32(-1); // block 1: name=beta, no next
    f.u32(1).i32(0); // one root
    let bytes = f.0.clone();

    let graph = registry.open(&bytes[..]).unwrap();
    assert!(graph.diagnostics.is_empty());
    let root = graph.block(graph.roots()[0]).unwrap();
    assert_eq!(root.get_str("name"), Some("alpha"));
    let next = root.get_link("next").unwrap().unwrap();
    assert_eq!(graph.block(next).unwrap().get_str("name"), Some("beta"));

    assert_eq!(graph.save_bytes().unwrap(), bytes);
}

// The header's endian byte switches everything after it to big-endian.
#[test]
fn header_declared_endianness() {
    let registry = named_registry();

    let mut f = FileBytes::new(b"NAM\x01");
    f.u32(7).u32(0); // versions stay in the format's default order
    f.u8(0); // header: big endian from here on
    f.0.extend_from_slice(&1u32.to_be_bytes()); // num_blocks
    f.0.extend_from_slice(&1u16.to_be_bytes()); // num_types
    f.0.extend_from_slice(&5u32.to_be_bytes());
    f.0.extend_from_slice(b"Named");
    f.0.extend_from_slice(&0u16.to_be_bytes()); // block type index
    f.0.extend_from_slice(&1u32.to_be_bytes()); // one string
    f.0.extend_from_slice(&4u32.to_be_bytes());
    f.0.extend_from_slice(b"solo");
    f.0.extend_from_slice(&0i32.to_be_bytes()); // name = solo
    f.0.extend_from_slice(&(-1i32).to_be_bytes()); // next = null
    f.0.extend_from_slice(&1u32.to_be_bytes()); // one root
    f.0.extend_from_slice(&0i32.to_be_bytes());
    let bytes = f.0.clone();

    let graph = registry.open(&bytes[..]).unwrap();
    let root = graph.block(graph.roots()[0]).unwrap();
    assert_eq!(root.get_str("name"), Some("solo"));

    assert_eq!(graph.save_bytes().unwrap(), bytes);
}

fn arbitrary_pixels() -> impl Strategy<Value = (u16, u16, Vec<(u8, u8, u8, u8)>)> {
    (1u16..4, 1u16..4).prop_flat_map(|(w, h)| {
        proptest::collection::vec(any::<(u8, u8, u8, u8)>(), (w as usize) * (h as usize))
            .prop_map(move |pixels| (w, h, pixels))
    })
}

fn build_tga(graph: &Graph, w: u16, h: u16, pixels: &[(u8, u8, u8, u8)]) -> Instance {
    let schema = graph.schema();
    let mut root = Instance::new(schema, "Tga").unwrap();
    root.set(schema, "width", Value::U16(w)).unwrap();
    root.set(schema, "height", Value::U16(h)).unwrap();
    let mut rows = Vec::new();
    for row in pixels.chunks(w as usize) {
        let mut cells = Vec::new();
        for &(r, g, b, a) in row {
            let mut pixel = Instance::new(schema, "Pixel").unwrap();
            pixel.set(schema, "r", Value::U8(r)).unwrap();
            pixel.set(schema, "g", Value::U8(g)).unwrap();
            pixel.set(schema, "b", Value::U8(b)).unwrap();
            pixel.set(schema, "a", Value::U8(a)).unwrap();
            cells.push(Value::Struct(pixel));
        }
        rows.push(Value::Array(cells));
    }
    root.set(schema, "pixels", Value::Array(rows)).unwrap();
    root
}

proptest! {
    // Round-trip identity: save(open(F)) == F for files we emitted.
    #[test]
    fn tga_round_trip_identity((w, h, pixels) in arbitrary_pixels()) {
        let registry = tga_registry();
        let mut graph = registry.new_graph("tga").unwrap();
        let root = build_tga(&graph, w, h, &pixels);
        let id = graph.add_block(root).unwrap();
        graph.add_root(id);

        let bytes = graph.save_bytes().unwrap();
        let reloaded = registry.open(&bytes[..]).unwrap();
        prop_assert!(reloaded.diagnostics.is_empty());
        prop_assert_eq!(reloaded.save_bytes().unwrap(), bytes);
    }

    // Predicate locality: the gate only governs its own field; identical
    // preceding fields read the same bytes under either version.
    #[test]
    fn predicate_locality(children in proptest::collection::vec(0u8..1, 0..3)) {
        let registry = scene_registry();
        let n = children.len() as i32;
        let kids: Vec<i32> = (1..=n).collect();
        let mut blocks = vec![("Node", node_body(None, &kids, -1))];
        for _ in &children {
            blocks.push(("Node", node_body(None, &[], -1)));
        }
        let with_gate_closed = scene_file(0x0400_0001, &blocks, &[0]);

        let mut blocks_old = vec![("Node", node_body(Some(9), &kids, -1))];
        for _ in &children {
            blocks_old.push(("Node", node_body(Some(9), &[], -1)));
        }
        let with_gate_open = scene_file(0x0400_0000, &blocks_old, &[0]);

        let new = registry.open(&with_gate_closed[..]).unwrap();
        let old = registry.open(&with_gate_open[..]).unwrap();

        // Fields other than the gated one decode identically.
        for (a, b) in walk(&new, Order::Pre, false).zip(walk(&old, Order::Pre, false)) {
            let na = new.block(a).unwrap();
            let nb = old.block(b).unwrap();
            prop_assert_eq!(na.get_int("num_children"), nb.get_int("num_children"));
            prop_assert_eq!(na.get_array("children").map(<[Value]>::len),
                            nb.get_array("children").map(<[Value]>::len));
        }
        prop_assert_eq!(old.block(old.roots()[0]).unwrap().get_int("legacy_flag"), Some(9));
        prop_assert_eq!(new.block(new.roots()[0]).unwrap().get_int("legacy_flag"), None);
    }
}
