//! The file-level graph: a flat arena of blocks connected by links.
//! Blocks are addressed by small ids; strong and weak links are both ids,
//! so cycles cost nothing and ownership stays with the arena.

use crate::codec::{Reader, Writer};
use crate::error::{Diagnostic, Error, Result};
use crate::registry::{Format, Framing};
use crate::schema::Schema;
use crate::stream::{read_instance, write_instance, ReadCtx, StringTable, WriteCtx};
use crate::value::{Instance, Slot, Value};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

/// Index of a block within its graph. Ids are stable across edits; removed
/// blocks leave a tombstone so outstanding ids never shift.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A loaded (or user-built) file: blocks, roots, and the tables needed to
/// re-emit the original bytes. Owns everything in it; dropping the graph
/// releases every block.
pub struct Graph {
    pub(crate) format: Arc<Format>,
    pub version: u32,
    pub user_version: u32,
    /// Effective endianness of the block section. Differs from the format
    /// default only when the header declares its own byte order.
    pub(crate) endian: crate::codec::Endianness,
    pub(crate) header: Option<Instance>,
    pub(crate) blocks: Vec<Option<Instance>>,
    pub(crate) roots: Vec<BlockId>,
    /// Block type table as loaded; kept in order so an unedited graph
    /// re-saves byte-identically. New type names append.
    pub(crate) type_table: Vec<String>,
    /// String pool as loaded, first-index-wins on duplicates.
    pub(crate) strings: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("format", &self.format.name)
            .field("version", &self.version)
            .field("user_version", &self.user_version)
            .field("blocks", &self.block_count())
            .field("roots", &self.roots)
            .field("warnings", &self.diagnostics.len())
            .finish()
    }
}

impl Graph {
    /// An empty graph for building a file from scratch.
    pub fn new(format: Arc<Format>) -> Self {
        Graph {
            version: format.default_version,
            user_version: format.default_user_version,
            endian: format.endian,
            format,
            header: None,
            blocks: Vec::new(),
            roots: Vec::new(),
            type_table: Vec::new(),
            strings: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.format.schema
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn block(&self, id: BlockId) -> Option<&Instance> {
        self.blocks.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Instance> {
        self.blocks.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    /// Live blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Instance)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|inst| (BlockId(i), inst)))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }

    pub fn add_root(&mut self, id: BlockId) {
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    pub fn type_name(&self, id: BlockId) -> Option<&str> {
        self.block(id).map(|inst| inst.type_name.as_str())
    }

    /// Adds a block. Its compound must exist in the schema.
    pub fn add_block(&mut self, instance: Instance) -> Result<BlockId> {
        if self.schema().compound(&instance.type_name).is_none() {
            return Err(Error::UnknownType(instance.type_name.clone()));
        }
        let id = BlockId(self.blocks.len());
        self.blocks.push(Some(instance));
        Ok(id)
    }

    pub fn get(&self, id: BlockId, field: &str) -> Option<&Value> {
        self.block(id)?.get(field)
    }

    /// Type-checked field assignment on a block.
    pub fn set(&mut self, id: BlockId, field: &str, value: Value) -> Result<()> {
        let schema = Arc::clone(&self.format.schema);
        let block = self
            .block_mut(id)
            .ok_or_else(|| Error::CorruptBlock(format!("no block {id}")))?;
        block.set(&schema, field, value)
    }

    // ---- load ----

    pub(crate) fn load<R: Read>(data: R, format: Arc<Format>) -> Result<Graph> {
        let mut r = Reader::new(data, format.endian);
        if !r.read_signature(&format.signature)? {
            return Err(Error::UnsupportedVersion(format!(
                "stream does not carry the '{}' signature",
                format.name
            )));
        }

        let mut graph = Graph::new(Arc::clone(&format));

        match format.framing {
            Framing::BlockTable => graph.load_block_table(&mut r)?,
            Framing::FlatRoot => graph.load_flat(&mut r)?,
        }

        let trailing = r.remaining(64)?;
        if trailing > 0 {
            graph.warn(format!("{trailing}+ trailing bytes after the last block"));
        }

        graph.resolve_links()?;
        graph.check_strong_dag()?;
        graph.check_canonical_order();

        tracing::debug!(
            name = %format.name,
            blocks = graph.block_count(),
            warnings = graph.diagnostics.len(),
            "loaded graph"
        );
        Ok(graph)
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.diagnostics.push(Diagnostic::new(message));
    }

    fn load_block_table<R: Read>(&mut self, r: &mut Reader<R>) -> Result<()> {
        let format = Arc::clone(&self.format);

        self.version = r.read_u32()?;
        self.user_version = r.read_u32()?;
        if self.version < format.min_version || self.version > format.max_version {
            return Err(Error::UnsupportedVersion(format!(
                "header version {:#010x} outside '{}' range {:#010x}..={:#010x}",
                self.version, format.name, format.min_version, format.max_version
            )));
        }

        // The header compound is read in the format's default byte order;
        // an endian field inside it switches everything that follows.
        if let Some(header_name) = &format.header_compound {
            let mut diags = std::mem::take(&mut self.diagnostics);
            let mut ctx = ReadCtx {
                schema: &format.schema,
                version: self.version,
                user_version: self.user_version,
                strings: None,
                diags: &mut diags,
            };
            let header = read_instance(r, &mut ctx, header_name)?;
            self.diagnostics = diags;

            if let Some(endian_field) = &format.endian_field {
                match header.get_int(endian_field) {
                    Some(0) => self.endian = crate::codec::Endianness::Big,
                    Some(1) => self.endian = crate::codec::Endianness::Little,
                    Some(other) => {
                        return Err(Error::CorruptBlock(format!(
                            "endian field '{endian_field}' holds {other}"
                        )))
                    }
                    None => {
                        return Err(Error::CorruptBlock(format!(
                            "header lacks the endian field '{endian_field}'"
                        )))
                    }
                }
            }
            self.header = Some(header);
        }
        r.endian = self.endian;

        let num_blocks = r.read_u32()? as usize;
        let num_types = r.read_u16()? as usize;
        let mut type_table = Vec::with_capacity(num_types.min(0x1000));
        for _ in 0..num_types {
            type_table.push(r.read_sized_string()?);
        }
        let mut block_types = Vec::with_capacity(num_blocks.min(0x10000));
        for _ in 0..num_blocks {
            let idx = r.read_u16()? as usize;
            let name = type_table.get(idx).ok_or_else(|| {
                Error::CorruptBlock(format!(
                    "block type index {idx} outside table of {num_types} entries"
                ))
            })?;
            block_types.push(name.clone());
        }
        self.type_table = type_table;

        if format.has_string_table {
            let num_strings = r.read_u32()? as usize;
            let mut strings = Vec::with_capacity(num_strings.min(0x10000));
            for _ in 0..num_strings {
                strings.push(r.read_sized_string()?);
            }
            self.strings = strings;
        }

        let mut diags = std::mem::take(&mut self.diagnostics);
        for type_name in &block_types {
            if format.schema.compound(type_name).is_none() {
                return Err(Error::UnknownType(type_name.clone()));
            }
            let mut ctx = ReadCtx {
                schema: &format.schema,
                version: self.version,
                user_version: self.user_version,
                strings: if format.has_string_table {
                    Some(&self.strings)
                } else {
                    None
                },
                diags: &mut diags,
            };
            let instance = read_instance(r, &mut ctx, type_name)?;
            self.blocks.push(Some(instance));
        }
        self.diagnostics = diags;

        let num_roots = r.read_u32()? as usize;
        for _ in 0..num_roots {
            let idx = r.read_i32()?;
            if idx < 0 || idx as usize >= self.blocks.len() {
                return Err(Error::LinkOutOfRange {
                    index: i64::from(idx),
                    len: self.blocks.len(),
                });
            }
            self.roots.push(BlockId(idx as usize));
        }
        Ok(())
    }

    fn load_flat<R: Read>(&mut self, r: &mut Reader<R>) -> Result<()> {
        let format = Arc::clone(&self.format);
        let root_name = format.header_compound.as_deref().ok_or_else(|| {
            Error::CorruptBlock(format!(
                "format '{}' declares no root compound",
                format.name
            ))
        })?;

        let mut diags = std::mem::take(&mut self.diagnostics);
        let mut ctx = ReadCtx {
            schema: &format.schema,
            version: self.version,
            user_version: self.user_version,
            strings: None,
            diags: &mut diags,
        };
        let root = read_instance(r, &mut ctx, root_name)?;
        self.diagnostics = diags;

        self.blocks.push(Some(root));
        self.roots.push(BlockId(0));
        Ok(())
    }

    /// Second pass over every link, after all blocks are materialized so
    /// forward references are legal: ranges and declared target types.
    fn resolve_links(&self) -> Result<()> {
        let schema = &self.format.schema;
        for (_, instance) in self.blocks() {
            visit_links(schema, instance, &mut |declared, _weak, target| {
                let Some(id) = target else { return Ok(()) };
                let actual = self.block(id).map(|b| b.type_name.as_str()).ok_or(
                    Error::LinkOutOfRange {
                        index: id.0 as i64,
                        len: self.blocks.len(),
                    },
                )?;
                if !schema.is_compatible(declared, actual) {
                    return Err(Error::LinkTypeMismatch {
                        index: id.0 as i64,
                        expected: declared.to_owned(),
                        found: actual.to_owned(),
                    });
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Strong links must form a DAG from each root; weak links exist
    /// precisely so cycles can be expressed without breaking this.
    fn check_strong_dag(&self) -> Result<()> {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color: HashMap<BlockId, u8> = HashMap::new();

        fn visit(
            graph: &Graph,
            id: BlockId,
            color: &mut HashMap<BlockId, u8>,
        ) -> Result<()> {
            match color.get(&id).copied().unwrap_or(WHITE) {
                BLACK => return Ok(()),
                GREY => {
                    return Err(Error::CorruptBlock(format!(
                        "strong link cycle through block {id}"
                    )))
                }
                _ => {}
            }
            color.insert(id, GREY);
            if let Some(instance) = graph.block(id) {
                let mut children = Vec::new();
                collect_links(instance, false, &mut children);
                for child in children {
                    visit(graph, child, color)?;
                }
            }
            color.insert(id, BLACK);
            Ok(())
        }

        for &root in &self.roots {
            visit(self, root, &mut color)?;
        }
        Ok(())
    }

    /// Saving enumerates blocks depth-first, so a file whose on-disk order
    /// differs cannot round-trip byte-exactly. That is worth a warning,
    /// not a failure.
    fn check_canonical_order(&mut self) {
        let order = self.save_order();
        let canonical = order.len() == self.blocks.len()
            && order.iter().enumerate().all(|(i, id)| id.0 == i);
        if !canonical && !self.blocks.is_empty() {
            self.warn("block order is not canonical; re-saving will renumber".into());
        }
    }

    // ---- save ----

    /// Reachable blocks in output order: depth-first from the roots over
    /// strong links, children before siblings, first visit wins.
    pub(crate) fn save_order(&self) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<BlockId> = self.roots.iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(instance) = self.block(id) else { continue };
            order.push(id);
            let mut children = Vec::new();
            collect_links(instance, false, &mut children);
            for child in children.into_iter().rev() {
                if self.block(child).is_some() {
                    stack.push(child);
                }
            }
        }
        order
    }

    pub fn save<W: Write>(&self, out: W) -> Result<()> {
        let format = &self.format;
        let mut w = Writer::new(out, format.endian);
        w.write_bytes(&format.signature)?;

        match format.framing {
            Framing::BlockTable => self.save_block_table(&mut w),
            Framing::FlatRoot => self.save_flat(&mut w),
        }
    }

    pub fn save_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.save(&mut out)?;
        Ok(out)
    }

    fn save_block_table<W: Write>(&self, w: &mut Writer<W>) -> Result<()> {
        let format = &self.format;

        w.write_u32(self.version)?;
        w.write_u32(self.user_version)?;

        if let Some(header) = &self.header {
            let mut ctx = WriteCtx {
                schema: &format.schema,
                version: self.version,
                user_version: self.user_version,
                strings: None,
                renumber: None,
            };
            write_instance(w, &mut ctx, header)?;
        }
        w.endian = self.endian;

        let order = self.save_order();
        let dropped = self.block_count() - order.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropping blocks unreachable from any root");
        }
        let renumber: HashMap<BlockId, i32> = order
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i as i32))
            .collect();

        // Keep the loaded type table and append anything new; indices into
        // it stay valid and unedited graphs reproduce their input bytes.
        let mut type_table = self.type_table.clone();
        let mut block_types = Vec::with_capacity(order.len());
        for &id in &order {
            let name = self.block(id).map(|b| b.type_name.clone()).unwrap_or_default();
            let idx = match type_table.iter().position(|n| *n == name) {
                Some(idx) => idx,
                None => {
                    type_table.push(name.clone());
                    type_table.len() - 1
                }
            };
            block_types.push(u16::try_from(idx).map_err(|_| {
                Error::CorruptBlock(format!("{} block types overflow the table", type_table.len()))
            })?);
        }

        w.write_u32(u32::try_from(order.len()).map_err(|_| {
            Error::CorruptBlock(format!("{} blocks overflow the header", order.len()))
        })?)?;
        w.write_u16(type_table.len() as u16)?;
        for name in &type_table {
            w.write_sized_string(name)?;
        }
        for idx in &block_types {
            w.write_u16(*idx)?;
        }

        if format.has_string_table {
            // Strings must hit the disk before the blocks that index them,
            // so the pool is collected up front in block order.
            let mut table = StringTable::from_entries(self.strings.clone());
            for &id in &order {
                if let Some(instance) = self.block(id) {
                    collect_strings(instance, &mut table);
                }
            }
            w.write_u32(table.entries().len() as u32)?;
            for s in table.entries() {
                w.write_sized_string(s)?;
            }

            let mut ctx = WriteCtx {
                schema: &format.schema,
                version: self.version,
                user_version: self.user_version,
                strings: Some(&mut table),
                renumber: Some(&renumber),
            };
            for &id in &order {
                if let Some(instance) = self.block(id) {
                    write_instance(w, &mut ctx, instance)?;
                }
            }
        } else {
            let mut ctx = WriteCtx {
                schema: &format.schema,
                version: self.version,
                user_version: self.user_version,
                strings: None,
                renumber: Some(&renumber),
            };
            for &id in &order {
                if let Some(instance) = self.block(id) {
                    write_instance(w, &mut ctx, instance)?;
                }
            }
        }

        w.write_u32(self.roots.len() as u32)?;
        for root in &self.roots {
            let idx = renumber.get(root).copied().unwrap_or(-1);
            w.write_i32(idx)?;
        }
        Ok(())
    }

    fn save_flat<W: Write>(&self, w: &mut Writer<W>) -> Result<()> {
        if self.roots.len() != 1 {
            return Err(Error::CorruptBlock(format!(
                "flat format requires exactly one root block, found {}",
                self.roots.len()
            )));
        }
        let root = self
            .block(self.roots[0])
            .ok_or_else(|| Error::CorruptBlock("root block was removed".into()))?;

        let mut ctx = WriteCtx {
            schema: &self.format.schema,
            version: self.version,
            user_version: self.user_version,
            strings: None,
            renumber: None,
        };
        write_instance(w, &mut ctx, root)
    }
}

/// Calls `f` for every link in the value tree, with the declared target
/// type of the field holding it. Field order is declaration order.
pub(crate) fn visit_links(
    schema: &Schema,
    instance: &Instance,
    f: &mut impl FnMut(&str, bool, Option<BlockId>) -> Result<()>,
) -> Result<()> {
    let Some(compound) = schema.compound(&instance.type_name) else {
        return Ok(());
    };
    for field in &compound.fields {
        if let Some(Slot::Present(value)) = instance.slot(&field.name) {
            let declared = match &field.ty {
                crate::schema::FieldTy::Ref { target } | crate::schema::FieldTy::Ptr { target } => {
                    Some(target.as_str())
                }
                _ => None,
            };
            visit_value_links(schema, declared, value, f)?;
        }
    }
    Ok(())
}

fn visit_value_links(
    schema: &Schema,
    declared: Option<&str>,
    value: &Value,
    f: &mut impl FnMut(&str, bool, Option<BlockId>) -> Result<()>,
) -> Result<()> {
    match value {
        Value::Link { target, weak } => {
            if let Some(declared) = declared {
                f(declared, *weak, *target)?;
            }
        }
        Value::Struct(inner) => visit_links(schema, inner, f)?,
        Value::Array(items) => {
            for item in items {
                visit_value_links(schema, declared, item, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Link targets in field declaration order, straight off the values (link
/// strength is stored with them). Used by traversal and the save order.
pub(crate) fn collect_links(instance: &Instance, include_weak: bool, out: &mut Vec<BlockId>) {
    for (_, slot) in instance.slots() {
        if let Slot::Present(value) = slot {
            collect_value_links(value, include_weak, out);
        }
    }
}

fn collect_value_links(value: &Value, include_weak: bool, out: &mut Vec<BlockId>) {
    match value {
        Value::Link {
            target: Some(id),
            weak,
        } if include_weak || !weak => out.push(*id),
        Value::Struct(inner) => collect_links(inner, include_weak, out),
        Value::Array(items) => {
            for item in items {
                collect_value_links(item, include_weak, out);
            }
        }
        _ => {}
    }
}

fn collect_strings(instance: &Instance, table: &mut StringTable) {
    for (_, slot) in instance.slots() {
        if let Slot::Present(value) = slot {
            collect_value_strings(value, table);
        }
    }
}

fn collect_value_strings(value: &Value, table: &mut StringTable) {
    match value {
        Value::Str(s) if !s.is_empty() => {
            table.intern(s);
        }
        Value::Struct(inner) => collect_strings(inner, table),
        Value::Array(items) => {
            for item in items {
                collect_value_strings(item, table);
            }
        }
        _ => {}
    }
}
