//! Typed walks and structural edits over a loaded graph.
//!
//! Traversal is lazy and visit-once, backed by an identity set of block
//! ids. Walks borrow the graph, so the borrow checker rules out mutation
//! while one is outstanding.

use crate::error::{Error, Result};
use crate::graph::{collect_links, visit_links, BlockId, Graph};
use crate::schema::expr::Expr;
use crate::schema::FieldTy;
use crate::value::{Instance, Slot, Value};
use std::collections::HashSet;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Order {
    Pre,
    Post,
}

enum Frame {
    Enter(BlockId),
    Exit(BlockId),
}

/// Lazy depth-first iterator over the blocks reachable from the roots.
pub struct Walk<'a> {
    graph: &'a Graph,
    stack: Vec<Frame>,
    visited: HashSet<BlockId>,
    visit_weak: bool,
    order: Order,
}

pub fn walk(graph: &Graph, order: Order, visit_weak: bool) -> Walk<'_> {
    Walk {
        graph,
        stack: graph.roots().iter().rev().map(|&id| Frame::Enter(id)).collect(),
        visited: HashSet::new(),
        visit_weak,
        order,
    }
}

impl Iterator for Walk<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    if !self.visited.insert(id) {
                        continue;
                    }
                    let Some(instance) = self.graph.block(id) else {
                        continue;
                    };
                    let mut children = Vec::new();
                    collect_links(instance, self.visit_weak, &mut children);

                    if self.order == Order::Post {
                        self.stack.push(Frame::Exit(id));
                    }
                    for child in children.into_iter().rev() {
                        self.stack.push(Frame::Enter(child));
                    }
                    if self.order == Order::Pre {
                        return Some(id);
                    }
                }
                Frame::Exit(id) => return Some(id),
            }
        }
        None
    }
}

/// Blocks whose type name satisfies `pred`, in pre-order. Weak edges are
/// followed so back-referenced blocks are found too.
pub fn find<'a, P>(graph: &'a Graph, pred: P) -> impl Iterator<Item = BlockId> + 'a
where
    P: Fn(&str) -> bool + 'a,
{
    walk(graph, Order::Pre, true)
        .filter(move |&id| graph.type_name(id).is_some_and(|name| pred(name)))
}

/// Rewrites every link referencing `old` to reference `new`, preserving
/// link strength. Fails without touching the graph if any such link
/// declares a target type `new` does not satisfy.
pub fn replace(graph: &mut Graph, old: BlockId, new: BlockId) -> Result<()> {
    let new_type = graph
        .type_name(new)
        .ok_or_else(|| Error::CorruptBlock(format!("no block {new}")))?
        .to_owned();

    let schema = graph.schema();
    for (_, instance) in graph.blocks() {
        visit_links(schema, instance, &mut |declared, _weak, target| {
            if target == Some(old) && !schema.is_compatible(declared, &new_type) {
                return Err(Error::LinkTypeMismatch {
                    index: old.0 as i64,
                    expected: declared.to_owned(),
                    found: new_type.clone(),
                });
            }
            Ok(())
        })?;
    }

    for slot in graph.blocks.iter_mut().flatten() {
        retarget_instance(slot, old, Some(new), None);
    }
    Ok(())
}

/// Creates `new_parent` as a block, moves every strong link that pointed
/// at `child` onto it, and strong-links it to `child`. The child keeps its
/// weak in-links and its root status.
pub fn insert_parent(graph: &mut Graph, child: BlockId, new_parent: Instance) -> Result<BlockId> {
    let child_type = graph
        .type_name(child)
        .ok_or_else(|| Error::CorruptBlock(format!("no block {child}")))?
        .to_owned();
    let parent_type = new_parent.type_name.clone();

    // Every strong in-link of the child must accept the parent's type.
    let schema = graph.schema();
    for (_, instance) in graph.blocks() {
        visit_links(schema, instance, &mut |declared, weak, target| {
            if !weak && target == Some(child) && !schema.is_compatible(declared, &parent_type) {
                return Err(Error::LinkTypeMismatch {
                    index: child.0 as i64,
                    expected: declared.to_owned(),
                    found: parent_type.clone(),
                });
            }
            Ok(())
        })?;
    }

    let parent_id = graph.add_block(new_parent)?;

    for (i, slot) in graph.blocks.iter_mut().enumerate() {
        if i == parent_id.0 {
            continue;
        }
        if let Some(instance) = slot {
            retarget_instance(instance, child, Some(parent_id), Some(false));
        }
    }

    attach_child(graph, parent_id, child, &child_type)?;
    Ok(parent_id)
}

/// Points the first suitable strong link field of `parent` at `child`:
/// a null scalar ref, or a ref array (bumping its plain-field length).
fn attach_child(
    graph: &mut Graph,
    parent_id: BlockId,
    child: BlockId,
    child_type: &str,
) -> Result<()> {
    let schema = std::sync::Arc::clone(&graph.format.schema);
    let parent = graph
        .block_mut(parent_id)
        .ok_or_else(|| Error::CorruptBlock(format!("no block {parent_id}")))?;
    let compound = schema
        .compound(&parent.type_name)
        .ok_or_else(|| Error::UnknownType(parent.type_name.clone()))?;

    for field in &compound.fields {
        let FieldTy::Ref { target } = &field.ty else {
            continue;
        };
        if !schema.is_compatible(target, child_type) {
            continue;
        }

        if field.length.is_none() {
            if parent.get_link(&field.name) == Some(None) {
                parent.set_raw(
                    &field.name,
                    Slot::Present(Value::Link {
                        target: Some(child),
                        weak: false,
                    }),
                );
                return Ok(());
            }
            continue;
        }

        // Array of refs: append, and keep the length field in sync when
        // the length expression is a plain field reference.
        let Some(Expr::Field(len_field)) = field.length.clone() else {
            continue;
        };
        let mut items = match parent.get(&field.name) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        items.push(Value::Link {
            target: Some(child),
            weak: false,
        });
        let new_len = items.len() as i64;
        parent.set_raw(&field.name, Slot::Present(Value::Array(items)));
        set_int_field(parent, &len_field, new_len);
        return Ok(());
    }

    Err(Error::CorruptBlock(format!(
        "'{}' has no free strong link field compatible with '{child_type}'",
        compound.name
    )))
}

fn set_int_field(instance: &mut Instance, name: &str, value: i64) {
    let updated = match instance.get(name) {
        Some(Value::U8(_)) => Value::U8(value as u8),
        Some(Value::U16(_)) => Value::U16(value as u16),
        Some(Value::U64(_)) => Value::U64(value as u64),
        Some(Value::I32(_)) => Value::I32(value as i32),
        Some(Value::I64(_)) => Value::I64(value),
        _ => Value::U32(value as u32),
    };
    instance.set_raw(name, Slot::Present(updated));
}

/// Nulls every link to `block` and tombstones it. With `cascade`, blocks
/// that become strong-unreachable from the roots go with it; weak links
/// left dangling null out on the next save regardless.
pub fn remove(graph: &mut Graph, block: BlockId, cascade: bool) -> Result<()> {
    if graph.block(block).is_none() {
        return Err(Error::CorruptBlock(format!("no block {block}")));
    }

    graph.roots.retain(|&id| id != block);
    graph.blocks[block.0] = None;

    let mut gone: HashSet<BlockId> = HashSet::new();
    gone.insert(block);

    if cascade {
        let mut reachable = HashSet::new();
        let mut stack: Vec<BlockId> = graph.roots.clone();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(instance) = graph.block(id) {
                let mut children = Vec::new();
                collect_links(instance, false, &mut children);
                stack.extend(children.into_iter().filter(|c| graph.block(*c).is_some()));
            }
        }
        for (id, _) in graph.blocks().collect::<Vec<_>>() {
            if !reachable.contains(&id) {
                gone.insert(id);
            }
        }
        for id in &gone {
            graph.blocks[id.0] = None;
        }
    }

    for slot in graph.blocks.iter_mut().flatten() {
        for id in &gone {
            retarget_instance(slot, *id, None, None);
        }
    }
    Ok(())
}

/// Rewrites links targeting `old` to `new` (or null). `strength` limits
/// the rewrite to links of that weakness when given.
fn retarget_instance(
    instance: &mut Instance,
    old: BlockId,
    new: Option<BlockId>,
    strength: Option<bool>,
) {
    for slot in instance.values_mut() {
        if let Slot::Present(value) = slot {
            retarget_value(value, old, new, strength);
        }
    }
}

fn retarget_value(value: &mut Value, old: BlockId, new: Option<BlockId>, strength: Option<bool>) {
    match value {
        Value::Link { target, weak } => {
            if *target == Some(old) && strength.map_or(true, |s| s == *weak) {
                *target = new;
            }
        }
        Value::Struct(inner) => retarget_instance(inner, old, new, strength),
        Value::Array(items) => {
            for item in items {
                retarget_value(item, old, new, strength);
            }
        }
        _ => {}
    }
}
