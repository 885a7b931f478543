//! The (de)serialization driver. One walker reads or writes a compound in
//! declared field order, consulting the schema for types, the expression
//! evaluator for gates and lengths, and the codec for bytes. The stream is
//! consumed strictly forward; a field is either fully read or the whole
//! load fails.

use crate::codec::{Reader, Writer};
use crate::error::{Diagnostic, Error, Result};
use crate::graph::BlockId;
use crate::schema::expr::{Expr, ExprValue, Scope};
use crate::schema::{BasicKind, BasicType, BitfieldDef, Compound, EnumDef, Field, FieldTy, Schema};
use crate::value::{Instance, Slot, Value};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Template parameter bindings of the compound currently being walked:
/// parameter name to concrete type name.
pub type Bindings = HashMap<String, String>;

/// Shared state of one load.
pub struct ReadCtx<'a> {
    pub schema: &'a Schema,
    pub version: u32,
    pub user_version: u32,
    /// String table read by the framing layer; when present, string fields
    /// are indices into it.
    pub strings: Option<&'a [String]>,
    pub diags: &'a mut Vec<Diagnostic>,
}

impl ReadCtx<'_> {
    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.diags.push(Diagnostic::new(message));
    }
}

/// An interning string table built during a save.
#[derive(Debug, Default)]
pub struct StringTable {
    entries: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringTable {
    /// Rebuilds the table loaded from a file; duplicate entries keep their
    /// first index so re-saving reproduces the original bytes.
    pub fn from_entries(entries: Vec<String>) -> Self {
        let mut index = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            index.entry(entry.clone()).or_insert(i as u32);
        }
        StringTable { entries, index }
    }

    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.entries.len() as u32;
        self.entries.push(s.to_owned());
        self.index.insert(s.to_owned(), i);
        i
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Shared state of one save.
pub struct WriteCtx<'a> {
    pub schema: &'a Schema,
    pub version: u32,
    pub user_version: u32,
    pub strings: Option<&'a mut StringTable>,
    /// Block id to on-disk index, produced by the renumbering pass. Links
    /// to blocks missing from the map are dangling and write as null.
    pub renumber: Option<&'a HashMap<BlockId, i32>>,
}

/// Expression scope over a partially read (or fully built) instance.
struct InstanceScope<'a> {
    instance: &'a Instance,
    version: u32,
    user_version: u32,
    arg: Option<i64>,
}

impl Scope for InstanceScope<'_> {
    fn field(&self, name: &str) -> Option<ExprValue> {
        self.instance.get(name)?.as_expr_value()
    }
    fn version(&self) -> u32 {
        self.version
    }
    fn user_version(&self) -> u32 {
        self.user_version
    }
    fn arg(&self) -> Option<i64> {
        self.arg
    }
}

/// Scope for the inner length of a 2-D array: field references that name
/// an array read the element belonging to the current row.
struct RowScope<'a> {
    outer: &'a InstanceScope<'a>,
    row: usize,
}

impl Scope for RowScope<'_> {
    fn field(&self, name: &str) -> Option<ExprValue> {
        match self.outer.instance.get(name)? {
            Value::Array(items) => items.get(self.row)?.as_expr_value(),
            other => other.as_expr_value(),
        }
    }
    fn version(&self) -> u32 {
        self.outer.version
    }
    fn user_version(&self) -> u32 {
        self.outer.user_version
    }
    fn arg(&self) -> Option<i64> {
        self.outer.arg
    }
}

/// A field's declared type resolved against the schema and the current
/// template bindings.
enum TyView<'a> {
    Basic(&'a BasicType),
    Enum(&'a EnumDef),
    Bitfield(&'a BitfieldDef),
    Compound(&'a Compound),
    Str,
    Link { target: &'a str, weak: bool },
}

fn resolve_ty<'a>(
    schema: &'a Schema,
    ty: &'a FieldTy,
    bindings: &Bindings,
) -> Result<TyView<'a>> {
    let by_name = |name: &str| -> Result<TyView<'a>> {
        if name == "string" {
            return Ok(TyView::Str);
        }
        if let Some(basic) = schema.basic(name) {
            Ok(TyView::Basic(basic))
        } else if let Some(def) = schema.enum_def(name) {
            Ok(TyView::Enum(def))
        } else if let Some(def) = schema.bitfield(name) {
            Ok(TyView::Bitfield(def))
        } else if let Some(compound) = schema.compound(name) {
            Ok(TyView::Compound(compound))
        } else {
            Err(Error::UnknownType(name.to_owned()))
        }
    };

    match ty {
        FieldTy::Basic(name) | FieldTy::Enum(name) | FieldTy::Bitfield(name) => by_name(name),
        FieldTy::Compound(name) => by_name(name),
        FieldTy::Param(param) => {
            let name = bindings
                .get(param)
                .ok_or_else(|| Error::UnknownType(param.clone()))?;
            by_name(name)
        }
        FieldTy::Ref { target } => Ok(TyView::Link {
            target,
            weak: false,
        }),
        FieldTy::Ptr { target } => Ok(TyView::Link {
            target,
            weak: true,
        }),
        FieldTy::Str => Ok(TyView::Str),
    }
}

/// Binds a field's template arguments to the target compound's parameters.
/// Arguments that are themselves parameters of the enclosing compound are
/// resolved through the current bindings first.
fn bind_templates(
    target: &Compound,
    template: &[String],
    bindings: &Bindings,
) -> Result<Bindings> {
    let mut bound = Bindings::new();
    for (param, arg) in target.params.iter().zip(template) {
        let concrete = bindings.get(arg).cloned().unwrap_or_else(|| arg.clone());
        bound.insert(param.clone(), concrete);
    }
    Ok(bound)
}

fn eval_arg(expr: &Expr, scope: &dyn Scope) -> Result<i64> {
    Ok(match expr.eval(scope)? {
        ExprValue::Int(i) => i,
        ExprValue::Bool(b) => i64::from(b),
    })
}

/// Reads one instance of `type_name` from the stream.
pub fn read_instance<R: Read>(
    r: &mut Reader<R>,
    ctx: &mut ReadCtx<'_>,
    type_name: &str,
) -> Result<Instance> {
    read_compound(r, ctx, type_name, &Bindings::new(), None)
}

fn read_compound<R: Read>(
    r: &mut Reader<R>,
    ctx: &mut ReadCtx<'_>,
    type_name: &str,
    bindings: &Bindings,
    arg: Option<i64>,
) -> Result<Instance> {
    let compound = ctx
        .schema
        .compound(type_name)
        .ok_or_else(|| Error::UnknownType(type_name.to_owned()))?;

    let mut instance = Instance::empty(type_name);

    for field in &compound.fields {
        // The scope is extended after each field, so this field's gates see
        // every value read so far and nothing later.
        let (included, field_arg, lengths) = {
            let scope = InstanceScope {
                instance: &instance,
                version: ctx.version,
                user_version: ctx.user_version,
                arg,
            };
            if !field.in_version(ctx.version, ctx.user_version)
                || !eval_cond(field, &scope)?
            {
                (false, None, None)
            } else {
                let field_arg = match &field.arg {
                    Some(expr) => Some(eval_arg(expr, &scope)?),
                    None => None,
                };
                let lengths = eval_lengths(field, &scope)?;
                (true, field_arg, Some(lengths))
            }
        };

        if !included {
            instance.set_raw(&field.name, Slot::Absent);
            continue;
        }

        let ty = resolve_ty(ctx.schema, &field.ty, bindings)?;
        let value = match lengths.unwrap_or(Lengths::Scalar) {
            Lengths::Scalar => read_one(r, ctx, &ty, field, bindings, field_arg)?,
            Lengths::Array(len) => {
                let mut items = Vec::with_capacity(len.min(0x10000));
                for _ in 0..len {
                    items.push(read_one(r, ctx, &ty, field, bindings, field_arg)?);
                }
                Value::Array(items)
            }
            Lengths::Matrix(rows) => {
                let mut outer = Vec::with_capacity(rows.len());
                for row_len in rows {
                    let mut row = Vec::with_capacity(row_len.min(0x10000));
                    for _ in 0..row_len {
                        row.push(read_one(r, ctx, &ty, field, bindings, field_arg)?);
                    }
                    outer.push(Value::Array(row));
                }
                Value::Array(outer)
            }
        };

        instance.set_raw(&field.name, Slot::Present(value));
    }

    Ok(instance)
}

enum Lengths {
    Scalar,
    Array(usize),
    /// One inner length per row, already evaluated.
    Matrix(Vec<usize>),
}

fn eval_cond(field: &Field, scope: &dyn Scope) -> Result<bool> {
    match &field.cond {
        Some(cond) => Ok(cond.eval_pred(scope)?),
        None => Ok(true),
    }
}

fn eval_lengths(field: &Field, scope: &InstanceScope<'_>) -> Result<Lengths> {
    match (&field.length, &field.width) {
        (None, _) => Ok(Lengths::Scalar),
        (Some(length), None) => Ok(Lengths::Array(length.eval_len(scope)?)),
        (Some(length), Some(width)) => {
            let rows = length.eval_len(scope)?;
            let mut inner = Vec::with_capacity(rows.min(0x10000));
            for row in 0..rows {
                let row_scope = RowScope { outer: scope, row };
                inner.push(width.eval_len(&row_scope)?);
            }
            Ok(Lengths::Matrix(inner))
        }
    }
}

fn read_one<R: Read>(
    r: &mut Reader<R>,
    ctx: &mut ReadCtx<'_>,
    ty: &TyView<'_>,
    field: &Field,
    bindings: &Bindings,
    arg: Option<i64>,
) -> Result<Value> {
    match ty {
        TyView::Basic(basic) => read_basic(r, basic, ctx),
        TyView::Enum(def) => {
            let size = ctx.schema.basic(&def.storage).map_or(4, |b| b.size);
            let raw = read_uint(r, size)?;
            if !def.covers(raw) {
                ctx.warn(format!(
                    "value {raw} is not declared by enum '{}'",
                    def.name
                ));
            }
            Ok(Value::Enum {
                decl: def.name.clone(),
                raw,
            })
        }
        TyView::Bitfield(def) => {
            let size = ctx.schema.basic(&def.storage).map_or(4, |b| b.size);
            let raw = read_uint(r, size)?;
            Ok(Value::Bits {
                decl: def.name.clone(),
                raw,
            })
        }
        TyView::Compound(target) => {
            let bound = bind_templates(target, &field.template, bindings)?;
            Ok(Value::Struct(read_compound(
                r,
                ctx,
                &target.name,
                &bound,
                arg,
            )?))
        }
        TyView::Str => {
            if let Some(pool) = ctx.strings {
                // Pool index; -1 is the null string.
                let idx = r.read_i32()?;
                if idx < 0 {
                    return Ok(Value::Str(String::new()));
                }
                let s = pool.get(idx as usize).ok_or_else(|| {
                    Error::CorruptBlock(format!(
                        "string index {idx} outside table of {} entries",
                        pool.len()
                    ))
                })?;
                Ok(Value::Str(s.clone()))
            } else {
                Ok(Value::Str(r.read_sized_string()?))
            }
        }
        TyView::Link { weak, .. } => {
            let idx = r.read_i32()?;
            let target = if idx == -1 {
                None
            } else {
                // Range and type verification happen in the resolution pass
                // once every block is materialized.
                Some(BlockId(idx as u32 as usize))
            };
            Ok(Value::Link {
                target,
                weak: *weak,
            })
        }
    }
}

fn read_basic<R: Read>(r: &mut Reader<R>, basic: &BasicType, ctx: &mut ReadCtx<'_>) -> Result<Value> {
    Ok(match (basic.kind, basic.size) {
        (BasicKind::Uint | BasicKind::Char, 1) => Value::U8(r.read_u8()?),
        (BasicKind::Uint, 2) => Value::U16(r.read_u16()?),
        (BasicKind::Uint, 4) => Value::U32(r.read_u32()?),
        (BasicKind::Uint, 8) => Value::U64(r.read_u64()?),
        (BasicKind::Int, 1) => Value::I8(r.read_i8()?),
        (BasicKind::Int, 2) => Value::I16(r.read_i16()?),
        (BasicKind::Int, 4) => Value::I32(r.read_i32()?),
        (BasicKind::Int, 8) => Value::I64(r.read_i64()?),
        (BasicKind::Float, 4) => Value::F32(r.read_f32()?),
        (BasicKind::Float, 8) => Value::F64(r.read_f64()?),
        (BasicKind::Bool, size) => {
            let raw = read_uint(r, size)?;
            if raw > 1 {
                ctx.warn(format!(
                    "non-canonical bool {raw} in '{}' will re-save as 1",
                    basic.name
                ));
            }
            Value::Bool(raw != 0)
        }
        // The loader rejects any other combination.
        (kind, size) => {
            return Err(Error::CorruptBlock(format!(
                "basic '{}' has unreadable shape {kind:?}/{size}",
                basic.name
            )))
        }
    })
}

fn read_uint<R: Read>(r: &mut Reader<R>, size: usize) -> Result<u64> {
    Ok(match size {
        1 => u64::from(r.read_u8()?),
        2 => u64::from(r.read_u16()?),
        8 => r.read_u64()?,
        _ => u64::from(r.read_u32()?),
    })
}

fn write_uint<W: Write>(w: &mut Writer<W>, size: usize, raw: u64) -> Result<()> {
    match size {
        1 => w.write_u8(raw as u8),
        2 => w.write_u16(raw as u16),
        8 => w.write_u64(raw),
        _ => w.write_u32(raw as u32),
    }
}

/// Writes one instance. The mirror image of `read_instance`: gates and
/// lengths are evaluated against the instance's own field values, so a
/// well-formed instance re-emits exactly the bytes it was read from.
pub fn write_instance<W: Write>(
    w: &mut Writer<W>,
    ctx: &mut WriteCtx<'_>,
    instance: &Instance,
) -> Result<()> {
    let type_name = instance.type_name.clone();
    write_compound(w, ctx, instance, &type_name, &Bindings::new(), None)
}

fn write_compound<W: Write>(
    w: &mut Writer<W>,
    ctx: &mut WriteCtx<'_>,
    instance: &Instance,
    type_name: &str,
    bindings: &Bindings,
    arg: Option<i64>,
) -> Result<()> {
    let compound = ctx
        .schema
        .compound(type_name)
        .ok_or_else(|| Error::UnknownType(type_name.to_owned()))?;

    for field in &compound.fields {
        let scope = InstanceScope {
            instance,
            version: ctx.version,
            user_version: ctx.user_version,
            arg,
        };

        if !field.in_version(ctx.version, ctx.user_version) || !eval_cond(field, &scope)? {
            // Conditioned out: no bytes, whatever the slot holds.
            continue;
        }

        let value = match instance.slot(&field.name) {
            Some(Slot::Present(value)) => value,
            _ => {
                return Err(Error::TypeError {
                    field: field.name.clone(),
                    expected: field.ty.describe(),
                    found: "absent".into(),
                })
            }
        };

        let field_arg = match &field.arg {
            Some(expr) => Some(eval_arg(expr, &scope)?),
            None => None,
        };

        let ty = resolve_ty(ctx.schema, &field.ty, bindings)?;

        match (&field.length, &field.width) {
            (None, _) => write_one(w, ctx, &ty, field, bindings, field_arg, value)?,
            (Some(length), None) => {
                let declared = length.eval_len(&scope)?;
                let items = expect_array(field, value)?;
                check_len(field, declared, items.len())?;
                for item in items {
                    write_one(w, ctx, &ty, field, bindings, field_arg, item)?;
                }
            }
            (Some(length), Some(width)) => {
                let declared = length.eval_len(&scope)?;
                let rows = expect_array(field, value)?;
                check_len(field, declared, rows.len())?;
                for (i, row) in rows.iter().enumerate() {
                    let row_scope = RowScope {
                        outer: &scope,
                        row: i,
                    };
                    let declared = width.eval_len(&row_scope)?;
                    let items = expect_array(field, row)?;
                    check_len(field, declared, items.len())?;
                    for item in items {
                        write_one(w, ctx, &ty, field, bindings, field_arg, item)?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn expect_array<'v>(field: &Field, value: &'v Value) -> Result<&'v [Value]> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::TypeError {
            field: field.name.clone(),
            expected: "array".into(),
            found: other.kind_name().into(),
        }),
    }
}

fn check_len(field: &Field, declared: usize, actual: usize) -> Result<()> {
    if declared != actual {
        return Err(Error::CorruptBlock(format!(
            "field '{}': length expression gives {declared} but the array holds {actual}",
            field.name
        )));
    }
    Ok(())
}

fn write_one<W: Write>(
    w: &mut Writer<W>,
    ctx: &mut WriteCtx<'_>,
    ty: &TyView<'_>,
    field: &Field,
    bindings: &Bindings,
    arg: Option<i64>,
    value: &Value,
) -> Result<()> {
    let mismatch = |expected: &str| Error::TypeError {
        field: field.name.clone(),
        expected: expected.into(),
        found: value.kind_name().into(),
    };

    match ty {
        TyView::Basic(basic) => write_basic(w, basic, field, value),
        TyView::Enum(def) => {
            let raw = match value {
                Value::Enum { raw, .. } => *raw,
                _ => return Err(mismatch(&def.name)),
            };
            let size = ctx.schema.basic(&def.storage).map_or(4, |b| b.size);
            write_uint(w, size, raw)
        }
        TyView::Bitfield(def) => {
            let raw = match value {
                Value::Bits { raw, .. } => *raw,
                _ => return Err(mismatch(&def.name)),
            };
            let size = ctx.schema.basic(&def.storage).map_or(4, |b| b.size);
            write_uint(w, size, raw)
        }
        TyView::Compound(target) => {
            let inst = match value {
                Value::Struct(inst) => inst,
                _ => return Err(mismatch(&target.name)),
            };
            let bound = bind_templates(target, &field.template, bindings)?;
            write_compound(w, ctx, inst, &target.name, &bound, arg)
        }
        TyView::Str => {
            let s = match value {
                Value::Str(s) => s,
                _ => return Err(mismatch("string")),
            };
            if let Some(strings) = ctx.strings.as_deref_mut() {
                if s.is_empty() {
                    w.write_i32(-1)
                } else {
                    let idx = strings.intern(s);
                    w.write_i32(idx as i32)
                }
            } else {
                w.write_sized_string(s)
            }
        }
        TyView::Link { .. } => {
            let target = match value {
                Value::Link { target, .. } => target,
                _ => return Err(mismatch("link")),
            };
            let idx = match (target, ctx.renumber) {
                (None, _) => -1,
                // Dangling after a removal: nulls out on the next save.
                (Some(id), Some(map)) => map.get(id).copied().unwrap_or(-1),
                (Some(id), None) => id.0 as i32,
            };
            w.write_i32(idx)
        }
    }
}

fn write_basic<W: Write>(
    w: &mut Writer<W>,
    basic: &BasicType,
    field: &Field,
    value: &Value,
) -> Result<()> {
    match (basic.kind, basic.size, value) {
        (BasicKind::Uint | BasicKind::Char, 1, Value::U8(v)) => w.write_u8(*v),
        (BasicKind::Uint, 2, Value::U16(v)) => w.write_u16(*v),
        (BasicKind::Uint, 4, Value::U32(v)) => w.write_u32(*v),
        (BasicKind::Uint, 8, Value::U64(v)) => w.write_u64(*v),
        (BasicKind::Int, 1, Value::I8(v)) => w.write_i8(*v),
        (BasicKind::Int, 2, Value::I16(v)) => w.write_i16(*v),
        (BasicKind::Int, 4, Value::I32(v)) => w.write_i32(*v),
        (BasicKind::Int, 8, Value::I64(v)) => w.write_i64(*v),
        (BasicKind::Float, 4, Value::F32(v)) => w.write_f32(*v),
        (BasicKind::Float, 8, Value::F64(v)) => w.write_f64(*v),
        (BasicKind::Bool, size, Value::Bool(v)) => write_uint(w, size, u64::from(*v)),
        _ => Err(Error::TypeError {
            field: field.name.clone(),
            expected: basic.name.clone(),
            found: value.kind_name().into(),
        }),
    }
}
