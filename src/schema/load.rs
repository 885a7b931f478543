//! Builds a `Schema` from its parsed description: collects every declared
//! type, resolves names to fixed point, flattens inheritance and compiles
//! the condition and length expressions.

use super::doc::{parse_document, Node};
use super::expr::Expr;
use super::{
    BasicKind, BasicType, BitMember, BitfieldDef, Compound, EnumDef, Field, FieldTy, Schema,
};
use crate::error::{Error, Result, SchemaErrorKind};
use linked_hash_map::LinkedHashMap;
use std::collections::HashSet;

/// Packs a dotted version literal `a.b.c.d` into `(a<<24)|(b<<16)|(c<<8)|d`.
/// Shorter dotted forms pack from the top byte down; bare decimal or `0x`
/// literals are taken verbatim.
pub fn parse_version(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).ok();
    }
    if !s.contains('.') {
        return s.parse().ok();
    }
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }
    let mut packed: u32 = 0;
    for (i, part) in parts.iter().enumerate() {
        let byte: u8 = part.parse().ok()?;
        packed |= u32::from(byte) << (24 - 8 * i);
    }
    Some(packed)
}

fn schema_err(kind: SchemaErrorKind, position: impl Into<String>) -> Error {
    Error::Schema {
        kind,
        position: position.into(),
    }
}

fn req_attr<'a>(node: &'a Node, name: &str, position: &str) -> Result<&'a str> {
    node.attr(name)
        .ok_or_else(|| schema_err(SchemaErrorKind::MissingAttribute(name.into()), position))
}

fn parse_version_attr(node: &Node, name: &str, position: &str) -> Result<Option<u32>> {
    match node.attr(name) {
        None => Ok(None),
        Some(raw) => parse_version(raw).map(Some).ok_or_else(|| {
            schema_err(
                SchemaErrorKind::BadAttribute {
                    name: name.into(),
                    detail: format!("'{raw}' is not a version literal"),
                },
                position,
            )
        }),
    }
}

fn parse_expr_attr(node: &Node, name: &str, position: &str) -> Result<Option<Expr>> {
    match node.attr(name) {
        None => Ok(None),
        Some(raw) => Expr::parse(raw).map(Some).map_err(|detail| {
            schema_err(SchemaErrorKind::BadExpression(detail), position)
        }),
    }
}

/// A compound before inheritance flattening.
struct RawCompound {
    name: String,
    parent: Option<String>,
    generic: bool,
    params: Vec<String>,
    fields: Vec<Field>,
}

pub(super) fn load(description: &str) -> Result<Schema> {
    let root = parse_document(description)?;
    if root.name != "schema" {
        return Err(schema_err(
            SchemaErrorKind::UnknownElement(root.name.clone()),
            "document root",
        ));
    }

    let mut schema = Schema::default();
    let mut raw_compounds: LinkedHashMap<String, RawCompound> = LinkedHashMap::new();

    // First pass: collect every declaration. Names are not resolved yet so
    // that forward and mutual references work.
    for child in &root.children {
        match child.name.as_str() {
            "basic" => {
                let basic = load_basic(child)?;
                check_fresh(&schema, &raw_compounds, &basic.name)?;
                schema.basics.insert(basic.name.clone(), basic);
            }
            "enum" => {
                let def = load_enum(child)?;
                check_fresh(&schema, &raw_compounds, &def.name)?;
                schema.enums.insert(def.name.clone(), def);
            }
            "bitfield" => {
                let def = load_bitfield(child)?;
                check_fresh(&schema, &raw_compounds, &def.name)?;
                schema.bitfields.insert(def.name.clone(), def);
            }
            "compound" => {
                let raw = load_compound(child)?;
                check_fresh(&schema, &raw_compounds, &raw.name)?;
                raw_compounds.insert(raw.name.clone(), raw);
            }
            other => {
                return Err(schema_err(
                    SchemaErrorKind::UnknownElement(other.into()),
                    "schema root",
                ))
            }
        }
    }

    // Second pass: every name must now resolve.
    resolve_names(&schema, &raw_compounds)?;

    // Third pass: flatten inheritance into a field-list prefix.
    flatten(&mut schema, raw_compounds)?;

    // Final pass: expressions may only look backwards, templates must match
    // the arity of the compound they instantiate.
    validate(&schema)?;

    Ok(schema)
}

fn check_fresh(
    schema: &Schema,
    raw_compounds: &LinkedHashMap<String, RawCompound>,
    name: &str,
) -> Result<()> {
    if schema.has_type(name) || raw_compounds.contains_key(name) {
        return Err(schema_err(
            SchemaErrorKind::DuplicateType(name.into()),
            format!("declaration of '{name}'"),
        ));
    }
    Ok(())
}

fn load_basic(node: &Node) -> Result<BasicType> {
    let name = req_attr(node, "name", "basic")?.to_owned();
    let position = format!("basic '{name}'");
    let size: usize = req_attr(node, "size", &position)?.parse().map_err(|_| {
        schema_err(
            SchemaErrorKind::BadAttribute {
                name: "size".into(),
                detail: "not an integer".into(),
            },
            &*position,
        )
    })?;
    let kind = match node.attr("kind").unwrap_or("uint") {
        "uint" => BasicKind::Uint,
        "int" => BasicKind::Int,
        "float" => BasicKind::Float,
        "char" => BasicKind::Char,
        "bool" => BasicKind::Bool,
        other => {
            return Err(schema_err(
                SchemaErrorKind::BadAttribute {
                    name: "kind".into(),
                    detail: format!("unknown kind '{other}'"),
                },
                position,
            ))
        }
    };
    let size_ok = match kind {
        BasicKind::Uint | BasicKind::Int => matches!(size, 1 | 2 | 4 | 8),
        BasicKind::Float => matches!(size, 4 | 8),
        BasicKind::Bool => matches!(size, 1 | 4),
        BasicKind::Char => size == 1,
    };
    if !size_ok {
        return Err(schema_err(
            SchemaErrorKind::BadAttribute {
                name: "size".into(),
                detail: format!("{size} bytes is invalid for this kind"),
            },
            position,
        ));
    }
    Ok(BasicType { name, size, kind })
}

fn load_enum(node: &Node) -> Result<EnumDef> {
    let name = req_attr(node, "name", "enum")?.to_owned();
    let position = format!("enum '{name}'");
    let storage = req_attr(node, "storage", &position)?.to_owned();
    let flags = node.attr("flags") == Some("true");

    let mut options = Vec::new();
    for option in &node.children {
        if option.name != "option" {
            return Err(schema_err(
                SchemaErrorKind::UnknownElement(option.name.clone()),
                position,
            ));
        }
        let opt_name = req_attr(option, "name", &position)?.to_owned();
        let raw = req_attr(option, "value", &position)?;
        let value = parse_u64_literal(raw).ok_or_else(|| {
            schema_err(
                SchemaErrorKind::BadAttribute {
                    name: "value".into(),
                    detail: format!("'{raw}' is not an integer"),
                },
                &*position,
            )
        })?;
        options.push((opt_name, value));
    }

    Ok(EnumDef {
        name,
        storage,
        flags,
        options,
    })
}

fn parse_u64_literal(raw: &str) -> Option<u64> {
    if let Some(hex) = raw.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

fn load_bitfield(node: &Node) -> Result<BitfieldDef> {
    let name = req_attr(node, "name", "bitfield")?.to_owned();
    let position = format!("bitfield '{name}'");
    let storage = req_attr(node, "storage", &position)?.to_owned();
    let msb_first = match node.attr("bitorder").unwrap_or("lsb") {
        "lsb" => false,
        "msb" => true,
        other => {
            return Err(schema_err(
                SchemaErrorKind::BadAttribute {
                    name: "bitorder".into(),
                    detail: format!("'{other}' is neither 'lsb' nor 'msb'"),
                },
                position,
            ))
        }
    };

    let mut members = Vec::new();
    let mut next_pos = 0u32;
    for member in &node.children {
        if member.name != "member" {
            return Err(schema_err(
                SchemaErrorKind::UnknownElement(member.name.clone()),
                position,
            ));
        }
        let member_name = req_attr(member, "name", &position)?.to_owned();
        let width: u32 = req_attr(member, "width", &position)?.parse().map_err(|_| {
            schema_err(
                SchemaErrorKind::BadAttribute {
                    name: "width".into(),
                    detail: "not an integer".into(),
                },
                &*position,
            )
        })?;
        // Explicit positions override the running cursor; the next member
        // continues after whichever came last.
        let pos = match member.attr("pos") {
            Some(raw) => raw.parse().map_err(|_| {
                schema_err(
                    SchemaErrorKind::BadAttribute {
                        name: "pos".into(),
                        detail: "not an integer".into(),
                    },
                    &*position,
                )
            })?,
            None => next_pos,
        };
        next_pos = pos + width;
        members.push(BitMember {
            name: member_name,
            pos,
            width,
        });
    }

    Ok(BitfieldDef {
        name,
        storage,
        msb_first,
        members,
    })
}

fn load_compound(node: &Node) -> Result<RawCompound> {
    let name = req_attr(node, "name", "compound")?.to_owned();
    let position = format!("compound '{name}'");
    let parent = node.attr("inherit").map(str::to_owned);
    let generic = node.attr("generic") == Some("true");
    let params: Vec<String> = node
        .attr("params")
        .map(|raw| raw.split(',').map(|p| p.trim().to_owned()).collect())
        .unwrap_or_default();
    if generic && params.is_empty() {
        return Err(schema_err(
            SchemaErrorKind::MissingAttribute("params".into()),
            position,
        ));
    }

    let mut fields = Vec::new();
    for child in &node.children {
        if child.name != "field" {
            return Err(schema_err(
                SchemaErrorKind::UnknownElement(child.name.clone()),
                position,
            ));
        }
        fields.push(load_field(child, &name, &params)?);
    }

    Ok(RawCompound {
        name,
        parent,
        generic,
        params,
        fields,
    })
}

fn load_field(node: &Node, compound: &str, params: &[String]) -> Result<Field> {
    let name = req_attr(node, "name", "field")?.to_owned();
    let position = format!("compound '{compound}' / field '{name}'");
    let type_name = req_attr(node, "type", &position)?;

    let ty = match type_name {
        "ref" => FieldTy::Ref {
            target: req_attr(node, "target", &position)?.to_owned(),
        },
        "ptr" => FieldTy::Ptr {
            target: req_attr(node, "target", &position)?.to_owned(),
        },
        "string" => FieldTy::Str,
        other if params.iter().any(|p| p == other) => FieldTy::Param(other.to_owned()),
        // Classified properly once every declaration is known.
        other => FieldTy::Compound(other.to_owned()),
    };

    let template = node
        .attr("template")
        .map(|raw| raw.split(',').map(|p| p.trim().to_owned()).collect())
        .unwrap_or_default();

    Ok(Field {
        name,
        ty,
        length: parse_expr_attr(node, "length", &position)?,
        width: parse_expr_attr(node, "width", &position)?,
        default: node.attr("default").map(str::to_owned),
        since: parse_version_attr(node, "since", &position)?,
        until: parse_version_attr(node, "until", &position)?,
        user_since: parse_version_attr(node, "user_since", &position)?,
        user_until: parse_version_attr(node, "user_until", &position)?,
        cond: parse_expr_attr(node, "cond", &position)?,
        arg: parse_expr_attr(node, "arg", &position)?,
        template,
    })
}

/// One full pass over every reference; anything unresolved fails here.
fn resolve_names(
    schema: &Schema,
    raw_compounds: &LinkedHashMap<String, RawCompound>,
) -> Result<()> {
    let known = |name: &str| schema.has_type(name) || raw_compounds.contains_key(name);

    for def in schema.enums.values() {
        let storage_ok = schema
            .basic(&def.storage)
            .map_or(false, |b| matches!(b.kind, BasicKind::Uint | BasicKind::Int));
        if !storage_ok {
            return Err(Error::UnknownType(def.storage.clone()));
        }
    }
    for def in schema.bitfields.values() {
        let storage_ok = schema
            .basic(&def.storage)
            .map_or(false, |b| matches!(b.kind, BasicKind::Uint | BasicKind::Int));
        if !storage_ok {
            return Err(Error::UnknownType(def.storage.clone()));
        }
    }

    for raw in raw_compounds.values() {
        if let Some(parent) = &raw.parent {
            if !raw_compounds.contains_key(parent) {
                return Err(Error::UnknownType(parent.clone()));
            }
        }
        for field in &raw.fields {
            match &field.ty {
                FieldTy::Compound(name) | FieldTy::Basic(name) => {
                    if !known(name) {
                        return Err(Error::UnknownType(name.clone()));
                    }
                }
                FieldTy::Ref { target } | FieldTy::Ptr { target } => {
                    if !raw_compounds.contains_key(target) {
                        return Err(Error::UnknownType(target.clone()));
                    }
                }
                FieldTy::Param(_) | FieldTy::Str | FieldTy::Enum(_) | FieldTy::Bitfield(_) => {}
            }
            for arg in &field.template {
                if !known(arg) && !raw.params.iter().any(|p| p == arg) {
                    return Err(Error::UnknownType(arg.clone()));
                }
            }
        }
    }
    Ok(())
}

/// Flattens inheritance chains and fixes up field type classification.
fn flatten(schema: &mut Schema, raw_compounds: LinkedHashMap<String, RawCompound>) -> Result<()> {
    // Reclassify: a field typed by name may be a basic, enum, bitfield or
    // compound; only now do we know which.
    let classify = |ty: &FieldTy| -> FieldTy {
        match ty {
            FieldTy::Compound(name) => {
                if schema.basics.contains_key(name) {
                    FieldTy::Basic(name.clone())
                } else if schema.enums.contains_key(name) {
                    FieldTy::Enum(name.clone())
                } else if schema.bitfields.contains_key(name) {
                    FieldTy::Bitfield(name.clone())
                } else {
                    ty.clone()
                }
            }
            other => other.clone(),
        }
    };

    let mut flattened: LinkedHashMap<String, Compound> = LinkedHashMap::new();

    fn flatten_one(
        name: &str,
        raw_compounds: &LinkedHashMap<String, RawCompound>,
        flattened: &mut LinkedHashMap<String, Compound>,
        in_progress: &mut HashSet<String>,
        classify: &dyn Fn(&FieldTy) -> FieldTy,
    ) -> Result<Vec<Field>> {
        if let Some(done) = flattened.get(name) {
            return Ok(done.fields.clone());
        }
        if !in_progress.insert(name.to_owned()) {
            return Err(Error::Schema {
                kind: SchemaErrorKind::CyclicInheritance(name.to_owned()),
                position: format!("compound '{name}'"),
            });
        }

        let raw = raw_compounds
            .get(name)
            .ok_or_else(|| Error::UnknownType(name.to_owned()))?;

        let mut fields = match &raw.parent {
            Some(parent) => flatten_one(parent, raw_compounds, flattened, in_progress, classify)?,
            None => Vec::new(),
        };
        for field in &raw.fields {
            let mut field = field.clone();
            field.ty = classify(&field.ty);
            fields.push(field);
        }

        in_progress.remove(name);
        flattened.insert(
            name.to_owned(),
            Compound {
                name: raw.name.clone(),
                parent: raw.parent.clone(),
                generic: raw.generic,
                params: raw.params.clone(),
                fields: fields.clone(),
            },
        );
        Ok(fields)
    }

    let mut in_progress = HashSet::new();
    for name in raw_compounds.keys() {
        flatten_one(
            name,
            &raw_compounds,
            &mut flattened,
            &mut in_progress,
            &classify,
        )?;
    }

    // Preserve declaration order regardless of flattening order.
    for name in raw_compounds.keys() {
        if let Some(compound) = flattened.remove(name) {
            schema.compounds.insert(name.clone(), compound);
        }
    }
    Ok(())
}

fn validate(schema: &Schema) -> Result<()> {
    // Value-typed compound fields nest physically, so composition must be
    // acyclic or no instance would have a finite layout.
    for name in schema.compounds.keys() {
        let mut trail = Vec::new();
        check_composition(schema, name, &mut trail)?;
    }

    for compound in schema.compounds.values() {
        let mut seen: HashSet<&str> = HashSet::new();
        for field in &compound.fields {
            if field.width.is_some() && field.length.is_none() {
                return Err(Error::Schema {
                    kind: SchemaErrorKind::BadAttribute {
                        name: "width".into(),
                        detail: "a second dimension needs a 'length' first".into(),
                    },
                    position: format!("compound '{}' / field '{}'", compound.name, field.name),
                });
            }
            let mut referenced = Vec::new();
            for expr in [&field.cond, &field.length, &field.width, &field.arg]
                .into_iter()
                .flatten()
            {
                expr.referenced_fields(&mut referenced);
            }
            for name in &referenced {
                if !seen.contains(name.as_str()) {
                    return Err(Error::Schema {
                        kind: SchemaErrorKind::BadExpression(format!(
                            "'{name}' does not precede the field that reads it"
                        )),
                        position: format!(
                            "compound '{}' / field '{}'",
                            compound.name, field.name
                        ),
                    });
                }
            }

            // Template arity against the instantiated compound.
            if let FieldTy::Compound(target) = &field.ty {
                let target_def = schema
                    .compound(target)
                    .ok_or_else(|| Error::UnknownType(target.clone()))?;
                if target_def.params.len() != field.template.len() {
                    return Err(Error::Schema {
                        kind: SchemaErrorKind::UnknownTemplateParam(format!(
                            "'{target}' takes {} template argument(s), {} given",
                            target_def.params.len(),
                            field.template.len()
                        )),
                        position: format!(
                            "compound '{}' / field '{}'",
                            compound.name, field.name
                        ),
                    });
                }
            }

            seen.insert(&field.name);
        }
    }
    Ok(())
}

fn check_composition<'a>(
    schema: &'a Schema,
    name: &'a str,
    trail: &mut Vec<&'a str>,
) -> Result<()> {
    if trail.contains(&name) {
        return Err(Error::Schema {
            kind: SchemaErrorKind::CyclicComposition(name.to_owned()),
            position: format!("compound '{name}'"),
        });
    }
    let Some(compound) = schema.compound(name) else {
        return Ok(());
    };
    trail.push(name);
    for field in &compound.fields {
        if let FieldTy::Compound(inner) = &field.ty {
            check_composition(schema, inner, trail)?;
        }
    }
    trail.pop();
    Ok(())
}
