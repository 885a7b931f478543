//! Dynamic typed values: what a loaded block actually holds. An `Instance`
//! is conceptually a struct — named slots in declaration order — whose
//! shape is dictated by a schema compound rather than a Rust type.

use crate::error::{Error, Result};
use crate::graph::BlockId;
use crate::schema::expr::ExprValue;
use crate::schema::{BasicKind, Field, FieldTy, Schema};
use linked_hash_map::LinkedHashMap;

/// A single value of any schema type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    /// An enum constant kept as its raw storage value. Raws outside the
    /// declared set survive round-trips untouched.
    Enum { decl: String, raw: u64 },
    /// A packed bitfield kept as its raw storage value.
    Bits { decl: String, raw: u64 },
    Struct(Instance),
    /// 1-D array; 2-D arrays nest another `Array` per row.
    Array(Vec<Value>),
    /// A link to another block. `None` is the null link. `weak` mirrors
    /// the declaring field: weak links never keep their target alive.
    Link { target: Option<BlockId>, weak: bool },
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::U8(_) => "u8",
            Value::I8(_) => "i8",
            Value::U16(_) => "u16",
            Value::I16(_) => "i16",
            Value::U32(_) => "u32",
            Value::I32(_) => "i32",
            Value::U64(_) => "u64",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Enum { .. } => "enum",
            Value::Bits { .. } => "bitfield",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::Link { .. } => "link",
        }
    }

    /// Integer view of any scalar, used by expressions and link checks.
    pub fn as_int(&self) -> Option<i64> {
        Some(match self {
            Value::U8(v) => i64::from(*v),
            Value::I8(v) => i64::from(*v),
            Value::U16(v) => i64::from(*v),
            Value::I16(v) => i64::from(*v),
            Value::U32(v) => i64::from(*v),
            Value::I32(v) => i64::from(*v),
            Value::U64(v) => *v as i64,
            Value::I64(v) => *v,
            Value::Bool(v) => i64::from(*v),
            Value::Enum { raw, .. } | Value::Bits { raw, .. } => *raw as i64,
            _ => return None,
        })
    }

    /// What an expression sees when it reads a field holding this value.
    /// Links read as their presence so conditions can test for null.
    pub fn as_expr_value(&self) -> Option<ExprValue> {
        match self {
            Value::Bool(v) => Some(ExprValue::Bool(*v)),
            Value::Link { target, .. } => Some(ExprValue::Int(i64::from(target.is_some()))),
            other => other.as_int().map(ExprValue::Int),
        }
    }
}

/// A field slot: absent when the field was conditioned out for this
/// instance's version parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Absent,
    Present(Value),
}

/// An instance of a schema compound. Slots keep declaration order; that
/// order is what the serializer walks.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub type_name: String,
    slots: LinkedHashMap<String, Slot>,
}

impl Instance {
    /// An instance with every slot absent. The deserializer fills slots as
    /// it reads them so condition expressions can see earlier fields.
    pub fn empty(type_name: impl Into<String>) -> Self {
        Instance {
            type_name: type_name.into(),
            slots: LinkedHashMap::new(),
        }
    }

    /// A user-constructed instance with every field set to its declared
    /// default (zero where the schema gives none). Template-parameter
    /// fields stay absent; their type is only known per use.
    pub fn new(schema: &Schema, type_name: &str) -> Result<Self> {
        let compound = schema
            .compound(type_name)
            .ok_or_else(|| Error::UnknownType(type_name.to_owned()))?;
        let mut instance = Instance::empty(type_name);
        for field in &compound.fields {
            let slot = match default_value(schema, field)? {
                Some(value) => Slot::Present(value),
                None => Slot::Absent,
            };
            instance.slots.insert(field.name.clone(), slot);
        }
        Ok(instance)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.slots.get(name) {
            Some(Slot::Present(value)) => Some(value),
            _ => None,
        }
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.get(name)
    }

    /// Field names and slots in declaration order.
    pub fn slots(&self) -> impl Iterator<Item = (&String, &Slot)> {
        self.slots.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut().map(|(_, slot)| slot)
    }

    /// Validates `value` against the declared type of `name` and stores
    /// it. Shape mismatches fail with `TypeError` and leave the instance
    /// untouched.
    pub fn set(&mut self, schema: &Schema, name: &str, value: Value) -> Result<()> {
        let compound = schema
            .compound(&self.type_name)
            .ok_or_else(|| Error::UnknownType(self.type_name.clone()))?;
        let (_, field) = compound.field(name).ok_or_else(|| Error::TypeError {
            field: name.to_owned(),
            expected: format!("a field of '{}'", self.type_name),
            found: "no such field".into(),
        })?;
        check_value(schema, field, &value, field.length.is_some(), field.width.is_some())?;
        self.slots.insert(name.to_owned(), Slot::Present(value));
        Ok(())
    }

    /// Stores without validation. The deserializer uses this: bytes it
    /// read are shaped by the same schema it writes with.
    pub(crate) fn set_raw(&mut self, name: &str, slot: Slot) {
        self.slots.insert(name.to_owned(), slot);
    }

    // Typed accessors for the common cases.

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_int()
    }

    pub fn get_f32(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_struct(&self, name: &str) -> Option<&Instance> {
        match self.get(name)? {
            Value::Struct(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn get_array(&self, name: &str) -> Option<&[Value]> {
        match self.get(name)? {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get_link(&self, name: &str) -> Option<Option<BlockId>> {
        match self.get(name)? {
            Value::Link { target, .. } => Some(*target),
            _ => None,
        }
    }
}

/// Checks a value's shape against a field declaration. `array`/`matrix`
/// say whether the declaration carries one or two length expressions.
pub fn check_value(
    schema: &Schema,
    field: &Field,
    value: &Value,
    array: bool,
    matrix: bool,
) -> Result<()> {
    let mismatch = |expected: String| Error::TypeError {
        field: field.name.clone(),
        expected,
        found: value.kind_name().into(),
    };

    if matrix {
        match value {
            Value::Array(rows) => {
                for row in rows {
                    check_value(schema, field, row, true, false)?;
                }
                return Ok(());
            }
            _ => return Err(mismatch(format!("array of arrays of {}", field.ty.describe()))),
        }
    }
    if array {
        match value {
            Value::Array(items) => {
                for item in items {
                    check_value(schema, field, item, false, false)?;
                }
                return Ok(());
            }
            _ => return Err(mismatch(format!("array of {}", field.ty.describe()))),
        }
    }

    match &field.ty {
        FieldTy::Basic(name) => {
            let basic = schema
                .basic(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?;
            let ok = matches!(
                (basic.kind, basic.size, value),
                (BasicKind::Uint, 1, Value::U8(_))
                    | (BasicKind::Uint, 2, Value::U16(_))
                    | (BasicKind::Uint, 4, Value::U32(_))
                    | (BasicKind::Uint, 8, Value::U64(_))
                    | (BasicKind::Int, 1, Value::I8(_))
                    | (BasicKind::Int, 2, Value::I16(_))
                    | (BasicKind::Int, 4, Value::I32(_))
                    | (BasicKind::Int, 8, Value::I64(_))
                    | (BasicKind::Float, 4, Value::F32(_))
                    | (BasicKind::Float, 8, Value::F64(_))
                    | (BasicKind::Bool, _, Value::Bool(_))
                    | (BasicKind::Char, 1, Value::U8(_))
            );
            if !ok {
                return Err(mismatch(name.clone()));
            }
        }
        FieldTy::Enum(name) => match value {
            Value::Enum { decl, .. } if decl == name => {}
            _ => return Err(mismatch(name.clone())),
        },
        FieldTy::Bitfield(name) => match value {
            Value::Bits { decl, .. } if decl == name => {}
            _ => return Err(mismatch(name.clone())),
        },
        FieldTy::Compound(name) => match value {
            Value::Struct(inst) if inst.type_name == *name => {}
            _ => return Err(mismatch(name.clone())),
        },
        // The concrete type is only known once the parameter is bound.
        FieldTy::Param(_) => {}
        FieldTy::Ref { .. } => match value {
            Value::Link { weak: false, .. } => {}
            _ => return Err(mismatch(field.ty.describe())),
        },
        FieldTy::Ptr { .. } => match value {
            Value::Link { weak: true, .. } => {}
            _ => return Err(mismatch(field.ty.describe())),
        },
        FieldTy::Str => match value {
            Value::Str(_) => {}
            _ => return Err(mismatch("string".into())),
        },
    }
    Ok(())
}

fn default_value(schema: &Schema, field: &Field) -> Result<Option<Value>> {
    // Arrays start empty whatever their element type.
    if field.length.is_some() || field.width.is_some() {
        return Ok(Some(Value::Array(Vec::new())));
    }

    Ok(match &field.ty {
        FieldTy::Basic(name) => {
            let basic = schema
                .basic(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?;
            let literal = field.default.as_deref();
            Some(scalar_default(basic.kind, basic.size, literal))
        }
        FieldTy::Enum(name) => {
            let raw = field
                .default
                .as_deref()
                .and_then(|lit| {
                    schema
                        .enum_def(name)
                        .and_then(|def| def.option_value(lit))
                        .or_else(|| lit.parse().ok())
                })
                .unwrap_or(0);
            Some(Value::Enum {
                decl: name.clone(),
                raw,
            })
        }
        FieldTy::Bitfield(name) => Some(Value::Bits {
            decl: name.clone(),
            raw: field.default.as_deref().and_then(|l| l.parse().ok()).unwrap_or(0),
        }),
        FieldTy::Compound(name) => Some(Value::Struct(Instance::new(schema, name)?)),
        FieldTy::Param(_) => None,
        FieldTy::Ref { .. } => Some(Value::Link {
            target: None,
            weak: false,
        }),
        FieldTy::Ptr { .. } => Some(Value::Link {
            target: None,
            weak: true,
        }),
        FieldTy::Str => Some(Value::Str(field.default.clone().unwrap_or_default())),
    })
}

fn scalar_default(kind: BasicKind, size: usize, literal: Option<&str>) -> Value {
    match (kind, size) {
        (BasicKind::Uint | BasicKind::Char, 1) => {
            Value::U8(literal.and_then(|l| l.parse().ok()).unwrap_or(0))
        }
        (BasicKind::Uint, 2) => Value::U16(literal.and_then(|l| l.parse().ok()).unwrap_or(0)),
        (BasicKind::Uint, 4) => Value::U32(literal.and_then(|l| l.parse().ok()).unwrap_or(0)),
        (BasicKind::Uint, 8) => Value::U64(literal.and_then(|l| l.parse().ok()).unwrap_or(0)),
        (BasicKind::Int, 1) => Value::I8(literal.and_then(|l| l.parse().ok()).unwrap_or(0)),
        (BasicKind::Int, 2) => Value::I16(literal.and_then(|l| l.parse().ok()).unwrap_or(0)),
        (BasicKind::Int, 4) => Value::I32(literal.and_then(|l| l.parse().ok()).unwrap_or(0)),
        (BasicKind::Int, 8) => Value::I64(literal.and_then(|l| l.parse().ok()).unwrap_or(0)),
        (BasicKind::Float, 8) => Value::F64(literal.and_then(|l| l.parse().ok()).unwrap_or(0.0)),
        (BasicKind::Bool, _) => Value::Bool(literal == Some("true") || literal == Some("1")),
        _ => Value::F32(literal.and_then(|l| l.parse().ok()).unwrap_or(0.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn schema() -> Schema {
        Schema::parse(
            r#"<schema>
                 <basic name="u8" size="1" kind="uint" />
                 <basic name="u32" size="4" kind="uint" />
                 <basic name="f32" size="4" kind="float" />
                 <compound name="Vec3">
                   <field name="x" type="f32" default="1.0" />
                   <field name="y" type="f32" />
                   <field name="z" type="f32" />
                 </compound>
                 <compound name="Node">
                   <field name="name" type="string" />
                   <field name="scale" type="Vec3" />
                   <field name="num_children" type="u32" />
                   <field name="children" type="ref" target="Node" length="num_children" />
                   <field name="parent" type="ptr" target="Node" />
                 </compound>
               </schema>"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_every_slot() {
        let schema = schema();
        let node = Instance::new(&schema, "Node").unwrap();
        assert_eq!(node.get_str("name"), Some(""));
        assert_eq!(node.get_struct("scale").unwrap().get_f32("x"), Some(1.0));
        assert_eq!(node.get_int("num_children"), Some(0));
        assert_eq!(node.get_array("children"), Some(&[][..]));
        assert_eq!(node.get_link("parent"), Some(None));
    }

    #[test]
    fn set_validates_shape() {
        let schema = schema();
        let mut node = Instance::new(&schema, "Node").unwrap();

        node.set(&schema, "num_children", Value::U32(2)).unwrap();
        assert_eq!(node.get_int("num_children"), Some(2));

        let err = node
            .set(&schema, "num_children", Value::F32(2.0))
            .unwrap_err();
        assert!(matches!(err, Error::TypeError { .. }));
        // The failed set left the old value in place.
        assert_eq!(node.get_int("num_children"), Some(2));

        let err = node.set(&schema, "ghost", Value::U32(0)).unwrap_err();
        assert!(matches!(err, Error::TypeError { .. }));
    }

    #[test]
    fn link_strength_is_part_of_the_shape() {
        let schema = schema();
        let mut node = Instance::new(&schema, "Node").unwrap();
        let err = node
            .set(
                &schema,
                "parent",
                Value::Link {
                    target: None,
                    weak: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::TypeError { .. }));
    }

    #[test]
    fn array_elements_are_checked() {
        let schema = schema();
        let mut node = Instance::new(&schema, "Node").unwrap();
        let ok = Value::Array(vec![Value::Link {
            target: None,
            weak: false,
        }]);
        node.set(&schema, "children", ok).unwrap();

        let bad = Value::Array(vec![Value::U32(1)]);
        assert!(node.set(&schema, "children", bad).is_err());
    }
}
