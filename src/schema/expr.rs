//! Condition and length expressions.
//!
//! Expressions are compiled once at schema load into an immutable tree and
//! interpreted against a scope of already-read field values plus the two
//! version parameters. They have no side effects.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, hex_digit1, multispace0},
    combinator::{all_consuming, map, opt, recognize, verify},
    multi::many0,
    sequence::{delimited, pair, preceded},
    Err, IResult,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("no field named '{0}' precedes this expression")]
    UnknownIdent(String),
    #[error("operator '{op}' cannot combine {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("array length evaluated to {0}, which is negative")]
    NegativeLength(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::BitAnd => "&",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// A compiled expression. Immutable after schema load, shareable across
/// threads together with the schema that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Bool(bool),
    Version,
    UserVersion,
    Arg,
    Field(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Result of evaluating an expression: comparisons and logic yield `Bool`,
/// everything else yields `Int`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExprValue {
    Int(i64),
    Bool(bool),
}

impl ExprValue {
    fn kind(self) -> &'static str {
        match self {
            ExprValue::Int(_) => "int",
            ExprValue::Bool(_) => "bool",
        }
    }

    /// Predicate interpretation: `Bool` as itself, `Int` as nonzero.
    pub fn truthy(self) -> bool {
        match self {
            ExprValue::Bool(b) => b,
            ExprValue::Int(i) => i != 0,
        }
    }
}

/// Field values visible to an expression: the fields read so far, the two
/// version parameters, and the argument bound at the enclosing field.
pub trait Scope {
    fn field(&self, name: &str) -> Option<ExprValue>;
    fn version(&self) -> u32;
    fn user_version(&self) -> u32;
    fn arg(&self) -> Option<i64>;
}

impl Expr {
    /// Compiles `input` into an expression tree. The error is a plain
    /// message; the schema loader wraps it with the element position.
    pub fn parse(input: &str) -> Result<Expr, String> {
        match all_consuming(delimited(multispace0, or_expr, multispace0))(input) {
            Ok((_, expr)) => Ok(expr),
            Err(Err::Error(e)) | Err(Err::Failure(e)) => {
                Err(format!("parse failed near '{}'", e.input))
            }
            Err(Err::Incomplete(..)) => Err("incomplete expression".into()),
        }
    }

    pub fn eval(&self, scope: &dyn Scope) -> Result<ExprValue, ExprError> {
        match self {
            Expr::Int(v) => Ok(ExprValue::Int(*v)),
            Expr::Bool(v) => Ok(ExprValue::Bool(*v)),
            Expr::Version => Ok(ExprValue::Int(i64::from(scope.version()))),
            Expr::UserVersion => Ok(ExprValue::Int(i64::from(scope.user_version()))),
            Expr::Arg => match scope.arg() {
                Some(v) => Ok(ExprValue::Int(v)),
                None => Err(ExprError::UnknownIdent("arg".into())),
            },
            Expr::Field(name) => scope
                .field(name)
                .ok_or_else(|| ExprError::UnknownIdent(name.clone())),
            Expr::Unary(op, inner) => {
                let v = inner.eval(scope)?;
                match (op, v) {
                    (UnaryOp::Not, ExprValue::Bool(b)) => Ok(ExprValue::Bool(!b)),
                    (UnaryOp::Not, ExprValue::Int(i)) => Ok(ExprValue::Bool(i == 0)),
                    (UnaryOp::Neg, ExprValue::Int(i)) => Ok(ExprValue::Int(i.wrapping_neg())),
                    (UnaryOp::Neg, ExprValue::Bool(_)) => Err(ExprError::TypeMismatch {
                        op: "-",
                        lhs: "bool",
                        rhs: "bool",
                    }),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(scope)?;
                // && and || short-circuit on the predicate value of the lhs.
                match op {
                    BinOp::And if !l.truthy() => return Ok(ExprValue::Bool(false)),
                    BinOp::Or if l.truthy() => return Ok(ExprValue::Bool(true)),
                    _ => {}
                }
                let r = rhs.eval(scope)?;
                eval_binary(*op, l, r)
            }
        }
    }

    /// Evaluates to a predicate. `Int` results count as true when nonzero.
    pub fn eval_pred(&self, scope: &dyn Scope) -> Result<bool, ExprError> {
        Ok(self.eval(scope)?.truthy())
    }

    /// Evaluates to an array length.
    pub fn eval_len(&self, scope: &dyn Scope) -> Result<usize, ExprError> {
        match self.eval(scope)? {
            ExprValue::Int(i) if i >= 0 => Ok(i as usize),
            ExprValue::Int(i) => Err(ExprError::NegativeLength(i)),
            ExprValue::Bool(_) => Err(ExprError::TypeMismatch {
                op: "length",
                lhs: "bool",
                rhs: "int",
            }),
        }
    }

    /// Names of the fields this expression reads, for loader validation.
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Field(name) => out.push(name.clone()),
            Expr::Unary(_, inner) => inner.referenced_fields(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.referenced_fields(out);
                rhs.referenced_fields(out);
            }
            _ => {}
        }
    }
}

fn eval_binary(op: BinOp, l: ExprValue, r: ExprValue) -> Result<ExprValue, ExprError> {
    use ExprValue::{Bool, Int};

    let mismatch = || ExprError::TypeMismatch {
        op: op.symbol(),
        lhs: l.kind(),
        rhs: r.kind(),
    };

    match op {
        BinOp::Or | BinOp::And => Ok(Bool(match op {
            BinOp::Or => l.truthy() || r.truthy(),
            _ => l.truthy() && r.truthy(),
        })),
        BinOp::Eq | BinOp::Ne => {
            let equal = match (l, r) {
                (Int(a), Int(b)) => a == b,
                (Bool(a), Bool(b)) => a == b,
                _ => return Err(mismatch()),
            };
            Ok(Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let (a, b) = match (l, r) {
                (Int(a), Int(b)) => (a, b),
                _ => return Err(mismatch()),
            };
            Ok(Bool(match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                _ => a >= b,
            }))
        }
        _ => {
            let (a, b) = match (l, r) {
                (Int(a), Int(b)) => (a, b),
                _ => return Err(mismatch()),
            };
            let v = match op {
                BinOp::BitOr => a | b,
                BinOp::BitXor => a ^ b,
                BinOp::BitAnd => a & b,
                BinOp::Shl => a.wrapping_shl(b as u32),
                BinOp::Shr => a.wrapping_shr(b as u32),
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => a.checked_div(b).ok_or(ExprError::DivisionByZero)?,
                BinOp::Rem => a.checked_rem(b).ok_or(ExprError::DivisionByZero)?,
                _ => unreachable!("handled above"),
            };
            Ok(Int(v))
        }
    }
}

// The grammar. One function per precedence level, loosest binding first,
// following the same shape as the field-descriptor grammar in the parsers
// this module grew out of.

type PResult<'a, T> = IResult<&'a str, T>;

fn ws<'a, T>(
    inner: impl FnMut(&'a str) -> PResult<'a, T>,
) -> impl FnMut(&'a str) -> PResult<'a, T> {
    preceded(multispace0, inner)
}

fn binary_level<'a>(
    mut operand: impl FnMut(&'a str) -> PResult<'a, Expr>,
    mut op: impl FnMut(&'a str) -> PResult<'a, BinOp>,
) -> impl FnMut(&'a str) -> PResult<'a, Expr> {
    move |input| {
        let (input, first) = operand(input)?;
        let (input, rest) = many0(pair(ws(|i| op(i)), |i| operand(i)))(input)?;
        Ok((input, rest.into_iter().fold(first, |acc, (op, rhs)| {
            Expr::Binary(op, Box::new(acc), Box::new(rhs))
        })))
    }
}

fn or_expr(input: &str) -> PResult<Expr> {
    binary_level(and_expr, map(tag("||"), |_| BinOp::Or))(input)
}

fn and_expr(input: &str) -> PResult<Expr> {
    binary_level(eq_expr, map(tag("&&"), |_| BinOp::And))(input)
}

fn eq_expr(input: &str) -> PResult<Expr> {
    binary_level(
        rel_expr,
        alt((
            map(tag("=="), |_| BinOp::Eq),
            map(tag("!="), |_| BinOp::Ne),
        )),
    )(input)
}

fn rel_expr(input: &str) -> PResult<Expr> {
    binary_level(
        bitor_expr,
        alt((
            map(tag("<="), |_| BinOp::Le),
            map(tag(">="), |_| BinOp::Ge),
            // A bare < must not swallow the first char of <<.
            map(verify(pair(char('<'), opt(char('<'))), |(_, s)| s.is_none()), |_| BinOp::Lt),
            map(verify(pair(char('>'), opt(char('>'))), |(_, s)| s.is_none()), |_| BinOp::Gt),
        )),
    )(input)
}

fn bitor_expr(input: &str) -> PResult<Expr> {
    binary_level(
        bitxor_expr,
        map(verify(pair(char('|'), opt(char('|'))), |(_, s)| s.is_none()), |_| BinOp::BitOr),
    )(input)
}

fn bitxor_expr(input: &str) -> PResult<Expr> {
    binary_level(bitand_expr, map(char('^'), |_| BinOp::BitXor))(input)
}

fn bitand_expr(input: &str) -> PResult<Expr> {
    binary_level(
        shift_expr,
        map(verify(pair(char('&'), opt(char('&'))), |(_, s)| s.is_none()), |_| BinOp::BitAnd),
    )(input)
}

fn shift_expr(input: &str) -> PResult<Expr> {
    binary_level(
        add_expr,
        alt((
            map(tag("<<"), |_| BinOp::Shl),
            map(tag(">>"), |_| BinOp::Shr),
        )),
    )(input)
}

fn add_expr(input: &str) -> PResult<Expr> {
    binary_level(
        mul_expr,
        alt((map(char('+'), |_| BinOp::Add), map(char('-'), |_| BinOp::Sub))),
    )(input)
}

fn mul_expr(input: &str) -> PResult<Expr> {
    binary_level(
        unary_expr,
        alt((
            map(char('*'), |_| BinOp::Mul),
            map(char('/'), |_| BinOp::Div),
            map(char('%'), |_| BinOp::Rem),
        )),
    )(input)
}

fn unary_expr(input: &str) -> PResult<Expr> {
    ws(alt((
        map(
            preceded(
                verify(pair(char('!'), opt(char('='))), |(_, e)| e.is_none()),
                unary_expr,
            ),
            |e| Expr::Unary(UnaryOp::Not, Box::new(e)),
        ),
        map(preceded(char('-'), unary_expr), |e| {
            Expr::Unary(UnaryOp::Neg, Box::new(e))
        }),
        atom,
    )))(input)
}

fn atom(input: &str) -> PResult<Expr> {
    ws(alt((
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        hex_literal,
        int_literal,
        identifier,
    )))(input)
}

fn hex_literal(input: &str) -> PResult<Expr> {
    map(preceded(tag("0x"), hex_digit1), |digits: &str| {
        // wrapping parse: versions like 0xFFFFFFFF fit in i64 fine
        Expr::Int(i64::from_str_radix(digits, 16).unwrap_or(i64::MAX))
    })(input)
}

fn int_literal(input: &str) -> PResult<Expr> {
    map(digit1, |digits: &str| {
        Expr::Int(digits.parse().unwrap_or(i64::MAX))
    })(input)
}

fn identifier(input: &str) -> PResult<Expr> {
    let (input, name) = recognize(pair(
        verify(nom::character::complete::anychar, |c| {
            c.is_ascii_alphabetic() || *c == '_'
        }),
        nom::bytes::complete::take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)?;

    let expr = match name {
        "true" => Expr::Bool(true),
        "false" => Expr::Bool(false),
        "version" => Expr::Version,
        "user_version" => Expr::UserVersion,
        "arg" => Expr::Arg,
        _ => Expr::Field(name.to_owned()),
    };
    Ok((input, expr))
}
