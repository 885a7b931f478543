use crate::schema::expr::ExprError;
use std::io;
use thiserror::Error;

/// Errors that can happen while loading a schema, reading or writing a file,
/// or editing a loaded graph. Loads are transactional: any error below aborts
/// the load and no partial graph is ever returned.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream ended before the requested bytes could be read.
    #[error("unexpected end of stream")]
    EndOfStream,

    #[error("i/o error: {0}")]
    Io(io::Error),

    /// The declarative description is malformed or inconsistent.
    /// `position` names the offending element or document location.
    #[error("schema error at {position}: {kind}")]
    Schema {
        kind: SchemaErrorKind,
        position: String,
    },

    /// A type name was referenced but never declared.
    #[error("unknown type '{0}'")]
    UnknownType(String),

    /// A condition or length expression failed to evaluate.
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// A link resolved to a block whose type is incompatible with the
    /// declared target of the field.
    #[error("link {index} points to a '{found}', expected a '{expected}'")]
    LinkTypeMismatch {
        index: i64,
        expected: String,
        found: String,
    },

    /// A link index falls outside the block table.
    #[error("link index {index} outside block table of {len} entries")]
    LinkOutOfRange { index: i64, len: usize },

    /// A value incompatible with the declared field type was assigned.
    #[error("field '{field}' expects {expected}, got {found}")]
    TypeError {
        field: String,
        expected: String,
        found: String,
    },

    /// The stream matched no registered format, or its header version falls
    /// outside the matching format's declared range.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    /// A block count, size or index disagrees with the header.
    #[error("corrupt block: {0}")]
    CorruptBlock(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::EndOfStream
        } else {
            Error::Io(e)
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaErrorKind {
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    #[error("unknown element <{0}>")]
    UnknownElement(String),
    #[error("missing attribute '{0}'")]
    MissingAttribute(String),
    #[error("bad attribute '{name}': {detail}")]
    BadAttribute { name: String, detail: String },
    #[error("duplicate type '{0}'")]
    DuplicateType(String),
    #[error("cyclic inheritance through '{0}'")]
    CyclicInheritance(String),
    #[error("compound '{0}' contains itself by value")]
    CyclicComposition(String),
    #[error("template parameter '{0}' is not declared by the compound")]
    UnknownTemplateParam(String),
    #[error("bad expression: {0}")]
    BadExpression(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A non-fatal observation made during a load. Warnings never abort the
/// load; they are accumulated in order and surfaced next to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
        }
    }
}
