//! Grammar for the declarative schema description: a small XML-like
//! document of nested elements with double-quoted attributes. Parsed with
//! nom into a plain node tree; the loader gives the nodes meaning.

use crate::error::{Error, SchemaErrorKind};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::multispace0,
    combinator::{map, opt},
    error::{ErrorKind, ParseError},
    multi::many0,
    sequence::{delimited, preceded, terminated, tuple},
    Err, IResult,
};

/// Errors produced while parsing the document syntax. Most are `NomError`;
/// the named variants exist for better reporting.
#[derive(Debug)]
pub enum DocParseError {
    NomError {
        kind: ErrorKind,
        other: Option<Box<DocParseError>>,
    },
    /// A close tag does not match the element it closes.
    MismatchedTag(String),
    /// An `&...;` sequence that is not one of the five standard entities.
    UnknownEntity(String),
}

impl ParseError<&str> for DocParseError {
    fn from_error_kind(_input: &str, kind: ErrorKind) -> Self {
        DocParseError::NomError { kind, other: None }
    }

    fn append(_input: &str, kind: ErrorKind, other: Self) -> Self {
        DocParseError::NomError {
            kind,
            other: Some(Box::new(other)),
        }
    }
}

type Result<'a, T> = IResult<&'a str, T, DocParseError>;

/// One element of the description: name, attributes in document order,
/// child elements, and any text content.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
    pub text: String,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parses a complete document into its root element.
pub fn parse_document(input: &str) -> std::result::Result<Node, Error> {
    let doc = delimited(trivia, element, trivia);
    match nom::combinator::all_consuming(doc)(input) {
        Ok((_, node)) => Ok(node),
        Err(Err::Error(e)) | Err(Err::Failure(e)) => Err(Error::Schema {
            kind: SchemaErrorKind::MalformedDocument(describe(&e)),
            position: locate(input, &e),
        }),
        Err(Err::Incomplete(..)) => Err(Error::Schema {
            kind: SchemaErrorKind::MalformedDocument("document ends early".into()),
            position: "end of input".into(),
        }),
    }
}

fn describe(e: &DocParseError) -> String {
    match e {
        DocParseError::MismatchedTag(name) => format!("close tag </{name}> does not match"),
        DocParseError::UnknownEntity(ent) => format!("unknown entity &{ent};"),
        DocParseError::NomError { kind, .. } => format!("syntax error ({kind:?})"),
    }
}

fn locate(_input: &str, e: &DocParseError) -> String {
    // Structured positions only exist for the named errors; nom errors keep
    // the default location.
    match e {
        DocParseError::MismatchedTag(name) => format!("element '{name}'"),
        _ => "document".into(),
    }
}

/// Whitespace, comments and the optional `<?...?>` prolog.
fn trivia(input: &str) -> Result<()> {
    let (input, _) = multispace0(input)?;
    let (input, _) = many0(terminated(
        alt((comment, prolog)),
        multispace0,
    ))(input)?;
    Ok((input, ()))
}

fn comment(input: &str) -> Result<()> {
    map(
        tuple((tag("<!--"), take_until("-->"), tag("-->"))),
        |_| (),
    )(input)
}

fn prolog(input: &str) -> Result<()> {
    map(tuple((tag("<?"), take_until("?>"), tag("?>"))), |_| ())(input)
}

fn name(input: &str) -> Result<&str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':')(input)
}

fn attribute(input: &str) -> Result<(String, String)> {
    let (input, key) = preceded(multispace0, name)(input)?;
    let (input, _) = delimited(multispace0, tag("="), multispace0)(input)?;
    let (input, raw) = delimited(tag("\""), take_while(|c| c != '"'), tag("\""))(input)?;
    let value = unescape(raw).map_err(|ent| Err::Failure(DocParseError::UnknownEntity(ent)))?;
    Ok((input, (key.to_owned(), value)))
}

fn element(input: &str) -> Result<Node> {
    let (input, _) = tag("<")(input)?;
    let (input, tag_name) = name(input)?;
    let (input, attrs) = many0(attribute)(input)?;
    let (input, _) = multispace0(input)?;

    // Self-closing form.
    let (input, closed) = opt(tag("/"))(input)?;
    let (input, _) = tag(">")(input)?;

    let mut node = Node {
        name: tag_name.to_owned(),
        attrs,
        ..Node::default()
    };

    if closed.is_some() {
        return Ok((input, node));
    }

    let (input, (children, text)) = content(input)?;
    node.children = children;
    node.text = text;

    let (input, _) = tag("</")(input)?;
    let (input, close_name) = name(input)?;
    if close_name != tag_name {
        return Err(Err::Failure(DocParseError::MismatchedTag(
            tag_name.to_owned(),
        )));
    }
    let (input, _) = preceded(multispace0, tag(">"))(input)?;

    Ok((input, node))
}

fn content(input: &str) -> Result<(Vec<Node>, String)> {
    let mut children = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    loop {
        let (next, chunk) = take_while::<_, _, DocParseError>(|c| c != '<')(rest)?;
        if !chunk.trim().is_empty() {
            let unescaped = unescape(chunk.trim())
                .map_err(|ent| Err::Failure(DocParseError::UnknownEntity(ent)))?;
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&unescaped);
        }
        rest = next;

        if rest.starts_with("</") {
            return Ok((rest, (children, text)));
        }
        if rest.starts_with("<!--") {
            let (next, ()) = comment(rest)?;
            rest = next;
            continue;
        }
        if rest.starts_with('<') {
            let (next, child) = element(rest)?;
            children.push(child);
            rest = next;
            continue;
        }
        // No '<' left at all: unterminated element.
        return Err(Err::Failure(DocParseError::NomError {
            kind: ErrorKind::TagClosure,
            other: None,
        }));
    }
}

fn unescape(raw: &str) -> std::result::Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_owned());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        let end = rest.find(';').ok_or_else(|| rest.to_owned())?;
        let entity = &rest[..end];
        out.push(match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            other => return Err(other.to_owned()),
        });
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_element() {
        let node = parse_document(r#"<basic name="u32" size="4" />"#).unwrap();
        assert_eq!(node.name, "basic");
        assert_eq!(node.attr("name"), Some("u32"));
        assert_eq!(node.attr("size"), Some("4"));
        assert_eq!(node.attr("kind"), None);
    }

    #[test]
    fn nesting_and_text() {
        let node = parse_document(
            r#"<compound name="Vec3">
                 <field name="x" type="f32" />
                 <field name="y" type="f32" />
                 docs for the type
               </compound>"#,
        )
        .unwrap();
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.children[1].attr("name"), Some("y"));
        assert_eq!(node.text, "docs for the type");
    }

    #[test]
    fn comments_and_prolog_skipped() {
        let node = parse_document(
            "<?xml version=\"1.0\"?>\n<!-- top -->\n<schema><!-- inner --><basic name=\"u8\" size=\"1\"/></schema>",
        )
        .unwrap();
        assert_eq!(node.name, "schema");
        assert_eq!(node.children.len(), 1);
    }

    #[test]
    fn entities_unescaped() {
        let node = parse_document(r#"<field cond="a &lt; 3 &amp;&amp; b &gt; 1" />"#).unwrap();
        assert_eq!(node.attr("cond"), Some("a < 3 && b > 1"));
    }

    #[test]
    fn mismatched_close_tag_fails() {
        let err = parse_document("<a><b></a></b>").unwrap_err();
        match err {
            Error::Schema { position, .. } => assert!(position.contains('b')),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_fails() {
        assert!(parse_document("not a document").is_err());
        assert!(parse_document("<unclosed").is_err());
    }
}
