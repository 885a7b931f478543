//! Binds file-format identities to schemas and framing strategies, and
//! owns the `open`/`save` entry points. A registry is a plain value:
//! build it once at startup, share it read-only afterwards.

use crate::codec::Endianness;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::schema::Schema;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// How the byte stream frames its blocks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Framing {
    /// Signature, versions, block type table, optional string table, block
    /// bodies, root footer. The shape of scene-graph formats.
    BlockTable,
    /// Signature then a single root compound. The shape of image and
    /// container formats.
    FlatRoot,
}

/// Everything needed to open and save one file format.
#[derive(Debug)]
pub struct Format {
    pub name: String,
    /// Fixed bytes the stream must start with. May be empty for formats
    /// with no magic; such a format matches anything, so register it last.
    pub signature: Vec<u8>,
    pub min_version: u32,
    pub max_version: u32,
    /// Versions assumed for fresh graphs and for `FlatRoot` streams,
    /// which carry no version of their own.
    pub default_version: u32,
    pub default_user_version: u32,
    pub schema: Arc<Schema>,
    pub framing: Framing,
    pub endian: Endianness,
    /// `BlockTable`: compound read between the versions and the block
    /// table. `FlatRoot`: the root compound itself.
    pub header_compound: Option<String>,
    /// Header field declaring byte order for everything after the header
    /// (0 = big, 1 = little).
    pub endian_field: Option<String>,
    pub has_string_table: bool,
}

impl Format {
    /// A block-table format with no header compound. Fields that are
    /// usually format-specific (`endian_field`, string table, header) are
    /// public; set them after construction.
    pub fn block_table(
        name: impl Into<String>,
        signature: &[u8],
        schema: Arc<Schema>,
        min_version: u32,
        max_version: u32,
    ) -> Self {
        Format {
            name: name.into(),
            signature: signature.to_vec(),
            min_version,
            max_version,
            default_version: max_version,
            default_user_version: 0,
            schema,
            framing: Framing::BlockTable,
            endian: Endianness::Little,
            header_compound: None,
            endian_field: None,
            has_string_table: false,
        }
    }

    /// A flat single-root format; `root` is the compound covering the
    /// whole stream.
    pub fn flat_root(
        name: impl Into<String>,
        signature: &[u8],
        schema: Arc<Schema>,
        root: impl Into<String>,
    ) -> Self {
        Format {
            name: name.into(),
            signature: signature.to_vec(),
            min_version: 0,
            max_version: 0,
            default_version: 0,
            default_user_version: 0,
            schema,
            framing: Framing::FlatRoot,
            endian: Endianness::Little,
            header_compound: Some(root.into()),
            endian_field: None,
            has_string_table: false,
        }
    }
}

/// Probes signatures in registration order and dispatches loads. Not a
/// process-wide singleton on purpose: passing the registry around keeps
/// tests isolated and freezes it by construction.
#[derive(Default)]
pub struct Registry {
    formats: Vec<Arc<Format>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers a format. Idempotent: re-registering the same identity
    /// (name plus signature) is a no-op.
    pub fn register(&mut self, format: Format) -> Arc<Format> {
        if let Some(existing) = self
            .formats
            .iter()
            .find(|f| f.name == format.name && f.signature == format.signature)
        {
            return Arc::clone(existing);
        }
        let format = Arc::new(format);
        self.formats.push(Arc::clone(&format));
        format
    }

    pub fn formats(&self) -> impl Iterator<Item = &Arc<Format>> {
        self.formats.iter()
    }

    pub fn format(&self, name: &str) -> Option<&Arc<Format>> {
        self.formats.iter().find(|f| f.name == name)
    }

    /// A fresh, empty graph for building a file of `format` from scratch.
    pub fn new_graph(&self, format: &str) -> Result<Graph> {
        let format = self
            .format(format)
            .ok_or_else(|| Error::UnsupportedVersion(format!("no format named '{format}'")))?;
        Ok(Graph::new(Arc::clone(format)))
    }

    /// Opens a stream: inflates gzip wrapping if present, probes the
    /// registered signatures in order, and loads the matching format.
    /// Either a complete graph comes back or nothing does.
    pub fn open<R: Read>(&self, mut data: R) -> Result<Graph> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes).map_err(Error::from)?;

        if bytes.starts_with(&[0x1f, 0x8b]) {
            tracing::debug!("inflating gzip-wrapped stream");
            let mut decoder = libflate::gzip::Decoder::new(&bytes[..])?;
            let mut inflated = Vec::new();
            decoder.read_to_end(&mut inflated).map_err(Error::from)?;
            bytes = inflated;
        }

        let format = self
            .formats
            .iter()
            .find(|f| bytes.starts_with(&f.signature))
            .ok_or_else(|| {
                Error::UnsupportedVersion("stream matches no registered format".into())
            })?;

        Graph::load(&bytes[..], Arc::clone(format))
    }

    pub fn open_path<P: AsRef<Path>>(&self, path: P) -> Result<Graph> {
        let file = std::fs::File::open(path).map_err(Error::from)?;
        self.open(std::io::BufReader::new(file))
    }

    /// Saves `graph` with the format it was opened (or created) with.
    pub fn save<W: std::io::Write>(&self, graph: &Graph, out: W) -> Result<()> {
        graph.save(out)
    }

    pub fn save_path<P: AsRef<Path>>(&self, graph: &Graph, path: P) -> Result<()> {
        let file = std::fs::File::create(path).map_err(Error::from)?;
        graph.save(std::io::BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SCHEMA: &str = r#"
        <schema>
          <basic name="u16" size="2" kind="uint" />
          <compound name="Root">
            <field name="width" type="u16" />
            <field name="height" type="u16" />
          </compound>
        </schema>"#;

    fn registry() -> Registry {
        let schema = Arc::new(Schema::parse(SCHEMA).unwrap());
        let mut registry = Registry::new();
        registry.register(Format::flat_root("demo", b"DEMO", schema, "Root"));
        registry
    }

    #[test]
    fn register_is_idempotent() {
        let schema = Arc::new(Schema::parse(SCHEMA).unwrap());
        let mut registry = Registry::new();
        registry.register(Format::flat_root("demo", b"DEMO", Arc::clone(&schema), "Root"));
        registry.register(Format::flat_root("demo", b"DEMO", schema, "Root"));
        assert_eq!(registry.formats().count(), 1);
    }

    #[test]
    fn probe_rejects_unknown_signature() {
        let registry = registry();
        let err = registry.open(&b"NOPE\x01\x02\x03\x04"[..]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(_)));
    }

    #[test]
    fn open_reads_a_flat_stream() {
        let registry = registry();
        let graph = registry.open(&b"DEMO\x02\x00\x03\x00"[..]).unwrap();
        assert_eq!(graph.block_count(), 1);
        let root = graph.block(graph.roots()[0]).unwrap();
        assert_eq!(root.get_int("width"), Some(2));
        assert_eq!(root.get_int("height"), Some(3));
    }

    #[test]
    fn gzip_wrapped_streams_inflate_before_probing() {
        let registry = registry();
        let mut encoder = libflate::gzip::Encoder::new(Vec::new()).unwrap();
        encoder.write_all(b"DEMO\x02\x00\x03\x00").unwrap();
        let compressed = encoder.finish().into_result().unwrap();

        let graph = registry.open(&compressed[..]).unwrap();
        assert_eq!(graph.block(graph.roots()[0]).unwrap().get_int("width"), Some(2));
    }

    #[test]
    fn flat_round_trip_is_byte_exact() {
        let registry = registry();
        let bytes = b"DEMO\x02\x00\x03\x00".to_vec();
        let graph = registry.open(&bytes[..]).unwrap();
        assert_eq!(graph.save_bytes().unwrap(), bytes);
    }
}
