//! # Blockform - schema-driven block-structured binary files
//!
//! ## Example
//!
//! ```ignore
//! use blockform::{Registry, Format, Schema, walk, Order};
//! use std::sync::Arc;
//!
//! /// Prints the name of every node in a scene file
//! fn main() {
//!     let schema = Arc::new(Schema::parse(include_str!("scene.xml")).unwrap());
//!     let mut registry = Registry::new();
//!     registry.register(Format::block_table("scene", b"SCN\x01", schema, 0, u32::MAX));
//!
//!     let graph = registry.open_path("model.scn").unwrap();
//!     for id in walk(&graph, Order::Pre, false) {
//!         let name = graph.block(id).and_then(|b| b.get_str("name").map(str::to_owned));
//!         println!("{} {:?}", graph.type_name(id).unwrap(), name);
//!     }
//! }
//! ```
//!
//! ## The file model
//!
//! The formats this crate targets share one shape: a signature, a pair of
//! version integers, and a flat list of typed records ("blocks") that point
//! at each other by index, forming a graph. What each block looks like is
//! not hard-coded anywhere - it comes from a declarative schema document
//! that names every struct ("compound"), its fields, which file versions
//! each field exists in, and how array lengths derive from earlier fields.
//! The engine interprets that description at load time: there is no code
//! generation and no recompiling when a format gains a field.
//!
//! Links between blocks come in two strengths. A `ref` expresses
//! containment: the target belongs to whoever holds the ref, and saving
//! walks refs depth-first to decide which blocks exist and in what order.
//! A `ptr` is a weak back-reference: it never keeps its target alive, and
//! it is the sanctioned way to express cycles (a child pointing back at
//! its parent) without breaking the ownership story.
//!
//! ## This crate
//!
//! [`Schema::parse`] compiles a description. A [`Registry`] maps
//! signatures to [`Format`]s; [`Registry::open`] probes them in order and
//! loads a [`Graph`] - or fails without exposing half a file. Blocks are
//! dynamic [`Instance`]s keyed by field name, addressed by [`BlockId`].
//! [`walk`]/[`find`] iterate the graph lazily with visit-once semantics;
//! [`replace`], [`insert_parent`] and [`remove`] edit its structure while
//! keeping every link consistent.
//!
//! Saving re-emits bytes deterministically: for a graph loaded without
//! warnings, saving with the original versions reproduces the input
//! byte for byte. Blocks no strong link can reach are dropped, weak links
//! left dangling by edits null out, and everything else is renumbered
//! depth-first.
//!
//! ## Warnings
//!
//! Real-world files bend their formats. Where tolerance is safe the loader
//! accumulates warnings instead of failing: unknown enum values round-trip
//! untouched, trailing bytes after the last block are ignored. Anything
//! structural - a link pointing at the wrong block type, a version no
//! format covers, a block table that disagrees with its header - aborts
//! the load.
//!
//! Graphs are single-owner and not synchronized; share a [`Schema`] or a
//! [`Registry`] across threads instead, both are immutable once built.

pub mod codec;
pub mod error;
pub mod graph;
pub mod registry;
pub mod schema;
pub mod stream;
pub mod value;
pub mod walk;

pub use codec::Endianness;
pub use error::{Diagnostic, Error, Result};
pub use graph::{BlockId, Graph};
pub use registry::{Format, Framing, Registry};
pub use schema::{parse_version, Schema};
pub use value::{Instance, Slot, Value};
pub use walk::{find, insert_parent, remove, replace, walk, Order, Walk};
