//! Structured document content: the interchange tree, its markup form, and
//! conversion into and out of a replicated document.

pub mod convert;
pub mod markup;
pub mod node;

pub use convert::{export_from, import_into, import_nodes};
pub use markup::{parse_markup, to_markup};
pub use node::{normalize, AttrValue, Mark, Node};
