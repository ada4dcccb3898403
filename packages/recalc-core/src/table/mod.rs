//! Table schema, field definitions, and link relations.

mod field;
mod record;
mod relation;
#[allow(clippy::module_inception)]
mod table;
pub(crate) mod validation;

pub use field::{Field, FieldBuilder, FieldKind, FieldSpec};
pub use record::Record;
pub use relation::{LinkOptions, Relationship, ID_COLUMN};
pub use table::{Row, TableData, TableMeta};
