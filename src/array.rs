//! Arrays: schemas, fragments, and per-open in-memory state.

pub mod domain;
pub mod fragment;
pub mod open_array;
pub mod schema;

pub use domain::NonEmptyDomain;
pub use fragment::{FragmentInfo, FragmentMetadata};
pub use open_array::{OpenArray, OpenMode};
pub use schema::{ArraySchema, Datatype};
