pub mod error;
pub mod object;
pub mod tsid;

pub use error::{CacheError, Result};
pub use object::{EntityRef, GameObject, ObjectMetadata};
pub use tsid::{EntityKind, Tsid, is_valid_tsid};
