//! Position-independent graph encoding.
//!
//! Graphs are written into one shared byte buffer. Heap objects and methods are
//! never written inline; they go into an [`ObjectTable`] and the buffer refers
//! to them by table id, so the buffer can live in read-only data.

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod replace;
pub mod stream;
pub mod table;

pub use decoder::GraphDecoder;
pub use encoder::{EncodedArtifact, GraphEncoder, SharedGraphEncoder};
pub use error::CodecError;
pub use replace::{IdentityReplacer, ObjectReplacer, ShadowHeap};
pub use stream::{TypeReader, TypeWriter};
pub use table::{ObjectTable, TableObject};
