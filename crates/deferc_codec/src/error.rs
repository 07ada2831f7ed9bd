use thiserror::Error;

/// Errors raised while building the object table or encoding/decoding graphs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("object table is frozen; no new entries may be added")]
    TableFrozen,

    #[error("object table must be frozen before graphs are encoded")]
    TableNotFrozen,

    #[error("{0} was not registered while preparing the object table")]
    MissingObject(String),

    #[error("object id {0} is out of range")]
    BadObjectId(u32),

    #[error("object id {id} is not a {expected}")]
    WrongObjectKind { id: u32, expected: &'static str },

    #[error("unexpected end of encoding at offset {0}")]
    Truncated(usize),

    #[error("unknown {what} tag {tag} at offset {offset}")]
    UnknownTag {
        what: &'static str,
        tag: u8,
        offset: usize,
    },

    #[error("invalid order-id width {0}")]
    BadWidth(u8),

    #[error("order id {id} at offset {offset} does not name a node")]
    BadOrderId { id: u32, offset: usize },

    #[error("graph at offset {0} does not begin with a start node")]
    MissingStart(usize),

    #[error("varint at offset {0} overflows")]
    Overflow(usize),
}
