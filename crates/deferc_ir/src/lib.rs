//! Arena-allocated IR graphs for deferred compilation.
//!
//! Nodes live in a `Vec` and refer to each other through [`NodeId`] indices, so
//! graphs with back-edges need no reference counting and can be serialized by
//! walking the arena in index order.

pub mod equality;
pub mod graph;
pub mod node;
pub mod object;

pub use equality::first_difference;
pub use graph::Graph;
pub use node::{
    ArithOp, CallKind, Constant, DeoptReason, FrameStateData, InvokeData, Node, NodeId, NodeKind,
};
pub use object::{HeapObject, HeapValue, ObjectRef};
