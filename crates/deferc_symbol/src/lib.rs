//! Method identities shared by every stage of the deferred-compilation build.

pub mod registry;
pub mod symbol;

pub use crate::registry::{Method, MethodFlags, MethodId, MethodTable};
pub use crate::symbol::Symbol;
