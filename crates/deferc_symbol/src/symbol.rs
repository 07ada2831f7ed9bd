//! A simple interned-by-value name used for owners, methods and signatures.

use core::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// An encoded representation of an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The last `.`-separated segment, e.g. `Map` for `java.util.Map`.
    #[inline]
    pub fn short(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl Display for Symbol {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    #[inline]
    fn from(val: &str) -> Self {
        Self(val.to_owned())
    }
}

impl From<String> for Symbol {
    #[inline]
    fn from(val: String) -> Self {
        Self(val)
    }
}
