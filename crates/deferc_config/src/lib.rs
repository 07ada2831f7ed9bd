pub mod variant;

pub use crate::variant::VariantKind;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for option 'max-methods': '{0}' is not a valid number")]
    InvalidMethodBudget(String),
}

/// Limits for inlining while graphs for deferred compilation are parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InliningConfig {
    /// Depth up to which trivial callees are inlined without a budget
    pub trivial_max_depth: u32,

    /// Largest callee, in IR nodes, still considered trivial
    pub trivial_max_nodes: u32,

    /// Maximum depth of accumulative inlining
    pub allowed_depth: u32,

    /// Node budget shared by one accumulative call chain
    pub allowed_nodes: u32,

    /// Budget on calls left un-inlined inside inlined callees
    pub allowed_invokes: u32,
}

impl Default for InliningConfig {
    fn default() -> Self {
        Self {
            trivial_max_depth: 10,
            trivial_max_nodes: 20,
            allowed_depth: 20,
            allowed_nodes: 100,
            allowed_invokes: 8,
        }
    }
}

/// Which variant the externally registered compilation roots start in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RootVariant {
    /// Roots are only parsed to report their call edges. Original code links
    /// a Deferred variant only for calls into registered roots, so a build
    /// with Original roots compiles no Deferred methods.
    Original,
    #[default]
    Deferred,
}

impl RootVariant {
    pub fn kind(self) -> VariantKind {
        match self {
            RootVariant::Original => VariantKind::Original,
            RootVariant::Deferred => VariantKind::Deferred,
        }
    }
}

/// Configuration for one deferred-compilation build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Maximum number of methods compiled in the Deferred variant (0 = unlimited)
    pub max_methods: usize,

    /// Turn a budget overrun into a fatal error instead of a warning
    pub enforce_max_methods: bool,

    /// Dump the call tree after the fixpoint
    pub print_call_tree: bool,

    /// Dump every discovered candidate edge, pruned ones included
    pub print_candidates: bool,

    /// Dump the sorted list of Deferred methods
    pub print_methods: bool,

    /// Variant of the root call-tree nodes; see [`RootVariant::Original`]
    pub root_variant: RootVariant,

    /// Decode each encoded graph again and compare it to the original
    pub verify_encoding: bool,

    /// Upper bound on outer call-tree passes
    pub max_passes: u32,

    pub inlining: InliningConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_methods: 0,
            enforce_max_methods: false,
            print_call_tree: false,
            print_candidates: false,
            print_methods: false,
            root_variant: RootVariant::default(),
            verify_encoding: false,
            max_passes: 16,
            inlining: InliningConfig::default(),
        }
    }
}

fn env_flag(name: &str, default: bool) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|val| val.parse().unwrap_or(default))
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

impl BuildConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().merge_with_env()
    }

    /// Override fields with any `DEFERC_*` variables that are set
    pub fn merge_with_env(mut self) -> Self {
        if let Ok(val) = std::env::var("DEFERC_MAX_METHODS") {
            let values: Vec<&str> = val.split(',').collect();
            if let Ok(max) = parse_max_methods(&values) {
                self.max_methods = max;
            }
        }
        if let Some(val) = env_flag("DEFERC_ENFORCE_MAX_METHODS", true) {
            self.enforce_max_methods = val;
        }
        if let Some(val) = env_flag("DEFERC_PRINT_CALL_TREE", true) {
            self.print_call_tree = val;
        }
        if let Some(val) = env_flag("DEFERC_PRINT_CANDIDATES", true) {
            self.print_candidates = val;
        }
        if let Some(val) = env_flag("DEFERC_PRINT_METHODS", true) {
            self.print_methods = val;
        }
        if let Some(val) = env_flag("DEFERC_VERIFY_ENCODING", true) {
            self.verify_encoding = val;
        }
        if let Some(val) = env_u32("DEFERC_MAX_PASSES") {
            self.max_passes = val;
        }
        if let Some(val) = env_u32("DEFERC_INLINE_TRIVIAL_DEPTH") {
            self.inlining.trivial_max_depth = val;
        }
        if let Some(val) = env_u32("DEFERC_INLINE_ALLOWED_DEPTH") {
            self.inlining.allowed_depth = val;
        }
        if let Some(val) = env_u32("DEFERC_INLINE_ALLOWED_NODES") {
            self.inlining.allowed_nodes = val;
        }
        self
    }

    /// Load configuration from a TOML file
    #[cfg(feature = "toml-config")]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BuildConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a TOML file (stub when the toml feature is disabled)
    #[cfg(not(feature = "toml-config"))]
    pub fn from_file(_path: &Path) -> anyhow::Result<Self> {
        anyhow::bail!("TOML support not enabled. Enable the 'toml-config' feature.")
    }

    /// Whether `count` Deferred methods exceed a non-zero budget
    pub fn exceeds_budget(&self, count: usize) -> bool {
        self.max_methods != 0 && count > self.max_methods
    }
}

/// Sum budget values, each optionally followed by a `#comment`.
pub fn parse_max_methods<S: AsRef<str>>(values: &[S]) -> Result<usize, ConfigError> {
    let mut total = 0usize;
    for value in values {
        let number = value.as_ref().split('#').next().unwrap_or_default().trim();
        if number.is_empty() {
            continue;
        }
        let parsed: usize = number
            .parse()
            .map_err(|_| ConfigError::InvalidMethodBudget(number.to_string()))?;
        total = total.saturating_add(parsed);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_values_are_summed_and_comments_stripped() {
        assert_eq!(parse_max_methods(&["100#core", "20 # extras"]), Ok(120));
        assert_eq!(parse_max_methods::<&str>(&[]), Ok(0));
        assert_eq!(
            parse_max_methods(&["ten"]),
            Err(ConfigError::InvalidMethodBudget("ten".to_string()))
        );
    }

    #[test]
    fn zero_budget_is_unlimited() {
        let config = BuildConfig::default();
        assert!(!config.exceeds_budget(1_000_000));

        let config = BuildConfig {
            max_methods: 2,
            ..BuildConfig::default()
        };
        assert!(!config.exceeds_budget(2));
        assert!(config.exceeds_budget(3));
    }

    #[test]
    fn root_variant_maps_to_kind() {
        assert_eq!(RootVariant::default().kind(), VariantKind::Deferred);
        assert_eq!(RootVariant::Original.kind(), VariantKind::Original);
    }
}
