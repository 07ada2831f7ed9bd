use serde::{Deserialize, Serialize};

/// The alternate compiled representations of one source method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VariantKind {
    /// The ahead-of-time compiled body.
    Original = 0,

    /// The representation compiled again at run time, with speculation.
    Deferred = 1,

    /// The trustworthy body a deferred method deoptimizes into.
    DeoptTarget = 2,
}

impl VariantKind {
    pub const ALL: [VariantKind; 3] = [
        VariantKind::Original,
        VariantKind::Deferred,
        VariantKind::DeoptTarget,
    ];

    /// Whether a caller in this variant may call a callee in `callee`.
    pub fn may_call(self, callee: VariantKind) -> bool {
        match self {
            VariantKind::Original | VariantKind::Deferred => true,
            VariantKind::DeoptTarget => callee == VariantKind::Original,
        }
    }

    /// Whether a frame in this variant may be returned into from a callee in `callee`.
    pub fn may_be_returned_into_from(self, callee: VariantKind) -> bool {
        match self {
            VariantKind::Original | VariantKind::DeoptTarget => true,
            VariantKind::Deferred => {
                matches!(callee, VariantKind::Deferred | VariantKind::Original)
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VariantKind::Original => "Original",
            VariantKind::Deferred => "Deferred",
            VariantKind::DeoptTarget => "DeoptTarget",
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(VariantKind::Original),
            1 => Some(VariantKind::Deferred),
            2 => Some(VariantKind::DeoptTarget),
            _ => None,
        }
    }
}

impl std::fmt::Display for VariantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_matrix() {
        use VariantKind::*;
        for callee in VariantKind::ALL {
            assert!(Original.may_call(callee));
            assert!(Deferred.may_call(callee));
        }
        assert!(DeoptTarget.may_call(Original));
        assert!(!DeoptTarget.may_call(Deferred));
        assert!(!DeoptTarget.may_call(DeoptTarget));
    }

    #[test]
    fn return_matrix() {
        use VariantKind::*;
        for callee in VariantKind::ALL {
            assert!(Original.may_be_returned_into_from(callee));
            assert!(DeoptTarget.may_be_returned_into_from(callee));
        }
        assert!(Deferred.may_be_returned_into_from(Deferred));
        assert!(Deferred.may_be_returned_into_from(Original));
        assert!(!Deferred.may_be_returned_into_from(DeoptTarget));
    }
}
