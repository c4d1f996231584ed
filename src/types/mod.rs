use serde::{Deserialize, Serialize};

/// Stable identifier for a tensor inside one graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

impl TensorId {
    /// Sentinel for an absent optional input slot (the IR's id `-1`),
    /// e.g. a convolution without bias. Ignored by readiness checks.
    pub const PLACEHOLDER: TensorId = TensorId(u32::MAX);

    pub fn is_placeholder(self) -> bool {
        self == Self::PLACEHOLDER
    }
}

/// Stable identifier for an operation inside one graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub usize);

/// Gap pixels between adjacent sample tiles, one entry per fused axis
/// (W first, then H).
pub type Gap = [usize; 2];
