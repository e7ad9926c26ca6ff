//! Absolute size ceiling

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClampOutcome {
    /// The proposed size is within the ceiling
    Allowed(u64),
    /// The proposed size was reduced to the ceiling
    Capped(u64),
    /// The volume is already at the ceiling; nothing to request
    AtLimit(u64),
}

impl ClampOutcome {
    /// Final size and whether the ceiling interfered
    pub fn into_parts(self) -> (u64, bool) {
        match self {
            ClampOutcome::Allowed(size) => (size, false),
            ClampOutcome::Capped(size) | ClampOutcome::AtLimit(size) => (size, true),
        }
    }
}

/// Clamp `proposed` to `max_size`.
///
/// Total: every input yields an outcome.
pub fn clamp(proposed: u64, committed: u64, max_size: Option<u64>) -> ClampOutcome {
    let Some(max) = max_size else {
        return ClampOutcome::Allowed(proposed);
    };
    if committed >= max {
        return ClampOutcome::AtLimit(committed);
    }
    if proposed > max {
        ClampOutcome::Capped(max)
    } else {
        ClampOutcome::Allowed(proposed)
    }
}
