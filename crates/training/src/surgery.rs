//! Which variables a restore fills in, and which keep training afterwards.

use models::VariableId;
use std::collections::BTreeSet;
use stereo_dataset::named_enum;

named_enum!(
    CascadePolicy, "cascade_policy", {
        /// Restore what matches, then train everything.
        FineTuneAll => "fine-tune-all",
        /// Freeze restored variables; train only the new ones.
        Cascade => "cascade",
        /// Extend like `cascade` but keep training the restored variables too.
        CascadeCross => "cascade-cross",
    }
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    /// Variables copied from the checkpoint, in current-inventory order.
    pub restore: Vec<VariableId>,
    /// Variables the optimizer updates, in current-inventory order.
    pub optimize: Vec<VariableId>,
}

impl RestorePlan {
    /// No checkpoint: nothing restored, everything trained.
    pub fn fresh(current: &[VariableId]) -> Self {
        Self {
            restore: Vec::new(),
            optimize: current.to_vec(),
        }
    }
}

/// `restore = current ∩ checkpoint` by identity equality. Under
/// `Cascade`, only `current \ restore` is optimized; otherwise all of `current`.
pub fn plan_restore(
    checkpoint: &[VariableId],
    current: &[VariableId],
    policy: CascadePolicy,
) -> RestorePlan {
    let stored: BTreeSet<&VariableId> = checkpoint.iter().collect();
    let restore: Vec<VariableId> = current
        .iter()
        .filter(|id| stored.contains(id))
        .cloned()
        .collect();
    let optimize = match policy {
        CascadePolicy::Cascade => current
            .iter()
            .filter(|id| !stored.contains(id))
            .cloned()
            .collect(),
        CascadePolicy::FineTuneAll | CascadePolicy::CascadeCross => current.to_vec(),
    };
    RestorePlan { restore, optimize }
}
