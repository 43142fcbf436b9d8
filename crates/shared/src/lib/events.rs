use serde::Serialize;

use crate::eth_spec::{Gwei, Slot, ValidatorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WithdrawalEntry {
    pub validator: ValidatorIndex,
    pub amount_gwei: Gwei,
    pub slot: Slot,
}

/// Events the core hands to the notification sink. Attestation inclusions
/// are tracked internally; only misses surface, batched per label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Event {
    BlockProposed {
        validator: ValidatorIndex,
        label: String,
        slot: Slot,
        exec_block_number: Option<u64>,
    },
    BlockMissed {
        validator: ValidatorIndex,
        label: String,
        slot: Slot,
    },
    /// Parallel arrays: `validators[i]` missed its duty at `slots[i]`.
    AttestationMissed {
        label: String,
        validators: Vec<ValidatorIndex>,
        slots: Vec<Slot>,
    },
    WithdrawalsBatched {
        label: String,
        entries: Vec<WithdrawalEntry>,
        total_gwei: Gwei,
    },
    NodeStale {
        slots_behind: u64,
    },
    InternalError {
        message: String,
        batch_range: Option<(Slot, Slot)>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BlockProposed { .. } => "block_proposed",
            Self::BlockMissed { .. } => "block_missed",
            Self::AttestationMissed { .. } => "attestation_missed",
            Self::WithdrawalsBatched { .. } => "withdrawals_batched",
            Self::NodeStale { .. } => "node_stale",
            Self::InternalError { .. } => "internal_error",
        }
    }

    /// Categories subject to the process-wide notification rate limit.
    pub fn rate_limit_category(&self) -> Option<&'static str> {
        match self {
            Self::NodeStale { .. } | Self::InternalError { .. } => Some(self.kind()),
            _ => None,
        }
    }
}
