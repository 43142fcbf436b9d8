use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::eth_spec::{Gwei, Slot, ValidatorIndex};

/// The parts of a beacon block this system cares about. A missed slot is
/// represented by the absence of a summary (a cached tombstone), never by
/// a partially-filled one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    /// Absent for pre-Bellatrix blocks.
    pub exec_block_number: Option<u64>,
    pub attestations: Vec<AttestationSummary>,
    pub withdrawals: Vec<Withdrawal>,
}

/// An aggregate attestation as included in a block body. `committee_bits`
/// is present iff the block is post-Electra (EIP-7549), in which case the
/// aggregate may span several committees of the attested slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationSummary {
    pub slot: Slot,
    pub committee_index: u64,
    pub aggregation_bits: String,
    pub committee_bits: Option<String>,
}

impl AttestationSummary {
    pub fn is_electra(&self) -> bool {
        self.committee_bits.is_some()
    }
}

/// One committee assigned to attest at a slot. For a given slot the
/// committees form an ordered sequence indexed 0..C-1; membership is
/// immutable once the slot is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeSummary {
    pub slot: Slot,
    pub index: u64,
    pub validators: Vec<ValidatorIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerDuty {
    pub slot: Slot,
    pub validator_index: ValidatorIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub validator_index: ValidatorIndex,
    pub address: String,
    pub amount_gwei: Gwei,
}

/// Attestation participation recovered from one committee of one on-chain
/// aggregate. Several records may share `(slot, committee_index)` when the
/// same committee was re-aggregated into multiple inclusion blocks; the
/// reconciler unions them on that join key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionRecord {
    pub slot: Slot,
    pub inclusion_slot: Slot,
    pub committee_index: u64,
    pub attesting_indices: BTreeSet<ValidatorIndex>,
}
