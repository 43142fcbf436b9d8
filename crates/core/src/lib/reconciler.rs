//! Joins proposer duties, committee assignments, attestation inclusions
//! and withdrawals for one batch of finalized slots into typed outcomes.
//!
//! This layer is pure: it runs over pre-fetched inputs and never performs
//! I/O or fails the batch. Undecodable attestations are discarded and
//! counted; slots without committee data are skipped and reported.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use beacon_duty_watch_shared::beacon::{BlockSummary, CommitteeSummary, ProposerDuty};
use beacon_duty_watch_shared::bitfields;
use beacon_duty_watch_shared::eth_spec::{Gwei, Slot, ValidatorIndex, INCLUSION_WINDOW_SLOTS};
use beacon_duty_watch_shared::events::{Event, WithdrawalEntry};
use beacon_duty_watch_shared::validators::MonitoredValidators;

/// A batch of slots `(begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub begin: Slot,
    pub end: Slot,
}

impl BatchRange {
    pub fn slots(&self) -> impl Iterator<Item = Slot> {
        self.begin + 1..=self.end
    }

    pub fn contains(&self, slot: Slot) -> bool {
        slot > self.begin && slot <= self.end
    }

    /// Last slot whose block can still include an attestation for this
    /// batch; committee pre-fetch and block fetch both extend to it.
    pub fn inclusion_end(&self) -> Slot {
        self.end + INCLUSION_WINDOW_SLOTS
    }
}

impl std::fmt::Display for BatchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}]", self.begin, self.end)
    }
}

pub struct BatchInputs {
    pub range: BatchRange,
    /// Duties across the epochs covering the batch; may include slots
    /// outside the range and unmonitored validators.
    pub duties: Vec<ProposerDuty>,
    /// Committee lists per slot; a missing batch slot means the slot is
    /// skipped this batch.
    pub committees: HashMap<Slot, Arc<Vec<CommitteeSummary>>>,
    /// Blocks for `(begin, end + 32]`; `None` is a missed-slot tombstone.
    pub blocks: HashMap<Slot, Option<Arc<BlockSummary>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposerOutcome {
    pub slot: Slot,
    pub validator: ValidatorIndex,
    pub proposed: bool,
    pub exec_block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestationOutcome {
    pub slot: Slot,
    pub validator: ValidatorIndex,
    pub included: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelWithdrawals {
    pub entries: Vec<WithdrawalEntry>,
    pub total_gwei: Gwei,
}

pub struct BatchReport {
    pub range: BatchRange,
    /// Ascending slot.
    pub proposer_outcomes: Vec<ProposerOutcome>,
    /// Ascending `(slot, validator)`; exactly one entry per monitored
    /// committee membership in the batch.
    pub attestation_outcomes: Vec<AttestationOutcome>,
    pub withdrawals: BTreeMap<String, LabelWithdrawals>,
    pub skipped_slots: Vec<Slot>,
    pub decode_errors: u64,
}

impl BatchReport {
    pub fn attestations_included(&self) -> usize {
        self.attestation_outcomes.iter().filter(|o| o.included).count()
    }

    /// Proposed blocks carrying an execution payload, for the MEV-reward
    /// enrichment.
    pub fn proposed_with_exec_block(&self) -> impl Iterator<Item = &ProposerOutcome> {
        self.proposer_outcomes
            .iter()
            .filter(|o| o.proposed && o.exec_block_number.is_some())
    }

    /// Renders the externally visible events in their delivery order:
    /// proposer outcomes by slot, then per-label attestation misses, then
    /// per-label withdrawal batches. Attestation inclusions stay internal.
    pub fn to_events(&self, monitored: &MonitoredValidators) -> Vec<Event> {
        let label_for = |validator: ValidatorIndex| {
            monitored
                .label_of(validator)
                .unwrap_or("unmonitored")
                .to_owned()
        };

        let mut events = Vec::new();
        for outcome in &self.proposer_outcomes {
            events.push(if outcome.proposed {
                Event::BlockProposed {
                    validator: outcome.validator,
                    label: label_for(outcome.validator),
                    slot: outcome.slot,
                    exec_block_number: outcome.exec_block_number,
                }
            } else {
                Event::BlockMissed {
                    validator: outcome.validator,
                    label: label_for(outcome.validator),
                    slot: outcome.slot,
                }
            });
        }

        let mut missed_by_label: BTreeMap<String, (Vec<ValidatorIndex>, Vec<Slot>)> =
            BTreeMap::new();
        for outcome in self.attestation_outcomes.iter().filter(|o| !o.included) {
            let (validators, slots) = missed_by_label
                .entry(label_for(outcome.validator))
                .or_default();
            validators.push(outcome.validator);
            slots.push(outcome.slot);
        }
        for (label, (validators, slots)) in missed_by_label {
            events.push(Event::AttestationMissed {
                label,
                validators,
                slots,
            });
        }

        for (label, aggregate) in &self.withdrawals {
            events.push(Event::WithdrawalsBatched {
                label: label.clone(),
                entries: aggregate.entries.clone(),
                total_gwei: aggregate.total_gwei,
            });
        }

        events
    }
}

pub fn reconcile_batch(inputs: &BatchInputs, monitored: &MonitoredValidators) -> BatchReport {
    let mut report = BatchReport {
        range: inputs.range,
        proposer_outcomes: Vec::new(),
        attestation_outcomes: Vec::new(),
        withdrawals: BTreeMap::new(),
        skipped_slots: Vec::new(),
        decode_errors: 0,
    };

    reconcile_proposals(inputs, monitored, &mut report);
    reconcile_attestations(inputs, monitored, &mut report);
    reconcile_withdrawals(inputs, monitored, &mut report);
    report
}

fn reconcile_proposals(
    inputs: &BatchInputs,
    monitored: &MonitoredValidators,
    report: &mut BatchReport,
) {
    let mut duties: Vec<&ProposerDuty> = inputs
        .duties
        .iter()
        .filter(|duty| inputs.range.contains(duty.slot) && monitored.contains(duty.validator_index))
        .collect();
    duties.sort_by_key(|duty| duty.slot);

    for duty in duties {
        let outcome = match inputs.blocks.get(&duty.slot) {
            Some(Some(block)) if block.proposer_index == duty.validator_index => ProposerOutcome {
                slot: duty.slot,
                validator: duty.validator_index,
                proposed: true,
                exec_block_number: block.exec_block_number,
            },
            Some(Some(block)) => {
                // precluded by the safe-slot margin; would mean a reorg
                // the node has not exposed as canonical
                tracing::warn!(
                    slot = duty.slot,
                    expected = duty.validator_index,
                    actual = block.proposer_index,
                    "Block proposer differs from assigned duty"
                );
                ProposerOutcome {
                    slot: duty.slot,
                    validator: duty.validator_index,
                    proposed: false,
                    exec_block_number: None,
                }
            }
            _ => ProposerOutcome {
                slot: duty.slot,
                validator: duty.validator_index,
                proposed: false,
                exec_block_number: None,
            },
        };
        report.proposer_outcomes.push(outcome);
    }
}

fn reconcile_attestations(
    inputs: &BatchInputs,
    monitored: &MonitoredValidators,
    report: &mut BatchReport,
) {
    for slot in inputs.range.slots() {
        let Some(committees) = inputs.committees.get(&slot) else {
            tracing::warn!(slot, "No committee data, skipping slot this batch");
            report.skipped_slots.push(slot);
            continue;
        };

        let monitored_in_slot: BTreeSet<ValidatorIndex> = committees
            .iter()
            .flat_map(|committee| committee.validators.iter())
            .copied()
            .filter(|validator| monitored.contains(*validator))
            .collect();
        if monitored_in_slot.is_empty() {
            continue;
        }

        let attested = scan_inclusion_window(slot, committees, inputs, report);
        for validator in monitored_in_slot {
            report.attestation_outcomes.push(AttestationOutcome {
                slot,
                validator,
                included: attested.contains(&validator),
            });
        }
    }
}

/// Walks blocks `[slot+1, slot+32]`, decoding every attestation targeting
/// `slot` and unioning participation on the `(slot, committee_index)` join
/// key; the same committee is often re-aggregated into several blocks.
fn scan_inclusion_window(
    slot: Slot,
    committees: &[CommitteeSummary],
    inputs: &BatchInputs,
    report: &mut BatchReport,
) -> BTreeSet<ValidatorIndex> {
    let mut by_committee: BTreeMap<u64, BTreeSet<ValidatorIndex>> = BTreeMap::new();
    for inclusion_slot in slot + 1..=slot + INCLUSION_WINDOW_SLOTS {
        let Some(Some(block)) = inputs.blocks.get(&inclusion_slot) else {
            continue;
        };
        for attestation in block.attestations.iter().filter(|att| att.slot == slot) {
            match bitfields::decode_attestation(attestation, committees, inclusion_slot) {
                Ok(records) => {
                    for record in records {
                        by_committee
                            .entry(record.committee_index)
                            .or_default()
                            .extend(record.attesting_indices);
                    }
                }
                Err(e) => {
                    report.decode_errors += 1;
                    tracing::warn!(
                        slot,
                        inclusion_slot,
                        "Discarding undecodable attestation: {e}"
                    );
                }
            }
        }
    }
    by_committee.into_values().flatten().collect()
}

fn reconcile_withdrawals(
    inputs: &BatchInputs,
    monitored: &MonitoredValidators,
    report: &mut BatchReport,
) {
    for slot in inputs.range.slots() {
        let Some(Some(block)) = inputs.blocks.get(&slot) else {
            continue;
        };
        for withdrawal in &block.withdrawals {
            let Some(label) = monitored.label_of(withdrawal.validator_index) else {
                continue;
            };
            let aggregate = report.withdrawals.entry(label.to_owned()).or_default();
            aggregate.entries.push(WithdrawalEntry {
                validator: withdrawal.validator_index,
                amount_gwei: withdrawal.amount_gwei,
                slot,
            });
            aggregate.total_gwei = aggregate.total_gwei.saturating_add(withdrawal.amount_gwei);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as StdBTreeMap;

    use beacon_duty_watch_shared::beacon::{AttestationSummary, Withdrawal};
    use beacon_duty_watch_shared::bitfields::encode_bitlist;

    use super::*;

    fn monitored(pairs: &[(&str, &[u64])]) -> MonitoredValidators {
        let groups: StdBTreeMap<String, Vec<u64>> = pairs
            .iter()
            .map(|(label, indices)| (label.to_string(), indices.to_vec()))
            .collect();
        MonitoredValidators::new(groups).unwrap()
    }

    fn committee(slot: Slot, index: u64, validators: &[u64]) -> CommitteeSummary {
        CommitteeSummary {
            slot,
            index,
            validators: validators.to_vec(),
        }
    }

    fn legacy_attestation(slot: Slot, committee_index: u64, bits: &[bool]) -> AttestationSummary {
        AttestationSummary {
            slot,
            committee_index,
            aggregation_bits: encode_bitlist(bits),
            committee_bits: None,
        }
    }

    fn block(slot: Slot, proposer: u64, attestations: Vec<AttestationSummary>) -> Arc<BlockSummary> {
        Arc::new(BlockSummary {
            slot,
            proposer_index: proposer,
            exec_block_number: Some(slot + 1000),
            attestations,
            withdrawals: Vec::new(),
        })
    }

    fn inputs(range: BatchRange) -> BatchInputs {
        BatchInputs {
            range,
            duties: Vec::new(),
            committees: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    /// Every slot of the inclusion span gets a tombstone unless a block
    /// was placed explicitly.
    fn fill_tombstones(inputs: &mut BatchInputs) {
        for slot in inputs.range.begin + 1..=inputs.range.inclusion_end() {
            inputs.blocks.entry(slot).or_insert(None);
        }
    }

    #[test]
    fn proposal_fulfilled_by_the_assigned_validator() {
        let monitored = monitored(&[("alice", &[100])]);
        let mut inputs = inputs(BatchRange { begin: 199, end: 200 });
        inputs.duties.push(ProposerDuty {
            slot: 200,
            validator_index: 100,
        });
        inputs.committees.insert(200, Arc::new(Vec::new()));
        inputs.blocks.insert(
            200,
            Some(Arc::new(BlockSummary {
                slot: 200,
                proposer_index: 100,
                exec_block_number: Some(500),
                attestations: Vec::new(),
                withdrawals: Vec::new(),
            })),
        );
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(
            report.proposer_outcomes,
            vec![ProposerOutcome {
                slot: 200,
                validator: 100,
                proposed: true,
                exec_block_number: Some(500),
            }]
        );
        assert!(report.attestation_outcomes.is_empty());
    }

    #[test]
    fn proposal_missed_on_tombstone() {
        let monitored = monitored(&[("alice", &[100])]);
        let mut inputs = inputs(BatchRange { begin: 199, end: 200 });
        inputs.duties.push(ProposerDuty {
            slot: 200,
            validator_index: 100,
        });
        inputs.committees.insert(200, Arc::new(Vec::new()));
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(
            report.proposer_outcomes,
            vec![ProposerOutcome {
                slot: 200,
                validator: 100,
                proposed: false,
                exec_block_number: None,
            }]
        );
    }

    #[test]
    fn duties_outside_the_range_or_unmonitored_are_ignored() {
        let monitored = monitored(&[("alice", &[100])]);
        let mut inputs = inputs(BatchRange { begin: 199, end: 200 });
        inputs.duties.push(ProposerDuty {
            slot: 201, // next batch
            validator_index: 100,
        });
        inputs.duties.push(ProposerDuty {
            slot: 200,
            validator_index: 555, // not ours
        });
        inputs.committees.insert(200, Arc::new(Vec::new()));
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert!(report.proposer_outcomes.is_empty());
    }

    #[test]
    fn legacy_attestation_splits_committee_into_included_and_missed() {
        let monitored = monitored(&[("alice", &[100, 300, 400])]);
        let mut inputs = inputs(BatchRange { begin: 299, end: 300 });
        inputs.committees.insert(
            300,
            Arc::new(vec![committee(300, 2, &[100, 200, 300, 400])]),
        );
        // 0x1b: data bits 1,1,0,1
        inputs.blocks.insert(
            305,
            Some(block(
                305,
                9,
                vec![AttestationSummary {
                    slot: 300,
                    committee_index: 2,
                    aggregation_bits: "0x1b".to_owned(),
                    committee_bits: None,
                }],
            )),
        );
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(
            report.attestation_outcomes,
            vec![
                AttestationOutcome { slot: 300, validator: 100, included: true },
                AttestationOutcome { slot: 300, validator: 300, included: false },
                AttestationOutcome { slot: 300, validator: 400, included: true },
            ]
        );
    }

    #[test]
    fn electra_aggregate_attributes_per_committee() {
        let monitored = monitored(&[("alice", &[11, 12, 31, 32])]);
        let mut inputs = inputs(BatchRange { begin: 399, end: 400 });
        inputs.committees.insert(
            400,
            Arc::new(vec![
                committee(400, 0, &[1, 2]),
                committee(400, 1, &[11, 12]),
                committee(400, 2, &[21, 22, 23]),
                committee(400, 3, &[31, 32]),
            ]),
        );
        inputs.blocks.insert(
            403,
            Some(block(
                403,
                9,
                vec![AttestationSummary {
                    slot: 400,
                    committee_index: 0,
                    aggregation_bits: "0x17".to_owned(), // data 1,1,1,0
                    committee_bits: Some("0x0a".to_owned()), // committees 1 and 3
                }],
            )),
        );
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(
            report.attestation_outcomes,
            vec![
                AttestationOutcome { slot: 400, validator: 11, included: true },
                AttestationOutcome { slot: 400, validator: 12, included: true },
                AttestationOutcome { slot: 400, validator: 31, included: true },
                AttestationOutcome { slot: 400, validator: 32, included: false },
            ]
        );
    }

    #[test]
    fn inclusion_counts_at_window_edge_but_not_past_it() {
        let monitored = monitored(&[("alice", &[100, 200])]);
        let mut inputs = inputs(BatchRange { begin: 99, end: 100 });
        inputs
            .committees
            .insert(100, Arc::new(vec![committee(100, 0, &[100, 200])]));
        // validator 100 attested, included exactly at s+32
        inputs.blocks.insert(
            132,
            Some(block(132, 9, vec![legacy_attestation(100, 0, &[true, false])])),
        );
        fill_tombstones(&mut inputs);
        // validator 200's attestation only lands at s+33, outside the window
        inputs.blocks.insert(
            133,
            Some(block(133, 9, vec![legacy_attestation(100, 0, &[false, true])])),
        );

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(
            report.attestation_outcomes,
            vec![
                AttestationOutcome { slot: 100, validator: 100, included: true },
                AttestationOutcome { slot: 100, validator: 200, included: false },
            ]
        );
    }

    #[test]
    fn reaggregated_attestations_union_on_the_join_key() {
        let monitored = monitored(&[("alice", &[1, 2, 3])]);
        let mut inputs = inputs(BatchRange { begin: 9, end: 10 });
        inputs
            .committees
            .insert(10, Arc::new(vec![committee(10, 0, &[1, 2, 3])]));
        inputs.blocks.insert(
            11,
            Some(block(11, 9, vec![legacy_attestation(10, 0, &[true, false, false])])),
        );
        inputs.blocks.insert(
            12,
            Some(block(12, 9, vec![legacy_attestation(10, 0, &[false, false, true])])),
        );
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(
            report.attestation_outcomes,
            vec![
                AttestationOutcome { slot: 10, validator: 1, included: true },
                AttestationOutcome { slot: 10, validator: 2, included: false },
                AttestationOutcome { slot: 10, validator: 3, included: true },
            ]
        );
        // exactly one outcome per (validator, slot)
        assert_eq!(report.attestation_outcomes.len(), 3);
    }

    #[test]
    fn slot_without_committee_data_is_skipped() {
        let monitored = monitored(&[("alice", &[1])]);
        let mut inputs = inputs(BatchRange { begin: 9, end: 11 });
        inputs.committees.insert(10, Arc::new(vec![committee(10, 0, &[1])]));
        // no committees for slot 11
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(report.skipped_slots, vec![11]);
        assert_eq!(report.attestation_outcomes.len(), 1);
        assert_eq!(report.attestation_outcomes[0].slot, 10);
    }

    #[test]
    fn undecodable_attestation_is_discarded_and_counted() {
        let monitored = monitored(&[("alice", &[1, 2])]);
        let mut inputs = inputs(BatchRange { begin: 9, end: 10 });
        inputs
            .committees
            .insert(10, Arc::new(vec![committee(10, 0, &[1, 2])]));
        inputs.blocks.insert(
            11,
            Some(block(
                11,
                9,
                vec![
                    AttestationSummary {
                        slot: 10,
                        committee_index: 0,
                        aggregation_bits: "0xzz".to_owned(),
                        committee_bits: None,
                    },
                    legacy_attestation(10, 0, &[true, false]),
                ],
            )),
        );
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        assert_eq!(report.decode_errors, 1);
        assert_eq!(
            report.attestation_outcomes,
            vec![
                AttestationOutcome { slot: 10, validator: 1, included: true },
                AttestationOutcome { slot: 10, validator: 2, included: false },
            ]
        );
    }

    #[test]
    fn withdrawals_accumulate_per_label() {
        let monitored = monitored(&[("alice", &[1]), ("bob", &[2])]);
        let mut inputs = inputs(BatchRange { begin: 9, end: 11 });
        inputs.committees.insert(10, Arc::new(Vec::new()));
        inputs.committees.insert(11, Arc::new(Vec::new()));
        let withdrawals_block = |slot: Slot, entries: Vec<Withdrawal>| {
            Some(Arc::new(BlockSummary {
                slot,
                proposer_index: 9,
                exec_block_number: Some(slot),
                attestations: Vec::new(),
                withdrawals: entries,
            }))
        };
        inputs.blocks.insert(
            10,
            withdrawals_block(
                10,
                vec![
                    Withdrawal { validator_index: 1, address: "0xa".to_owned(), amount_gwei: 5 },
                    Withdrawal { validator_index: 99, address: "0xb".to_owned(), amount_gwei: 7 },
                ],
            ),
        );
        inputs.blocks.insert(
            11,
            withdrawals_block(
                11,
                vec![
                    Withdrawal { validator_index: 1, address: "0xa".to_owned(), amount_gwei: 3 },
                    Withdrawal { validator_index: 2, address: "0xc".to_owned(), amount_gwei: 11 },
                ],
            ),
        );
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        let alice = &report.withdrawals["alice"];
        assert_eq!(alice.total_gwei, 8);
        assert_eq!(
            alice.entries,
            vec![
                WithdrawalEntry { validator: 1, amount_gwei: 5, slot: 10 },
                WithdrawalEntry { validator: 1, amount_gwei: 3, slot: 11 },
            ]
        );
        let bob = &report.withdrawals["bob"];
        assert_eq!(bob.total_gwei, 11);
        // validator 99 is nobody's
        assert_eq!(report.withdrawals.len(), 2);
    }

    #[test]
    fn events_render_in_delivery_order() {
        let monitored = monitored(&[("alice", &[100, 300, 400])]);
        let mut inputs = inputs(BatchRange { begin: 299, end: 300 });
        inputs.duties.push(ProposerDuty {
            slot: 300,
            validator_index: 100,
        });
        inputs.committees.insert(
            300,
            Arc::new(vec![committee(300, 2, &[100, 200, 300, 400])]),
        );
        inputs.blocks.insert(
            305,
            Some(block(
                305,
                9,
                vec![AttestationSummary {
                    slot: 300,
                    committee_index: 2,
                    aggregation_bits: "0x1b".to_owned(),
                    committee_bits: None,
                }],
            )),
        );
        fill_tombstones(&mut inputs);

        let report = reconcile_batch(&inputs, &monitored);
        let events = report.to_events(&monitored);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            Event::BlockMissed { validator: 100, slot: 300, .. }
        ));
        match &events[1] {
            Event::AttestationMissed {
                label,
                validators,
                slots,
            } => {
                assert_eq!(label, "alice");
                assert_eq!(validators, &vec![300]);
                assert_eq!(slots, &vec![300]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
