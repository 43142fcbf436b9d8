//! SSZ bitlist/bitvector decoding for aggregate attestations.
//!
//! Bits are laid out LSB-first within each byte: bit i of byte j is
//! position 8*j + i. A bitlist marks its logical length with a delimiter
//! bit (the highest set bit of the buffer); a bitvector has a fixed
//! logical length and no delimiter.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::beacon::{AttestationSummary, CommitteeSummary, InclusionRecord};
use crate::eth_spec::{Slot, ValidatorIndex};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitfieldError {
    #[error("bitfield is not valid hex: {0}")]
    InvalidHex(String),

    #[error("committee {index} not present among the {total} committees of slot {slot}")]
    UnknownCommittee { index: u64, slot: Slot, total: usize },

    #[error(
        "aggregation bits carry {carried} data bits but the selected committees hold {expected} members"
    )]
    AggregateSizeMismatch { carried: usize, expected: usize },
}

fn parse_hex_bits(hex_str: &str) -> Result<Vec<bool>, BitfieldError> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(stripped).map_err(|e| BitfieldError::InvalidHex(e.to_string()))?;
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes {
        for position in 0..8 {
            bits.push(byte & (1u8 << position) != 0);
        }
    }
    Ok(bits)
}

/// Data bits of an SSZ bitlist: everything strictly below the delimiter
/// bit. A buffer with no set bit decodes to the empty list.
pub fn bitlist_bits(hex_str: &str) -> Result<Vec<bool>, BitfieldError> {
    let bits = parse_hex_bits(hex_str)?;
    match bits.iter().rposition(|bit| *bit) {
        Some(delimiter) => Ok(bits[..delimiter].to_vec()),
        None => Ok(Vec::new()),
    }
}

/// Participating members of a single committee, from a legacy (single
/// committee) aggregation bitlist. Data bits beyond the committee size are
/// ignored.
pub fn decode_bitlist(
    hex_str: &str,
    committee: &[ValidatorIndex],
) -> Result<BTreeSet<ValidatorIndex>, BitfieldError> {
    let data = bitlist_bits(hex_str)?;
    Ok(data
        .iter()
        .take(committee.len())
        .enumerate()
        .filter_map(|(position, set)| set.then(|| committee[position]))
        .collect())
}

/// Selected indices of an SSZ bitvector of fixed logical length
/// `total_committees`; indices at or beyond that length are discarded.
pub fn decode_committee_bits(
    hex_str: &str,
    total_committees: usize,
) -> Result<Vec<u64>, BitfieldError> {
    let bits = parse_hex_bits(hex_str)?;
    Ok(bits
        .iter()
        .enumerate()
        .take(total_committees)
        .filter_map(|(position, set)| set.then_some(position as u64))
        .collect())
}

/// Decodes one aggregate attestation into per-committee inclusion records.
///
/// `committees` must be the full ordered committee list of the attested
/// slot. Post-Electra aggregates (those carrying `committee_bits`) span
/// the selected committees in index order; legacy aggregates cover exactly
/// the committee named by `data.index`.
pub fn decode_attestation(
    attestation: &AttestationSummary,
    committees: &[CommitteeSummary],
    inclusion_slot: Slot,
) -> Result<Vec<InclusionRecord>, BitfieldError> {
    match &attestation.committee_bits {
        Some(committee_bits) => decode_electra_aggregate(
            &attestation.aggregation_bits,
            committee_bits,
            committees,
            attestation.slot,
            inclusion_slot,
        ),
        None => {
            let committee = committee_at(committees, attestation.committee_index, attestation.slot)?;
            let attesting_indices = decode_bitlist(&attestation.aggregation_bits, &committee.validators)?;
            Ok(vec![InclusionRecord {
                slot: attestation.slot,
                inclusion_slot,
                committee_index: attestation.committee_index,
                attesting_indices,
            }])
        }
    }
}

fn committee_at(
    committees: &[CommitteeSummary],
    index: u64,
    slot: Slot,
) -> Result<&CommitteeSummary, BitfieldError> {
    committees
        .iter()
        .find(|committee| committee.index == index)
        .ok_or(BitfieldError::UnknownCommittee {
            index,
            slot,
            total: committees.len(),
        })
}

/// Electra (EIP-7549) multi-committee aggregate: the aggregation bitlist
/// concatenates the participation of every selected committee in committee
/// index order, then terminates with the delimiter. Total data bits must
/// equal the summed size of the selected committees; excess or deficit is
/// a decode error, never a silent truncation.
fn decode_electra_aggregate(
    aggregation_bits: &str,
    committee_bits: &str,
    committees: &[CommitteeSummary],
    attested_slot: Slot,
    inclusion_slot: Slot,
) -> Result<Vec<InclusionRecord>, BitfieldError> {
    let selected = decode_committee_bits(committee_bits, committees.len())?;
    let data = bitlist_bits(aggregation_bits)?;

    let mut members: Vec<&CommitteeSummary> = Vec::with_capacity(selected.len());
    let mut expected = 0usize;
    for index in &selected {
        let committee = committee_at(committees, *index, attested_slot)?;
        expected += committee.validators.len();
        members.push(committee);
    }

    if data.len() != expected {
        return Err(BitfieldError::AggregateSizeMismatch {
            carried: data.len(),
            expected,
        });
    }

    let mut records = Vec::with_capacity(members.len());
    let mut cursor = 0usize;
    for committee in members {
        let attesting_indices = data[cursor..cursor + committee.validators.len()]
            .iter()
            .enumerate()
            .filter_map(|(position, set)| set.then(|| committee.validators[position]))
            .collect();
        cursor += committee.validators.len();
        records.push(InclusionRecord {
            slot: attested_slot,
            inclusion_slot,
            committee_index: committee.index,
            attesting_indices,
        });
    }
    Ok(records)
}

/// Encoding dual of [`bitlist_bits`]: data bits followed by the delimiter.
pub fn encode_bitlist(bits: &[bool]) -> String {
    let mut bytes = vec![0u8; bits.len() / 8 + 1];
    for (position, set) in bits.iter().enumerate() {
        if *set {
            bytes[position / 8] |= 1u8 << (position % 8);
        }
    }
    // delimiter bit at the logical length
    bytes[bits.len() / 8] |= 1u8 << (bits.len() % 8);
    format!("0x{}", hex::encode(bytes))
}

/// Encoding dual of [`decode_committee_bits`].
pub fn encode_bitvector(bits: &[bool]) -> String {
    let mut bytes = vec![0u8; bits.len().div_ceil(8).max(1)];
    for (position, set) in bits.iter().enumerate() {
        if *set {
            bytes[position / 8] |= 1u8 << (position % 8);
        }
    }
    format!("0x{}", hex::encode(bytes))
}
