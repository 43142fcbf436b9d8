use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::eth_spec::ValidatorIndex;

#[derive(Debug, Error)]
pub enum ValidatorSetError {
    #[error("no validators configured")]
    Empty,

    #[error("label {0} has no validator indices")]
    EmptyLabel(String),

    #[error("validator {index} is assigned to both {first} and {second}")]
    DuplicateIndex {
        index: ValidatorIndex,
        first: String,
        second: String,
    },
}

/// The monitored validator set: `label -> indices` as configured, plus the
/// derived reverse lookup. Every index belongs to exactly one label.
#[derive(Debug, Clone, Default)]
pub struct MonitoredValidators {
    by_label: BTreeMap<String, BTreeSet<ValidatorIndex>>,
    label_by_index: HashMap<ValidatorIndex, String>,
}

impl MonitoredValidators {
    pub fn new(
        groups: BTreeMap<String, Vec<ValidatorIndex>>,
    ) -> Result<Self, ValidatorSetError> {
        if groups.is_empty() {
            return Err(ValidatorSetError::Empty);
        }

        let mut by_label: BTreeMap<String, BTreeSet<ValidatorIndex>> = BTreeMap::new();
        let mut label_by_index: HashMap<ValidatorIndex, String> = HashMap::new();
        for (label, indices) in groups {
            if indices.is_empty() {
                return Err(ValidatorSetError::EmptyLabel(label));
            }
            for index in &indices {
                if let Some(existing) = label_by_index.get(index) {
                    return Err(ValidatorSetError::DuplicateIndex {
                        index: *index,
                        first: existing.clone(),
                        second: label,
                    });
                }
                label_by_index.insert(*index, label.clone());
            }
            by_label.insert(label, indices.into_iter().collect());
        }

        Ok(Self {
            by_label,
            label_by_index,
        })
    }

    pub fn contains(&self, index: ValidatorIndex) -> bool {
        self.label_by_index.contains_key(&index)
    }

    pub fn label_of(&self, index: ValidatorIndex) -> Option<&str> {
        self.label_by_index.get(&index).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.by_label.keys().map(String::as_str)
    }

    pub fn indices(&self) -> impl Iterator<Item = ValidatorIndex> + '_ {
        self.by_label.values().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.label_by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_by_index.is_empty()
    }
}
