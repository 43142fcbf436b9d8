use std::str::FromStr;

use thiserror::Error;

pub type Slot = u64;
pub type Epoch = u64;
pub type ValidatorIndex = u64;
pub type Gwei = u64;

pub const SLOTS_PER_EPOCH: u64 = 32;
pub const SECONDS_PER_SLOT: u64 = 12;

/// An attestation for slot s may legally appear in blocks [s+1, s+32].
pub const INCLUSION_WINDOW_SLOTS: u64 = 32;

pub fn epoch_of(slot: Slot) -> Epoch {
    slot / SLOTS_PER_EPOCH
}

pub fn first_slot_of(epoch: Epoch) -> Slot {
    epoch * SLOTS_PER_EPOCH
}

/// Slot the chain should be at for the given wall-clock timestamp.
pub fn expected_slot_at(genesis_timestamp: u64, now_timestamp: u64) -> Slot {
    now_timestamp.saturating_sub(genesis_timestamp) / SECONDS_PER_SLOT
}

pub struct NetworkConfig {
    pub chain_id: u64,
    pub genesis_timestamp: u64,
}

pub trait NetworkInfo {
    fn as_str(&self) -> String;
    fn get_config(&self) -> NetworkConfig;
}

#[derive(Debug, Error)]
#[error("unknown network {0}")]
pub struct NetworkParseError(String);

#[derive(Debug, Clone)]
pub enum Network {
    Mainnet,
    Sepolia,
    Holesky,
}

impl NetworkInfo for Network {
    fn as_str(&self) -> String {
        let val = match self {
            Self::Mainnet => "mainnet",
            Self::Sepolia => "sepolia",
            Self::Holesky => "holesky",
        };
        val.to_owned()
    }

    fn get_config(&self) -> NetworkConfig {
        match self {
            Self::Mainnet => NetworkConfig {
                chain_id: 1,
                genesis_timestamp: 1606824023,
            },
            Self::Sepolia => NetworkConfig {
                chain_id: 11155111,
                genesis_timestamp: 1655733600,
            },
            Self::Holesky => NetworkConfig {
                chain_id: 17000,
                genesis_timestamp: 1695902400,
            },
        }
    }
}

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "sepolia" => Ok(Self::Sepolia),
            "holesky" => Ok(Self::Holesky),
            unknown => Err(NetworkParseError(unknown.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_boundaries() {
        assert_eq!(epoch_of(0), 0);
        assert_eq!(epoch_of(31), 0);
        assert_eq!(epoch_of(32), 1);
        assert_eq!(first_slot_of(3), 96);
    }

    #[test]
    fn expected_slot_tracks_wall_clock() {
        let genesis = 1606824023;
        assert_eq!(expected_slot_at(genesis, genesis), 0);
        assert_eq!(expected_slot_at(genesis, genesis + 11), 0);
        assert_eq!(expected_slot_at(genesis, genesis + 12), 1);
        assert_eq!(expected_slot_at(genesis, genesis + 12 * 100 + 5), 100);
        // clock behind genesis saturates to slot 0
        assert_eq!(expected_slot_at(genesis, genesis - 100), 0);
    }

    #[test]
    fn network_round_trips_via_from_str() {
        let network: Network = "mainnet".parse().unwrap();
        assert_eq!(network.get_config().genesis_timestamp, 1606824023);
        assert!("ropsten".parse::<Network>().is_err());
    }
}
