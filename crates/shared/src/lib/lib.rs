pub mod beacon;
pub mod bitfields;
pub mod eth_spec;
pub mod events;
pub mod validators;
