//! Adapters - implementations of the domain ports

pub mod inbound;
pub mod outbound;
