//! Structural types passed across the gateway boundary.

pub mod contract;
pub mod enums;
pub mod order;
