//! Analysis modules.
//!
//! Statistics are always computed from a store snapshot, never from
//! individual uploads.

pub mod aggregator;

pub use aggregator::*;
