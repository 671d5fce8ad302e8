//! Source-side planning: what to move and where it lands.

pub mod delta;
pub mod paths;
pub mod rename;

pub use delta::{compute_delta, TransferItem};
