//! Per-transport session pumps.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
