//! Tests for the dispute crate.

pub(crate) mod fixtures;

mod contract;
mod lpp;
mod position;
mod preimage;
mod scheduler;
