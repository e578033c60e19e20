//! Analyses over bytecode (before emission) and IR (after emission)

pub mod explore;
pub mod liveness;
