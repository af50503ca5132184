// scrivener-common: shared types and wire protocol for the Scrivener workspace

pub mod protocol;
pub mod types;
