// scrivener-daemon library entry point.

pub mod config;
pub mod embedding;
pub mod generation;
pub mod http;
pub mod naming;
pub mod runtime;
pub mod search;
pub mod security;
pub mod store;
