//! Core abstractions for Folio sessions: the transport capability contract.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod transport;
