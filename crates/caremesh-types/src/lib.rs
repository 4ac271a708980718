//! Shared types for the caremesh relay: wire envelopes, domain models and
//! credential claims. Nothing in here performs I/O.

pub mod api;
pub mod events;
pub mod models;
