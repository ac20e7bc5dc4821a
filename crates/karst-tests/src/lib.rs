//! Shared helpers for the integration suite.

pub mod helpers;
