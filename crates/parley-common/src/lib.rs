//! # parley-common
//!
//! Shared configuration and domain-name helpers used across all Parley crates.
//! No protocol logic lives here.

pub mod config;
pub mod domain;
