//! # spv-tests
//!
//! Integration tests for the SPV sync core.
//!
//! This crate provides:
//! - A regtest block generator with merkle proofs
//! - A scripted TCP peer that serves a mined chain
//! - End-to-end sync and fork resolution tests
//! - Property-based tests for consensus and chain invariants

pub mod generators;
pub mod harness;

#[cfg(test)]
mod sync_tests;

#[cfg(test)]
mod fork_tests;


#[cfg(test)]
mod validation_tests;

pub use generators::*;
pub use harness::*;
