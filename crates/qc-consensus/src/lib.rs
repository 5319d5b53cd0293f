//! # qc-consensus — Block production, validation, and proof-of-work.
//!
//! This crate implements the [`BlockProducer`](qc_core::traits::BlockProducer)
//! trait, wiring together qc-core's validation, difficulty adjustment, reward,
//! and mempool modules into a claim-aware block template assembler and
//! validator. Proof-of-work is a double SHA-256 header hash checked against a
//! 256-bit target, no external mining backend.

pub mod engine;

pub use engine::{mine_block, ConsensusEngine};
