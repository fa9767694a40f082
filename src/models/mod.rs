//! Core data models for the image intake pipeline.
//!
//! These types describe one upload as it moves through planning, derivation,
//! and storage. The ledger row maps to SQLite via `sqlx::FromRow` and every
//! caller-facing type serializes as JSON via `serde`.

pub mod record;
pub mod upload;
pub mod variant;
