//! Typed wire models for each engine's JSONL output.
//!
//! Every schema is an internally tagged serde enum with `#[serde(default)]`
//! on optional fields, so new fields and unknown event types from newer CLI
//! versions decode without breaking the stream.

pub mod claude;
pub mod codex;
pub mod opencode;
pub mod pi;
