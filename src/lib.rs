//! Clearance engine: a two-dimensional agent/user permission model, job
//! lifecycle, and chat tool-call loop for autonomous-agent action
//! authorization.
//!
//! Grounded throughout on the teacher's engine layer (`engine/agent_loop.rs`,
//! `engine/sessions.rs`, `engine/tool_executor.rs`, `engine/skills/crypto.rs`)
//! and persistence layer (`commands/state.rs`'s `Mutex<Connection>`
//! pattern) — see `DESIGN.md` for the full grounding ledger.

pub mod chat_loop;
pub mod clearance;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod executors;
pub mod external;
pub mod lifecycle;
pub mod sandbox;
pub mod store;
pub mod transcription;

pub use error::{EngineError, EngineResult};
