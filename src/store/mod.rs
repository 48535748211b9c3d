//! Persistence (SPEC_FULL.md §2 "Persistence" ambient layer).

pub mod sqlite;

pub use sqlite::{default_db_path, EngineStore};
