//! Kojo - Core Library
//!
//! Shared types, settings, and the interactive-tool allowlist used by the
//! session manager and the CLI.

pub mod error;
pub mod ids;
pub mod settings;
pub mod tools;
pub mod types;

pub use error::*;
pub use tools::*;
pub use types::*;
