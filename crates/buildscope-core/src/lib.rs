//! Core types and traits for build settings mediation.
//!
//! - `DocumentUri`: identity of a source document
//! - `BuildSettings`, `BuildTarget`, events: the data model shared by backends and the manager
//! - `BuildSystem`: capability contract for pluggable backends
//! - `BuildSettingsDelegate`: contract for subsystems notified of changes
//! - `FallbackSettingsComputer`: settings for documents no backend covers

pub mod config;
pub mod document;
pub mod error;
pub mod fallback;
pub mod traits;
pub mod types;

pub use config::*;
pub use document::*;
pub use error::*;
pub use fallback::*;
pub use traits::*;
pub use types::*;
