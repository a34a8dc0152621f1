//! Build system backends implementing [`buildscope_core::BuildSystem`].
//!
//! - `compilation_db`: `compile_commands.json` lookup, optional file watching
//! - `package`: settings derived from a package manager's resolved build plan
//! - `fallback_only`: no build system; every document gets fallback settings

pub mod compilation_db;
pub mod fallback_only;
pub mod package;

pub use compilation_db::*;
pub use fallback_only::*;
pub use package::*;
