//! Build settings manager.
//!
//! A single owner task mediates between an editor's language services and
//! one `BuildSystem` backend:
//! - `cache`: per-document settings with stale-while-refresh semantics
//! - `tracker`: target dependency graph for change propagation
//! - `coalescer`: debounced notification batches
//! - `delegates`: weakly held subscribers with failure isolation
//! - `manager`: the public handle and its owner task

pub mod cache;
pub mod coalescer;
pub mod delegates;
pub mod manager;
pub mod tracker;

pub use cache::{DocumentState, SettingsView};
pub use coalescer::{ChangeBatch, ChangeCoalescer, ChangeInput};
pub use delegates::{DelegateId, DelegateRegistry};
pub use manager::{BuildSystemManager, ManagerStats};
pub use tracker::DependencyTracker;
