use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::broadcast;

use crate::{
    AffectedDocuments, BackendId, BuildSettings, BuildSystemEvent, BuildTarget, DocumentUri,
    Result, TargetChanges,
};

/// Capability contract every build system backend implements.
#[async_trait]
pub trait BuildSystem: Send + Sync {
    fn id(&self) -> BackendId;

    /// Settings for one document. `Ok(None)` means the backend has no
    /// opinion; an error is treated by callers like `Ok(None)`.
    /// Must be safe to call concurrently for different documents.
    async fn settings(&self, document: &DocumentUri) -> Result<Option<BuildSettings>>;

    /// Long-lived event feed. Each call returns a new receiver; a closed
    /// channel signals that the backend can no longer report changes.
    fn subscribe(&self) -> broadcast::Receiver<BuildSystemEvent>;

    /// Current full snapshot of the backend's targets.
    async fn targets(&self) -> Result<Vec<BuildTarget>>;
}

/// Downstream subsystem notified of build settings changes.
#[async_trait]
pub trait BuildSettingsDelegate: Send + Sync {
    async fn file_build_settings_changed(&self, changed: &HashSet<DocumentUri>) -> Result<()>;

    async fn files_dependencies_updated(&self, affected: &AffectedDocuments) -> Result<()>;

    async fn build_targets_changed(&self, changes: &TargetChanges) -> Result<()>;

    /// Free-form progress text for the index log. Best effort.
    async fn log_message_to_index_log(&self, _task_id: &str, _message: &str) {}
}
