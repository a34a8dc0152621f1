use async_trait::async_trait;
use buildscope_core::{
    BackendId, BuildSettings, BuildSystem, BuildSystemEvent, BuildTarget, DocumentUri, Result,
};
use tokio::sync::broadcast;

/// Backend used when no real build system is configured. Never has an
/// opinion, so every document resolves to fallback settings.
pub struct FallbackOnlyBuildSystem {
    // Held so subscribers see an open, silent stream rather than termination.
    events: broadcast::Sender<BuildSystemEvent>,
}

impl FallbackOnlyBuildSystem {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for FallbackOnlyBuildSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildSystem for FallbackOnlyBuildSystem {
    fn id(&self) -> BackendId {
        BackendId::FallbackOnly
    }

    async fn settings(&self, _document: &DocumentUri) -> Result<Option<BuildSettings>> {
        Ok(None)
    }

    fn subscribe(&self) -> broadcast::Receiver<BuildSystemEvent> {
        self.events.subscribe()
    }

    async fn targets(&self) -> Result<Vec<BuildTarget>> {
        Ok(Vec::new())
    }
}
