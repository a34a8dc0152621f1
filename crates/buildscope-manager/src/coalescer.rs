// ABOUTME: Debounces change notifications into one batch per time window
// ABOUTME: Runs as its own task; the first input after a flush opens the next window

use async_trait::async_trait;
use buildscope_core::{AffectedDocuments, BuildTargetEvent, DocumentUri, TargetChanges};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// One change report handed to the coalescer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeInput {
    SettingsChanged(HashSet<DocumentUri>),
    DependenciesUpdated(AffectedDocuments),
    TargetsChanged(TargetChanges),
}

/// Everything accumulated during one window. Parts left `None` or empty
/// are not delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub settings_changed: HashSet<DocumentUri>,
    pub dependencies_updated: Option<AffectedDocuments>,
    pub targets_changed: Option<TargetChanges>,
}

impl ChangeBatch {
    pub fn absorb(&mut self, input: ChangeInput) {
        match input {
            ChangeInput::SettingsChanged(documents) => self.settings_changed.extend(documents),
            ChangeInput::DependenciesUpdated(affected) => match &mut self.dependencies_updated {
                Some(existing) => existing.merge(affected),
                None => self.dependencies_updated = Some(affected),
            },
            ChangeInput::TargetsChanged(changes) => {
                let merged = match (self.targets_changed.take(), changes) {
                    (Some(TargetChanges::Unknown), _) | (_, TargetChanges::Unknown) => {
                        TargetChanges::Unknown
                    }
                    (None, TargetChanges::Events(events)) => {
                        let mut merged = Vec::with_capacity(events.len());
                        push_events(&mut merged, events);
                        TargetChanges::Events(merged)
                    }
                    (Some(TargetChanges::Events(mut existing)), TargetChanges::Events(events)) => {
                        push_events(&mut existing, events);
                        TargetChanges::Events(existing)
                    }
                };
                self.targets_changed = Some(merged);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.settings_changed.is_empty()
            && self
                .dependencies_updated
                .as_ref()
                .map_or(true, AffectedDocuments::is_empty)
            && match &self.targets_changed {
                None => true,
                Some(TargetChanges::Unknown) => false,
                Some(TargetChanges::Events(events)) => events.is_empty(),
            }
    }
}

/// Keep arrival order; a later event for the same target overwrites the
/// kind of the earlier one in place.
fn push_events(into: &mut Vec<BuildTargetEvent>, events: Vec<BuildTargetEvent>) {
    for event in events {
        match into.iter_mut().find(|e| e.target == event.target) {
            Some(existing) => existing.kind = event.kind,
            None => into.push(event),
        }
    }
}

/// Destination for flushed batches.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn deliver(&self, batch: ChangeBatch);
}

#[async_trait]
impl BatchSink for mpsc::UnboundedSender<ChangeBatch> {
    async fn deliver(&self, batch: ChangeBatch) {
        let _ = self.send(batch);
    }
}

/// Handle to the coalescing task. Dropping it flushes whatever is pending
/// and ends the task.
pub struct ChangeCoalescer {
    inputs: mpsc::UnboundedSender<ChangeInput>,
    task: JoinHandle<()>,
}

impl ChangeCoalescer {
    pub fn spawn<S: BatchSink>(window: Duration, sink: S) -> Self {
        let (inputs, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, window, sink));
        Self { inputs, task }
    }

    pub fn push(&self, input: ChangeInput) {
        let _ = self.inputs.send(input);
    }

    pub fn settings_changed(&self, documents: HashSet<DocumentUri>) {
        if !documents.is_empty() {
            self.push(ChangeInput::SettingsChanged(documents));
        }
    }

    pub fn dependencies_updated(&self, affected: AffectedDocuments) {
        if !affected.is_empty() {
            self.push(ChangeInput::DependenciesUpdated(affected));
        }
    }

    pub fn targets_changed(&self, changes: TargetChanges) {
        if !matches!(&changes, TargetChanges::Events(events) if events.is_empty()) {
            self.push(ChangeInput::TargetsChanged(changes));
        }
    }

    /// Stop accepting input and wait until the last batch is delivered.
    pub async fn close(self) {
        drop(self.inputs);
        let _ = self.task.await;
    }
}

async fn run<S: BatchSink>(mut rx: mpsc::UnboundedReceiver<ChangeInput>, window: Duration, sink: S) {
    while let Some(first) = rx.recv().await {
        let mut batch = ChangeBatch::default();
        batch.absorb(first);
        let deadline = Instant::now() + window;
        let mut closed = false;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                input = rx.recv() => match input {
                    Some(input) => batch.absorb(input),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        if !batch.is_empty() {
            debug!(
                target: "buildscope::coalescer",
                settings_changed = batch.settings_changed.len(),
                dependencies = batch.dependencies_updated.is_some(),
                targets = batch.targets_changed.is_some(),
                "Flushing change batch"
            );
            sink.deliver(batch).await;
        }
        if closed {
            break;
        }
    }
}
