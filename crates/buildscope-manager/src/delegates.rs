// ABOUTME: Registry of change delegates held by weak reference
// ABOUTME: Dispatches batches in registration order with per-delegate failure isolation

use async_trait::async_trait;
use buildscope_core::{duration_millis, BuildSettingsDelegate, Result, TargetChanges};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::coalescer::{BatchSink, ChangeBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DelegateId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<(DelegateId, Weak<dyn BuildSettingsDelegate>)>,
}

/// Delegates are held weakly: a delegate whose owner dropped it simply
/// stops receiving notifications.
#[derive(Clone)]
pub struct DelegateRegistry {
    inner: Arc<RwLock<Registry>>,
    timeout: Duration,
}

impl DelegateRegistry {
    /// `timeout` bounds how long one delegate may take with one batch.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry::default())),
            timeout,
        }
    }

    pub fn register<D>(&self, delegate: &Arc<D>) -> DelegateId
    where
        D: BuildSettingsDelegate + 'static,
    {
        let weak = Arc::downgrade(delegate);
        let weak: Weak<dyn BuildSettingsDelegate> = weak;
        let mut registry = self.inner.write();
        registry.next_id += 1;
        let id = DelegateId(registry.next_id);
        registry.entries.push((id, weak));
        debug!(target: "buildscope::delegates", delegate = id.0, "Delegate registered");
        id
    }

    pub fn unregister(&self, id: DelegateId) -> bool {
        let mut registry = self.inner.write();
        let before = registry.entries.len();
        registry.entries.retain(|(entry, _)| *entry != id);
        before != registry.entries.len()
    }

    /// Live delegates in registration order. Dead entries are pruned.
    fn live(&self) -> Vec<(DelegateId, Arc<dyn BuildSettingsDelegate>)> {
        let mut registry = self.inner.write();
        registry.entries.retain(|(_, weak)| weak.strong_count() > 0);
        registry
            .entries
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|d| (*id, d)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one batch to every delegate. Each delegate runs in its own
    /// task so an error, panic or hang in one never reaches the others. A
    /// delegate still busy after the timeout is abandoned.
    pub async fn dispatch(&self, batch: &ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        for (id, delegate) in self.live() {
            let batch = batch.clone();
            let mut task = tokio::spawn(deliver(delegate, batch));
            let outcome = match tokio::time::timeout(self.timeout, &mut task).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    task.abort();
                    warn!(
                        target: "buildscope::delegates",
                        delegate = id.0,
                        timeout_ms = duration_millis(self.timeout),
                        "Delegate timed out handling change notification"
                    );
                    continue;
                }
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    target: "buildscope::delegates",
                    delegate = id.0,
                    error = %e,
                    "Delegate failed to handle change notification"
                ),
                Err(e) => warn!(
                    target: "buildscope::delegates",
                    delegate = id.0,
                    error = %e,
                    "Delegate panicked while handling change notification"
                ),
            }
        }
    }

    /// Fire-and-forget index log forwarding.
    pub fn log_message(&self, task_id: &str, message: &str) {
        for (_, delegate) in self.live() {
            let task_id = task_id.to_string();
            let message = message.to_string();
            tokio::spawn(async move {
                delegate.log_message_to_index_log(&task_id, &message).await;
            });
        }
    }
}

async fn deliver(delegate: Arc<dyn BuildSettingsDelegate>, batch: ChangeBatch) -> Result<()> {
    let mut outcome = Ok(());
    if !batch.settings_changed.is_empty() {
        outcome = outcome.and(
            delegate
                .file_build_settings_changed(&batch.settings_changed)
                .await,
        );
    }
    if let Some(affected) = batch.dependencies_updated.filter(|a| !a.is_empty()) {
        outcome = outcome.and(delegate.files_dependencies_updated(&affected).await);
    }
    match batch.targets_changed {
        Some(TargetChanges::Events(events)) if events.is_empty() => {}
        Some(changes) => outcome = outcome.and(delegate.build_targets_changed(&changes).await),
        None => {}
    }
    outcome
}

#[async_trait]
impl BatchSink for DelegateRegistry {
    async fn deliver(&self, batch: ChangeBatch) {
        self.dispatch(&batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildscope_core::{AffectedDocuments, BuildSettingsError, DocumentUri};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl BuildSettingsDelegate for Recorder {
        async fn file_build_settings_changed(&self, changed: &HashSet<DocumentUri>) -> Result<()> {
            self.log.lock().push(format!("{}:settings:{}", self.name, changed.len()));
            if self.fail {
                return Err(BuildSettingsError::Delegate("refused".into()));
            }
            Ok(())
        }

        async fn files_dependencies_updated(&self, _affected: &AffectedDocuments) -> Result<()> {
            self.log.lock().push(format!("{}:deps", self.name));
            Ok(())
        }

        async fn build_targets_changed(&self, _changes: &TargetChanges) -> Result<()> {
            self.log.lock().push(format!("{}:targets", self.name));
            Ok(())
        }
    }

    fn batch() -> ChangeBatch {
        ChangeBatch {
            settings_changed: [DocumentUri::from_path("/w/a.c").unwrap()].into_iter().collect(),
            dependencies_updated: Some(AffectedDocuments::All),
            targets_changed: None,
        }
    }

    #[tokio::test]
    async fn dispatch_in_registration_order_and_isolates_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DelegateRegistry::new(Duration::from_secs(5));
        let first = Arc::new(Recorder { name: "first", log: log.clone(), fail: true });
        let second = Arc::new(Recorder { name: "second", log: log.clone(), fail: false });
        registry.register(&first);
        registry.register(&second);

        registry.dispatch(&batch()).await;
        assert_eq!(
            *log.lock(),
            vec!["first:settings:1", "first:deps", "second:settings:1", "second:deps"]
        );
    }

    struct HangingDelegate;

    #[async_trait]
    impl BuildSettingsDelegate for HangingDelegate {
        async fn file_build_settings_changed(&self, _: &HashSet<DocumentUri>) -> Result<()> {
            std::future::pending().await
        }

        async fn files_dependencies_updated(&self, _: &AffectedDocuments) -> Result<()> {
            std::future::pending().await
        }

        async fn build_targets_changed(&self, _: &TargetChanges) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_delegate_is_abandoned_after_timeout() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DelegateRegistry::new(Duration::from_millis(200));
        let hanging = Arc::new(HangingDelegate);
        let second = Arc::new(Recorder { name: "second", log: log.clone(), fail: false });
        registry.register(&hanging);
        registry.register(&second);

        registry.dispatch(&batch()).await;
        registry.dispatch(&batch()).await;
        assert_eq!(log.lock().len(), 4);
    }

    #[tokio::test]
    async fn dropped_and_unregistered_delegates_are_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DelegateRegistry::new(Duration::from_secs(5));
        let dropped = Arc::new(Recorder { name: "dropped", log: log.clone(), fail: false });
        let removed = Arc::new(Recorder { name: "removed", log: log.clone(), fail: false });
        registry.register(&dropped);
        let id = registry.register(&removed);
        drop(dropped);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());

        registry.dispatch(&batch()).await;
        assert!(log.lock().is_empty());
    }
}
