// ABOUTME: Build settings manager: single owner task mediating between editor and backend
// ABOUTME: Handles resolve with fallback timeout, invalidation, target tracking and delegate fan-out

use buildscope_core::{
    AffectedDocuments, BackendId, BuildSettings, BuildSettingsDelegate, BuildSettingsError,
    BuildSystem, BuildSystemEvent, BuildTarget, BuildTargetEvent, DocumentUri,
    FallbackSettingsComputer, ManagerConfig, Result, TargetChanges,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{DocumentState, SettingsCache, SettingsView};
use crate::coalescer::ChangeCoalescer;
use crate::delegates::{DelegateId, DelegateRegistry};
use crate::tracker::DependencyTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub cached_documents: usize,
    pub stale_documents: usize,
    pub fallback_documents: usize,
    pub in_flight_queries: usize,
    pub known_targets: usize,
    /// Documents owned by at least one known target.
    pub known_documents: usize,
    pub backend_queries: u64,
}

enum Command {
    Resolve {
        document: DocumentUri,
        reply: oneshot::Sender<BuildSettings>,
    },
    FallbackServed(DocumentUri),
    Invalidate {
        documents: Vec<DocumentUri>,
        reason: String,
        done: oneshot::Sender<()>,
    },
    Evict {
        document: DocumentUri,
        done: oneshot::Sender<bool>,
    },
    State {
        document: DocumentUri,
        reply: oneshot::Sender<DocumentState>,
    },
    Stats(oneshot::Sender<ManagerStats>),
    Shutdown,
}

enum Internal {
    QueryFinished {
        document: DocumentUri,
        generation: u64,
        result: Result<Option<BuildSettings>>,
    },
    Backend(BuildSystemEvent),
    BackendLagged(u64),
    BackendClosed,
    TargetsFetched {
        events: Vec<BuildTargetEvent>,
        reset: bool,
        result: Result<Vec<BuildTarget>>,
    },
}

/// Cloneable handle to a running manager. The owner task stops once every
/// handle is dropped or `shutdown` is called.
#[derive(Clone)]
pub struct BuildSystemManager {
    commands: mpsc::UnboundedSender<Command>,
    view: SettingsView,
    fallback: Arc<FallbackSettingsComputer>,
    delegates: DelegateRegistry,
    fallback_timeout: Duration,
    backend_id: BackendId,
}

impl BuildSystemManager {
    /// Spawn the owner task. Must be called from within a Tokio runtime.
    pub fn start(backend: Arc<dyn BuildSystem>, config: ManagerConfig) -> Self {
        let fallback = Arc::new(FallbackSettingsComputer::new(config.fallback.clone()));
        let cache = SettingsCache::new(Arc::clone(&fallback));
        let view = cache.view();
        let delegates = DelegateRegistry::new(config.delegate_timeout());
        let backend_id = backend.id();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let event_pump = tokio::spawn(pump_events(backend.subscribe(), internal_tx.clone()));

        let mut owner = Owner {
            backend,
            cache,
            tracker: DependencyTracker::new(),
            coalescer: ChangeCoalescer::spawn(config.debounce(), delegates.clone()),
            delegates: delegates.clone(),
            internal_tx,
            targets_fetch_in_flight: false,
            pending_target_events: Vec::new(),
            pending_reset: true,
            backend_queries: 0,
            event_pump,
        };
        owner.fetch_targets();
        tokio::spawn(owner.run(command_rx, internal_rx));

        info!(
            target: "buildscope::manager",
            backend = %backend_id,
            debounce_ms = config.debounce_ms,
            fallback_timeout_ms = config.fallback_timeout_ms,
            "Build system manager started"
        );

        Self {
            commands,
            view,
            fallback,
            delegates,
            fallback_timeout: config.fallback_timeout(),
            backend_id,
        }
    }

    pub fn backend_id(&self) -> &BackendId {
        &self.backend_id
    }

    /// Settings for `document`. Never fails: when the backend does not
    /// answer within the fallback timeout, fallback settings are returned and
    /// delegates hear about the real settings once they arrive.
    pub async fn resolve(&self, document: &DocumentUri) -> BuildSettings {
        if let Some(settings) = self.view.get(document) {
            return settings;
        }

        let (reply, rx) = oneshot::channel();
        let command = Command::Resolve {
            document: document.clone(),
            reply,
        };
        if self.commands.send(command).is_err() {
            debug!(
                target: "buildscope::manager",
                backend = %self.backend_id,
                document = %document,
                "Manager stopped, serving fallback"
            );
            return self.fallback.compute(document);
        }

        match tokio::time::timeout(self.fallback_timeout, rx).await {
            Ok(Ok(settings)) => settings,
            // Evicted or stopped while waiting.
            Ok(Err(_)) => self.fallback.compute(document),
            Err(_) => {
                debug!(
                    target: "buildscope::manager",
                    document = %document,
                    backend = %self.backend_id,
                    timeout_ms = buildscope_core::duration_millis(self.fallback_timeout),
                    "Backend slow, serving fallback"
                );
                let _ = self.commands.send(Command::FallbackServed(document.clone()));
                self.fallback.compute(document)
            }
        }
    }

    /// Subscribe a delegate. It is held weakly and notified in registration
    /// order.
    pub fn register_for_changes<D>(&self, delegate: &Arc<D>) -> DelegateId
    where
        D: BuildSettingsDelegate + 'static,
    {
        self.delegates.register(delegate)
    }

    pub fn unregister(&self, id: DelegateId) -> bool {
        self.delegates.unregister(id)
    }

    /// Mark cached settings stale and refresh them in the background. Stale
    /// values keep being served until the refresh lands.
    pub async fn invalidate(
        &self,
        documents: impl IntoIterator<Item = DocumentUri>,
        reason: &str,
    ) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Invalidate {
            documents: documents.into_iter().collect(),
            reason: reason.to_string(),
            done,
        })?;
        rx.await.map_err(|_| BuildSettingsError::ManagerStopped)
    }

    /// Forget `document`. Returns whether anything was cached or pending.
    pub async fn evict(&self, document: &DocumentUri) -> Result<bool> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Evict {
            document: document.clone(),
            done,
        })?;
        rx.await.map_err(|_| BuildSettingsError::ManagerStopped)
    }

    pub async fn state(&self, document: &DocumentUri) -> Result<DocumentState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::State {
            document: document.clone(),
            reply,
        })?;
        rx.await.map_err(|_| BuildSettingsError::ManagerStopped)
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        rx.await.map_err(|_| BuildSettingsError::ManagerStopped)
    }

    /// Forward a progress message to every delegate's index log.
    pub fn log_message_to_index_log(&self, task_id: &str, message: &str) {
        self.delegates.log_message(task_id, message);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BuildSettingsError::ManagerStopped)
    }
}

async fn pump_events(
    mut events: broadcast::Receiver<BuildSystemEvent>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    loop {
        let message = match events.recv().await {
            Ok(event) => Internal::Backend(event),
            Err(RecvError::Lagged(skipped)) => Internal::BackendLagged(skipped),
            Err(RecvError::Closed) => {
                let _ = internal.send(Internal::BackendClosed);
                return;
            }
        };
        if internal.send(message).is_err() {
            return;
        }
    }
}

struct Owner {
    backend: Arc<dyn BuildSystem>,
    cache: SettingsCache,
    tracker: DependencyTracker,
    coalescer: ChangeCoalescer,
    delegates: DelegateRegistry,
    internal_tx: mpsc::UnboundedSender<Internal>,
    targets_fetch_in_flight: bool,
    pending_target_events: Vec<BuildTargetEvent>,
    pending_reset: bool,
    backend_queries: u64,
    event_pump: JoinHandle<()>,
}

impl Owner {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = internal.recv() => self.handle_internal(message),
            }
        }

        self.event_pump.abort();
        self.coalescer.close().await;
        info!(target: "buildscope::manager", "Build system manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Resolve { document, reply } => {
                if let Some(entry) = self.cache.get(&document) {
                    let _ = reply.send(entry.settings.clone());
                } else if let Some(generation) = self.cache.join_or_begin(&document, reply) {
                    self.spawn_query(document, generation);
                }
            }
            Command::FallbackServed(document) => self.cache.mark_fallback_served(&document),
            Command::Invalidate {
                documents,
                reason,
                done,
            } => {
                self.invalidate(documents.iter(), &reason);
                let _ = done.send(());
            }
            Command::Evict { document, done } => {
                let evicted = self.cache.evict(&document);
                debug!(target: "buildscope::manager", document = %document, evicted, "Evicted document");
                let _ = done.send(evicted);
            }
            Command::State { document, reply } => {
                let _ = reply.send(self.cache.state(&document));
            }
            Command::Stats(reply) => {
                let cache = self.cache.stats();
                let _ = reply.send(ManagerStats {
                    cached_documents: cache.entries,
                    stale_documents: cache.stale,
                    fallback_documents: cache.fallback,
                    in_flight_queries: cache.in_flight,
                    known_targets: self.tracker.len(),
                    known_documents: self.tracker.known_documents().len(),
                    backend_queries: self.backend_queries,
                });
            }
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::QueryFinished {
                document,
                generation,
                result,
            } => {
                let Some(completion) = self.cache.complete(&document, generation, result) else {
                    return;
                };
                if let Some(generation) = completion.requery {
                    self.spawn_query(document.clone(), generation);
                }
                if completion.changed {
                    self.coalescer
                        .settings_changed(HashSet::from([document]));
                }
            }
            Internal::Backend(event) => self.handle_backend_event(event),
            Internal::BackendLagged(skipped) => {
                warn!(target: "buildscope::manager", skipped, "Backend events lagged");
                self.everything_changed("backend events were dropped");
            }
            Internal::BackendClosed => {
                error!(target: "buildscope::manager", backend = %self.backend.id(), "Backend event stream terminated");
                self.everything_changed("backend event stream terminated");
            }
            Internal::TargetsFetched {
                events,
                reset,
                result,
            } => {
                self.targets_fetch_in_flight = false;
                self.apply_targets(events, reset, result);
                self.fetch_targets();
            }
        }
    }

    fn handle_backend_event(&mut self, event: BuildSystemEvent) {
        match event {
            BuildSystemEvent::FileSettingsChanged(documents) => {
                self.invalidate(documents.iter(), "backend reported settings change");
            }
            BuildSystemEvent::DependenciesUpdated(affected) => {
                self.coalescer.dependencies_updated(affected);
            }
            BuildSystemEvent::TargetsChanged(events) => {
                if events.iter().any(|e| e.target.is_none()) {
                    self.everything_changed("backend reported unnamed target change");
                    return;
                }
                self.pending_target_events.extend(events);
                self.fetch_targets();
            }
            BuildSystemEvent::LogMessage { task_id, message } => {
                self.delegates.log_message(&task_id, &message);
            }
        }
    }

    fn apply_targets(
        &mut self,
        events: Vec<BuildTargetEvent>,
        reset: bool,
        result: Result<Vec<BuildTarget>>,
    ) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target: "buildscope::manager", error = %e, "Fetching build targets failed");
                if !events.is_empty() {
                    self.notify_everything("target snapshot unavailable");
                }
                return;
            }
        };

        if events.is_empty() {
            if reset {
                self.tracker.reset(snapshot);
            }
            return;
        }

        let affected = self.tracker.apply_snapshot(&events, snapshot, reset);
        match &affected {
            AffectedDocuments::All => self.invalidate_all("target change"),
            AffectedDocuments::Only(documents) => {
                self.invalidate(documents.iter(), "target change");
            }
        }
        debug!(
            target: "buildscope::manager",
            events = events.len(),
            "Applied target events"
        );
        self.coalescer.dependencies_updated(affected);
        self.coalescer.targets_changed(TargetChanges::Events(events));
    }

    /// Start one `targets()` fetch carrying all pending events, unless one
    /// is already running.
    fn fetch_targets(&mut self) {
        if self.targets_fetch_in_flight
            || (self.pending_target_events.is_empty() && !self.pending_reset)
        {
            return;
        }
        self.targets_fetch_in_flight = true;
        let events = std::mem::take(&mut self.pending_target_events);
        let reset = std::mem::take(&mut self.pending_reset);
        let backend = Arc::clone(&self.backend);
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let fetch = tokio::spawn(async move { backend.targets().await });
            let result = fetch.await.unwrap_or_else(|e| {
                Err(BuildSettingsError::Backend(format!("targets query panicked: {}", e)))
            });
            let _ = internal.send(Internal::TargetsFetched {
                events,
                reset,
                result,
            });
        });
    }

    fn spawn_query(&mut self, document: DocumentUri, generation: u64) {
        self.backend_queries += 1;
        let backend = Arc::clone(&self.backend);
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let query = {
                let document = document.clone();
                tokio::spawn(async move { backend.settings(&document).await })
            };
            let result = query.await.unwrap_or_else(|e| {
                Err(BuildSettingsError::Backend(format!("settings query panicked: {}", e)))
            });
            let _ = internal.send(Internal::QueryFinished {
                document,
                generation,
                result,
            });
        });
    }

    fn invalidate<'a>(&mut self, documents: impl IntoIterator<Item = &'a DocumentUri>, reason: &str) {
        let started = self.cache.invalidate(documents);
        if !started.is_empty() {
            debug!(
                target: "buildscope::manager",
                reason,
                refreshing = started.len(),
                "Invalidated cached settings"
            );
        }
        for (document, generation) in started {
            self.spawn_query(document, generation);
        }
    }

    fn invalidate_all(&mut self, reason: &str) {
        let started = self.cache.invalidate_all();
        debug!(
            target: "buildscope::manager",
            reason,
            refreshing = started.len(),
            "Invalidated all cached settings"
        );
        for (document, generation) in started {
            self.spawn_query(document, generation);
        }
    }

    /// Conservative refresh when the backend's changes cannot be narrowed.
    fn notify_everything(&mut self, reason: &str) {
        info!(target: "buildscope::manager", reason, "Treating everything as changed");
        self.invalidate_all(reason);
        self.coalescer.dependencies_updated(AffectedDocuments::All);
        self.coalescer.targets_changed(TargetChanges::Unknown);
    }

    fn everything_changed(&mut self, reason: &str) {
        self.notify_everything(reason);
        self.pending_target_events.clear();
        self.pending_reset = true;
        self.fetch_targets();
    }
}
