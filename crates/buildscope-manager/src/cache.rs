// ABOUTME: Per-document build settings cache owned by the manager's owner task
// ABOUTME: Tracks in-flight backend queries, stale entries and a lock-free read view

use buildscope_core::{BuildSettings, DocumentUri, FallbackSettingsComputer, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub settings: BuildSettings,
    pub last_updated: Instant,
    pub stale: bool,
}

/// Lifecycle of one document in the cache. Absence of an entry after
/// eviction reads as `Unresolved` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Unresolved,
    Resolving,
    Resolved { fallback: bool },
    Stale,
}

/// Read-only view of resolved settings, safe to query from any task.
#[derive(Clone, Default)]
pub struct SettingsView {
    entries: Arc<DashMap<DocumentUri, BuildSettings>>,
}

impl SettingsView {
    pub fn get(&self, document: &DocumentUri) -> Option<BuildSettings> {
        self.entries.get(document).map(|e| e.value().clone())
    }
}

struct InFlight {
    generation: u64,
    waiters: Vec<oneshot::Sender<BuildSettings>>,
    /// Invalidated again while the query ran; its answer may be outdated.
    requery: bool,
    /// A caller gave up waiting and was handed fallback settings.
    fallback_served: bool,
}

/// Outcome of storing a finished backend query.
#[derive(Debug)]
pub struct Completion {
    /// The stored value differs from what callers could have observed before.
    pub changed: bool,
    /// Generation of a follow-up query to start immediately.
    pub requery: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub stale: usize,
    pub fallback: usize,
    pub in_flight: usize,
}

pub struct SettingsCache {
    entries: HashMap<DocumentUri, CacheEntry>,
    in_flight: HashMap<DocumentUri, InFlight>,
    view: SettingsView,
    fallback: Arc<FallbackSettingsComputer>,
    next_generation: u64,
}

impl SettingsCache {
    pub fn new(fallback: Arc<FallbackSettingsComputer>) -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            view: SettingsView::default(),
            fallback,
            next_generation: 0,
        }
    }

    pub fn view(&self) -> SettingsView {
        self.view.clone()
    }

    pub fn get(&self, document: &DocumentUri) -> Option<&CacheEntry> {
        self.entries.get(document)
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentUri> {
        self.entries.keys()
    }

    pub fn state(&self, document: &DocumentUri) -> DocumentState {
        let querying = self.in_flight.contains_key(document);
        match self.entries.get(document) {
            None if querying => DocumentState::Resolving,
            None => DocumentState::Unresolved,
            Some(entry) if entry.stale && querying => DocumentState::Resolving,
            Some(entry) if entry.stale => DocumentState::Stale,
            Some(entry) => DocumentState::Resolved {
                fallback: entry.settings.is_fallback(),
            },
        }
    }

    fn begin(&mut self, document: &DocumentUri) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.in_flight.insert(
            document.clone(),
            InFlight {
                generation,
                waiters: Vec::new(),
                requery: false,
                fallback_served: false,
            },
        );
        generation
    }

    /// Wait on the running query for `document`, or start one. Returns the
    /// generation of a newly started query that the caller must run.
    pub fn join_or_begin(
        &mut self,
        document: &DocumentUri,
        waiter: oneshot::Sender<BuildSettings>,
    ) -> Option<u64> {
        if let Some(flight) = self.in_flight.get_mut(document) {
            flight.waiters.push(waiter);
            return None;
        }
        let generation = self.begin(document);
        if let Some(flight) = self.in_flight.get_mut(document) {
            flight.waiters.push(waiter);
        }
        Some(generation)
    }

    pub fn mark_fallback_served(&mut self, document: &DocumentUri) {
        if let Some(flight) = self.in_flight.get_mut(document) {
            flight.fallback_served = true;
        }
    }

    /// Store the result of query `generation`. Results for evicted or
    /// superseded queries are dropped and yield `None`.
    pub fn complete(
        &mut self,
        document: &DocumentUri,
        generation: u64,
        result: Result<Option<BuildSettings>>,
    ) -> Option<Completion> {
        match self.in_flight.get(document) {
            Some(flight) if flight.generation == generation => {}
            _ => {
                debug!(
                    target: "buildscope::cache",
                    document = %document,
                    generation,
                    "Discarding result for evicted document"
                );
                return None;
            }
        }
        let flight = self.in_flight.remove(document)?;
        let previous = self.entries.get(document).map(|e| e.settings.clone());

        let fresh = match result {
            Ok(Some(settings)) => Some(settings),
            Ok(None) => Some(self.fallback.compute(document)),
            Err(e) => {
                warn!(
                    target: "buildscope::cache",
                    document = %document,
                    error = %e,
                    retained_stale = previous.is_some(),
                    "Backend query failed"
                );
                // Keep a stale value over replacing it with fallback.
                match previous {
                    Some(_) => None,
                    None => Some(self.fallback.compute(document)),
                }
            }
        };

        let stored = fresh.clone();
        if let Some(settings) = fresh {
            self.view.entries.insert(document.clone(), settings.clone());
            self.entries.insert(
                document.clone(),
                CacheEntry {
                    settings,
                    last_updated: Instant::now(),
                    stale: false,
                },
            );
        }

        // A waiter that is gone gave up on the query and was served fallback,
        // even if its notice has not reached us yet.
        let mut fallback_served = flight.fallback_served;
        if let Some(entry) = self.entries.get(document) {
            for waiter in flight.waiters {
                if waiter.send(entry.settings.clone()).is_err() {
                    fallback_served = true;
                }
            }
        }

        let changed = match (&stored, &previous) {
            (Some(fresh), Some(previous)) => fresh != previous,
            (Some(fresh), None) => fallback_served && *fresh != self.fallback.compute(document),
            (None, _) => false,
        };

        let requery = flight.requery.then(|| self.begin(document));
        Some(Completion { changed, requery })
    }

    /// Mark entries stale and return the queries to start. Documents with a
    /// query already running get a follow-up instead of a second query.
    pub fn invalidate<'a>(
        &mut self,
        documents: impl IntoIterator<Item = &'a DocumentUri>,
    ) -> Vec<(DocumentUri, u64)> {
        let mut started = Vec::new();
        for document in documents {
            let cached = match self.entries.get_mut(document) {
                Some(entry) => {
                    entry.stale = true;
                    true
                }
                None => false,
            };
            if let Some(flight) = self.in_flight.get_mut(document) {
                flight.requery = true;
                continue;
            }
            if cached {
                let generation = self.begin(document);
                started.push((document.clone(), generation));
            }
        }
        started
    }

    pub fn invalidate_all(&mut self) -> Vec<(DocumentUri, u64)> {
        let documents: Vec<DocumentUri> = self
            .entries
            .keys()
            .chain(self.in_flight.keys())
            .cloned()
            .collect();
        self.invalidate(documents.iter())
    }

    /// Drop the entry and any running query for `document`. Returns whether
    /// anything was removed; evicting twice is fine.
    pub fn evict(&mut self, document: &DocumentUri) -> bool {
        let had_entry = self.entries.remove(document).is_some();
        self.view.entries.remove(document);
        let had_query = self.in_flight.remove(document).is_some();
        had_entry || had_query
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            stale: self.entries.values().filter(|e| e.stale).count(),
            fallback: self
                .entries
                .values()
                .filter(|e| e.settings.is_fallback())
                .count(),
            in_flight: self.in_flight.len(),
        }
    }
}
