// ABOUTME: Target dependency graph used to compute which documents a target change affects
// ABOUTME: Walks reverse dependency edges breadth-first with a visited set so cycles terminate

use buildscope_core::{
    AffectedDocuments, BuildTarget, BuildTargetEvent, BuildTargetId, DocumentUri, TargetEventKind,
};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct DependencyTracker {
    targets: HashMap<BuildTargetId, BuildTarget>,
    /// Reverse edges: target -> targets that depend on it.
    dependents: HashMap<BuildTargetId, HashSet<BuildTargetId>>,
    owners: HashMap<DocumentUri, HashSet<BuildTargetId>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole graph with a fresh snapshot.
    pub fn reset(&mut self, snapshot: Vec<BuildTarget>) {
        self.targets.clear();
        self.dependents.clear();
        self.owners.clear();
        for target in snapshot {
            self.insert(target);
        }
        debug!(
            target: "buildscope::tracker",
            targets = self.targets.len(),
            documents = self.owners.len(),
            "Dependency graph rebuilt"
        );
    }

    /// Apply one target event. `definition` is the target as found in the
    /// backend's snapshot taken after the event, if present there.
    pub fn apply(
        &mut self,
        event: &BuildTargetEvent,
        definition: Option<BuildTarget>,
    ) -> AffectedDocuments {
        let Some(id) = &event.target else {
            return AffectedDocuments::All;
        };

        let mut affected = self.affected_by(id);
        match (event.kind, definition) {
            (TargetEventKind::Removed, _) | (_, None) => {
                self.remove(id);
            }
            (_, Some(target)) => {
                self.remove(id);
                self.insert(target);
                affected.extend(self.affected_by(id));
            }
        }
        AffectedDocuments::Only(affected)
    }

    /// Apply a batch of events with definitions taken from `snapshot`.
    /// Events are measured against the graph as it was before the batch, so
    /// documents that left a target are still reported. With `reset` the
    /// graph is then rebuilt from `snapshot`.
    pub fn apply_snapshot(
        &mut self,
        events: &[BuildTargetEvent],
        snapshot: Vec<BuildTarget>,
        reset: bool,
    ) -> AffectedDocuments {
        let definitions: HashMap<_, _> = snapshot
            .iter()
            .map(|target| (target.id.clone(), target))
            .collect();
        let mut affected = AffectedDocuments::none();
        for event in events {
            let definition = event
                .target
                .as_ref()
                .and_then(|id| definitions.get(id))
                .map(|target| (*target).clone());
            affected.merge(self.apply(event, definition));
        }
        if reset {
            self.reset(snapshot);
        }
        affected
    }

    fn insert(&mut self, mut target: BuildTarget) {
        if target.dependencies.remove(&target.id) {
            warn!(
                target: "buildscope::tracker",
                target_id = %target.id,
                "Ignoring self-dependency"
            );
        }
        for dependency in &target.dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(target.id.clone());
        }
        for source in &target.sources {
            self.owners
                .entry(source.clone())
                .or_default()
                .insert(target.id.clone());
        }
        self.targets.insert(target.id.clone(), target);
    }

    /// Drop a target's own edges. Edges other targets hold towards it stay,
    /// so a re-created target is wired back in.
    fn remove(&mut self, id: &BuildTargetId) -> Option<BuildTarget> {
        let target = self.targets.remove(id)?;
        for dependency in &target.dependencies {
            if let Some(dependents) = self.dependents.get_mut(dependency) {
                dependents.remove(id);
                if dependents.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
        for source in &target.sources {
            if let Some(owners) = self.owners.get_mut(source) {
                owners.remove(id);
                if owners.is_empty() {
                    self.owners.remove(source);
                }
            }
        }
        Some(target)
    }

    /// Sources of `id` and of every target that transitively depends on it.
    pub fn affected_by(&self, id: &BuildTargetId) -> HashSet<DocumentUri> {
        let mut affected = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([id.clone()]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(target) = self.targets.get(&current) {
                affected.extend(target.sources.iter().cloned());
            }
            if let Some(dependents) = self.dependents.get(&current) {
                queue.extend(
                    dependents
                        .iter()
                        .filter(|d| !visited.contains(*d))
                        .cloned(),
                );
            }
        }
        affected
    }

    #[cfg(test)]
    pub fn targets_for(&self, document: &DocumentUri) -> Vec<BuildTargetId> {
        let mut targets: Vec<_> = self
            .owners
            .get(document)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    pub fn known_documents(&self) -> HashSet<DocumentUri> {
        self.owners.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn target(&self, id: &BuildTargetId) -> Option<&BuildTarget> {
        self.targets.get(id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
