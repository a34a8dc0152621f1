// ABOUTME: Build system backed by a package manager's resolved build plan
// ABOUTME: Lazily resolves the plan once, derives per-file settings from target dependencies

use async_trait::async_trait;
use buildscope_core::{
    BackendId, BuildSettings, BuildSettingsError, BuildSystem, BuildSystemEvent, BuildTarget,
    BuildTargetEvent, BuildTargetId, DocumentUri, Language, Result,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Resolved build plan as described by the package manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Where dependency modules are built; relative paths are taken from the package root
    #[serde(default = "default_build_directory")]
    pub build_directory: PathBuf,
    #[serde(default)]
    pub targets: Vec<PlanTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTarget {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub compiler_arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

fn default_build_directory() -> PathBuf {
    PathBuf::from(".build")
}

/// Produces a build plan, typically by asking the package manager.
#[async_trait]
pub trait PlanLoader: Send + Sync {
    async fn load(&self) -> Result<BuildPlan>;
}

/// Reads a build plan from a JSON file.
pub struct JsonPlanLoader {
    path: PathBuf,
}

impl JsonPlanLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PlanLoader for JsonPlanLoader {
    async fn load(&self) -> Result<BuildPlan> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Runs the package manager and parses the build plan from its stdout.
pub struct CommandPlanLoader {
    program: String,
    args: Vec<String>,
    current_dir: PathBuf,
}

impl CommandPlanLoader {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
        current_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            current_dir: current_dir.into(),
        }
    }
}

#[async_trait]
impl PlanLoader for CommandPlanLoader {
    async fn load(&self) -> Result<BuildPlan> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.current_dir)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildSettingsError::Backend(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// A plan with paths resolved against the package root and lookups indexed.
#[derive(Debug)]
struct ResolvedPlan {
    build_directory: PathBuf,
    root: PathBuf,
    targets: BTreeMap<BuildTargetId, ResolvedTarget>,
    owners: HashMap<DocumentUri, BuildTargetId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedTarget {
    display_name: String,
    sources: Vec<DocumentUri>,
    dependencies: Vec<BuildTargetId>,
    compiler_arguments: Vec<String>,
    working_directory: Option<PathBuf>,
}

impl ResolvedPlan {
    fn resolve(root: &Path, plan: BuildPlan) -> Result<Self> {
        let absolute = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };

        let mut targets = BTreeMap::new();
        for target in plan.targets {
            let sources = target
                .sources
                .iter()
                .map(|s| DocumentUri::from_path(absolute(s)))
                .collect::<Result<Vec<_>>>()?;
            let id = BuildTargetId::new(target.name.clone());
            targets.insert(
                id,
                ResolvedTarget {
                    display_name: target.display_name.unwrap_or(target.name),
                    sources,
                    dependencies: target
                        .dependencies
                        .into_iter()
                        .map(BuildTargetId::new)
                        .collect(),
                    compiler_arguments: target.compiler_arguments,
                    working_directory: target.working_directory.map(|p| absolute(&p)),
                },
            );
        }

        // First target in id order owns a file listed by several targets.
        let mut owners = HashMap::new();
        for (id, target) in &targets {
            for source in &target.sources {
                owners.entry(source.clone()).or_insert_with(|| id.clone());
            }
        }

        Ok(Self {
            build_directory: absolute(&plan.build_directory),
            root: root.to_path_buf(),
            targets,
            owners,
        })
    }

    /// Transitive dependencies of `target`, excluding itself.
    fn transitive_dependencies(&self, target: &BuildTargetId) -> BTreeSet<BuildTargetId> {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<&BuildTargetId> = VecDeque::new();
        if let Some(t) = self.targets.get(target) {
            queue.extend(t.dependencies.iter());
        }
        while let Some(dep) = queue.pop_front() {
            if dep == target || !visited.insert(dep.clone()) {
                continue;
            }
            match self.targets.get(dep) {
                Some(t) => queue.extend(t.dependencies.iter()),
                None => debug!(
                    target: "buildscope::package",
                    dependency = %dep,
                    "Dependency is not part of the plan"
                ),
            }
        }
        visited
    }

    fn settings_for(&self, document: &DocumentUri) -> Option<BuildSettings> {
        let owner = self.owners.get(document)?;
        let target = self.targets.get(owner)?;

        let mut args = target.compiler_arguments.clone();
        for dep in self.transitive_dependencies(owner) {
            args.push("-I".to_string());
            args.push(
                self.build_directory
                    .join(format!("{}.build", dep))
                    .display()
                    .to_string(),
            );
        }
        if let Some(path) = document.path() {
            args.push(path.display().to_string());
        }

        Some(BuildSettings::from_backend(
            BackendId::PackageManager,
            Language::of_document(document),
            args,
            target
                .working_directory
                .clone()
                .unwrap_or_else(|| self.root.clone()),
        ))
    }

    fn build_targets(&self) -> Vec<BuildTarget> {
        self.targets
            .iter()
            .map(|(id, t)| BuildTarget {
                id: id.clone(),
                display_name: t.display_name.clone(),
                sources: t.sources.iter().cloned().collect(),
                dependencies: t.dependencies.iter().filter(|d| *d != id).cloned().collect(),
            })
            .collect()
    }

    /// Target events and settings-changed documents between two plans.
    fn diff(&self, next: &ResolvedPlan) -> (Vec<BuildTargetEvent>, HashSet<DocumentUri>) {
        let mut events = Vec::new();
        for (id, target) in &next.targets {
            match self.targets.get(id) {
                None => events.push(BuildTargetEvent::created(id.clone())),
                Some(old) if old != target => events.push(BuildTargetEvent::changed(id.clone())),
                Some(_) => {}
            }
        }
        for id in self.targets.keys() {
            if !next.targets.contains_key(id) {
                events.push(BuildTargetEvent::removed(id.clone()));
            }
        }

        let changed = self
            .owners
            .keys()
            .chain(next.owners.keys())
            .filter(|doc| self.settings_for(doc) != next.settings_for(doc))
            .cloned()
            .collect();
        (events, changed)
    }
}

pub struct PackageManagerBuildSystem {
    root: PathBuf,
    loader: Box<dyn PlanLoader>,
    plan: RwLock<Option<Arc<ResolvedPlan>>>,
    load_lock: Mutex<()>,
    resolutions: AtomicU64,
    events: broadcast::Sender<BuildSystemEvent>,
}

impl PackageManagerBuildSystem {
    pub fn new(
        root: impl Into<PathBuf>,
        loader: impl PlanLoader + 'static,
        event_capacity: usize,
    ) -> Self {
        let (events, _rx) = broadcast::channel(event_capacity.max(1));
        Self {
            root: root.into(),
            loader: Box::new(loader),
            plan: RwLock::new(None),
            load_lock: Mutex::new(()),
            resolutions: AtomicU64::new(0),
            events,
        }
    }

    /// Number of times the plan has been loaded.
    pub fn resolution_count(&self) -> u64 {
        self.resolutions.load(Ordering::SeqCst)
    }

    async fn load_plan(&self) -> Result<Arc<ResolvedPlan>> {
        let task_id = format!(
            "package-resolve-{}",
            self.resolutions.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.log(&task_id, format!("Resolving build plan in {}", self.root.display()));
        let plan = match self.loader.load().await {
            Ok(plan) => plan,
            Err(e) => {
                self.log(&task_id, format!("Build plan resolution failed: {}", e));
                return Err(e);
            }
        };
        let resolved = Arc::new(ResolvedPlan::resolve(&self.root, plan)?);
        self.log(
            &task_id,
            format!("Resolved {} targets", resolved.targets.len()),
        );
        info!(
            target: "buildscope::package",
            root = %self.root.display(),
            targets = resolved.targets.len(),
            "Build plan resolved"
        );
        Ok(resolved)
    }

    /// Current plan, resolving it on first use. Concurrent first callers
    /// share one resolution.
    async fn plan(&self) -> Result<Arc<ResolvedPlan>> {
        let cached = self.plan.read().clone();
        if let Some(plan) = cached {
            return Ok(plan);
        }
        let _guard = self.load_lock.lock().await;
        let cached = self.plan.read().clone();
        if let Some(plan) = cached {
            return Ok(plan);
        }
        let plan = self.load_plan().await?;
        *self.plan.write() = Some(Arc::clone(&plan));
        Ok(plan)
    }

    /// Re-resolve the plan and report what changed. A failed reload keeps
    /// the previous plan.
    pub async fn reload(&self) -> Result<Vec<BuildTargetEvent>> {
        let _guard = self.load_lock.lock().await;
        let next = self.load_plan().await?;
        let previous = self.plan.write().replace(Arc::clone(&next));

        let Some(previous) = previous else {
            // Nobody has seen targets yet; everything is new.
            let events: Vec<_> = next
                .targets
                .keys()
                .cloned()
                .map(BuildTargetEvent::created)
                .collect();
            self.emit(BuildSystemEvent::TargetsChanged(events.clone()));
            return Ok(events);
        };

        let (events, changed) = previous.diff(&next);
        if !events.is_empty() {
            self.emit(BuildSystemEvent::TargetsChanged(events.clone()));
        }
        if !changed.is_empty() {
            self.emit(BuildSystemEvent::FileSettingsChanged(changed));
        }
        Ok(events)
    }

    fn log(&self, task_id: &str, message: String) {
        self.emit(BuildSystemEvent::LogMessage {
            task_id: task_id.to_string(),
            message,
        });
    }

    fn emit(&self, event: BuildSystemEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "buildscope::package", "No event subscribers");
        }
    }
}

#[async_trait]
impl BuildSystem for PackageManagerBuildSystem {
    fn id(&self) -> BackendId {
        BackendId::PackageManager
    }

    async fn settings(&self, document: &DocumentUri) -> Result<Option<BuildSettings>> {
        let plan = self.plan().await.map_err(|e| {
            warn!(target: "buildscope::package", error = %e, "Build plan unavailable");
            e
        })?;
        Ok(plan.settings_for(document))
    }

    fn subscribe(&self) -> broadcast::Receiver<BuildSystemEvent> {
        self.events.subscribe()
    }

    async fn targets(&self) -> Result<Vec<BuildTarget>> {
        Ok(self.plan().await?.build_targets())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(json: &str) -> ResolvedPlan {
        ResolvedPlan::resolve(Path::new("/pkg"), serde_json::from_str(json).unwrap()).unwrap()
    }

    fn doc(path: &str) -> DocumentUri {
        DocumentUri::from_path(path).unwrap()
    }

    const PLAN: &str = r#"{
        "targets": [
            {"name": "App", "sources": ["Sources/App/main.swift"], "dependencies": ["Core"],
             "compiler_arguments": ["-module-name", "App"]},
            {"name": "Core", "sources": ["Sources/Core/core.swift"], "dependencies": ["Base"]},
            {"name": "Base", "sources": ["Sources/Base/base.swift"], "dependencies": ["Core"]}
        ]
    }"#;

    #[test]
    fn settings_include_transitive_dependencies() {
        let plan = plan(PLAN);
        let settings = plan.settings_for(&doc("/pkg/Sources/App/main.swift")).unwrap();
        assert_eq!(
            settings.compiler_arguments(),
            [
                "-module-name",
                "App",
                "-I",
                "/pkg/.build/Base.build",
                "-I",
                "/pkg/.build/Core.build",
                "/pkg/Sources/App/main.swift",
            ]
        );
        assert_eq!(settings.language(), Language::Swift);
        assert_eq!(settings.working_directory(), Path::new("/pkg"));
        assert!(plan.settings_for(&doc("/pkg/Package.swift")).is_none());
    }

    #[test]
    fn dependency_cycle_terminates_and_excludes_self() {
        let plan = plan(PLAN);
        let deps = plan.transitive_dependencies(&BuildTargetId::new("Core"));
        assert_eq!(deps, [BuildTargetId::new("Base")].into_iter().collect());
    }

    #[test]
    fn diff_reports_target_events_and_affected_files() {
        let old = plan(PLAN);
        let new = plan(
            r#"{
            "targets": [
                {"name": "App", "sources": ["Sources/App/main.swift"], "dependencies": ["Core"],
                 "compiler_arguments": ["-module-name", "App"]},
                {"name": "Core", "sources": ["Sources/Core/core.swift"]},
                {"name": "Tools", "sources": ["Sources/Tools/tool.swift"]}
            ]
        }"#,
        );
        let (events, changed) = old.diff(&new);
        assert!(events.contains(&BuildTargetEvent::changed("Core")));
        assert!(events.contains(&BuildTargetEvent::created("Tools")));
        assert!(events.contains(&BuildTargetEvent::removed("Base")));
        assert!(!events.iter().any(|e| e.target == Some("App".into())));

        // App lost Base as a transitive dependency, so its settings changed too.
        assert!(changed.contains(&doc("/pkg/Sources/App/main.swift")));
        assert!(changed.contains(&doc("/pkg/Sources/Base/base.swift")));
        assert!(changed.contains(&doc("/pkg/Sources/Tools/tool.swift")));
    }
}
