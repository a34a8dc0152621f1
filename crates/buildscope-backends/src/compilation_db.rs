// ABOUTME: Build system backed by a compile_commands.json compilation database
// ABOUTME: Direct per-file lookup; reload diffs entries and reports changed files

use async_trait::async_trait;
use buildscope_core::{
    BackendId, BuildSettings, BuildSettingsError, BuildSystem, BuildSystemEvent, BuildTarget,
    BuildTargetEvent, DocumentUri, Language, Result,
};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const COMPILE_COMMANDS_FILE: &str = "compile_commands.json";

/// Id of the single synthetic target owning every database entry.
pub const COMPILE_COMMANDS_TARGET: &str = "compile_commands";

#[derive(Debug, Deserialize)]
struct RawEntry {
    directory: PathBuf,
    file: PathBuf,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    #[serde(default)]
    command: Option<String>,
}

/// One resolved database entry. `arguments` excludes the compiler executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCommand {
    pub working_directory: PathBuf,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompilationDatabase {
    commands: HashMap<DocumentUri, CompileCommand>,
}

impl CompilationDatabase {
    pub fn parse(json: &str) -> Result<Self> {
        let entries: Vec<RawEntry> = serde_json::from_str(json)?;
        let mut commands = HashMap::with_capacity(entries.len());
        for entry in entries {
            let mut argv = match (entry.arguments, entry.command) {
                (Some(arguments), _) => arguments,
                (None, Some(command)) => split_command(&command),
                (None, None) => {
                    warn!(
                        target: "buildscope::compiledb",
                        file = %entry.file.display(),
                        "Entry has neither arguments nor command, skipping"
                    );
                    continue;
                }
            };
            if argv.is_empty() {
                continue;
            }
            argv.remove(0);

            let file = if entry.file.is_absolute() {
                entry.file
            } else {
                entry.directory.join(&entry.file)
            };
            let document = DocumentUri::from_path(&file)?;
            // Later entries for the same file win, as most consumers do.
            commands.insert(
                document,
                CompileCommand {
                    working_directory: entry.directory,
                    arguments: argv,
                },
            );
        }
        Ok(Self { commands })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn get(&self, document: &DocumentUri) -> Option<&CompileCommand> {
        self.commands.get(document)
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentUri> {
        self.commands.keys()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Documents added, removed, or whose command differs between the two.
    fn diff(&self, other: &CompilationDatabase) -> HashSet<DocumentUri> {
        let mut changed: HashSet<DocumentUri> = self
            .commands
            .iter()
            .filter(|(doc, cmd)| other.commands.get(*doc) != Some(*cmd))
            .map(|(doc, _)| doc.clone())
            .collect();
        changed.extend(
            other
                .commands
                .keys()
                .filter(|doc| !self.commands.contains_key(*doc))
                .cloned(),
        );
        changed
    }
}

/// Split a shell command line into words, honoring single quotes, double
/// quotes and backslash escapes.
pub fn split_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => current.push(c),
            (Some('"'), '"') => quote = None,
            (Some('"'), '\\') => match chars.next() {
                Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => current.push('\\'),
            },
            (Some(_), _) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, _) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

pub struct CompilationDatabaseBuildSystem {
    path: PathBuf,
    database: RwLock<Arc<CompilationDatabase>>,
    events: broadcast::Sender<BuildSystemEvent>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl CompilationDatabaseBuildSystem {
    pub fn open(path: impl Into<PathBuf>, event_capacity: usize) -> Result<Self> {
        let path = path.into();
        let database = CompilationDatabase::load(&path)?;
        info!(
            target: "buildscope::compiledb",
            path = %path.display(),
            entries = database.len(),
            "Loaded compilation database"
        );
        let (events, _rx) = broadcast::channel(event_capacity.max(1));
        Ok(Self {
            path,
            database: RwLock::new(Arc::new(database)),
            events,
            watcher: Mutex::new(None),
        })
    }

    /// Find a compilation database in `dir` or its `build/` subdirectory.
    pub fn search(dir: &Path) -> Option<PathBuf> {
        [dir.join(COMPILE_COMMANDS_FILE), dir.join("build").join(COMPILE_COMMANDS_FILE)]
            .into_iter()
            .find(|candidate| candidate.is_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn database(&self) -> Arc<CompilationDatabase> {
        Arc::clone(&self.database.read())
    }

    /// Re-read the database file. Emits events when any entry changed and
    /// returns the changed documents.
    pub fn reload(&self) -> Result<HashSet<DocumentUri>> {
        let fresh = CompilationDatabase::load(&self.path)?;
        let changed = {
            let mut current = self.database.write();
            let changed = current.diff(&fresh);
            *current = Arc::new(fresh);
            changed
        };

        if changed.is_empty() {
            debug!(target: "buildscope::compiledb", "Reload found no changes");
            return Ok(changed);
        }

        info!(
            target: "buildscope::compiledb",
            changed = changed.len(),
            "Compilation database changed"
        );
        // No receivers is fine: nobody is listening yet.
        let _ = self
            .events
            .send(BuildSystemEvent::TargetsChanged(vec![BuildTargetEvent::changed(
                COMPILE_COMMANDS_TARGET,
            )]));
        let _ = self
            .events
            .send(BuildSystemEvent::FileSettingsChanged(changed.clone()));
        Ok(changed)
    }

    /// Reload automatically whenever the database file is written.
    pub fn watch(self: &Arc<Self>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BuildSettingsError::Backend("database path has no parent".into()))?;
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let this: Weak<Self> = Arc::downgrade(self);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(target: "buildscope::compiledb", error = %e, "watcher error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let touches_db = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !touches_db {
                return;
            }
            if let Some(this) = this.upgrade() {
                if let Err(e) = this.reload() {
                    warn!(target: "buildscope::compiledb", error = %e, "reload after change failed");
                }
            }
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl BuildSystem for CompilationDatabaseBuildSystem {
    fn id(&self) -> BackendId {
        BackendId::CompilationDatabase
    }

    async fn settings(&self, document: &DocumentUri) -> Result<Option<BuildSettings>> {
        let database = self.database();
        Ok(database.get(document).map(|command| {
            BuildSettings::from_backend(
                BackendId::CompilationDatabase,
                Language::of_document(document),
                command.arguments.iter().cloned(),
                command.working_directory.clone(),
            )
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<BuildSystemEvent> {
        self.events.subscribe()
    }

    async fn targets(&self) -> Result<Vec<BuildTarget>> {
        let database = self.database();
        Ok(vec![BuildTarget::new(COMPILE_COMMANDS_TARGET, "Compilation database")
            .with_sources(database.documents().cloned())])
    }
}
