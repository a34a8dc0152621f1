use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::DocumentUri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Swift,
    C,
    Cpp,
    ObjC,
    ObjCpp,
    Other,
}

impl Language {
    /// Map a file extension (without the dot, any case) to a language.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "swift" => Language::Swift,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "c++" | "hpp" | "hh" | "hxx" => Language::Cpp,
            "m" => Language::ObjC,
            "mm" => Language::ObjCpp,
            _ => Language::Other,
        }
    }

    pub fn of_document(document: &DocumentUri) -> Self {
        document
            .extension()
            .map(|ext| Self::from_extension(&ext))
            .unwrap_or(Language::Other)
    }

    pub fn is_c_family(self) -> bool {
        matches!(
            self,
            Language::C | Language::Cpp | Language::ObjC | Language::ObjCpp
        )
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Language::Swift => "swift",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::ObjC => "objc",
            Language::ObjCpp => "objcpp",
            Language::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Which backend produced a set of build settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendId {
    CompilationDatabase,
    PackageManager,
    FallbackOnly,
    Other(String),
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendId::CompilationDatabase => write!(f, "compilation-database"),
            BackendId::PackageManager => write!(f, "package-manager"),
            BackendId::FallbackOnly => write!(f, "fallback-only"),
            BackendId::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Immutable snapshot of the compiler invocation for one document.
///
/// Clones share the argument slice. A changed invocation is a new value;
/// nothing here is ever patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    compiler_arguments: Arc<[String]>,
    working_directory: PathBuf,
    language: Language,
    is_fallback: bool,
    source_backend: Option<BackendId>,
}

impl BuildSettings {
    /// Settings answered by a real backend.
    pub fn from_backend<I, S>(
        backend: BackendId,
        language: Language,
        compiler_arguments: I,
        working_directory: impl Into<PathBuf>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            compiler_arguments: compiler_arguments.into_iter().map(Into::into).collect(),
            working_directory: working_directory.into(),
            language,
            is_fallback: false,
            source_backend: Some(backend),
        }
    }

    /// Locally computed best-effort settings.
    pub fn fallback<I, S>(
        language: Language,
        compiler_arguments: I,
        working_directory: impl Into<PathBuf>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            compiler_arguments: compiler_arguments.into_iter().map(Into::into).collect(),
            working_directory: working_directory.into(),
            language,
            is_fallback: true,
            source_backend: None,
        }
    }

    pub fn compiler_arguments(&self) -> &[String] {
        &self.compiler_arguments
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    pub fn source_backend(&self) -> Option<&BackendId> {
        self.source_backend.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTargetId(String);

impl BuildTargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BuildTargetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A build system's unit of compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    pub id: BuildTargetId,
    pub display_name: String,
    #[serde(default)]
    pub sources: HashSet<DocumentUri>,
    #[serde(default)]
    pub dependencies: HashSet<BuildTargetId>,
}

impl BuildTarget {
    pub fn new(id: impl Into<BuildTargetId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            sources: HashSet::new(),
            dependencies: HashSet::new(),
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = DocumentUri>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_dependencies(
        mut self,
        dependencies: impl IntoIterator<Item = BuildTargetId>,
    ) -> Self {
        self.dependencies.extend(dependencies);
        self
    }
}

impl From<String> for BuildTargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetEventKind {
    Created,
    Changed,
    Removed,
}

/// A change to one target. `target: None` means the backend could not name
/// the target and everything must be assumed affected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildTargetEvent {
    pub target: Option<BuildTargetId>,
    pub kind: TargetEventKind,
}

impl BuildTargetEvent {
    pub fn created(target: impl Into<BuildTargetId>) -> Self {
        Self {
            target: Some(target.into()),
            kind: TargetEventKind::Created,
        }
    }

    pub fn changed(target: impl Into<BuildTargetId>) -> Self {
        Self {
            target: Some(target.into()),
            kind: TargetEventKind::Changed,
        }
    }

    pub fn removed(target: impl Into<BuildTargetId>) -> Self {
        Self {
            target: Some(target.into()),
            kind: TargetEventKind::Removed,
        }
    }

    /// Catch-all change without a usable target id.
    pub fn everything() -> Self {
        Self {
            target: None,
            kind: TargetEventKind::Changed,
        }
    }
}

/// Documents affected by a dependency change. `All` is the conservative
/// full refresh; it is never spelled as an empty `Only`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffectedDocuments {
    All,
    Only(HashSet<DocumentUri>),
}

impl AffectedDocuments {
    pub fn none() -> Self {
        AffectedDocuments::Only(HashSet::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, AffectedDocuments::All)
    }

    /// True only for an empty `Only`; `All` is never empty.
    pub fn is_empty(&self) -> bool {
        match self {
            AffectedDocuments::All => false,
            AffectedDocuments::Only(docs) => docs.is_empty(),
        }
    }

    pub fn contains(&self, document: &DocumentUri) -> bool {
        match self {
            AffectedDocuments::All => true,
            AffectedDocuments::Only(docs) => docs.contains(document),
        }
    }

    /// Union in place. `All` absorbs everything.
    pub fn merge(&mut self, other: AffectedDocuments) {
        match (&mut *self, other) {
            (AffectedDocuments::All, _) => {}
            (_, AffectedDocuments::All) => *self = AffectedDocuments::All,
            (AffectedDocuments::Only(mine), AffectedDocuments::Only(theirs)) => {
                mine.extend(theirs)
            }
        }
    }
}

impl FromIterator<DocumentUri> for AffectedDocuments {
    fn from_iter<T: IntoIterator<Item = DocumentUri>>(iter: T) -> Self {
        AffectedDocuments::Only(iter.into_iter().collect())
    }
}

/// Payload of a target notification. `Unknown` means target information is
/// wholly unavailable, as opposed to a list of concrete events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetChanges {
    Unknown,
    Events(Vec<BuildTargetEvent>),
}

/// Everything a backend can report asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSystemEvent {
    FileSettingsChanged(HashSet<DocumentUri>),
    DependenciesUpdated(AffectedDocuments),
    TargetsChanged(Vec<BuildTargetEvent>),
    LogMessage { task_id: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str) -> DocumentUri {
        DocumentUri::from_path(path).unwrap()
    }

    #[test]
    fn language_from_extension() {
        assert_eq!(Language::from_extension("swift"), Language::Swift);
        assert_eq!(Language::from_extension("h"), Language::C);
        assert_eq!(Language::from_extension("CC"), Language::Cpp);
        assert_eq!(Language::from_extension("m"), Language::ObjC);
        assert_eq!(Language::from_extension("mm"), Language::ObjCpp);
        assert_eq!(Language::from_extension("rs"), Language::Other);
        assert_eq!(Language::of_document(&doc("/w/README")), Language::Other);
    }

    #[test]
    fn settings_clones_share_arguments() {
        let settings = BuildSettings::from_backend(
            BackendId::CompilationDatabase,
            Language::C,
            ["-DFOO", "-Iinclude"],
            "/w",
        );
        let copy = settings.clone();
        assert!(std::ptr::eq(
            settings.compiler_arguments().as_ptr(),
            copy.compiler_arguments().as_ptr()
        ));
        assert!(!copy.is_fallback());
        assert_eq!(copy.source_backend(), Some(&BackendId::CompilationDatabase));
    }

    #[test]
    fn affected_documents_merge() {
        let mut affected: AffectedDocuments = [doc("/w/a.c")].into_iter().collect();
        affected.merge([doc("/w/b.c")].into_iter().collect());
        assert!(affected.contains(&doc("/w/b.c")));
        assert!(!affected.contains(&doc("/w/c.c")));

        affected.merge(AffectedDocuments::All);
        assert!(affected.is_all());
        affected.merge(AffectedDocuments::none());
        assert!(affected.is_all());
        assert!(!affected.is_empty());
        assert!(AffectedDocuments::none().is_empty());
    }
}
