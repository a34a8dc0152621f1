// ABOUTME: Integration tests for the on-disk backends.
// ABOUTME: Uses temp directories for compile_commands.json and build plan fixtures.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use buildscope_backends::{
    CommandPlanLoader, CompilationDatabaseBuildSystem, JsonPlanLoader, PackageManagerBuildSystem,
    COMPILE_COMMANDS_TARGET,
};
use buildscope_core::{
    BackendId, BuildSystem, BuildSystemEvent, BuildTargetEvent, BuildTargetId, DocumentUri,
    Language,
};
use tempfile::TempDir;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn write_db(dir: &Path, entries: &[(&str, &[&str])]) -> std::path::PathBuf {
    let json: Vec<serde_json::Value> = entries
        .iter()
        .map(|(file, args)| {
            serde_json::json!({
                "directory": dir,
                "file": file,
                "arguments": args,
            })
        })
        .collect();
    let path = dir.join("compile_commands.json");
    std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn compilation_database_answers_known_files_only() -> Result<()> {
    let tmp = TempDir::new()?;
    write_db(tmp.path(), &[("a.c", &["clang", "-DA", "a.c"])]);

    let found = CompilationDatabaseBuildSystem::search(tmp.path()).expect("database found");
    let backend = CompilationDatabaseBuildSystem::open(found, 16)?;

    let a = DocumentUri::from_path(tmp.path().join("a.c"))?;
    let settings = backend.settings(&a).await?.expect("settings for a.c");
    assert_eq!(settings.compiler_arguments(), ["-DA", "a.c"]);
    assert_eq!(settings.language(), Language::C);
    assert_eq!(settings.working_directory(), tmp.path());
    assert_eq!(settings.source_backend(), Some(&BackendId::CompilationDatabase));
    assert!(!settings.is_fallback());

    let unknown = DocumentUri::from_path(tmp.path().join("b.c"))?;
    assert!(backend.settings(&unknown).await?.is_none());

    let targets = backend.targets().await?;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].id, BuildTargetId::new(COMPILE_COMMANDS_TARGET));
    assert!(targets[0].sources.contains(&a));
    Ok(())
}

#[tokio::test]
async fn compilation_database_search_checks_build_dir() -> Result<()> {
    let tmp = TempDir::new()?;
    assert!(CompilationDatabaseBuildSystem::search(tmp.path()).is_none());
    std::fs::create_dir(tmp.path().join("build"))?;
    let path = write_db(&tmp.path().join("build"), &[]);
    assert_eq!(CompilationDatabaseBuildSystem::search(tmp.path()), Some(path));
    Ok(())
}

#[tokio::test]
async fn compilation_database_reload_emits_changes() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = write_db(
        tmp.path(),
        &[("a.c", &["cc", "-DA"]), ("b.c", &["cc", "-DB"])],
    );
    let backend = CompilationDatabaseBuildSystem::open(&path, 16)?;
    let mut rx = backend.subscribe();

    assert!(backend.reload()?.is_empty());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    write_db(
        tmp.path(),
        &[("a.c", &["cc", "-DA"]), ("b.c", &["cc", "-DB=2"])],
    );
    let changed = backend.reload()?;
    let b = DocumentUri::from_path(tmp.path().join("b.c"))?;
    assert_eq!(changed, [b.clone()].into_iter().collect::<HashSet<_>>());

    assert_eq!(
        rx.recv().await?,
        BuildSystemEvent::TargetsChanged(vec![BuildTargetEvent::changed(COMPILE_COMMANDS_TARGET)])
    );
    assert_eq!(rx.recv().await?, BuildSystemEvent::FileSettingsChanged(changed));

    let settings = backend.settings(&b).await?.expect("settings for b.c");
    assert_eq!(settings.compiler_arguments(), ["-DB=2"]);
    Ok(())
}

#[tokio::test]
async fn watched_compilation_database_reloads_on_write() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = write_db(
        tmp.path(),
        &[("a.c", &["cc", "-DA"]), ("b.c", &["cc", "-DB"])],
    );
    let backend = Arc::new(CompilationDatabaseBuildSystem::open(&path, 64)?);
    let mut rx = backend.subscribe();
    backend.watch()?;

    // Give the watcher a moment to register before writing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    write_db(
        tmp.path(),
        &[("a.c", &["cc", "-DA"]), ("b.c", &["cc", "-DB=2"])],
    );

    let b = DocumentUri::from_path(tmp.path().join("b.c"))?;
    let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(BuildSystemEvent::FileSettingsChanged(changed)) if changed.contains(&b) => {
                    return true
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await?;
    assert!(reloaded);

    let settings = backend.settings(&b).await?.expect("settings for b.c");
    assert_eq!(settings.compiler_arguments(), ["-DB=2"]);
    Ok(())
}

#[tokio::test]
async fn compilation_database_reload_failure_keeps_previous() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = write_db(tmp.path(), &[("a.c", &["cc", "-DA"])]);
    let backend = CompilationDatabaseBuildSystem::open(&path, 16)?;

    std::fs::write(&path, "{ not json")?;
    assert!(backend.reload().is_err());

    let a = DocumentUri::from_path(tmp.path().join("a.c"))?;
    assert!(backend.settings(&a).await?.is_some());
    Ok(())
}

const PLAN: &str = r#"{
    "build_directory": ".build/debug",
    "targets": [
        {"name": "App", "sources": ["Sources/App/main.swift"], "dependencies": ["Core"]},
        {"name": "Core", "sources": ["Sources/Core/core.swift"],
         "compiler_arguments": ["-enable-testing"]}
    ]
}"#;

#[tokio::test]
async fn package_plan_resolves_once_for_concurrent_callers() -> Result<()> {
    let tmp = TempDir::new()?;
    let plan_path = tmp.path().join("plan.json");
    std::fs::write(&plan_path, PLAN)?;

    let backend = Arc::new(PackageManagerBuildSystem::new(
        tmp.path(),
        JsonPlanLoader::new(&plan_path),
        16,
    ));
    let main = DocumentUri::from_path(tmp.path().join("Sources/App/main.swift"))?;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let backend = Arc::clone(&backend);
            let main = main.clone();
            tokio::spawn(async move { backend.settings(&main).await })
        })
        .collect();
    for handle in handles {
        let settings = handle.await??.expect("settings for main.swift");
        assert_eq!(settings.source_backend(), Some(&BackendId::PackageManager));
        assert!(settings
            .compiler_arguments()
            .iter()
            .any(|a| a.ends_with("Core.build")));
    }
    assert_eq!(backend.resolution_count(), 1);

    let targets = backend.targets().await?;
    let app = targets
        .iter()
        .find(|t| t.id == BuildTargetId::new("App"))
        .expect("App target");
    assert!(app.dependencies.contains(&BuildTargetId::new("Core")));
    assert!(app.sources.contains(&main));
    Ok(())
}

#[tokio::test]
async fn package_reload_reports_target_and_file_changes() -> Result<()> {
    let tmp = TempDir::new()?;
    let plan_path = tmp.path().join("plan.json");
    std::fs::write(&plan_path, PLAN)?;
    let backend = PackageManagerBuildSystem::new(tmp.path(), JsonPlanLoader::new(&plan_path), 64);
    backend.targets().await?;
    let mut rx = backend.subscribe();

    std::fs::write(
        &plan_path,
        r#"{
        "build_directory": ".build/debug",
        "targets": [
            {"name": "App", "sources": ["Sources/App/main.swift"], "dependencies": ["Core"]},
            {"name": "Core", "sources": ["Sources/Core/core.swift"],
             "compiler_arguments": ["-enable-testing", "-DNEW"]}
        ]
    }"#,
    )?;
    let events = backend.reload().await?;
    assert_eq!(events, vec![BuildTargetEvent::changed("Core")]);

    let mut saw_targets = false;
    let mut changed_files = HashSet::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            BuildSystemEvent::TargetsChanged(events) => {
                saw_targets = events == vec![BuildTargetEvent::changed("Core")];
            }
            BuildSystemEvent::FileSettingsChanged(files) => changed_files.extend(files),
            BuildSystemEvent::LogMessage { task_id, .. } => {
                assert!(task_id.starts_with("package-resolve-"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(saw_targets);
    // Only Core's own arguments changed; App only includes Core's module path.
    let core = DocumentUri::from_path(tmp.path().join("Sources/Core/core.swift"))?;
    assert_eq!(changed_files, [core].into_iter().collect());
    Ok(())
}

#[tokio::test]
async fn package_load_failure_surfaces_as_error() -> Result<()> {
    let tmp = TempDir::new()?;
    let backend = PackageManagerBuildSystem::new(
        tmp.path(),
        JsonPlanLoader::new(tmp.path().join("missing.json")),
        16,
    );
    let doc = DocumentUri::from_path(tmp.path().join("main.swift"))?;
    assert!(backend.settings(&doc).await.is_err());
    assert!(backend.reload().await.is_err());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn command_loader_reports_failing_package_manager() -> Result<()> {
    let tmp = TempDir::new()?;
    let backend = PackageManagerBuildSystem::new(
        tmp.path(),
        CommandPlanLoader::new("sh", ["-c", "echo resolution failed >&2; exit 3"], tmp.path()),
        16,
    );
    let err = backend.targets().await.unwrap_err();
    assert!(err.to_string().contains("resolution failed"));

    let ok = PackageManagerBuildSystem::new(
        tmp.path(),
        CommandPlanLoader::new("sh", ["-c", "echo '{\"targets\": []}'"], tmp.path()),
        16,
    );
    assert!(ok.targets().await?.is_empty());
    Ok(())
}
