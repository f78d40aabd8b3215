//! 打开、导航、惰性展开与提取的端到端测试

mod common;

use archive_explorer::archive::cli_engine::SevenZipCliEngine;
use archive_explorer::archive::{
    ArchiveEntry, Engine, ItemKind, ItemOutcome, OpenOutcome, Status,
};
use archive_explorer::error::{AppError, Result};
use async_trait::async_trait;
use common::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

const README: &[u8] = b"Nested all the way down.\nLine two of the readme.\n";

/// NestedArchive.zip
/// └── archive.tar.lz4
///     └── archive.tar
///         └── docs/readme.txt
fn nested_zip_bytes() -> Vec<u8> {
    let tar = tar_bytes(&[("docs/", b""), ("docs/readme.txt", README)]);
    zip_bytes(&[("archive.tar.lz4", &lz4(&tar))])
}

/// outer.zip
/// ├── folder/NestedArchive.zip
/// └── hello.txt
fn create_nested_fixture(dir: &Path) -> PathBuf {
    let nested_zip = nested_zip_bytes();
    let outer = dir.join("outer.zip");
    create_zip_archive(
        &outer,
        &[
            ("folder/", b""),
            ("folder/NestedArchive.zip", &nested_zip),
            ("hello.txt", b"hello"),
        ],
    );
    outer
}

/// 用 7z 命令行在暂存目录中打包 `members`
fn create_7z_with_cli(binary: &Path, dir: &Path, members: &[(&str, &[u8])]) -> PathBuf {
    let staging = dir.join("7z-staging");
    for (name, content) in members {
        let path = staging.join(name.trim_end_matches('/'));
        if name.ends_with('/') {
            std::fs::create_dir_all(&path).unwrap();
        } else {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }
    }
    let archive = dir.join("outer.7z");
    let output = std::process::Command::new(binary)
        .arg("a")
        .arg(&archive)
        .arg("folder")
        .arg("hello.txt")
        .current_dir(&staging)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    archive
}

#[tokio::test]
async fn test_root_children_for_every_format_and_engine() {
    let temp_dir = TempDir::new().unwrap();
    let services = test_services(&temp_dir);
    let cli_binary = SevenZipCliEngine::new(None).locate_binary().ok();

    let nested_zip = nested_zip_bytes();
    let members: [(&str, &[u8]); 3] = [
        ("folder/", b""),
        ("folder/NestedArchive.zip", &nested_zip),
        ("hello.txt", b"hello"),
    ];
    let tar = tar_bytes(&members);

    // (引擎覆盖作用的基础类型, 归档文件)
    let mut fixtures = vec![
        ("zip", write_file(temp_dir.path(), "outer.zip", &zip_bytes(&members))),
        ("tar", write_file(temp_dir.path(), "outer.tar", &tar)),
        ("tar", write_file(temp_dir.path(), "outer.tar.gz", &gzip(&tar))),
        ("tar", write_file(temp_dir.path(), "outer.tar.lz4", &lz4(&tar))),
    ];
    if let Some(binary) = &cli_binary {
        fixtures.push(("7z", create_7z_with_cli(binary, temp_dir.path(), &members)));
    }

    for (type_id, archive) in fixtures {
        let engine_ids: Vec<String> = services
            .catalog
            .engine_options(type_id)
            .iter()
            .map(|option| option.id.clone())
            .collect();
        assert!(!engine_ids.is_empty(), "no engines for {}", type_id);

        for engine_id in engine_ids {
            if !services.registry.contains(&engine_id)
                || (engine_id == "7z-cli" && cli_binary.is_none())
            {
                continue;
            }
            assert!(services.selector.set_override(&engine_id, type_id));
            let label = format!("{} via {}", archive.display(), engine_id);

            let state = test_state(&services);
            assert_eq!(state.open(&archive).await.unwrap(), OpenOutcome::Opened, "{}", label);
            let root = state.root().unwrap();
            assert_eq!(child_names(&state, root), vec!["folder", "hello.txt"], "{}", label);

            let folder = state.item(child_named(&state, root, "folder")).unwrap();
            assert_eq!(folder.kind, ItemKind::Directory, "{}", label);
            let hello = state.item(child_named(&state, root, "hello.txt")).unwrap();
            assert_eq!(hello.kind, ItemKind::File, "{}", label);
            state.close().await;
        }
        services.selector.clear_override(type_id);
    }
}

#[tokio::test]
async fn test_nested_round_trip_is_byte_exact() {
    let temp_dir = TempDir::new().unwrap();
    let outer = create_nested_fixture(temp_dir.path());
    let services = test_services(&temp_dir);
    let state = test_state(&services);

    assert_eq!(state.open(&outer).await.unwrap(), OpenOutcome::Opened);
    let root = state.root().unwrap();

    let folder = child_named(&state, root, "folder");
    assert_eq!(state.open_item(folder).await.unwrap(), ItemOutcome::Focused(folder));

    let nested_zip = child_named(&state, folder, "NestedArchive.zip");
    assert_eq!(
        state.open_item(nested_zip).await.unwrap(),
        ItemOutcome::Unfolded(nested_zip)
    );
    assert_eq!(state.focused(), Some(nested_zip));
    assert_eq!(
        state.item(nested_zip).unwrap().bound.unwrap().format_id,
        "zip"
    );

    let tar_lz4 = child_named(&state, nested_zip, "archive.tar.lz4");
    assert_eq!(
        state.open_item(tar_lz4).await.unwrap(),
        ItemOutcome::Unfolded(tar_lz4)
    );
    assert_eq!(child_names(&state, tar_lz4), vec!["archive.tar"]);

    let tar = child_named(&state, tar_lz4, "archive.tar");
    assert_eq!(state.open_item(tar).await.unwrap(), ItemOutcome::Unfolded(tar));

    let docs = child_named(&state, tar, "docs");
    let readme = child_named(&state, docs, "readme.txt");
    assert_eq!(
        state.with_tree(|tree| tree.depth_of(readme)).unwrap(),
        3
    );

    let dest = temp_dir.path().join("out");
    let written = state.extract_items(&[readme], &dest).await.unwrap();
    assert_eq!(written, vec![dest.join("readme.txt")]);
    assert_eq!(std::fs::read(dest.join("readme.txt")).unwrap(), README);

    // 已展开的节点再次打开只移动焦点
    assert_eq!(
        state.open_item(nested_zip).await.unwrap(),
        ItemOutcome::Focused(nested_zip)
    );
    assert_eq!(state.go_up().unwrap(), folder);
    assert_eq!(state.go_up().unwrap(), root);
    assert!(matches!(state.go_up(), Err(AppError::Navigation(_))));

    state.close().await;
}

#[tokio::test]
async fn test_compound_archive_extract_all() {
    let temp_dir = TempDir::new().unwrap();
    let source = write_file(
        temp_dir.path(),
        "project.tar.gz",
        &gzip(&tar_bytes(&[
            ("src/", b""),
            ("src/main.rs", b"fn main() {}"),
            ("Cargo.toml", b"[package]"),
        ])),
    );
    let services = test_services(&temp_dir);
    let state = test_state(&services);

    assert_eq!(state.open(&source).await.unwrap(), OpenOutcome::Opened);
    let detection = state.detection().unwrap();
    assert_eq!(detection.type_id(), "tar");
    assert_eq!(detection.composition.unwrap().id, "tar.gz");
    assert_eq!(state.item(state.root().unwrap()).unwrap().name, "project.tar.gz");

    let dest = temp_dir.path().join("dest");
    let written = state.extract_all(&dest).await.unwrap();
    assert_eq!(written, vec![dest.join("Cargo.toml"), dest.join("src")]);
    assert_eq!(std::fs::read(dest.join("src/main.rs")).unwrap(), b"fn main() {}");
    assert_eq!(state.status(), Status::Done);
}

#[tokio::test]
async fn test_extract_directory_item_recurses() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("tree.zip");
    create_zip_archive(
        &source,
        &[
            ("docs/", b""),
            ("docs/a.txt", b"a"),
            ("docs/deep/b.txt", b"b"),
            ("other.txt", b"o"),
        ],
    );
    let services = test_services(&temp_dir);
    let state = test_state(&services);
    state.open(&source).await.unwrap();
    let docs = child_named(&state, state.root().unwrap(), "docs");

    let dest = temp_dir.path().join("dest");
    let written = state.extract_items(&[docs], &dest).await.unwrap();
    assert_eq!(written, vec![dest.join("docs")]);
    assert_eq!(std::fs::read(dest.join("docs/deep/b.txt")).unwrap(), b"b");
    assert!(!dest.join("other.txt").exists());
}

/// 目标目录里已有 `src/main.rs`（旧）和 `src/user_notes.txt`
fn prepare_destination(dir: &Path) -> PathBuf {
    let dest = dir.join("dest");
    std::fs::create_dir_all(dest.join("src")).unwrap();
    std::fs::write(dest.join("src/main.rs"), b"old").unwrap();
    std::fs::write(dest.join("src/user_notes.txt"), b"mine").unwrap();
    dest
}

#[tokio::test]
async fn test_extract_all_merges_into_existing_directory() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("proj.zip");
    create_zip_archive(&source, &[("src/", b""), ("src/main.rs", b"fn main() {}")]);
    let services = test_services(&temp_dir);
    let state = test_state(&services);
    state.open(&source).await.unwrap();

    let dest = prepare_destination(temp_dir.path());
    let written = state.extract_all(&dest).await.unwrap();
    assert_eq!(written, vec![dest.join("src")]);
    assert_eq!(std::fs::read(dest.join("src/main.rs")).unwrap(), b"fn main() {}");
    assert_eq!(std::fs::read(dest.join("src/user_notes.txt")).unwrap(), b"mine");
}

#[tokio::test]
async fn test_extract_directory_item_merges_into_existing_directory() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("proj.zip");
    create_zip_archive(&source, &[("src/", b""), ("src/main.rs", b"fn main() {}")]);
    let services = test_services(&temp_dir);
    let state = test_state(&services);
    state.open(&source).await.unwrap();
    let src = child_named(&state, state.root().unwrap(), "src");

    let dest = prepare_destination(temp_dir.path());
    let written = state.extract_items(&[src], &dest).await.unwrap();
    assert_eq!(written, vec![dest.join("src")]);
    assert_eq!(std::fs::read(dest.join("src/main.rs")).unwrap(), b"fn main() {}");
    assert_eq!(std::fs::read(dest.join("src/user_notes.txt")).unwrap(), b"mine");
}

#[tokio::test]
async fn test_encrypted_archive_records_password_error() {
    let temp_dir = TempDir::new().unwrap();
    let mut bytes = zip_bytes(&[("secret.txt", b"classified")]);
    mark_zip_encrypted(&mut bytes);
    let source = write_file(temp_dir.path(), "secret.zip", &bytes);
    let services = test_services(&temp_dir);
    let state = test_state(&services);

    let error = state.open(&source).await.unwrap_err();
    assert!(matches!(error, AppError::PasswordRequired { .. }), "{:?}", error);
    assert!(state.root().is_none());
    assert!(state.focused().is_none());
    assert!(state.error().unwrap().contains("Password required"));
    assert!(matches!(state.status(), Status::Error { .. }));
}

#[tokio::test]
async fn test_operation_events_stream() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("a.zip");
    create_zip_archive(&source, &[("a.txt", b"a")]);
    let services = test_services(&temp_dir);
    let state = test_state(&services);

    let mut events = state.operation_events();
    state.open(&source).await.unwrap();

    let mut received = Vec::new();
    while let Ok(status) = events.try_recv() {
        received.push(status);
    }
    assert!(matches!(received.first(), Some(Status::Processing { .. })));
    assert_eq!(received.last(), Some(&Status::Done));
}

#[tokio::test]
async fn test_unregistered_override_leaves_selection_unchanged() {
    let temp_dir = TempDir::new().unwrap();
    let services = test_services(&temp_dir);
    let selector = &services.selector;

    assert_eq!(selector.active_engine_id("zip").as_deref(), Some("zip"));
    assert!(!selector.set_override("does-not-exist", "zip"));
    // 已注册但不在该格式的可选列表中
    assert!(!selector.set_override("stream", "zip"));
    assert_eq!(selector.active_engine_id("zip").as_deref(), Some("zip"));
    assert!(services.overrides.get("zip").is_none());

    // 其他格式不受影响
    assert!(selector.set_override("7z-cli", "7z"));
    assert_eq!(selector.active_engine_id("7z").as_deref(), Some("7z-cli"));
    assert_eq!(selector.active_engine_id("zip").as_deref(), Some("zip"));

    // 覆盖持久化在配置目录的 JSON 文件中
    let persisted = std::fs::read_to_string(temp_dir.path().join("engines.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&persisted).unwrap();
    assert_eq!(json[0]["format_id"], "7z");
    assert_eq!(json[0]["engine_id"], "7z-cli");
}

/// 在列出条目（或提取条目）时一直等待，直到被取消
struct StallingEngine {
    started: Arc<Notify>,
    stall_listing: bool,
}

#[async_trait]
impl Engine for StallingEngine {
    fn id(&self) -> &str {
        "zip"
    }

    async fn load_entries(&self, _archive: &Path) -> Result<Vec<ArchiveEntry>> {
        if self.stall_listing {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(vec![ArchiveEntry::file("late.txt")])
    }

    async fn extract_entry(
        &self,
        _entry: &ArchiveEntry,
        _archive: &Path,
        _dest_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    }

    async fn extract_all(&self, _archive: &Path, _dest_dir: &Path) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_cancelling_open_leaves_no_tree_and_no_error() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("slow.zip");
    create_zip_archive(&source, &[("a.txt", b"a")]);

    let services = test_services(&temp_dir);
    let started = Arc::new(Notify::new());
    services.registry.register(Arc::new(StallingEngine {
        started: Arc::clone(&started),
        stall_listing: true,
    }));
    let state = Arc::new(test_state(&services));

    let opening = {
        let state = Arc::clone(&state);
        tokio::spawn(async move { state.open(&source).await })
    };

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .unwrap();
    state.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), opening)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, OpenOutcome::Cancelled);
    assert!(state.root().is_none());
    assert!(state.focused().is_none());
    assert!(state.error().is_none());
    assert_eq!(state.status(), Status::Cancelled);
}

#[tokio::test]
async fn test_cancelling_extraction_leaves_destination_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("slow.zip");
    create_zip_archive(&source, &[("late.txt", b"late")]);

    let services = test_services(&temp_dir);
    let started = Arc::new(Notify::new());
    services.registry.register(Arc::new(StallingEngine {
        started: Arc::clone(&started),
        stall_listing: false,
    }));
    let state = Arc::new(test_state(&services));
    assert_eq!(state.open(&source).await.unwrap(), OpenOutcome::Opened);
    let late = child_named(&state, state.root().unwrap(), "late.txt");

    let dest = temp_dir.path().join("dest");
    let extracting = {
        let state = Arc::clone(&state);
        let dest = dest.clone();
        tokio::spawn(async move { state.extract_items(&[late], &dest).await })
    };

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .unwrap();
    state.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), extracting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AppError::Cancelled)), "{:?}", result);
    assert_eq!(state.status(), Status::Cancelled);
    assert!(!dest.join("late.txt").exists());
    // 取消提取不影响打开的归档，操作目录已清理
    assert!(state.is_open());
    assert_eq!(std::fs::read_dir(temp_dir.path().join("cache")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_new_open_supersedes_previous() {
    let temp_dir = TempDir::new().unwrap();
    let slow = temp_dir.path().join("slow.zip");
    create_zip_archive(&slow, &[("a.txt", b"a")]);
    let fast = write_file(
        temp_dir.path(),
        "fast.tar",
        &tar_bytes(&[("b.txt", b"b")]),
    );

    let services = test_services(&temp_dir);
    let started = Arc::new(Notify::new());
    services.registry.register(Arc::new(StallingEngine {
        started: Arc::clone(&started),
        stall_listing: true,
    }));
    let state = Arc::new(test_state(&services));

    let first = {
        let state = Arc::clone(&state);
        tokio::spawn(async move { state.open(&slow).await })
    };
    started.notified().await;

    assert_eq!(state.open(&fast).await.unwrap(), OpenOutcome::Opened);
    assert_eq!(first.await.unwrap().unwrap(), OpenOutcome::Cancelled);

    let root = state.root().unwrap();
    assert_eq!(child_names(&state, root), vec!["b.txt"]);
    assert_eq!(state.status(), Status::Done);
}

#[tokio::test]
async fn test_non_archive_nested_file_goes_to_opener() {
    let temp_dir = TempDir::new().unwrap();
    let outer = create_nested_fixture(temp_dir.path());
    let services = test_services(&temp_dir);
    let state = test_state(&services);
    state.open(&outer).await.unwrap();

    let hello = child_named(&state, state.root().unwrap(), "hello.txt");
    match state.open_item(hello).await.unwrap() {
        ItemOutcome::OpenedExternally(path) => {
            assert_eq!(std::fs::read(path).unwrap(), b"hello");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // 焦点不变，文件节点没有被展开
    assert_eq!(state.focused(), state.root());
    assert!(state.item(hello).unwrap().children.is_none());
}

#[tokio::test]
async fn test_corrupt_archive_sets_error() {
    let temp_dir = TempDir::new().unwrap();
    let source = write_file(temp_dir.path(), "broken.7z", b"7z\xBC\xAF\x27\x1C garbage");
    let services = test_services(&temp_dir);
    let state = test_state(&services);

    let error = state.open(&source).await.unwrap_err();
    assert!(matches!(error, AppError::InvalidArchive { .. } | AppError::Io(_)));
    assert!(state.root().is_none());
    assert!(state.error().is_some());
}
