use std::fs;
use std::path::{Path, PathBuf};

use quarry::config::Config;
use quarry::{DocumentManager, IndexFileOptions};
use quarry_core::error::Error;
use quarry_core::index::Index;
use quarry_core::models::{new_id, now, Collection, SearchOptions, ShareLevel, User};
use quarry_core::runner::{TaskState, TaskStatus};
use quarry_core::store::DocumentStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ALPHA: &str = "---\nsource: https://docs.example.com/alpha\n---\n\n# Alpha\n\nThe borrow checker enforces ownership rules.\n\n## Details\n\nLifetimes are usually inferred.\n";
const BETA: &str = "---\nsource: https://docs.example.com/beta\n---\n\n# Beta\n\nGarbage collectors trace reachable objects.\n";

struct Harness {
    tmp: TempDir,
    manager: DocumentManager,
    owner: User,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage.database.dsn = root.join("quarry.sqlite");
    cfg.storage.index.dsn = root.join("index");
    cfg
}

async fn create_user(manager: &DocumentManager, subject: &str) -> User {
    manager
        .store()
        .create_user(&User {
            id: new_id(),
            provider: "local".into(),
            subject: subject.into(),
            email: None,
            display_name: subject.into(),
            roles: vec!["user".into()],
            active: true,
            created_at: now(),
        })
        .await
        .unwrap()
}

async fn setup() -> Harness {
    let tmp = TempDir::new().unwrap();
    let manager = DocumentManager::open(&test_config(tmp.path())).await.unwrap();
    let owner = create_user(&manager, "owner").await;

    let cancel = CancellationToken::new();
    let runner = manager.runner().clone();
    let token = cancel.clone();
    tokio::spawn(async move { runner.run(token).await });

    Harness {
        tmp,
        manager,
        owner,
        cancel,
    }
}

impl Harness {
    fn write(&self, name: &str, content: &str) -> PathBuf {
        let dir = self.tmp.path().join("files");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn uploads(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.tmp.path().join("index").join("uploads")) {
            Ok(rd) => rd.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn index(&self, name: &str, content: &str, opts: IndexFileOptions) -> TaskState {
        let path = self.write(name, content);
        let id = self
            .manager
            .index_file(&self.owner.id, &path, opts)
            .await
            .unwrap();
        self.manager.runner().wait(&id).await.unwrap()
    }

    async fn search(&self, user_id: &str, query: &str) -> Vec<String> {
        let opts = SearchOptions {
            max_results: 10,
            collections: Vec::new(),
        };
        self.manager
            .search(user_id, query, &opts)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.source)
            .collect()
    }

    async fn collection(&self, label: &str) -> Collection {
        let c = Collection {
            id: new_id(),
            label: label.into(),
            description: String::new(),
            owner_id: self.owner.id.clone(),
            created_at: now(),
            updated_at: now(),
        };
        self.manager.store().create_collection(&c).await.unwrap();
        c
    }
}

#[tokio::test]
async fn test_index_and_search_markdown() {
    let h = setup().await;
    let state = h.index("alpha.md", ALPHA, IndexFileOptions::default()).await;
    assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);
    assert_eq!(state.progress, 1.0);
    let state = h.index("beta.md", BETA, IndexFileOptions::default()).await;
    assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);

    let sources = h.search(&h.owner.id, "borrow checker").await;
    assert_eq!(
        sources.first().map(String::as_str),
        Some("https://docs.example.com/alpha")
    );
    assert!(h.uploads().is_empty(), "uploads left behind: {:?}", h.uploads());
}

#[tokio::test]
async fn test_source_option_overrides_front_matter() {
    let h = setup().await;
    let opts = IndexFileOptions {
        source: "https://mirror.example.com/alpha".into(),
        etag: "v1".into(),
        ..Default::default()
    };
    let state = h.index("alpha.md", ALPHA, opts).await;
    assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);

    let doc = h
        .manager
        .store()
        .get_document_by_source("https://mirror.example.com/alpha")
        .await
        .unwrap();
    assert_eq!(doc.etag, "v1");
    assert_eq!(doc.owner_id, h.owner.id);
    assert!(!doc.sections.is_empty());
}

#[tokio::test]
async fn test_reupload_keeps_identity() {
    let h = setup().await;
    h.index("alpha.md", ALPHA, IndexFileOptions::default()).await;
    let first = h
        .manager
        .store()
        .get_document_by_source("https://docs.example.com/alpha")
        .await
        .unwrap();

    let revised = ALPHA.replace("borrow checker", "type checker");
    let state = h.index("alpha.md", &revised, IndexFileOptions::default()).await;
    assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);

    let second = h
        .manager
        .store()
        .get_document_by_source("https://docs.example.com/alpha")
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.created_at, first.created_at);
    let content = String::from_utf8(second.content).unwrap();
    assert!(content.contains("type checker"));
    assert!(!content.contains("borrow checker"));

    // No duplicate entries from the first upload survive.
    let entries = h.manager.index().entries().await.unwrap();
    assert!(entries.iter().all(|e| second.sections.iter().any(|s| s.id == e.section_id)));
}

#[tokio::test]
async fn test_missing_source_fails_and_rolls_back() {
    let h = setup().await;
    let state = h
        .index("nosource.md", "# Untitled\n\nNo front matter here.\n", IndexFileOptions::default())
        .await;
    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.error.unwrap_or_default().to_lowercase().contains("source"));
    assert!(h.uploads().is_empty());
    assert!(h.manager.index().entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unsupported_extension_is_rejected_upfront() {
    let h = setup().await;
    let path = h.write("diagram.png", "not really a png");
    let err = h
        .manager
        .index_file(&h.owner.id, &path, IndexFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        Error::kind_of(&err),
        Some(Error::NotSupported { extension, .. }) if extension == ".png"
    ));
    assert!(h.uploads().is_empty());
    assert!(h.manager.runner().list().await.is_empty());
}

#[tokio::test]
async fn test_search_hides_unreadable_documents() {
    let h = setup().await;
    let reader = create_user(&h.manager, "reader").await;
    let shared = h.collection("shared").await;

    h.index("alpha.md", ALPHA, IndexFileOptions::default()).await;
    let opts = IndexFileOptions {
        collections: vec![shared.id.clone()],
        ..Default::default()
    };
    h.index("beta.md", BETA, opts).await;

    assert!(h.search(&reader.id, "borrow checker").await.is_empty());

    h.manager
        .store()
        .create_collection_share(&shared.id, &reader.id, ShareLevel::Read)
        .await
        .unwrap();
    let sources = h.search(&reader.id, "garbage collectors").await;
    assert_eq!(sources, vec!["https://docs.example.com/beta".to_string()]);
}

#[tokio::test]
async fn test_unreadable_hits_do_not_shrink_the_page() {
    let h = setup().await;
    let reader = create_user(&h.manager, "reader").await;
    let shared = h.collection("shared").await;

    for name in ["one", "two", "three"] {
        let body = format!(
            "---\nsource: https://docs.example.com/{name}\n---\n\n# {name}\n\nThe borrow checker rejects this.\n"
        );
        let collections = if name == "three" {
            vec![shared.id.clone()]
        } else {
            Vec::new()
        };
        let opts = IndexFileOptions {
            collections,
            ..Default::default()
        };
        let state = h.index(&format!("{name}.md"), &body, opts).await;
        assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);
    }
    h.manager
        .store()
        .create_collection_share(&shared.id, &reader.id, ShareLevel::Read)
        .await
        .unwrap();

    let opts = SearchOptions {
        max_results: 1,
        collections: Vec::new(),
    };
    let results = h
        .manager
        .search(&reader.id, "borrow checker", &opts)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source, "https://docs.example.com/three");

    let owner = h
        .manager
        .search(&h.owner.id, "borrow checker", &opts)
        .await
        .unwrap();
    assert_eq!(owner.len(), 1);
}

#[tokio::test]
async fn test_index_into_foreign_collection_is_refused() {
    let h = setup().await;
    let other = create_user(&h.manager, "other").await;
    let private = h.collection("private").await;

    let path = h.write("alpha.md", ALPHA);
    let opts = IndexFileOptions {
        collections: vec![private.id.clone()],
        ..Default::default()
    };
    assert!(h.manager.index_file(&other.id, &path, opts).await.is_err());
    assert!(h.uploads().is_empty());
}

#[tokio::test]
async fn test_cleanup_drops_orphaned_entries() {
    let h = setup().await;
    h.index("alpha.md", ALPHA, IndexFileOptions::default()).await;
    h.index("beta.md", BETA, IndexFileOptions::default()).await;

    let alpha = h
        .manager
        .store()
        .get_document_by_source("https://docs.example.com/alpha")
        .await
        .unwrap();
    h.manager.store().delete_document(&alpha.id).await.unwrap();

    let id = h.manager.cleanup(&h.owner.id).await.unwrap();
    let state = h.manager.runner().wait(&id).await.unwrap();
    assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);

    let entries = h.manager.index().entries().await.unwrap();
    assert!(!entries.is_empty());
    assert!(entries
        .iter()
        .all(|e| e.source == "https://docs.example.com/beta"));
}

#[tokio::test]
async fn test_reindex_collection() {
    let h = setup().await;
    let c = h.collection("docs").await;
    let opts = IndexFileOptions {
        collections: vec![c.id.clone()],
        ..Default::default()
    };
    h.index("alpha.md", ALPHA, opts).await;

    let id = h.manager.reindex_collection(&h.owner.id, &c.id).await.unwrap();
    let state = h.manager.runner().wait(&id).await.unwrap();
    assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);
    assert_eq!(state.message, "re-indexed 1 documents");

    let opts = SearchOptions {
        max_results: 5,
        collections: vec![c.id.clone()],
    };
    let results = h.manager.search(&h.owner.id, "borrow checker", &opts).await.unwrap();
    assert_eq!(results[0].source, "https://docs.example.com/alpha");
}

#[tokio::test]
async fn test_backup_restores_into_fresh_instance() {
    let h = setup().await;
    h.index("alpha.md", ALPHA, IndexFileOptions::default()).await;
    h.index("beta.md", BETA, IndexFileOptions::default()).await;

    let mut backup: Vec<u8> = Vec::new();
    h.manager.backup(&mut backup).await.unwrap();
    let backup_path = h.tmp.path().join("backup.mime");
    fs::write(&backup_path, &backup).unwrap();

    let fresh = setup().await;
    let id = fresh
        .manager
        .restore_backup(&fresh.owner.id, &backup_path)
        .await
        .unwrap();
    let state = fresh.manager.runner().wait(&id).await.unwrap();
    assert_eq!(state.status, TaskStatus::Succeeded, "{:?}", state.error);

    let doc = fresh
        .manager
        .store()
        .get_document_by_source("https://docs.example.com/alpha")
        .await
        .unwrap();
    assert_eq!(doc.owner_id, h.owner.id);
    assert_eq!(
        fresh.manager.index().entries().await.unwrap(),
        h.manager.index().entries().await.unwrap()
    );
    let sources = fresh.search(&h.owner.id, "borrow checker").await;
    assert_eq!(
        sources.first().map(String::as_str),
        Some("https://docs.example.com/alpha")
    );
}
