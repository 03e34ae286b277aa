use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn quarry_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_quarry"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "---\nsource: https://docs.example.com/alpha\n---\n\n# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(files_dir.join("gamma.png"), [0x89, b'P', b'N', b'G']).unwrap();

    let config_content = format!(
        r#"[storage.database]
dsn = "{root}/data/quarry.sqlite"

[storage.index]
dsn = "{root}/data/index"

[llm.provider]
name = "offline"

[task_runner]
uri = "memory://?parallelism=2&cleanupDelay=1m&cleanupInterval=10s"

[file_converter]
uri = "extract://"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("quarry.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_quarry(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = quarry_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("USER", "integration")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run quarry binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("files")
        .join(name)
        .display()
        .to_string()
}

#[test]
fn test_init_creates_databases() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_quarry(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));

    let data = config.parent().unwrap().parent().unwrap().join("data");
    assert!(data.join("quarry.sqlite").exists());
    assert!(data.join("index").join("lexical.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    assert!(run_quarry(&config, &["init"]).2);
    let (_, stderr, success) = run_quarry(&config, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_index_and_search() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_quarry(&config, &["index", &file(&config, "alpha.md")]);
    assert!(success, "index failed: {}", stderr);
    assert!(stderr.contains("done"));

    let (stdout, stderr, success) = run_quarry(&config, &["search", "cargo and crates"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.starts_with("1. https://docs.example.com/alpha"), "{}", stdout);
}

#[test]
fn test_index_requires_a_source() {
    let (_tmp, config) = setup_test_env();
    let beta = file(&config, "beta.md");

    let (_, stderr, success) = run_quarry(&config, &["index", &beta]);
    assert!(!success);
    assert!(stderr.contains("no source"), "{}", stderr);

    let (_, stderr, success) = run_quarry(
        &config,
        &["index", &beta, "--source", "https://docs.example.com/beta"],
    );
    assert!(success, "index with --source failed: {}", stderr);
    let (stdout, _, _) = run_quarry(&config, &["search", "machine learning"]);
    assert!(stdout.contains("https://docs.example.com/beta"));
}

#[test]
fn test_unsupported_extension() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_quarry(&config, &["index", &file(&config, "gamma.png")]);
    assert!(!success);
    assert!(stderr.contains("unsupported file extension '.png'"), "{}", stderr);
    assert!(stderr.contains(".pdf"));
}

#[test]
fn test_search_no_results() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_quarry(&config, &["search", "anything"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_collections_create_and_list() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_quarry(
        &config,
        &["collections", "create", "handbook", "--description", "team docs"],
    );
    assert!(success, "create failed: {}", stderr);
    let id = stdout.trim().to_string();
    assert!(!id.is_empty());

    let (stdout, _, success) = run_quarry(&config, &["collections", "list"]);
    assert!(success);
    assert!(stdout.contains(&format!("{}\thandbook\tteam docs", id)));

    let (_, stderr, success) = run_quarry(
        &config,
        &["index", &file(&config, "alpha.md"), "--collection", &id],
    );
    assert!(success, "index into collection failed: {}", stderr);
    let (_, stderr, success) = run_quarry(&config, &["reindex", &id]);
    assert!(success, "reindex failed: {}", stderr);

    let (stdout, _, _) = run_quarry(&config, &["search", "Rust programming", "--collection", &id]);
    assert!(stdout.contains("https://docs.example.com/alpha"));
}

#[test]
fn test_backup_and_restore() {
    let (tmp, config) = setup_test_env();
    assert!(run_quarry(&config, &["index", &file(&config, "alpha.md")]).2);

    let backup = tmp.path().join("quarry.backup").display().to_string();
    let (_, stderr, success) = run_quarry(&config, &["backup", &backup]);
    assert!(success, "backup failed: {}", stderr);
    let content = fs::read_to_string(&backup).unwrap();
    assert!(content.contains("snapshot-id: documents"));
    assert!(content.contains("snapshot-id: index"));

    let (_, stderr, success) = run_quarry(&config, &["restore", &backup]);
    assert!(success, "restore failed: {}", stderr);
    let (stdout, _, _) = run_quarry(&config, &["search", "cargo and crates"]);
    assert!(stdout.contains("https://docs.example.com/alpha"));
}

#[test]
fn test_cleanup() {
    let (_tmp, config) = setup_test_env();
    assert!(run_quarry(&config, &["index", &file(&config, "alpha.md")]).2);
    let (_, stderr, success) = run_quarry(&config, &["cleanup"]);
    assert!(success, "cleanup failed: {}", stderr);
}
