//! End-to-end tests that drive the `docent` binary. Providers are left
//! disabled, so these cover everything that works without network access.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docent_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docent");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs = root.join("docs");
    fs::create_dir_all(docs.join("nested")).unwrap();
    fs::write(docs.join("empty.txt"), "").unwrap();
    fs::write(docs.join("blank.md"), "   \n\n  ").unwrap();
    fs::write(docs.join("nested").join("notes.txt"), "").unwrap();
    fs::write(docs.join("image.png"), [0x89, b'P', b'N', b'G']).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/docent.sqlite"

[chunking]
max_tokens = 200
overlap_tokens = 20

[embedding]
provider = "disabled"

[llm]
provider = "disabled"
"#,
        root.display()
    );

    let config_path = config_dir.join("docent.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docent(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docent_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docent binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn init_is_idempotent() {
    let (tmp, config) = setup_test_env();

    let (stdout, stderr, ok) = run_docent(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/docent.sqlite").exists());

    let (_, stderr, ok) = run_docent(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn chatbot_create_then_list() {
    let (_tmp, config) = setup_test_env();
    run_docent(&config, &["init"]);

    let (stdout, stderr, ok) = run_docent(
        &config,
        &[
            "chatbot",
            "create",
            "--tenant",
            "acme",
            "--name",
            "Support",
            "--monthly-limit",
            "500",
        ],
    );
    assert!(ok, "create failed: {}", stderr);
    let id = stdout.trim().to_string();
    assert!(!id.is_empty());

    let (stdout, _, ok) = run_docent(&config, &["chatbot", "list", "--tenant", "acme"]);
    assert!(ok);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("Support"));
    assert!(stdout.contains("500"));

    let (stdout, _, ok) = run_docent(&config, &["chatbot", "list", "--tenant", "globex"]);
    assert!(ok);
    assert!(stdout.contains("No chatbots"));
}

#[test]
fn empty_file_ingests_without_embedding() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("docs/empty.txt");

    let (stdout, stderr, ok) = run_docent(
        &config,
        &["ingest", "file", file.to_str().unwrap(), "--tenant", "acme"],
    );
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("documents: 1"));
    assert!(stdout.contains("chunks: 0"));
    assert!(stdout.contains("ok"));

    let (stdout, _, ok) = run_docent(&config, &["sources", "--tenant", "acme"]);
    assert!(ok);
    assert!(stdout.contains("COMPLETE"));
    assert!(stdout.contains("empty.txt"));
}

#[test]
fn failed_ingest_is_recorded_on_the_source() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("guide.md");
    fs::write(&file, "# Guide\n\nReturns are accepted within 30 days.").unwrap();

    let (_, _, ok) = run_docent(
        &config,
        &["ingest", "file", file.to_str().unwrap(), "--tenant", "acme"],
    );
    assert!(!ok, "ingest should fail while embeddings are disabled");

    let (stdout, _, ok) = run_docent(&config, &["sources", "--tenant", "acme"]);
    assert!(ok);
    assert!(stdout.contains("FAILED"));
    assert!(stdout.contains("error:"));
    assert!(stdout.contains("disabled"));
}

#[test]
fn ingest_dir_reports_each_supported_file() {
    let (tmp, config) = setup_test_env();
    let dir = tmp.path().join("docs");

    let (stdout, stderr, ok) = run_docent(
        &config,
        &["ingest", "dir", dir.to_str().unwrap(), "--tenant", "acme"],
    );
    assert!(ok, "ingest dir failed: {}", stderr);
    assert!(stdout.contains("empty.txt"));
    assert!(stdout.contains("blank.md"));
    assert!(stdout.contains("notes.txt"));
    assert!(!stdout.contains("image.png"));
    assert!(stdout.contains("files: 3  failed: 0"));
}

#[test]
fn ingest_dir_include_globs_filter_files() {
    let (tmp, config) = setup_test_env();
    let dir = tmp.path().join("docs");

    let (stdout, stderr, ok) = run_docent(
        &config,
        &[
            "ingest",
            "dir",
            dir.to_str().unwrap(),
            "--tenant",
            "acme",
            "--include",
            "nested/**",
        ],
    );
    assert!(ok, "ingest dir failed: {}", stderr);
    assert!(stdout.contains("notes.txt"));
    assert!(!stdout.contains("empty.txt"));
    assert!(stdout.contains("files: 1  failed: 0"));
}

#[test]
fn sources_for_unknown_tenant_is_empty() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, ok) = run_docent(&config, &["sources", "--tenant", "nobody"]);
    assert!(ok);
    assert!(stdout.contains("No data sources"));
}

#[test]
fn search_needs_embeddings() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, ok) = run_docent(
        &config,
        &["search", "refund policy", "--tenant", "acme"],
    );
    assert!(!ok);
    assert!(stderr.contains("disabled"), "stderr: {}", stderr);
}

#[test]
fn missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_docent(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn completions_need_no_config() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, ok) = run_docent(&tmp.path().join("nope.toml"), &["completions", "bash"]);
    assert!(ok);
    assert!(stdout.contains("docent"));
}
