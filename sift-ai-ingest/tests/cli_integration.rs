use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Helper to run the CLI binary with given args
fn run_cli(args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_sift-ingest"))
        .args(args)
        .env("RUST_LOG", "error") // Reduce log noise
        .output()?;
    Ok(output)
}

fn write_file(dir: &Path, name: &str, content: &str) -> Result<String> {
    let path = dir.join(name);
    std::fs::write(&path, content)?;
    Ok(path.to_string_lossy().into_owned())
}

fn stdout_json(output: &Output) -> Result<Value> {
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn test_cli_help() -> Result<()> {
    let output = run_cli(&["--help"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ingest"));
    assert!(stdout.contains("memory"));
    assert!(stdout.contains("status"));
    Ok(())
}

#[test]
fn test_cli_ingest_into_database() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let first = write_file(
        temp_dir.path(),
        "first.md",
        "# Memory\n\nBatches shrink when the heap fills up.\n\n## Cache\n\nQuery results are cached until memory runs low.",
    )?;
    let second = write_file(
        temp_dir.path(),
        "second.txt",
        &"Plain text repeated to produce several windows. ".repeat(20),
    )?;
    let db = temp_dir.path().join("chunks.db");
    let db = db.to_string_lossy();

    let output = run_cli(&[
        "ingest", &first, &second, "--db", &db, "--chunk-size", "200", "--chunk-overlap", "20",
        "--format", "json",
    ])?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let json = stdout_json(&output)?;
    assert_eq!(json["files"], 2);
    assert_eq!(json["document_count"], 2);
    assert_eq!(json["failed_batches"], 0);
    assert!(json.get("embeddings").is_none());
    let chunks = json["chunk_count"].as_u64().unwrap();
    assert!(chunks >= 3);
    assert_eq!(json["stored_total"].as_u64(), Some(chunks));

    // Re-ingesting the same files replaces chunks instead of duplicating them
    let output = run_cli(&["ingest", &first, &second, "--db", &db, "--format", "json"])?;
    assert!(output.status.success());
    let json = stdout_json(&output)?;
    assert!(json["stored_total"].as_u64().unwrap() >= json["chunk_count"].as_u64().unwrap());
    Ok(())
}

#[test]
fn test_cli_ingest_summary_without_database() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let file = write_file(temp_dir.path(), "note.txt", "A short note.")?;

    let output = run_cli(&["ingest", &file, "--preset", "low-memory", "--strategy", "paragraphs"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Ingested 1 files"));
    assert!(stdout.contains("Chunks: 1"));
    assert!(!stdout.contains("Stored in"));
    Ok(())
}

#[test]
fn test_cli_memory_and_status() -> Result<()> {
    let output = run_cli(&["--memory-budget-mb", "4096", "memory", "--format", "json"])?;
    assert!(output.status.success());
    let json = stdout_json(&output)?;
    assert!(json["usage"]["heap_total"].as_u64().unwrap() > 0);
    assert!(json["issues"].is_array());

    let output = run_cli(&["memory"])?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Heap analysis"));

    let output = run_cli(&["status"])?;
    assert!(output.status.success());
    let json = stdout_json(&output)?;
    assert_eq!(json["running"], false);
    assert_eq!(json["embedding_provider"], "feature-hash");
    assert_eq!(json["embedding_dimension"], 768);
    Ok(())
}

#[test]
fn test_cli_config_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = write_file(temp_dir.path(), "sift.toml", "[embedding]\ndimension = 64\n")?;

    let output = run_cli(&["--config", &config, "status"])?;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)?["embedding_dimension"], 64);

    let broken = write_file(temp_dir.path(), "broken.toml", "[memory]\nmax_batch_size = 0\n")?;
    let output = run_cli(&["--config", &broken, "status"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_batch_size"));
    Ok(())
}

#[test]
fn test_cli_error_handling() -> Result<()> {
    let output = run_cli(&["ingest", "/nonexistent/file.txt"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read"));

    let temp_dir = TempDir::new()?;
    let file = write_file(temp_dir.path(), "note.txt", "text")?;

    let output = run_cli(&["ingest", &file, "--preset", "turbo"])?;
    assert!(!output.status.success());

    let output = run_cli(&["ingest", &file, "--chunk-size", "10", "--chunk-overlap", "10"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("chunk_overlap"));

    let output = run_cli(&["ingest"])?;
    assert!(!output.status.success());
    Ok(())
}
