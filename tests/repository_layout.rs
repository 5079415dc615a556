//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Repository-level checks for shipped configuration and sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mockcloud_common::config::{AppConfig, DelayWindow};
use mockcloud_common::LogFormat;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
}

fn read(path: &str) -> String {
    let full = repo_root().join(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

fn rust_sources(dir: &Path, found: &mut Vec<PathBuf>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            rust_sources(&path, found);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            found.push(path);
        }
    }
}

#[test]
fn shipped_config_parses_and_validates() {
    let config: AppConfig = read("configs/mockcloud.toml").parse().unwrap();
    assert_eq!(config.api.listen.port(), 8000);
    assert_eq!(
        config.worker.vm,
        DelayWindow::new(Duration::from_secs(30), Duration::from_secs(60))
    );
    assert_eq!(config.worker.volume, config.worker.vm);
    assert_eq!(config.worker.delete, DelayWindow::fixed(Duration::from_secs(5)));
    assert!(config.storage.replay_on_start);
    assert!(config.storage.journal_path.is_some());
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(
        config.catalog.instance_types,
        AppConfig::default().catalog.instance_types
    );
}

#[test]
fn sources_carry_frontmatter_header() {
    let mut sources = Vec::new();
    for dir in ["crates", "bin", "tests"] {
        rust_sources(&repo_root().join(dir), &mut sources);
    }
    assert!(!sources.is_empty());
    for source in sources {
        let content = fs::read_to_string(&source).unwrap();
        assert!(
            content.starts_with("//! ---"),
            "{} must include frontmatter header",
            source.display()
        );
    }
}
