use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use rstest::*;

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

#[test]
fn list_models() -> Result<()> {
    cargo_run!("clipsearch", "models")
        .success()
        .stdout(predicate::str::contains("ViT-B-32/laion2b_s34b_b79k"))
        .stdout(predicate::str::contains("ViT-H-14/laion2b_s32b_b79k"));

    cargo_run!("clipsearch", "models", "--output-format", "json")
        .success()
        .stdout(predicate::str::contains("\"alias\": \"fast\""));
    Ok(())
}

#[test]
fn index_empty_dir() -> Result<()> {
    let conf_dir = assert_fs::TempDir::new()?;
    let images = assert_fs::TempDir::new()?;
    images.child("notes.txt").write_str("not an image")?;

    cargo_run!("clipsearch", "-c", conf_dir.path(), "index", images.path()).success();
    cargo_run!("clipsearch", "-c", conf_dir.path(), "status", images.path(), "--output-format", "json")
        .success()
        .stdout(predicate::str::contains("\"indexed\": 0"));
    Ok(())
}

#[test]
fn index_missing_root() -> Result<()> {
    let conf_dir = assert_fs::TempDir::new()?;
    let missing = conf_dir.path().join("missing");

    cargo_run!("clipsearch", "-c", conf_dir.path(), "index", &missing)
        .failure()
        .stderr(predicate::str::contains("not a directory"));
    Ok(())
}

#[rstest]
#[case::text(&["--text", "a cat"])]
#[case::like(&["--like", "a.jpg"])]
fn search_empty_index(#[case] query: &[&str]) -> Result<()> {
    let conf_dir = assert_fs::TempDir::new()?;
    let images = assert_fs::TempDir::new()?;

    let mut cmd = Command::cargo_bin("clipsearch")?;
    cmd.arg("-c").arg(conf_dir.path()).arg("search").arg(images.path()).args(query);
    cmd.assert().failure().stderr(predicate::str::contains("index is empty"));
    Ok(())
}

#[test]
fn search_requires_query() -> Result<()> {
    let images = assert_fs::TempDir::new()?;
    cargo_run!("clipsearch", "search", images.path()).failure();
    cargo_run!("clipsearch", "search", images.path(), "--text", "a", "--like", "b.jpg").failure();
    Ok(())
}

#[test]
fn clean_empty_collection() -> Result<()> {
    let conf_dir = assert_fs::TempDir::new()?;
    let images = assert_fs::TempDir::new()?;

    cargo_run!("clipsearch", "-c", conf_dir.path(), "clean", images.path(), "--all").success();
    cargo_run!("clipsearch", "-c", conf_dir.path(), "clean", images.path(), "--model", "best")
        .success();
    Ok(())
}
