use std::error::Error;
use std::path::Path;

use stevedore::config::preprocess;
use stevedore::errors::LoadError;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn expands_default_directive_values() -> TestResult {
    let doc = "\
alias:
  values:
    image: ubuntu:22.04
steps:
  - id: hello
    cmd: $image echo hello
";
    let out = preprocess(doc, Path::new("."))?;
    assert!(out.contains("cmd: ubuntu:22.04 echo hello"));
    Ok(())
}

#[test]
fn doubled_directive_escapes_to_a_literal() -> TestResult {
    let doc = "\
alias:
  values:
    image: ubuntu
steps:
  - id: hello
    cmd: busybox echo $$image costs $$5
";
    let out = preprocess(doc, Path::new("."))?;
    assert!(out.contains("echo $image costs $5"));
    Ok(())
}

#[test]
fn undefined_names_are_left_verbatim() -> TestResult {
    let doc = "\
alias:
  values:
    known: v
steps:
  - id: hello
    cmd: busybox echo $unknown
";
    let out = preprocess(doc, Path::new("."))?;
    assert!(out.contains("echo $unknown"));
    Ok(())
}

#[test]
fn whale_directive_with_escape_matches_hand_expansion() -> TestResult {
    let doc = "\
alias:
  directive: \"\u{1f433}\"
  values:
    repo: example.io/app
steps:
  - id: build-app
    build: -t \u{1f433}repo:v1 .
  - id: note
    cmd: ubuntu echo \u{1f433}\u{1f433}repo
";
    let out = preprocess(doc, Path::new("."))?;
    assert!(out.contains("build: -t example.io/app:v1 ."));
    assert!(out.contains("echo \u{1f433}repo"));
    Ok(())
}

#[test]
fn directive_longer_than_one_character_is_rejected() {
    let doc = "\
alias:
  directive: ab
  values:
    x: y
steps: []
";
    let err = preprocess(doc, Path::new(".")).unwrap_err();
    assert!(matches!(err, LoadError::InvalidAliasDirective(d) if d == "ab"));
}

#[test]
fn document_without_directive_is_unchanged() -> TestResult {
    let doc = "\
steps:
  - id: hello
    cmd: busybox echo hello
";
    assert_eq!(preprocess(doc, Path::new("."))?, doc);
    Ok(())
}

#[test]
fn applying_twice_equals_applying_once() -> TestResult {
    // All referenced names defined, values introduce no new tokens.
    let doc = "\
alias:
  values:
    image: ubuntu:22.04
    region: westus
steps:
  - id: hello
    cmd: $image echo $region
";
    let once = preprocess(doc, Path::new("."))?;
    let twice = preprocess(&once, Path::new("."))?;
    assert_eq!(once, twice);
    Ok(())
}

#[test]
fn alias_sources_compose_and_inline_values_override() -> TestResult {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("common.yaml"), "image: alpine\nregion: eastus\n")?;
    std::fs::write(dir.path().join("override.yaml"), "region: westus\n")?;

    let doc = "\
alias:
  src:
    - common.yaml
    - override.yaml
  values:
    image: ubuntu
steps:
  - id: hello
    cmd: $image echo $region
";
    let out = preprocess(doc, dir.path())?;
    assert!(out.contains("cmd: ubuntu echo westus"));
    Ok(())
}

#[test]
fn missing_alias_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let doc = "\
alias:
  src:
    - does-not-exist.yaml
steps: []
";
    let err = preprocess(doc, dir.path()).unwrap_err();
    assert!(matches!(err, LoadError::AliasSourceUnreadable { .. }));
}
