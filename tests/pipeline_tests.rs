//! Tests for the process pipeline engine.
//!
//! Validates per-stage exit status recovery (the PIPESTATUS-equivalent),
//! interior failure detection, expected-code overrides, and the
//! in-process digest tee.
//!
//! Tests that need external programs skip themselves when a program is
//! not on the host.

use std::fs;
use std::process::{Command, Stdio};

use imagebundle::{Error, Pipeline, PipelineInput, PipelineOutput};
use sha1::{Digest, Sha1};
use tempfile::TempDir;

/// Returns false (and says so) when `program` cannot be spawned here.
fn have(program: &str) -> bool {
    let found = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok();
    if !found {
        eprintln!("skipping: '{program}' not available on this host");
    }
    found
}

// =============================================================================
// Exit Status Recovery Tests
// =============================================================================

#[test]
fn test_single_stage_output_captured() {
    if !have("sh") {
        return;
    }
    let mut pipeline = Pipeline::new("echo-pipeline");
    pipeline.add(
        "echo",
        "sh",
        vec!["-c".to_string(), "printf hello".to_string()],
    );
    let output = pipeline
        .execute(PipelineInput::Null, PipelineOutput::Capture)
        .unwrap();
    assert_eq!(output, "hello");
}

#[test]
fn test_all_stage_statuses_recovered() {
    if !have("sh") || !have("cat") {
        return;
    }
    let mut pipeline = Pipeline::new("status-pipeline");
    pipeline.add(
        "produce",
        "sh",
        vec!["-c".to_string(), "printf data".to_string()],
    );
    pipeline.add("relay", "cat", vec![]);
    pipeline.add("consume", "cat", vec![]);
    pipeline
        .execute(PipelineInput::Null, PipelineOutput::Capture)
        .unwrap();

    let results = pipeline.results();
    assert_eq!(results.len(), 3, "one status per stage");
    for result in results {
        assert_eq!(result.code, 0);
        assert!(result.successful);
    }
    assert!(pipeline.errors().is_empty());
}

#[test]
fn test_interior_stage_failure_is_named() {
    if !have("sh") || !have("cat") {
        return;
    }
    // The first stage fails; the terminal stage exits zero. A naive
    // process pipe would report success here.
    let mut pipeline = Pipeline::new("interior-failure");
    pipeline.add("hash", "sh", vec!["-c".to_string(), "exit 1".to_string()]);
    pipeline.add("tee", "cat", vec![]);
    pipeline.add("gzip", "cat", vec![]);

    let err = pipeline
        .execute(PipelineInput::Null, PipelineOutput::Capture)
        .unwrap_err();
    match err {
        Error::PipelineStageFailed {
            pipeline: name,
            stage,
            code,
            expected,
        } => {
            assert_eq!(name, "interior-failure");
            assert_eq!(stage, "hash");
            assert_eq!(code, 1);
            assert_eq!(expected, 0);
        }
        other => panic!("expected PipelineStageFailed, got {other:?}"),
    }

    // The terminal stage's own status is still recorded as successful.
    let results = pipeline.results();
    assert!(!results[0].successful);
    assert!(results[2].successful);
}

#[test]
fn test_first_failing_stage_in_declared_order_reported() {
    if !have("sh") {
        return;
    }
    let mut pipeline = Pipeline::new("two-failures");
    pipeline.add("first", "sh", vec!["-c".to_string(), "exit 2".to_string()]);
    pipeline.add("second", "sh", vec!["-c".to_string(), "exit 3".to_string()]);

    let err = pipeline
        .execute(PipelineInput::Null, PipelineOutput::Capture)
        .unwrap_err();
    match err {
        Error::PipelineStageFailed { stage, .. } => assert_eq!(stage, "first"),
        other => panic!("expected PipelineStageFailed, got {other:?}"),
    }
    assert_eq!(pipeline.errors().len(), 2);
}

#[test]
fn test_expected_nonzero_code_counts_as_success() {
    if !have("sh") {
        return;
    }
    let mut pipeline = Pipeline::new("expected-code");
    pipeline.add_expecting(
        "grumbler",
        "sh",
        vec!["-c".to_string(), "exit 3".to_string()],
        3,
    );
    pipeline
        .execute(PipelineInput::Null, PipelineOutput::Capture)
        .unwrap();
    assert!(pipeline.results()[0].successful);
    assert_eq!(pipeline.results()[0].code, 3);
}

#[test]
fn test_unspawnable_stage_is_invocation_error() {
    let mut pipeline = Pipeline::new("bad-program");
    pipeline.add("ghost", "definitely-not-a-real-program-9e7b", vec![]);
    let err = pipeline
        .execute(PipelineInput::Null, PipelineOutput::Capture)
        .unwrap_err();
    assert!(matches!(err, Error::PipelineInvocation { .. }));
}

#[test]
fn test_empty_pipeline_is_invocation_error() {
    let mut pipeline = Pipeline::new("empty");
    let err = pipeline
        .execute(PipelineInput::Null, PipelineOutput::Capture)
        .unwrap_err();
    assert!(matches!(err, Error::PipelineInvocation { .. }));
}

// =============================================================================
// File Input/Output Tests
// =============================================================================

#[test]
fn test_file_input_to_file_output() {
    if !have("cat") {
        return;
    }
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("input");
    let output = temp.path().join("output");
    fs::write(&input, b"pass through").unwrap();

    let mut pipeline = Pipeline::new("copy");
    pipeline.add("relay", "cat", vec![]);
    pipeline
        .execute(
            PipelineInput::File(input),
            PipelineOutput::File(output.clone()),
        )
        .unwrap();
    assert_eq!(fs::read(&output).unwrap(), b"pass through");
}

// =============================================================================
// Digest Tee Tests
// =============================================================================

#[test]
fn test_digest_tee_hashes_while_forwarding() {
    if !have("cat") {
        return;
    }
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("input");
    let data: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
    fs::write(&input, &data).unwrap();

    let mut pipeline = Pipeline::new("tee-pipeline");
    pipeline.add("read", "cat", vec![]);
    let handle = pipeline.add_digest_tee("digest");
    pipeline.add("consume", "cat", vec![]);

    let output = temp.path().join("output");
    pipeline
        .execute(
            PipelineInput::File(input),
            PipelineOutput::File(output.clone()),
        )
        .unwrap();

    // Both readers saw every byte: the sink file matches and the digest
    // is the digest of the full stream.
    assert_eq!(fs::read(&output).unwrap(), data);
    assert_eq!(
        handle.digest().expect("digest after run"),
        <[u8; 20]>::from(Sha1::digest(&data))
    );
    assert!(pipeline.results().iter().all(|r| r.successful));
}

#[test]
fn test_trailing_digest_tee_writes_pipeline_output() {
    if !have("sh") {
        return;
    }
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("output");

    let mut pipeline = Pipeline::new("trailing-tee");
    pipeline.add(
        "produce",
        "sh",
        vec!["-c".to_string(), "printf abc".to_string()],
    );
    let handle = pipeline.add_digest_tee("digest");
    pipeline
        .execute(PipelineInput::Null, PipelineOutput::File(output.clone()))
        .unwrap();

    assert_eq!(fs::read(&output).unwrap(), b"abc");
    assert_eq!(
        handle.hex_digest().as_deref(),
        Some("a9993e364706816aba3e25717850c26c9cd0d89d")
    );
}

#[test]
fn test_digest_tee_before_run_is_empty() {
    let mut pipeline = Pipeline::new("unused");
    let handle = pipeline.add_digest_tee("digest");
    assert!(handle.digest().is_none());
    assert!(handle.hex_digest().is_none());
}
