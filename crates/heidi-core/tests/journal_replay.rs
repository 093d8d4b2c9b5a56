// crates/heidi-core/tests/journal_replay.rs
// ============================================================================
// Module: Journal and Replay Tests
// Description: Hash-chain writer, schema lock, and offline replay.
// Purpose: Prove that any tampering is detected at a precise line.
// Dependencies: heidi-core, proptest, serde_json, tempfile
// ============================================================================
//! ## Overview
//! Builds journals through the real writer (and by hand for byte-level edge
//! cases) and checks the replay verifier against them.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::collections::BTreeMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;

use heidi_core::EVENT_VERSION;
use heidi_core::Event;
use heidi_core::EventJournal;
use heidi_core::EventKind;
use heidi_core::EventLevel;
use heidi_core::EventRecord;
use heidi_core::JournalError;
use heidi_core::MAX_EVENT_BYTES;
use heidi_core::MetricValue;
use heidi_core::PipelineView;
use heidi_core::ReplayError;
use heidi_core::parse_event_line;
use heidi_core::runtime::replay::verify_bytes;
use heidi_core::sha256_hex;
use heidi_core::verify_journal;
use proptest::prelude::*;
use tempfile::tempdir;

mod common;
use crate::common::write_journal;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Builds an event by hand.
fn manual_event(run_id: &str, round: u32, event_type: &str, stage: &str, prev_hash: &str) -> Event {
    Event {
        event_version: EVENT_VERSION.to_string(),
        ts: "2026-01-01T00:00:00Z".to_string(),
        run_id: run_id.to_string(),
        round,
        stage: stage.to_string(),
        level: EventLevel::Info,
        event_type: event_type.to_string(),
        message: "manual".to_string(),
        counters_delta: BTreeMap::new(),
        usage_delta: BTreeMap::new(),
        artifact_paths: Vec::new(),
        prev_hash: prev_hash.to_string(),
    }
}

/// Splits journal bytes into lines that keep their terminators.
fn raw_lines(bytes: &[u8]) -> Vec<Vec<u8>> {
    bytes.split_inclusive(|byte| *byte == b'\n').map(<[u8]>::to_vec).collect()
}

// ============================================================================
// SECTION: Writer
// ============================================================================

/// Tests the chain links of freshly written lines.
#[test]
fn writer_links_each_line_to_the_previous_raw_bytes() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    write_journal(&path, "run_chain", 3);
    let bytes = fs::read(&path).expect("read journal");
    let lines = raw_lines(&bytes);
    assert_eq!(lines.len(), 3);
    let first = parse_event_line(std::str::from_utf8(&lines[0]).expect("utf8").trim_end())
        .expect("first line");
    assert_eq!(first.prev_hash, "run_chain");
    assert_eq!(first.event_type, "pipeline_start");
    for index in 1 .. lines.len() {
        let text = std::str::from_utf8(&lines[index]).expect("utf8");
        let event = parse_event_line(text.trim_end()).expect("line");
        assert_eq!(event.prev_hash, sha256_hex(&lines[index - 1]));
    }
}

/// Tests that fields are written in the locked order.
#[test]
fn writer_emits_fields_in_wire_order() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    write_journal(&path, "run_order", 1);
    let text = fs::read_to_string(&path).expect("read journal");
    let positions: Vec<usize> = heidi_core::EVENT_FIELDS
        .iter()
        .map(|field| text.find(&format!("\"{field}\":")).expect("field present"))
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
}

/// Tests that reopening resumes the chain from the last line.
#[test]
fn reopened_journal_continues_the_chain() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    write_journal(&path, "run_resume", 2);
    let mut journal = EventJournal::open(&path, "run_resume").expect("reopen");
    assert_eq!(journal.event_count(), 2);
    journal
        .append(EventRecord::of_kind(EventKind::PipelineComplete, "pipeline", 3, "done"))
        .expect("append");
    let report = verify_journal(&path).expect("verify");
    assert_eq!(report.events, 3);
    assert_eq!(report.last_hash.as_deref(), Some(journal.last_hash()));
    assert_eq!(report.final_state, PipelineView::Idle);
}

/// Tests that a journal cannot be reopened under another run id.
#[test]
fn reopening_under_another_run_id_is_refused() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    write_journal(&path, "run_owner", 1);
    assert!(matches!(EventJournal::open(&path, "run_other"), Err(JournalError::Corrupt { .. })));
}

/// Tests that a torn final line blocks further appends.
#[test]
fn partial_trailing_line_is_refused() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    write_journal(&path, "run_torn", 1);
    let mut file = OpenOptions::new().append(true).open(&path).expect("open");
    file.write_all(b"{\"event_version\":\"1.0\"").expect("torn write");
    assert!(matches!(
        EventJournal::open(&path, "run_torn"),
        Err(JournalError::Corrupt {
            line: 2,
            ..
        })
    ));
}

/// Tests that secrets and ANSI codes never reach the file.
#[test]
fn messages_are_sanitized_before_hashing() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    let mut journal = EventJournal::open(&path, "run_redact").expect("open");
    let token = format!("ghp_{}", "a".repeat(36));
    let event = journal
        .append(EventRecord::of_kind(
            EventKind::PipelineError,
            "pipeline",
            1,
            format!("\u{1b}[31mpush failed with {token}\u{1b}[0m"),
        ))
        .expect("append");
    assert_eq!(event.message, "push failed with [GITHUB_TOKEN]");
    let text = fs::read_to_string(&path).expect("read");
    assert!(!text.contains(&token));
    verify_journal(&path).expect("still verifies");
}

/// Tests that NaN deltas are refused and nothing is written.
#[test]
fn non_finite_deltas_are_refused() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    let mut journal = EventJournal::open(&path, "run_nan").expect("open");
    let mut counters = BTreeMap::new();
    counters.insert("train_loss".to_string(), MetricValue::Float(f64::NAN));
    let record =
        EventRecord::of_kind(EventKind::StageEnd, "train", 1, "loss").with_counters(counters);
    assert!(matches!(journal.append(record), Err(JournalError::NonFinite("counters_delta"))));
    assert_eq!(journal.event_count(), 0);
    assert_eq!(journal.last_hash(), "run_nan");
    assert_eq!(fs::read(&path).expect("read").len(), 0);
}

/// Tests the per-line size cap.
#[test]
fn oversized_events_are_refused() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    let mut journal = EventJournal::open(&path, "run_big").expect("open");
    let mut usage = BTreeMap::new();
    usage.insert("k".repeat(MAX_EVENT_BYTES), MetricValue::Int(1));
    let record = EventRecord::of_kind(EventKind::StageEnd, "generate", 1, "big").with_usage(usage);
    assert!(matches!(journal.append(record), Err(JournalError::PayloadTooLarge(_))));
    assert_eq!(journal.event_count(), 0);
}

// ============================================================================
// SECTION: Replay
// ============================================================================

/// Tests that an empty journal verifies with zero events.
#[test]
fn empty_journal_verifies() {
    let report = verify_bytes(b"").expect("empty verifies");
    assert_eq!(report.events, 0);
    assert_eq!(report.final_state, PipelineView::Idle);
    assert_eq!(report.run_id, None);
}

/// Tests state reconstruction across a round.
#[test]
fn replay_reconstructs_pipeline_view_and_rounds() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    let mut journal = EventJournal::open(&path, "run_view").expect("open");
    let steps = [
        (EventKind::PipelineStart, "pipeline", 0),
        (EventKind::StageStart, "generate", 1),
        (EventKind::StageStart, "validate", 1),
        (EventKind::StageStart, "train", 2),
    ];
    for (kind, stage, round) in steps {
        journal.append(EventRecord::of_kind(kind, stage, round, "step")).expect("append");
    }
    let report = verify_journal(&path).expect("verify");
    assert_eq!(report.final_state, PipelineView::Finalizing);
    assert_eq!(report.max_round, 2);
    assert_eq!(report.run_id.as_deref(), Some("run_view"));

    journal
        .append(
            EventRecord::of_kind(EventKind::PipelineError, "pipeline", 2, "boom")
                .with_level(EventLevel::Error),
        )
        .expect("append error");
    assert_eq!(verify_journal(&path).expect("verify").final_state, PipelineView::Error);
}

/// Tests that CRLF lines are hashed exactly as written.
#[test]
fn crlf_lines_are_hashed_verbatim() {
    let first = serde_json::to_string(&manual_event("run_crlf", 0, "pipeline_start", "pipeline", "run_crlf"))
        .expect("serialize");
    let first_line = format!("{first}\r\n");
    let second = serde_json::to_string(&manual_event(
        "run_crlf",
        1,
        "stage_start",
        "generate",
        &sha256_hex(first_line.as_bytes()),
    ))
    .expect("serialize");
    let journal = format!("{first_line}{second}\r\n");
    let report = verify_bytes(journal.as_bytes()).expect("crlf verifies");
    assert_eq!(report.events, 2);

    let normalized = journal.replace("\r\n", "\n");
    assert!(matches!(
        verify_bytes(normalized.as_bytes()),
        Err(ReplayError::Chain {
            line: 2,
            ..
        })
    ));
}

/// Tests that line 0 must link to its own run id.
#[test]
fn first_line_must_link_to_run_id() {
    let line = serde_json::to_string(&manual_event("run_a", 0, "pipeline_start", "pipeline", "other"))
        .expect("serialize");
    let err = verify_bytes(format!("{line}\n").as_bytes()).expect_err("must fail");
    assert_eq!(err.line(), Some(1));
    assert!(matches!(err, ReplayError::Chain { .. }));
}

/// Tests that every line must share line 0's run id.
#[test]
fn run_id_must_stay_constant() {
    let first = format!(
        "{}\n",
        serde_json::to_string(&manual_event("run_a", 0, "pipeline_start", "pipeline", "run_a"))
            .expect("serialize")
    );
    let second = serde_json::to_string(&manual_event(
        "run_b",
        1,
        "stage_start",
        "generate",
        &sha256_hex(first.as_bytes()),
    ))
    .expect("serialize");
    let err = verify_bytes(format!("{first}{second}\n").as_bytes()).expect_err("must fail");
    assert!(matches!(
        err,
        ReplayError::Schema {
            line: 2,
            ..
        }
    ));
}

/// Tests schema lock violations on replay.
#[test]
fn schema_violations_fail_closed_with_line_numbers() {
    let valid = serde_json::to_string(&manual_event("run_s", 0, "pipeline_start", "pipeline", "run_s"))
        .expect("serialize");
    let wrong_version = valid.replace("\"event_version\":\"1.0\"", "\"event_version\":\"2.0\"");
    let missing_field = valid.replace(",\"message\":\"manual\"", "");
    let extra_field = valid.replacen('{', "{\"extra\":1,", 1);
    for bad in [wrong_version, missing_field, extra_field, String::new()] {
        let err = verify_bytes(format!("{bad}\n").as_bytes()).expect_err("must fail");
        assert!(matches!(
            err,
            ReplayError::Schema {
                line: 1,
                ..
            }
        ));
    }
    let err = verify_bytes(b"{not json}\n").expect_err("must fail");
    assert!(matches!(
        err,
        ReplayError::Json {
            line: 1,
            ..
        }
    ));
}

/// Tests that a missing journal is an I/O error.
#[test]
fn missing_journal_is_an_io_error() {
    let dir = tempdir().expect("temp dir");
    assert!(matches!(
        verify_journal(&dir.path().join("absent.jsonl")),
        Err(ReplayError::Io(_))
    ));
}

// ============================================================================
// SECTION: Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Tests that flipping any byte before the last line is caught by the next line.
    #[test]
    fn any_tampered_byte_is_detected(
        count in 3_u32 .. 9,
        line_pick in any::<prop::sample::Index>(),
        byte_pick in any::<prop::sample::Index>(),
        flip in 1_u8 ..= 255,
    ) {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("events.jsonl");
        write_journal(&path, "run_prop", count);
        let bytes = fs::read(&path).expect("read");
        let lines = raw_lines(&bytes);
        let target = line_pick.index(lines.len() - 1);
        let content_len = lines[target].len() - 1;
        let offset: usize = lines[.. target].iter().map(Vec::len).sum::<usize>()
            + byte_pick.index(content_len);
        let mut tampered = bytes.clone();
        tampered[offset] ^= flip;
        let err = verify_bytes(&tampered).expect_err("tampering must be detected");
        let tampered_line = u64::try_from(target).expect("line index") + 1;
        let line = err.line().expect("line-level error");
        prop_assert!(line <= tampered_line + 1, "detected at {line}, tampered {tampered_line}");
    }
}
