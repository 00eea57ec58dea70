//! A report forced before any thread has ever looked idle must still be
//! complete and well-formed, with every thread marked active.

use tempfile::NamedTempFile;
mod common;
use common::{ScriptedSampler, read_utf16_report, start_harness};

#[test]
fn dump_now_reports_all_threads_as_active() {
    let sampler = ScriptedSampler::new();
    sampler.busy(41, vec![vec![0x1000, 0x2000], vec![0x1000, 0x2000, 0x3000]]);
    sampler.busy(42, vec![vec![0x1100, 0x2100], vec![0x2100, 0x3100]]);

    let report = NamedTempFile::new().expect("temp report file");
    let harness = start_harness(&sampler, 50, Some(report.path()));
    harness.detector.register(41, "alpha");
    harness.detector.register(42, "beta");

    // No watchdog loop at all: the manual path must stand alone
    harness.detector.dump_now().expect("dump succeeds");

    let text = read_utf16_report(report.path());
    let blocks: Vec<&str> = text.trim_end().split("\n\n").collect();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].starts_with("[0] thread alpha (41) is active"));
    assert!(blocks[1].starts_with("[1] thread beta (42) is active"));
    for block in &blocks {
        assert!(block.lines().count() >= 3, "header plus frames: {block}");
    }
}

#[test]
fn dump_now_with_unresolvable_addresses_degrades_per_line() {
    let sampler = ScriptedSampler::new();
    // 0xdead is not in the scenario symbol table
    sampler.busy(51, vec![vec![0x1000, 0xdead], vec![0x1000, 0xdead, 0x2000]]);

    let report = NamedTempFile::new().expect("temp report file");
    let harness = start_harness(&sampler, 50, Some(report.path()));
    harness.detector.register(51, "mixed");

    harness.detector.dump_now().expect("dump succeeds");

    let text = read_utf16_report(report.path());
    assert!(text.contains("gate_wait"), "resolvable line kept: {text}");
    assert!(
        text.contains("0x000000000000dead, source unavailable"),
        "unresolvable line degraded, not dropped: {text}"
    );
}

#[test]
fn unopenable_report_path_falls_back_to_stderr() {
    let sampler = ScriptedSampler::new();
    sampler.stuck(61, vec![0x1000]);

    let dir = tempfile::tempdir().expect("temp dir");
    // A directory cannot be created as a file; the report must fall back
    // to stderr rather than be lost, and the dump itself still succeeds.
    let harness = start_harness(&sampler, 50, Some(dir.path()));
    harness.detector.register(61, "worker");

    harness.detector.dump_now().expect("fallback sink succeeds");
}
