//! End-to-end positional assembly scenarios
//!
//! Each test drives the full pipeline through the public driver API with
//! hand-built evidence streams.

use break_forge::assembly::positional::assemble_both_directions;
use break_forge::{
    AssemblyConfig, AssemblyContext, AssemblyError, AssemblyRecord, BreakendDirection,
    DirectedEvidence, PositionalAssembler,
};

fn test_config() -> AssemblyConfig {
    AssemblyConfig {
        k: 4,
        anchor_length: 10,
        max_path_length: 100,
        max_read_length: 60,
        min_concordant_fragment_size: 100,
        max_concordant_fragment_size: 300,
        ..AssemblyConfig::default()
    }
}

fn no_collapse_config() -> AssemblyConfig {
    let mut config = test_config();
    config.error_correction.max_base_mismatch_for_collapse = 0;
    config
}

fn context(config: AssemblyConfig) -> AssemblyContext {
    AssemblyContext::new(config).unwrap()
}

fn soft_clip(
    id: &str,
    reference_index: usize,
    start: i32,
    direction: BreakendDirection,
    bases: &[u8],
    quals: &[u8],
    anchor: usize,
) -> DirectedEvidence {
    DirectedEvidence::soft_clip(
        id,
        reference_index,
        start,
        direction,
        bases.to_vec(),
        quals.to_vec(),
        anchor,
    )
    .unwrap()
}

fn run(
    evidence: Vec<DirectedEvidence>,
    context: AssemblyContext,
    direction: BreakendDirection,
) -> Vec<AssemblyRecord> {
    PositionalAssembler::new(evidence.into_iter(), context, direction)
        .map(|r| r.expect("assembly error"))
        .collect()
}

/// E1: a single forward soft clip produces one anchored contig whose
/// non-reference tail is the clipped sequence
#[test]
fn single_forward_soft_clip() {
    // read ATGTGGC aligned 2S2M3S: the breakend-proximal portion is GT
    // (anchor, positions 3-4) plus the clipped tail GGC
    let evidence = soft_clip(
        "read1",
        2,
        3,
        BreakendDirection::Forward,
        b"GTGGC",
        &[3, 4, 5, 6, 7],
        2,
    );
    let out = run(
        vec![evidence],
        context(no_collapse_config()),
        BreakendDirection::Forward,
    );
    assert_eq!(out.len(), 1);
    let contig = &out[0];
    assert_eq!(contig.reference_index, 2);
    assert_eq!(contig.direction, BreakendDirection::Forward);
    assert!(contig.base_calls.ends_with(b"GGC"));
    assert_eq!(contig.anchored_base_count, 2);
    assert_eq!(contig.anchor_position, Some(4));
}

/// E2: two identical soft clips assemble into one contig whose qualities
/// reflect the summed per-k-mer weights
#[test]
fn identical_soft_clips_merge() {
    let make = |id: &str| {
        soft_clip(
            id,
            0,
            10,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[5; 8],
            4,
        )
    };
    let single = run(
        vec![make("solo")],
        context(no_collapse_config()),
        BreakendDirection::Forward,
    );
    let out = run(
        vec![make("a"), make("b")],
        context(no_collapse_config()),
        BreakendDirection::Forward,
    );
    assert_eq!(out.len(), 1);
    let contig = &out[0];
    assert!(contig.base_calls.ends_with(b"CCCC"));
    assert_eq!(contig.base_calls, b"AAAACCCC");
    assert_eq!(contig.anchored_base_count, 4);
    assert_eq!(
        contig.supporting_evidence,
        vec!["a".to_string(), "b".to_string()]
    );
    // doubled support doubles every per-base quality, it never duplicates
    // bases
    assert_eq!(contig.base_calls.len(), single[0].base_calls.len());
    for (two, one) in contig
        .base_qualities
        .iter()
        .zip(single[0].base_qualities.iter())
    {
        assert_eq!(u32::from(*two), 2 * u32::from(*one));
    }
}

/// E3: a one-base interior difference collapses into the higher-weight
/// variant
#[test]
fn bubble_collapses_to_heavier_variant() {
    let heavy = soft_clip(
        "heavy",
        0,
        10,
        BreakendDirection::Forward,
        b"AAAACTGGTT",
        &[20; 10],
        4,
    );
    let light = soft_clip(
        "light",
        0,
        10,
        BreakendDirection::Forward,
        b"AAAACAGGTT",
        &[10; 10],
        4,
    );
    let mut config = test_config();
    config.error_correction.max_base_mismatch_for_collapse = 1;
    config.error_correction.collapse_bubbles_only = true;
    let out = run(
        vec![heavy, light],
        context(config),
        BreakendDirection::Forward,
    );
    assert_eq!(out.len(), 1);
    let contig = &out[0];
    assert_eq!(contig.base_calls, b"AAAACTGGTT");
    // the collapsed read still supports the winning contig
    assert_eq!(
        contig.supporting_evidence,
        vec!["heavy".to_string(), "light".to_string()]
    );
}

/// E4: evidence spanning two reference indices yields two independent,
/// deterministic pipelines
#[test]
fn two_reference_contigs_assemble_independently() {
    let evidence = vec![
        soft_clip(
            "c0",
            0,
            10,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        soft_clip(
            "c1",
            1,
            10,
            BreakendDirection::Forward,
            b"GGGGTTTT",
            &[10; 8],
            4,
        ),
    ];
    let out = run(
        evidence,
        context(no_collapse_config()),
        BreakendDirection::Forward,
    );
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].reference_index, 0);
    assert_eq!(out[0].base_calls, b"AAAACCCC");
    assert_eq!(out[1].reference_index, 1);
    assert_eq!(out[1].base_calls, b"GGGGTTTT");
}

fn recovery_evidence() -> Vec<DirectedEvidence> {
    vec![
        soft_clip(
            "ok3",
            3,
            100,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        // out of sort order within contig 3
        soft_clip(
            "bad3",
            3,
            50,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        soft_clip(
            "ok4",
            4,
            10,
            BreakendDirection::Forward,
            b"GGGGTTTT",
            &[10; 8],
            4,
        ),
    ]
}

/// E5: recovery mode drops the failing contig and resumes at the next
/// reference index
#[test]
fn recovery_mode_resumes_at_next_reference() {
    let mut config = no_collapse_config();
    config.attempt_recovery = true;
    let out: Vec<_> = PositionalAssembler::new(
        recovery_evidence().into_iter(),
        context(config),
        BreakendDirection::Forward,
    )
    .collect();
    let records: Vec<&AssemblyRecord> = out
        .iter()
        .map(|r| r.as_ref().expect("recovery mode must not surface errors"))
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reference_index, 4);
    assert_eq!(records[0].base_calls, b"GGGGTTTT");
}

/// Each failure gets its own recovery chance: an intervening contig that
/// assembles cleanly but emits nothing must not exhaust the budget
#[test]
fn recovery_budget_is_per_failure() {
    let mut config = no_collapse_config();
    config.attempt_recovery = true;
    let evidence = vec![
        soft_clip(
            "ok3",
            3,
            100,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        soft_clip(
            "bad3",
            3,
            50,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        // fully reference-anchored read: contig 4 assembles nothing
        soft_clip(
            "ref4",
            4,
            10,
            BreakendDirection::Forward,
            b"AAAAAAAA",
            &[10; 8],
            8,
        ),
        soft_clip(
            "ok5",
            5,
            100,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        soft_clip(
            "bad5",
            5,
            50,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        soft_clip(
            "ok6",
            6,
            10,
            BreakendDirection::Forward,
            b"GGGGTTTT",
            &[10; 8],
            4,
        ),
    ];
    let out: Vec<_> = PositionalAssembler::new(
        evidence.into_iter(),
        context(config),
        BreakendDirection::Forward,
    )
    .collect();
    let records: Vec<&AssemblyRecord> = out
        .iter()
        .map(|r| r.as_ref().expect("second failure must still recover"))
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reference_index, 6);
    assert_eq!(records[0].base_calls, b"GGGGTTTT");
}

/// Without recovery the same stream is fatal
#[test]
fn strict_mode_propagates_malformed_input() {
    let mut out = PositionalAssembler::new(
        recovery_evidence().into_iter(),
        context(no_collapse_config()),
        BreakendDirection::Forward,
    );
    match out.next() {
        Some(Err(AssemblyError::MalformedInput(_))) => {}
        other => panic!("expected MalformedInput, got {other:?}"),
    }
    assert!(out.next().is_none());
}

/// E6: with a backward direction configured, forward evidence is silently
/// dropped and contigs anchor on the right; symmetric input reads out
/// reversed relative to the forward case
#[test]
fn direction_filter_and_backward_readout() {
    let forward = soft_clip(
        "fwd",
        0,
        10,
        BreakendDirection::Forward,
        b"AAAACCCC",
        &[10; 8],
        4,
    );
    let backward = soft_clip(
        "bwd",
        0,
        16,
        BreakendDirection::Backward,
        b"CCCCAAAA",
        &[10; 8],
        4,
    );
    let evidence = vec![forward, backward];

    let out_backward = run(
        evidence.clone(),
        context(no_collapse_config()),
        BreakendDirection::Backward,
    );
    assert_eq!(out_backward.len(), 1);
    let contig = &out_backward[0];
    assert_eq!(contig.direction, BreakendDirection::Backward);
    assert_eq!(contig.supporting_evidence, vec!["bwd".to_string()]);
    assert_eq!(contig.base_calls, b"CCCCAAAA");
    assert_eq!(contig.anchored_base_count, 4);
    assert_eq!(contig.anchor_position, Some(20));

    let out_forward = run(
        evidence,
        context(no_collapse_config()),
        BreakendDirection::Forward,
    );
    assert_eq!(out_forward.len(), 1);
    let mut reversed = out_forward[0].base_calls.clone();
    reversed.reverse();
    assert_eq!(contig.base_calls, reversed);
}

/// Determinism: identical input and configuration produce byte-identical
/// output streams
#[test]
fn assembly_is_deterministic() {
    fastrand::seed(1844);
    let mut evidence = Vec::new();
    let mut position = 10;
    for i in 0..40 {
        position += fastrand::i32(0..400);
        let bases: Vec<u8> = (0..12)
            .map(|_| b"ACGT"[fastrand::usize(0..4)])
            .collect();
        let quals: Vec<u8> = (0..12).map(|_| fastrand::u8(1..40)).collect();
        evidence.push(
            DirectedEvidence::soft_clip(
                format!("r{i}"),
                0,
                position,
                BreakendDirection::Forward,
                bases,
                quals,
                4,
            )
            .unwrap(),
        );
    }
    let first = run(
        evidence.clone(),
        context(test_config()),
        BreakendDirection::Forward,
    );
    let second = run(
        evidence,
        context(test_config()),
        BreakendDirection::Forward,
    );
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

/// Evidence release: once a contig consumes a piece of evidence, no later
/// contig may claim it
#[test]
fn evidence_supports_at_most_one_contig() {
    fastrand::seed(99);
    let mut evidence = Vec::new();
    let mut position = 10;
    for i in 0..30 {
        position += fastrand::i32(0..60);
        let bases: Vec<u8> = (0..10)
            .map(|_| b"ACGT"[fastrand::usize(0..4)])
            .collect();
        evidence.push(
            DirectedEvidence::soft_clip(
                format!("r{i}"),
                0,
                position,
                BreakendDirection::Forward,
                bases,
                vec![15; 10],
                4,
            )
            .unwrap(),
        );
    }
    let out = run(
        evidence,
        context(test_config()),
        BreakendDirection::Forward,
    );
    let mut seen = std::collections::HashSet::new();
    for record in &out {
        for id in &record.supporting_evidence {
            assert!(seen.insert(id.clone()), "evidence {id} consumed twice");
        }
    }
}

/// The rayon helper assembles both directions of one evidence set
#[test]
fn both_directions_assemble_in_parallel() {
    let evidence = vec![
        soft_clip(
            "fwd",
            0,
            10,
            BreakendDirection::Forward,
            b"AAAACCCC",
            &[10; 8],
            4,
        ),
        soft_clip(
            "bwd",
            0,
            16,
            BreakendDirection::Backward,
            b"CCCCAAAA",
            &[10; 8],
            4,
        ),
    ];
    let (forward, backward) =
        assemble_both_directions(evidence, &context(no_collapse_config())).unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(backward.len(), 1);
    assert_eq!(forward[0].base_calls, b"AAAACCCC");
    assert_eq!(backward[0].base_calls, b"CCCCAAAA");
}

/// Optional side output: one CSV per (contig, direction) with header and
/// one row per emitted contig
#[test]
fn export_tracker_writes_progress_csv() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(no_collapse_config())
        .with_contig_names(vec!["chr1".to_string()])
        .with_export_dir(dir.path().to_path_buf());
    let evidence = vec![soft_clip(
        "r1",
        0,
        10,
        BreakendDirection::Forward,
        b"AAAACCCC",
        &[10; 8],
        4,
    )];
    let out = run(evidence, ctx, BreakendDirection::Forward);
    assert_eq!(out.len(), 1);

    let exported = std::fs::read_to_string(dir.path().join("positional-chr1-fwd.csv")).unwrap();
    let lines: Vec<&str> = exported.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("contigs,"));
    assert!(lines[1].starts_with("1,"));
}
