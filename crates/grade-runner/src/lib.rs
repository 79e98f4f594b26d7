use anyhow::{Context, Result};
use grade_core::{
    passthrough_score, score_coalesce, score_cycles, score_expected, validate_trace, CoalesceCase,
    CoalesceTally, CycleBounds, MetricRecord, OutputSchema, Report, ScoreResult, INVALID_CYCLES,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub schema: OutputSchema,
    pub echo_output: bool,
    pub max_score: f64,
}

impl TestCase {
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }
}

pub fn run_test(case: &TestCase) -> MetricRecord {
    match &case.schema {
        OutputSchema::StdoutMarker { marker, arity } => run_marker_test(case, marker, *arity),
        OutputSchema::ResultFile { file_name, arity } => {
            run_result_file_test(case, file_name, *arity)
        }
        OutputSchema::TagStream => run_tag_stream_test(case),
    }
}

fn invalidate(case: &TestCase, reason: String) -> MetricRecord {
    warn!(test = %case.name, reason = %reason, "marking record invalid");
    MetricRecord::invalid(reason)
}

fn spawn_capture(case: &TestCase, cwd: Option<&Path>) -> Result<Output> {
    let program = match cwd {
        Some(_) => absolutize(&case.program),
        None => case.program.clone(),
    };
    let mut cmd = Command::new(&program);
    cmd.args(&case.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    debug!(command = %case.command_line(), "spawning child");
    cmd.output()
        .with_context(|| format!("failed to run {}", case.program.display()))
}

fn run_marker_test(case: &TestCase, marker: &str, arity: usize) -> MetricRecord {
    let output = match spawn_capture(case, None) {
        Ok(output) => output,
        Err(err) => return invalidate(case, format!("{err:#}")),
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut marker_line = None;
    for line in stdout.lines() {
        if line.contains(marker) {
            marker_line = Some(line.to_string());
        } else if case.echo_output {
            println!("{line}");
        }
    }
    if !output.status.success() {
        return invalidate(case, format!("{} exited with {}", case.name, output.status));
    }
    let line = match marker_line {
        Some(line) => line,
        None => return invalidate(case, format!("no {marker} line in {} output", case.name)),
    };
    let values = parse_integers(&line);
    if values.len() < arity {
        return invalidate(
            case,
            format!(
                "{marker} line carried {} integers, expected {arity}",
                values.len()
            ),
        );
    }
    MetricRecord::Values(values[..arity].to_vec())
}

fn run_result_file_test(case: &TestCase, file_name: &str, arity: usize) -> MetricRecord {
    let scratch = scratch_dir();
    if let Err(err) = fs::create_dir_all(&scratch) {
        return invalidate(case, format!("could not create scratch dir: {err}"));
    }
    let record = result_file_in_dir(case, file_name, arity, &scratch);
    let _ = fs::remove_dir_all(&scratch);
    record
}

fn result_file_in_dir(
    case: &TestCase,
    file_name: &str,
    arity: usize,
    scratch: &Path,
) -> MetricRecord {
    let result_path = scratch.join(file_name);
    // Never read a result file left over from an earlier run.
    let _ = fs::remove_file(&result_path);

    let output = match spawn_capture(case, Some(scratch)) {
        Ok(output) => output,
        Err(err) => return invalidate(case, format!("{err:#}")),
    };
    if !output.status.success() {
        return invalidate(
            case,
            format!("running {} failed with {}", case.name, output.status),
        );
    }
    let data = match fs::read_to_string(&result_path) {
        Ok(data) => data,
        Err(_) => return invalidate(case, format!("{} wrote no result file", case.name)),
    };
    let mut values = Vec::new();
    for token in data.split_whitespace() {
        match token.parse::<u64>() {
            Ok(v) => values.push(v),
            Err(_) => {
                return invalidate(
                    case,
                    format!("non-integer {token:?} in {} results", case.name),
                )
            }
        }
    }
    if values.len() < arity {
        return invalidate(
            case,
            format!("result file carried {} integers, expected {arity}", values.len()),
        );
    }
    MetricRecord::Values(values[..arity].to_vec())
}

fn run_tag_stream_test(case: &TestCase) -> MetricRecord {
    let output = match spawn_capture(case, None) {
        Ok(output) => output,
        Err(err) => return invalidate(case, format!("{err:#}")),
    };
    if !output.status.success() {
        return invalidate(
            case,
            format!("running {} failed with {}", case.name, output.status),
        );
    }
    match parse_tag_stream(&String::from_utf8_lossy(&output.stdout)) {
        Ok(tally) => MetricRecord::Coalesce(tally),
        Err(reason) => invalidate(case, format!("{}: {reason}", case.name)),
    }
}

// First line is the operation count, then one digit per coalescing event
// until a literal Done line, and the final output line is the allocation
// count. Unrelated lines pass through untallied.
fn parse_tag_stream(stdout: &str) -> std::result::Result<CoalesceTally, String> {
    let lines: Vec<&str> = stdout.lines().collect();
    let (first, rest) = match lines.split_first() {
        Some(split) => split,
        None => return Err("produced no output".to_string()),
    };
    let op_count = first
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("bad operation count {first:?}"))?;

    let mut cases = [0u64; 4];
    let mut saw_done = false;
    for line in rest {
        match line.trim() {
            "Done" => {
                saw_done = true;
                break;
            }
            "1" => cases[0] += 1,
            "2" => cases[1] += 1,
            "3" => cases[2] += 1,
            "4" => cases[3] += 1,
            _ => {}
        }
    }
    if !saw_done {
        return Err("never printed Done".to_string());
    }
    let alloc_count = match lines.last().map(|line| line.trim().parse::<u64>()) {
        Some(Ok(v)) => v,
        _ => return Err("bad allocation count".to_string()),
    };
    Ok(CoalesceTally {
        op_count,
        alloc_count,
        cases,
    })
}

fn parse_integers(text: &str) -> Vec<u64> {
    let mut values = Vec::new();
    let mut run = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            run.push(c);
        } else if !run.is_empty() {
            if let Ok(v) = run.parse() {
                values.push(v);
            }
            run.clear();
        }
    }
    if !run.is_empty() {
        if let Ok(v) = run.parse() {
            values.push(v);
        }
    }
    values
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

fn scratch_dir() -> PathBuf {
    let n = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("grade_scratch_{}_{}", std::process::id(), n))
}

// Children that run from a scratch directory still need to find the
// executable and trace paths the suite declared relative to the cwd.
fn absolutize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn trace_display(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Clone)]
pub struct PerfTest {
    pub name: String,
    pub rows: u64,
    pub cols: u64,
    pub bounds: CycleBounds,
    pub max_score: f64,
}

#[derive(Debug, Clone)]
pub struct CacheSimSuite {
    pub sim: TestCase,
    pub trans_program: PathBuf,
    pub correctness_sizes: Vec<(u64, u64)>,
    pub perf32: PerfTest,
    pub perf63: PerfTest,
}

impl CacheSimSuite {
    pub fn standard() -> Self {
        Self {
            sim: TestCase {
                name: "Csim correctness".to_string(),
                program: PathBuf::from("./test-csim"),
                args: vec![],
                schema: OutputSchema::StdoutMarker {
                    marker: "TEST_CSIM_RESULTS",
                    arity: 1,
                },
                echo_output: true,
                max_score: 60.0,
            },
            trans_program: PathBuf::from("./test-trans"),
            correctness_sizes: vec![
                (1, 1),
                (7, 2),
                (3, 15),
                (137, 1),
                (6, 60),
                (57, 57),
                (128, 128),
                (32, 32),
                (64, 64),
                (63, 65),
            ],
            perf32: PerfTest {
                name: "Trans perf 32x32".to_string(),
                rows: 32,
                cols: 32,
                bounds: CycleBounds {
                    lower: 36_000,
                    upper: 45_000,
                },
                max_score: 20.0,
            },
            perf63: PerfTest {
                name: "Trans perf 63x65".to_string(),
                rows: 63,
                cols: 65,
                bounds: CycleBounds {
                    lower: 280_000,
                    upper: 350_000,
                },
                max_score: 10.0,
            },
        }
    }

    fn trans_case(&self, name: &str, rows: u64, cols: u64) -> TestCase {
        TestCase {
            name: name.to_string(),
            program: self.trans_program.clone(),
            args: vec![
                "-s".to_string(),
                "-M".to_string(),
                rows.to_string(),
                "-N".to_string(),
                cols.to_string(),
            ],
            schema: OutputSchema::StdoutMarker {
                marker: "TEST_TRANS_RESULTS",
                arity: 2,
            },
            echo_output: false,
            max_score: 0.0,
        }
    }
}

pub fn run_cache_sim(suite: &CacheSimSuite) -> Report {
    let mut report = Report::default();

    println!("Part A: Testing cache simulator");
    println!("Running {}", suite.sim.command_line());
    let sim_record = run_test(&suite.sim);
    let sim_score = passthrough_score(&sim_record, suite.sim.max_score);
    report.push(ScoreResult::new(
        &suite.sim.name,
        sim_record,
        sim_score,
        suite.sim.max_score,
    ));

    println!("Part B: Testing transpose function correctness");
    let mut trans_ok = true;
    for &(rows, cols) in &suite.correctness_sizes {
        let case = suite.trans_case("trans correctness", rows, cols);
        println!("Running {}", case.command_line());
        let record = run_test(&case);
        match record.value(0) {
            Some(flag) if flag != 0 => {}
            _ => trans_ok = false,
        }
    }

    // The timed runs only count when every geometry transposed correctly.
    let mut cycles = Vec::with_capacity(2);
    if trans_ok {
        for perf in [&suite.perf32, &suite.perf63] {
            let case = suite.trans_case(&perf.name, perf.rows, perf.cols);
            println!("Running {}", case.command_line());
            let record = run_test(&case);
            let score = score_cycles(&record, 1, perf.bounds, perf.max_score);
            cycles.push(record.value(1));
            report.push(ScoreResult::new(&perf.name, record, score, perf.max_score));
        }
    } else {
        println!("Correctness checks failed.  No credit for part B");
        for perf in [&suite.perf32, &suite.perf63] {
            let record = MetricRecord::invalid("transpose correctness checks failed");
            cycles.push(None);
            report.push(ScoreResult::new(&perf.name, record, 0.0, perf.max_score));
        }
    }

    let c32 = cycles[0].unwrap_or(INVALID_CYCLES);
    let c63 = cycles[1].unwrap_or(INVALID_CYCLES);
    report.scoreboard = vec![c32 + c63, c32, c63];
    report
}

pub fn render_cache_sim_summary(report: &Report) -> String {
    let mut out = String::new();
    out.push_str("\nCache Lab summary:\n");
    out.push_str(&format!(
        "{:<22}{:>8}{:>10}{:>12}\n",
        "", "Points", "Max pts", "Cycles"
    ));
    for result in &report.results {
        let cycles = match &result.record {
            MetricRecord::Values(values) if values.len() >= 2 => values[1].to_string(),
            MetricRecord::Invalid { .. } => "invalid".to_string(),
            _ => String::new(),
        };
        out.push_str(&format!(
            "{:<22}{:>8.1}{:>10.0}{:>12}\n",
            result.name, result.score, result.max_score, cycles
        ));
    }
    out.push_str(&format!(
        "{:>22}{:>8.1}{:>10.0}\n",
        "Total points",
        report.total_score(),
        report.total_max()
    ));
    out
}

#[derive(Debug, Clone)]
pub struct TraceTest {
    pub trace: PathBuf,
    pub set_bits: u32,
    pub associativity: u32,
    pub block_bits: u32,
    pub max_ops: Option<usize>,
    pub expected: Vec<Option<u64>>,
    pub max_score: f64,
}

#[derive(Debug, Clone)]
pub struct CacheTraceSuite {
    pub simulator: PathBuf,
    pub tests: Vec<TraceTest>,
}

impl CacheTraceSuite {
    pub fn standard() -> Self {
        Self {
            simulator: PathBuf::from("./csim-ref"),
            tests: vec![
                TraceTest {
                    trace: PathBuf::from("./traces/tr1.trace"),
                    set_bits: 3,
                    associativity: 1,
                    block_bits: 4,
                    max_ops: Some(5),
                    expected: vec![Some(2), None, Some(1)],
                    max_score: 3.0,
                },
                TraceTest {
                    trace: PathBuf::from("./traces/tr2.trace"),
                    set_bits: 1,
                    associativity: 3,
                    block_bits: 4,
                    max_ops: Some(5),
                    expected: vec![Some(2), Some(2), None],
                    max_score: 3.0,
                },
                TraceTest {
                    trace: PathBuf::from("./traces/tr3.trace"),
                    set_bits: 2,
                    associativity: 3,
                    block_bits: 4,
                    max_ops: Some(10),
                    expected: vec![Some(5), Some(4), Some(1)],
                    max_score: 4.0,
                },
            ],
        }
    }

    fn replay_case(&self, test: &TraceTest, name: &str) -> TestCase {
        TestCase {
            name: name.to_string(),
            program: self.simulator.clone(),
            args: vec![
                "-s".to_string(),
                test.set_bits.to_string(),
                "-E".to_string(),
                test.associativity.to_string(),
                "-b".to_string(),
                test.block_bits.to_string(),
                "-t".to_string(),
                absolutize(&test.trace).display().to_string(),
            ],
            schema: OutputSchema::ResultFile {
                file_name: ".csim_results",
                arity: 3,
            },
            echo_output: false,
            max_score: test.max_score,
        }
    }
}

pub fn run_cache_traces(suite: &CacheTraceSuite) -> Report {
    let mut report = Report::default();
    for test in &suite.tests {
        let name = trace_display(&test.trace);
        let record = match validate_trace(&test.trace, test.max_ops) {
            Ok(()) => run_test(&suite.replay_case(test, &name)),
            Err(err) => {
                println!("{err}");
                warn!(trace = %name, reason = %err, "trace rejected");
                MetricRecord::invalid(err.to_string())
            }
        };
        let score = score_expected(&record, &test.expected, test.max_score);
        report.push(ScoreResult::new(name, record, score, test.max_score));
    }
    report
}

fn wildcard_cell(entry: &Option<u64>) -> String {
    match entry {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

pub fn render_cache_traces_summary(suite: &CacheTraceSuite, report: &Report) -> String {
    let mut out = String::new();
    for (test, result) in suite.tests.iter().zip(&report.results) {
        match &result.record {
            MetricRecord::Values(values) => {
                out.push_str(&format!("{} results:\n", result.name));
                out.push_str(&format!(
                    "Real values       - Hits: {} Misses: {} Evictions: {}\n",
                    values[0], values[1], values[2]
                ));
                out.push_str(&format!(
                    "Expected values   - Hits: {} Misses: {} Evictions: {}\n",
                    wildcard_cell(&test.expected[0]),
                    wildcard_cell(&test.expected[1]),
                    wildcard_cell(&test.expected[2])
                ));
            }
            MetricRecord::Invalid { reason } => {
                out.push_str(&format!("Error running {}: {reason}\n", result.name));
            }
            _ => {}
        }
        out.push_str(&format!(
            "{} points = {} / {}\n\n",
            result.name, result.score, result.max_score
        ));
    }
    out
}

#[derive(Debug, Clone)]
pub struct MallocBenchmark {
    pub trace: PathBuf,
    pub target: CoalesceCase,
    pub max_score: f64,
}

#[derive(Debug, Clone)]
pub struct MallocTraceSuite {
    pub initializer: PathBuf,
    pub benchmarks: Vec<MallocBenchmark>,
}

impl MallocTraceSuite {
    pub fn standard() -> Self {
        Self {
            initializer: PathBuf::from("./mm_initializer"),
            benchmarks: vec![
                MallocBenchmark {
                    trace: PathBuf::from("./traces/tr1.rep"),
                    target: CoalesceCase::NextFree,
                    max_score: 3.0,
                },
                MallocBenchmark {
                    trace: PathBuf::from("./traces/tr2.rep"),
                    target: CoalesceCase::PrevFree,
                    max_score: 3.0,
                },
                MallocBenchmark {
                    trace: PathBuf::from("./traces/tr3.rep"),
                    target: CoalesceCase::BothFree,
                    max_score: 4.0,
                },
            ],
        }
    }
}

fn run_malloc_benchmark(suite: &MallocTraceSuite, index: usize) -> ScoreResult {
    let bench = &suite.benchmarks[index];
    let case = TestCase {
        name: format!("Trace {}", index + 1),
        program: suite.initializer.clone(),
        args: vec!["-f".to_string(), bench.trace.display().to_string()],
        schema: OutputSchema::TagStream,
        echo_output: false,
        max_score: bench.max_score,
    };
    let record = run_test(&case);
    let score = score_coalesce(&record, bench.target, bench.max_score);
    ScoreResult::new(case.name, record, score, bench.max_score)
}

pub fn run_malloc_traces(suite: &MallocTraceSuite) -> Report {
    let mut report = Report::default();
    for index in 0..suite.benchmarks.len() {
        report.push(run_malloc_benchmark(suite, index));
    }
    report
}

// `number` is 1-based, matching the -t flag.
pub fn run_single_malloc_trace(suite: &MallocTraceSuite, number: usize) -> ScoreResult {
    run_malloc_benchmark(suite, number - 1)
}

const MALLOC_RULE_WIDTH: usize = 90;

fn expected_cell(index: usize, target: CoalesceCase) -> &'static str {
    if index == 0 {
        "-"
    } else if index == target.index() {
        "1+"
    } else {
        "0"
    }
}

fn render_malloc_trace_box(number: usize, tally: &CoalesceTally, target: CoalesceCase) -> String {
    let rule = "-".repeat(MALLOC_RULE_WIDTH);
    let labels = [
        "1: [Previous/Next both allocated]",
        "2: [Previous allocated, Next free]",
        "3: [Previous free, Next allocated]",
        "4: [Previous/Next both free]",
    ];
    let mut out = String::new();
    out.push_str(&format!("{rule}\nTrace {number}\n{rule}\n"));
    out.push_str(&format!("{:<50}{:>20}{:>20}\n", "Cases", "Actual", "Expected"));
    out.push_str(&format!("{rule}\n"));
    for (index, label) in labels.iter().enumerate() {
        out.push_str(&format!(
            "{:<50}{:>20}{:>20}\n",
            label,
            tally.cases[index],
            expected_cell(index, target)
        ));
    }
    out.push_str(&format!("{rule}\n"));
    out
}

fn render_malloc_result(number: usize, bench: &MallocBenchmark, result: &ScoreResult) -> String {
    match &result.record {
        MetricRecord::Coalesce(tally) => render_malloc_trace_box(number, tally, bench.target),
        _ => format!("Trace {number} is not well-formatted.\n"),
    }
}

pub fn render_malloc_traces_summary(suite: &MallocTraceSuite, report: &Report) -> String {
    let mut out = String::new();
    for (index, (bench, result)) in suite.benchmarks.iter().zip(&report.results).enumerate() {
        out.push_str(&render_malloc_result(index + 1, bench, result));
    }
    let roll_up = report
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("Trace {}: {:.1}/{:.1}", i + 1, r.score, r.max_score))
        .collect::<Vec<_>>()
        .join(", ");
    out.push_str(&roll_up);
    out.push('\n');
    out
}

pub fn render_single_malloc_trace(
    suite: &MallocTraceSuite,
    number: usize,
    result: &ScoreResult,
) -> String {
    let bench = &suite.benchmarks[number - 1];
    let mut out = render_malloc_result(number, bench, result);
    out.push_str(&format!(
        "Score for trace {}: {:.1}/{:.1}\n",
        number, result.score, result.max_score
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let n = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "grade_runner_test_{}_{}",
            std::process::id(),
            n
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[cfg(unix)]
    fn fake_binary(dir: &Path, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
        path
    }

    fn case(program: PathBuf, args: Vec<String>, schema: OutputSchema) -> TestCase {
        TestCase {
            name: "test".to_string(),
            program,
            args,
            schema,
            echo_output: false,
            max_score: 10.0,
        }
    }

    const TRANS_SCHEMA: OutputSchema = OutputSchema::StdoutMarker {
        marker: "TEST_TRANS_RESULTS",
        arity: 2,
    };

    #[test]
    fn integers_are_parsed_in_order() {
        assert_eq!(parse_integers("TEST_TRANS_RESULTS=1:40500"), vec![1, 40_500]);
        assert_eq!(parse_integers("TEST_CSIM_RESULTS: 3 4 5"), vec![3, 4, 5]);
        assert_eq!(parse_integers("no digits here"), Vec::<u64>::new());
    }

    #[test]
    fn tag_stream_parser_tallies_cases_and_counts() {
        let tally = parse_tag_stream("6\n1\n2\n2\nDone\n3\n").expect("tally");
        assert_eq!(
            tally,
            CoalesceTally {
                op_count: 6,
                alloc_count: 3,
                cases: [1, 2, 0, 0],
            }
        );
    }

    #[test]
    fn tag_stream_parser_ignores_unrelated_lines() {
        let tally = parse_tag_stream("6\nmalloc block at 0x10\n1\nDone\n4\n").expect("tally");
        assert_eq!(tally.cases, [1, 0, 0, 0]);
        assert_eq!(tally.op_count, 6);
        assert_eq!(tally.alloc_count, 4);
    }

    #[test]
    fn tag_stream_parser_rejects_structural_violations() {
        assert!(parse_tag_stream("").is_err());
        assert!(parse_tag_stream("ops\n1\nDone\n4\n").is_err());
        assert!(parse_tag_stream("6\n1\n2\n").is_err());
        // Done with no allocation count after it
        assert!(parse_tag_stream("6\n1\nDone\n").is_err());
    }

    #[test]
    fn command_lines_are_shell_quoted() {
        let parts = vec![
            "./test-trans".to_string(),
            "-M".to_string(),
            "32".to_string(),
        ];
        assert_eq!(shell_join(&parts), "./test-trans -M 32");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[cfg(unix)]
    #[test]
    fn marker_line_integers_are_extracted() {
        let dir = temp_dir();
        let program = fake_binary(
            &dir,
            "test-trans",
            "echo step one\necho TEST_TRANS_RESULTS=1:40500",
        );
        let record = run_test(&case(program, vec![], TRANS_SCHEMA));
        assert_eq!(record, MetricRecord::Values(vec![1, 40_500]));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn missing_marker_line_invalidates_the_record() {
        let dir = temp_dir();
        let program = fake_binary(&dir, "test-trans", "echo nothing to see");
        let record = run_test(&case(program, vec![], TRANS_SCHEMA));
        assert!(!record.is_valid());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_invalidates_the_record() {
        let dir = temp_dir();
        let program = fake_binary(&dir, "test-trans", "echo TEST_TRANS_RESULTS=1:40500\nexit 1");
        let record = run_test(&case(program, vec![], TRANS_SCHEMA));
        assert!(!record.is_valid());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn missing_binary_invalidates_the_record() {
        let dir = temp_dir();
        let record = run_test(&case(dir.join("no-such-binary"), vec![], TRANS_SCHEMA));
        assert!(!record.is_valid());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn result_file_is_read_from_the_scratch_directory() {
        let dir = temp_dir();
        let program = fake_binary(&dir, "csim-ref", "echo '2 3 1 0 0' > .csim_results");
        let record = run_test(&case(
            program,
            vec![],
            OutputSchema::ResultFile {
                file_name: ".csim_results",
                arity: 3,
            },
        ));
        assert_eq!(record, MetricRecord::Values(vec![2, 3, 1]));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn child_writing_no_result_file_invalidates_the_record() {
        let dir = temp_dir();
        let program = fake_binary(&dir, "csim-ref", "true");
        let record = run_test(&case(
            program,
            vec![],
            OutputSchema::ResultFile {
                file_name: ".csim_results",
                arity: 3,
            },
        ));
        assert!(!record.is_valid());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn tag_stream_child_is_tallied() {
        let dir = temp_dir();
        let program = fake_binary(&dir, "mm_initializer", "printf '6\\n1\\n2\\n2\\nDone\\n3\\n'");
        let record = run_test(&case(program, vec![], OutputSchema::TagStream));
        assert_eq!(
            record,
            MetricRecord::Coalesce(CoalesceTally {
                op_count: 6,
                alloc_count: 3,
                cases: [1, 2, 0, 0],
            })
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    fn two_trace_suite(dir: &Path) -> CacheTraceSuite {
        let sim = fake_binary(dir, "csim-ref", "echo '2 3 1 0 0' > .csim_results");
        let bad = dir.join("tr1.trace");
        fs::write(&bad, "L 1,1\nL 2,1\nL 3,1\nL 4,1\nL 5,1\nL 6,1\n").expect("write trace");
        let good = dir.join("tr2.trace");
        fs::write(&good, "L 10,4\nS 10,4\n").expect("write trace");
        CacheTraceSuite {
            simulator: sim,
            tests: vec![
                TraceTest {
                    trace: bad,
                    set_bits: 3,
                    associativity: 1,
                    block_bits: 4,
                    max_ops: Some(5),
                    expected: vec![Some(2), None, Some(1)],
                    max_score: 3.0,
                },
                TraceTest {
                    trace: good,
                    set_bits: 1,
                    associativity: 3,
                    block_bits: 4,
                    max_ops: Some(5),
                    expected: vec![Some(2), Some(3), None],
                    max_score: 3.0,
                },
            ],
        }
    }

    #[cfg(unix)]
    #[test]
    fn over_budget_trace_fails_in_isolation() {
        let dir = temp_dir();
        let suite = two_trace_suite(&dir);
        let report = run_cache_traces(&suite);

        assert!(!report.results[0].record.is_valid());
        assert_eq!(report.results[0].score, 0.0);
        assert_eq!(report.results[1].score, 3.0);
        assert_eq!(report.total_score(), 3.0);
        assert_eq!(report.total_max(), 6.0);

        let summary = render_cache_traces_summary(&suite, &report);
        assert!(summary.contains("Error running tr1.trace"));
        assert!(summary.contains("Real values       - Hits: 2 Misses: 3 Evictions: 1"));
        assert!(summary.contains("Expected values   - Hits: 2 Misses: 3 Evictions: -"));
        assert!(summary.contains("tr2.trace points = 3 / 3"));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    fn crashy_malloc_suite(dir: &Path) -> MallocTraceSuite {
        let script = "case \"$2\" in\n  *tr1.rep) exit 1 ;;\n  *) printf '6\\n3\\nDone\\n2\\n' ;;\nesac";
        let initializer = fake_binary(dir, "mm_initializer", script);
        MallocTraceSuite {
            initializer,
            benchmarks: vec![
                MallocBenchmark {
                    trace: dir.join("tr1.rep"),
                    target: CoalesceCase::NextFree,
                    max_score: 3.0,
                },
                MallocBenchmark {
                    trace: dir.join("tr2.rep"),
                    target: CoalesceCase::PrevFree,
                    max_score: 3.0,
                },
            ],
        }
    }

    #[cfg(unix)]
    #[test]
    fn failing_child_does_not_abort_later_benchmarks() {
        let dir = temp_dir();
        let suite = crashy_malloc_suite(&dir);
        let report = run_malloc_traces(&suite);

        assert!(!report.results[0].record.is_valid());
        assert_eq!(report.results[0].score, 0.0);
        assert_eq!(report.results[1].score, 3.0);
        assert_eq!(report.total_score(), 3.0);

        let summary = render_malloc_traces_summary(&suite, &report);
        assert!(summary.contains("Trace 1 is not well-formatted."));
        assert!(summary.contains("3: [Previous free, Next allocated]"));
        assert!(summary.contains("Trace 1: 0.0/3.0, Trace 2: 3.0/3.0"));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn rerunning_the_matrix_is_deterministic() {
        let dir = temp_dir();
        let suite = crashy_malloc_suite(&dir);
        let first = run_malloc_traces(&suite);
        let second = run_malloc_traces(&suite);

        assert_eq!(first.total_score(), second.total_score());
        assert_eq!(first.results.len(), second.results.len());
        for (a, b) in first.results.iter().zip(&second.results) {
            assert_eq!(a.record, b.record);
            assert_eq!(a.score, b.score);
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    fn sim_suite(dir: &Path, csim_line: &str, trans_line: &str) -> CacheSimSuite {
        let mut suite = CacheSimSuite::standard();
        suite.sim.program = fake_binary(dir, "test-csim", &format!("echo {csim_line}"));
        suite.trans_program = fake_binary(dir, "test-trans", &format!("echo {trans_line}"));
        suite.correctness_sizes = vec![(32, 32), (63, 65)];
        suite
    }

    #[cfg(unix)]
    #[test]
    fn cache_sim_matrix_scores_and_scoreboard() {
        let dir = temp_dir();
        let suite = sim_suite(&dir, "'TEST_CSIM_RESULTS: 60'", "TEST_TRANS_RESULTS=1:40500");
        let report = run_cache_sim(&suite);

        // 60 + 10.0 (midpoint of the 32x32 curve) + 10.0 (full credit at 63x65)
        assert_eq!(report.total_score(), 80.0);
        assert_eq!(report.total_max(), 90.0);
        assert_eq!(report.scoreboard, vec![81_000, 40_500, 40_500]);

        let payload = report.autoresult();
        assert_eq!(
            payload["scoreboard"],
            serde_json::json!([80.0, 81_000, 40_500, 40_500])
        );

        let summary = render_cache_sim_summary(&report);
        assert!(summary.contains("Cache Lab summary:"));
        assert!(summary.contains(&format!(
            "{:<22}{:>8.1}{:>10.0}{:>12}",
            "Trans perf 32x32", 10.0, 20.0, "40500"
        )));
        assert!(summary.contains("Total points"));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn failed_correctness_pre_pass_zeroes_perf_scores() {
        let dir = temp_dir();
        let suite = sim_suite(&dir, "'TEST_CSIM_RESULTS: 48'", "TEST_TRANS_RESULTS=0:0");
        let report = run_cache_sim(&suite);

        assert_eq!(report.total_score(), 48.0);
        assert!(!report.results[1].record.is_valid());
        assert!(!report.results[2].record.is_valid());
        assert_eq!(
            report.scoreboard,
            vec![INVALID_CYCLES * 2, INVALID_CYCLES, INVALID_CYCLES]
        );
        assert!(render_cache_sim_summary(&report).contains("invalid"));
        let _ = fs::remove_dir_all(dir);
    }
}
