use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use thiserror::Error;

// Cycle sentinel the grading platform expects for failed perf runs; used
// only at the payload boundary, absent cycles are None internally.
pub const INVALID_CYCLES: u64 = (1 << 31) - 1;

#[derive(Debug, Clone)]
pub enum OutputSchema {
    StdoutMarker { marker: &'static str, arity: usize },
    ResultFile { file_name: &'static str, arity: usize },
    TagStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoalesceTally {
    pub op_count: u64,
    pub alloc_count: u64,
    // case index 0 = both neighbors allocated, 1 = next free,
    // 2 = previous free, 3 = both free
    pub cases: [u64; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricRecord {
    Values(Vec<u64>),
    Coalesce(CoalesceTally),
    Invalid { reason: String },
}

impl MetricRecord {
    pub fn invalid(reason: impl Into<String>) -> Self {
        MetricRecord::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, MetricRecord::Invalid { .. })
    }

    pub fn value(&self, index: usize) -> Option<u64> {
        match self {
            MetricRecord::Values(values) => values.get(index).copied(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Could not find {0}")]
    Missing(String),

    #[error("{0} is not a well written trace.")]
    Empty(String),

    #[error("{trace} contains too many instructions, use a maximum of {max} for this trace")]
    TooManyOps {
        trace: String,
        count: usize,
        max: usize,
    },

    #[error("\"{line}\" is not a well written instruction. (line {line_no})")]
    BadInstruction { line_no: usize, line: String },

    #[error("failed to read {trace}: {source}")]
    Io {
        trace: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn validate_trace(path: &Path, max_ops: Option<usize>) -> Result<(), TraceError> {
    let name = path.display().to_string();
    if !path.exists() {
        return Err(TraceError::Missing(name));
    }
    let data = fs::read_to_string(path).map_err(|source| TraceError::Io {
        trace: name.clone(),
        source,
    })?;
    if data.is_empty() {
        return Err(TraceError::Empty(name));
    }

    // One trailing newline is tolerated; everything else must be instructions.
    let body = data.strip_suffix('\n').unwrap_or(&data);
    let lines: Vec<&str> = body
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();

    if let Some(max) = max_ops {
        let count = lines
            .iter()
            .filter(|line| matches!(line.bytes().next(), Some(b'L') | Some(b'S')))
            .count();
        if count > max {
            return Err(TraceError::TooManyOps {
                trace: name,
                count,
                max,
            });
        }
    }

    for (idx, line) in lines.iter().enumerate() {
        if !instruction_ok(line) {
            return Err(TraceError::BadInstruction {
                line_no: idx + 1,
                line: (*line).to_string(),
            });
        }
    }
    Ok(())
}

fn instruction_ok(line: &str) -> bool {
    let rest = match line.strip_prefix("L ").or_else(|| line.strip_prefix("S ")) {
        Some(rest) => rest,
        None => return false,
    };
    let (addr, len) = match rest.split_once(',') {
        Some(parts) => parts,
        None => return false,
    };
    !addr.is_empty()
        && addr.chars().all(|c| c.is_ascii_alphanumeric())
        && !len.is_empty()
        && len.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, Copy)]
pub struct CycleBounds {
    pub lower: u64,
    pub upper: u64,
}

pub fn miss_score(cycles: u64, lower: u64, upper: u64, full: f64) -> f64 {
    if cycles <= lower {
        return full;
    }
    if cycles >= upper {
        return 0.0;
    }
    let over = (cycles - lower) as f64;
    let span = (upper - lower) as f64;
    round1((1.0 - over / span) * full)
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub fn score_cycles(record: &MetricRecord, index: usize, bounds: CycleBounds, full: f64) -> f64 {
    match record.value(index) {
        Some(cycles) => miss_score(cycles, bounds.lower, bounds.upper, full),
        None => 0.0,
    }
}

pub fn matches_expected(actual: &[u64], expected: &[Option<u64>]) -> bool {
    actual.len() == expected.len()
        && actual.iter().zip(expected).all(|(a, e)| match e {
            Some(want) => a == want,
            None => true,
        })
}

pub fn score_expected(record: &MetricRecord, expected: &[Option<u64>], points: f64) -> f64 {
    match record {
        MetricRecord::Values(actual) if matches_expected(actual, expected) => points,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoalesceCase {
    NextFree,
    PrevFree,
    BothFree,
}

impl CoalesceCase {
    pub fn index(self) -> usize {
        match self {
            CoalesceCase::NextFree => 1,
            CoalesceCase::PrevFree => 2,
            CoalesceCase::BothFree => 3,
        }
    }

    pub fn competitors(self) -> [usize; 2] {
        match self {
            CoalesceCase::NextFree => [2, 3],
            CoalesceCase::PrevFree => [1, 3],
            CoalesceCase::BothFree => [1, 2],
        }
    }
}

pub fn score_coalesce(record: &MetricRecord, target: CoalesceCase, points: f64) -> f64 {
    let tally = match record {
        MetricRecord::Coalesce(tally) => tally,
        _ => return 0.0,
    };
    // Case 0 (neither neighbor free) is background and may fire freely.
    let [a, b] = target.competitors();
    if tally.cases[target.index()] >= 1 && tally.cases[a] == 0 && tally.cases[b] == 0 {
        points
    } else {
        0.0
    }
}

pub fn passthrough_score(record: &MetricRecord, max: f64) -> f64 {
    match record.value(0) {
        Some(points) => (points as f64).clamp(0.0, max),
        None => 0.0,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreResult {
    pub name: String,
    pub record: MetricRecord,
    pub score: f64,
    pub max_score: f64,
}

impl ScoreResult {
    pub fn new(name: impl Into<String>, record: MetricRecord, score: f64, max_score: f64) -> Self {
        Self {
            name: name.into(),
            record,
            score: score.clamp(0.0, max_score),
            max_score,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub results: Vec<ScoreResult>,
    pub scoreboard: Vec<u64>,
}

impl Report {
    pub fn push(&mut self, result: ScoreResult) {
        self.results.push(result);
    }

    pub fn total_score(&self) -> f64 {
        round1(self.results.iter().map(|r| r.score).sum())
    }

    pub fn total_max(&self) -> f64 {
        self.results.iter().map(|r| r.max_score).sum()
    }

    pub fn autoresult(&self) -> Value {
        let total = self.total_score();
        if self.scoreboard.is_empty() {
            json!({ "scores": { "Autograded": total } })
        } else {
            let mut board = Vec::with_capacity(self.scoreboard.len() + 1);
            board.push(json!(total));
            board.extend(self.scoreboard.iter().map(|v| json!(v)));
            json!({ "scores": { "Autograded": total }, "scoreboard": board })
        }
    }
}
