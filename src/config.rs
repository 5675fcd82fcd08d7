//! Control-file parsing: `key = value` lines, `#` comments, blank lines
//! ignored, unknown keys warned about and otherwise ignored.

use crate::error::GrandConvError;
use std::path::{Path, PathBuf};

/// Parsed run configuration, before any CLI-flag overrides are applied.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub use_gpu: bool,
    pub nthreads: usize,
    /// Substitution-matrix dimension implied by `seqtype`.
    pub n: usize,
    pub selected_pairs: Vec<(i64, i64)>,
    pub dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            use_gpu: false,
            nthreads: 1,
            n: 20,
            selected_pairs: Vec::new(),
            dir: PathBuf::from("."),
        }
    }
}

/// Parses a control file at `path` into a [`RunConfig`], starting from
/// [`RunConfig::default`] and overwriting fields named by recognized
/// keys. Unrecognized keys are logged at `warn` and otherwise ignored,
/// rather than rejected, matching the tolerant convention of the
/// control-file format this parser is modeled on.
pub fn parse_control_file(path: &Path) -> Result<RunConfig, GrandConvError> {
    let text = std::fs::read_to_string(path)?;
    parse_control_file_str(&text)
}

fn parse_control_file_str(text: &str) -> Result<RunConfig, GrandConvError> {
    let mut config = RunConfig::default();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(GrandConvError::InvalidInput {
                detail: format!("control file line {}: missing '=': {raw_line:?}", lineno + 1),
            });
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "useGPU" => {
                config.use_gpu = parse_bool(value).ok_or_else(|| GrandConvError::InvalidInput {
                    detail: format!("control file line {}: useGPU must be 0/1/true/false, got {value:?}", lineno + 1),
                })?;
            }
            "nthreads" => {
                config.nthreads = value.parse().map_err(|_| GrandConvError::InvalidInput {
                    detail: format!("control file line {}: nthreads must be a positive integer, got {value:?}", lineno + 1),
                })?;
            }
            "seqtype" => {
                config.n = seqtype_to_n(value).ok_or_else(|| GrandConvError::InvalidInput {
                    detail: format!(
                        "control file line {}: unrecognized seqtype {value:?} (expected nucleotide, amino-acid, or codon)",
                        lineno + 1
                    ),
                })?;
            }
            "branch-pairs" => {
                config.selected_pairs = parse_branch_pairs(value).ok_or_else(|| GrandConvError::InvalidInput {
                    detail: format!(
                        "control file line {}: malformed branch-pairs list {value:?} (expected \"(u,v),(u,v),...\")",
                        lineno + 1
                    ),
                })?;
            }
            "dir" => {
                config.dir = PathBuf::from(value);
            }
            other => {
                tracing::warn!(key = other, line = lineno + 1, "ignoring unrecognized control-file key");
            }
        }
    }
    Ok(config)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "0" | "false" | "no" => Some(false),
        "1" | "true" | "yes" => Some(true),
        _ => None,
    }
}

fn seqtype_to_n(value: &str) -> Option<usize> {
    match value {
        "nucleotide" | "nuc" => Some(4),
        "amino-acid" | "aa" => Some(20),
        "codon" => Some(61),
        _ => None,
    }
}

/// Parses the `"(u,v),(u,v),..."` branch-pairs value from the external
/// contract. Whitespace between tokens is tolerated; an empty value is
/// an empty list.
fn parse_branch_pairs(value: &str) -> Option<Vec<(i64, i64)>> {
    let value = value.trim();
    if value.is_empty() {
        return Some(Vec::new());
    }
    let mut pairs = Vec::new();
    for tuple in value.split(')') {
        let tuple = tuple.trim().trim_start_matches(',').trim();
        if tuple.is_empty() {
            continue;
        }
        let inner = tuple.strip_prefix('(')?;
        let (u, v) = inner.split_once(',')?;
        let u: i64 = u.trim().parse().ok()?;
        let v: i64 = v.trim().parse().ok()?;
        pairs.push((u, v));
    }
    Some(pairs)
}
