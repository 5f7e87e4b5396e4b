use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Changed lines of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub lines: BTreeSet<u32>,
}

/// The fixed set of changed lines under evaluation for a session.
///
/// Built once at session start; the denominator of every coverage ratio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    files: Vec<FileChange>,
}

impl ChangeSet {
    /// Build from (path, lines) pairs. Paths are normalised, repeated paths
    /// are merged, files without lines are dropped; first-seen order is kept.
    pub fn new(entries: impl IntoIterator<Item = (String, BTreeSet<u32>)>) -> Self {
        let mut files: Vec<FileChange> = Vec::new();
        for (path, lines) in entries {
            if lines.is_empty() {
                continue;
            }
            let path = normalize_path(&path);
            match files.iter_mut().find(|f| f.path == path) {
                Some(existing) => existing.lines.extend(lines),
                None => files.push(FileChange { path, lines }),
            }
        }
        Self { files }
    }

    pub fn files(&self) -> &[FileChange] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_lines(&self) -> usize {
        self.files.iter().map(|f| f.lines.len()).sum()
    }

    pub fn lines_for(&self, path: &str) -> Option<&BTreeSet<u32>> {
        let path = normalize_path(path);
        self.files.iter().find(|f| f.path == path).map(|f| &f.lines)
    }

    /// Keep only files whose name ends with one of `extensions`.
    /// An empty list keeps everything.
    pub fn retain_extensions(self, extensions: &[String]) -> Self {
        if extensions.is_empty() {
            return self;
        }
        let files = self
            .files
            .into_iter()
            .filter(|f| extensions.iter().any(|ext| f.path.ends_with(ext.as_str())))
            .collect();
        Self { files }
    }
}

/// Format of the coverage file written by the test command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageFormat {
    Lcov,
    Json,
}

impl FromStr for CoverageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lcov" => Ok(CoverageFormat::Lcov),
            "json" => Ok(CoverageFormat::Json),
            other => Err(Error::ConfigValidation(format!(
                "unknown coverage format: {other} (expected: lcov, json)"
            ))),
        }
    }
}

impl fmt::Display for CoverageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageFormat::Lcov => write!(f, "lcov"),
            CoverageFormat::Json => write!(f, "json"),
        }
    }
}

/// Line hit counts as reported by the coverage tool, for any set of files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCoverage {
    files: BTreeMap<String, BTreeMap<u32, u64>>,
}

impl RawCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: &str, line: u32, hits: u64) {
        *self
            .files
            .entry(normalize_path(path))
            .or_default()
            .entry(line)
            .or_insert(0) += hits;
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn parse(format: CoverageFormat, content: &str) -> Result<Self> {
        match format {
            CoverageFormat::Lcov => parse_lcov(content),
            CoverageFormat::Json => parse_json(content),
        }
    }

    /// Hits for the file best matching `path`, if any.
    ///
    /// Exact matches win; otherwise the shortest raw path that ends with
    /// `path` on a component boundary (or the reverse) is used.
    fn lines_for(&self, path: &str) -> Option<&BTreeMap<u32, u64>> {
        if let Some(lines) = self.files.get(path) {
            return Some(lines);
        }
        self.files
            .iter()
            .filter(|(raw, _)| suffix_match(raw, path) || suffix_match(path, raw))
            .min_by_key(|(raw, _)| raw.split('/').count())
            .map(|(_, lines)| lines)
    }
}

/// Parse LCOV tracefile records (`SF:`, `DA:`, `end_of_record`).
pub fn parse_lcov(content: &str) -> Result<RawCoverage> {
    let mut raw = RawCoverage::new();
    let mut current: Option<String> = None;

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if let Some(path) = line.strip_prefix("SF:") {
            current = Some(path.to_string());
        } else if let Some(data) = line.strip_prefix("DA:") {
            let Some(ref file) = current else {
                return Err(Error::Coverage(format!(
                    "lcov line {}: DA record outside of a file record",
                    idx + 1
                )));
            };
            let mut parts = data.split(',');
            let line_no = parts.next().and_then(|n| n.trim().parse::<u32>().ok());
            let hits = parts.next().and_then(|n| n.trim().parse::<u64>().ok());
            match (line_no, hits) {
                (Some(line_no), Some(hits)) => raw.record(file, line_no, hits),
                _ => {
                    return Err(Error::Coverage(format!(
                        "lcov line {}: malformed DA record: {data}",
                        idx + 1
                    )));
                }
            }
        } else if line == "end_of_record" {
            current = None;
        }
    }

    Ok(raw)
}

/// Parse `{"path": {"line": hits}}`.
pub fn parse_json(content: &str) -> Result<RawCoverage> {
    let parsed: BTreeMap<String, BTreeMap<String, u64>> = serde_json::from_str(content)
        .map_err(|e| Error::Coverage(format!("failed to parse coverage JSON: {e}")))?;

    let mut raw = RawCoverage::new();
    for (path, lines) in parsed {
        for (line, hits) in lines {
            let line_no = line.parse::<u32>().map_err(|_| {
                Error::Coverage(format!("invalid line number {line:?} for {path}"))
            })?;
            raw.record(&path, line_no, hits);
        }
    }
    Ok(raw)
}

/// Covered / not covered, for every changed line and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    files: BTreeMap<String, BTreeMap<u32, bool>>,
}

impl CoverageReport {
    pub fn files(&self) -> &BTreeMap<String, BTreeMap<u32, bool>> {
        &self.files
    }

    pub fn total_lines(&self) -> usize {
        self.files.values().map(|lines| lines.len()).sum()
    }

    pub fn covered_lines(&self) -> usize {
        self.files
            .values()
            .flat_map(|lines| lines.values())
            .filter(|covered| **covered)
            .count()
    }

    /// Covered changed lines / total changed lines. An empty change counts as
    /// fully covered.
    pub fn coverage_ratio(&self) -> f64 {
        let total = self.total_lines();
        if total == 0 {
            return 1.0;
        }
        self.covered_lines() as f64 / total as f64
    }

    pub fn is_line_covered(&self, path: &str, line: u32) -> bool {
        self.files
            .get(&normalize_path(path))
            .and_then(|lines| lines.get(&line))
            .copied()
            .unwrap_or(false)
    }

    /// Uncovered changed lines grouped into runs of consecutive line numbers.
    pub fn uncovered_regions(&self) -> Vec<UncoveredRegion> {
        let mut regions = Vec::new();
        for (path, lines) in &self.files {
            let mut run: Vec<u32> = Vec::new();
            for (&line, &covered) in lines {
                if covered {
                    continue;
                }
                if let Some(&last) = run.last()
                    && line != last + 1
                {
                    regions.push(UncoveredRegion::new(path, std::mem::take(&mut run)));
                }
                run.push(line);
            }
            if !run.is_empty() {
                regions.push(UncoveredRegion::new(path, run));
            }
        }
        regions
    }
}

/// A run of consecutive uncovered changed lines in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncoveredRegion {
    pub file: String,
    pub lines: Vec<u32>,
}

impl UncoveredRegion {
    fn new(file: &str, lines: Vec<u32>) -> Self {
        Self {
            file: file.to_string(),
            lines,
        }
    }

    pub fn first_line(&self) -> u32 {
        self.lines.first().copied().unwrap_or(0)
    }

    pub fn last_line(&self) -> u32 {
        self.lines.last().copied().unwrap_or(0)
    }
}

/// Restrict raw coverage to the change set. Lines without a raw record are
/// reported as not covered; files outside the change are ignored.
pub fn analyze(change_set: &ChangeSet, raw: &RawCoverage) -> CoverageReport {
    let mut files = BTreeMap::new();
    for change in change_set.files() {
        let hits = raw.lines_for(&change.path);
        let lines = change
            .lines
            .iter()
            .map(|&line| {
                let covered = hits
                    .and_then(|h| h.get(&line))
                    .is_some_and(|&count| count > 0);
                (line, covered)
            })
            .collect();
        files.insert(change.path.clone(), lines);
    }
    CoverageReport { files }
}

/// Forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

fn suffix_match(longer: &str, shorter: &str) -> bool {
    longer.len() > shorter.len()
        && longer.ends_with(shorter)
        && longer.as_bytes()[longer.len() - shorter.len() - 1] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[u32]) -> BTreeSet<u32> {
        items.iter().copied().collect()
    }

    fn sample_change_set() -> ChangeSet {
        ChangeSet::new([
            ("src/parser.rs".to_string(), lines(&[10, 11, 12, 20])),
            ("src/lib.rs".to_string(), lines(&[3])),
        ])
    }

    #[test]
    fn test_change_set_merges_and_normalizes() {
        let cs = ChangeSet::new([
            ("./src/a.rs".to_string(), lines(&[1, 2])),
            ("src\\a.rs".to_string(), lines(&[2, 3])),
            ("src/empty.rs".to_string(), BTreeSet::new()),
        ]);
        assert_eq!(cs.files().len(), 1);
        assert_eq!(cs.files()[0].path, "src/a.rs");
        assert_eq!(cs.total_lines(), 3);
        assert!(cs.lines_for("./src/a.rs").is_some());
    }

    #[test]
    fn test_retain_extensions() {
        let cs = ChangeSet::new([
            ("src/a.rs".to_string(), lines(&[1])),
            ("README.md".to_string(), lines(&[1])),
        ]);
        let filtered = cs.clone().retain_extensions(&[".rs".to_string()]);
        assert_eq!(filtered.files().len(), 1);
        assert_eq!(cs.retain_extensions(&[]).files().len(), 2);
    }

    #[test]
    fn test_parse_lcov() {
        let lcov = "TN:\nSF:/tmp/sb/src/parser.rs\nDA:10,3\nDA:11,0\nDA:12,1,abc123\nend_of_record\nSF:/tmp/sb/src/other.rs\nDA:1,5\nend_of_record\n";
        let raw = parse_lcov(lcov).unwrap();
        let hits = raw.lines_for("src/parser.rs").unwrap();
        assert_eq!(hits.get(&10), Some(&3));
        assert_eq!(hits.get(&11), Some(&0));
        assert_eq!(hits.get(&12), Some(&1));
    }

    #[test]
    fn test_parse_lcov_repeated_records_sum() {
        let lcov = "SF:src/a.rs\nDA:1,0\nend_of_record\nSF:src/a.rs\nDA:1,2\nend_of_record\n";
        let raw = parse_lcov(lcov).unwrap();
        assert_eq!(raw.lines_for("src/a.rs").unwrap().get(&1), Some(&2));
    }

    #[test]
    fn test_parse_lcov_malformed() {
        assert!(parse_lcov("DA:1,1\n").is_err());
        assert!(parse_lcov("SF:a.rs\nDA:x,1\n").is_err());
    }

    #[test]
    fn test_parse_json() {
        let raw = parse_json(r#"{"src/lib.rs": {"3": 1, "4": 0}}"#).unwrap();
        assert_eq!(raw.lines_for("src/lib.rs").unwrap().get(&3), Some(&1));
        assert!(parse_json(r#"{"src/lib.rs": {"three": 1}}"#).is_err());
        assert!(parse_json("not json").is_err());
    }

    #[test]
    fn test_analyze_defaults_unknown_to_uncovered() {
        let cs = sample_change_set();
        let mut raw = RawCoverage::new();
        raw.record("src/parser.rs", 10, 4);
        raw.record("src/parser.rs", 11, 0);
        // line 12 and 20 have no record; src/lib.rs has no record at all

        let report = analyze(&cs, &raw);
        assert_eq!(report.total_lines(), 5);
        assert_eq!(report.covered_lines(), 1);
        assert!(report.is_line_covered("src/parser.rs", 10));
        assert!(!report.is_line_covered("src/parser.rs", 12));
        assert!(!report.is_line_covered("src/lib.rs", 3));
    }

    #[test]
    fn test_analyze_ignores_files_outside_change() {
        let cs = sample_change_set();
        let mut raw = RawCoverage::new();
        raw.record("src/unrelated.rs", 1, 9);
        raw.record("src/lib.rs", 3, 1);
        raw.record("src/lib.rs", 99, 1);

        let report = analyze(&cs, &raw);
        assert_eq!(report.files().len(), 2);
        assert!(!report.files().contains_key("src/unrelated.rs"));
        assert_eq!(report.files()["src/lib.rs"].len(), 1);
    }

    #[test]
    fn test_analyze_matches_absolute_paths_by_suffix() {
        let cs = ChangeSet::new([("src/lib.rs".to_string(), lines(&[1]))]);
        let mut raw = RawCoverage::new();
        raw.record("/work/sandbox/crates/extra/src/lib.rs", 1, 0);
        raw.record("/work/sandbox/src/lib.rs", 1, 7);

        let report = analyze(&cs, &raw);
        assert!(report.is_line_covered("src/lib.rs", 1));
    }

    #[test]
    fn test_suffix_match_respects_component_boundary() {
        assert!(suffix_match("/x/src/lib.rs", "src/lib.rs"));
        assert!(!suffix_match("/x/mysrc/lib.rs", "src/lib.rs"));
        assert!(!suffix_match("src/lib.rs", "src/lib.rs"));
    }

    #[test]
    fn test_ratio_bounds() {
        let cs = sample_change_set();
        let empty = analyze(&cs, &RawCoverage::new());
        assert_eq!(empty.coverage_ratio(), 0.0);

        let mut raw = RawCoverage::new();
        for line in [10, 11, 12, 20] {
            raw.record("src/parser.rs", line, 1);
        }
        raw.record("src/lib.rs", 3, 1);
        let full = analyze(&cs, &raw);
        assert_eq!(full.coverage_ratio(), 1.0);
        assert!(full.uncovered_regions().is_empty());

        let nothing = analyze(&ChangeSet::default(), &raw);
        assert_eq!(nothing.coverage_ratio(), 1.0);
    }

    #[test]
    fn test_ratio_is_one_only_when_every_line_covered() {
        let cs = sample_change_set();
        let mut raw = RawCoverage::new();
        for line in [10, 11, 12, 20] {
            raw.record("src/parser.rs", line, 1);
        }
        let report = analyze(&cs, &raw);
        assert!(report.coverage_ratio() < 1.0);
        assert!((report.coverage_ratio() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_reanalysis_is_idempotent() {
        let cs = sample_change_set();
        let raw = parse_lcov("SF:src/parser.rs\nDA:10,1\nDA:20,0\nend_of_record\n").unwrap();
        assert_eq!(analyze(&cs, &raw), analyze(&cs, &raw));
    }

    #[test]
    fn test_uncovered_regions_group_consecutive_lines() {
        let cs = sample_change_set();
        let mut raw = RawCoverage::new();
        raw.record("src/parser.rs", 11, 1);

        let regions = analyze(&cs, &raw).uncovered_regions();
        assert_eq!(
            regions,
            vec![
                UncoveredRegion::new("src/lib.rs", vec![3]),
                UncoveredRegion::new("src/parser.rs", vec![10]),
                UncoveredRegion::new("src/parser.rs", vec![12]),
                UncoveredRegion::new("src/parser.rs", vec![20]),
            ]
        );

        let regions = analyze(&cs, &RawCoverage::new()).uncovered_regions();
        let parser: Vec<_> = regions.iter().filter(|r| r.file == "src/parser.rs").collect();
        assert_eq!(parser.len(), 2);
        assert_eq!(parser[0].lines, vec![10, 11, 12]);
        assert_eq!(parser[0].first_line(), 10);
        assert_eq!(parser[0].last_line(), 12);
    }

    #[test]
    fn test_report_serde_roundtrip_keeps_line_keys() {
        let report = analyze(&sample_change_set(), &RawCoverage::new());
        let json = serde_json::to_string(&report).unwrap();
        let back: CoverageReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
