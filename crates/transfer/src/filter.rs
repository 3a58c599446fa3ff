//! Include/exclude glob filtering of project paths.

use glob::{MatchOptions, Pattern};

use crate::TransferError;

/// Shell-glob semantics on POSIX-style relative paths: `*` and `?` may
/// cross `/`, and `**` spans any number of segments.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compiled include/exclude rules.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, TransferError> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// True if `rel_path` matches at least one include pattern and no
    /// exclude pattern. Exclusion is only consulted for included paths.
    pub fn matches(&self, rel_path: &str) -> bool {
        let included = self
            .include
            .iter()
            .any(|p| p.matches_with(rel_path, MATCH_OPTIONS));
        included
            && !self
                .exclude
                .iter()
                .any(|p| p.matches_with(rel_path, MATCH_OPTIONS))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, TransferError> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(TransferError::from))
        .collect()
}
