//! Line classification and checkpoint tracking.

use dbheal_common::Checkpoint;
use regex::Regex;

/// What a single log line means to the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// A block-boundary marker. `block` is `None` when the captured number
    /// does not fit a block number.
    Progress { block: Option<u64> },
    /// The line contains one of the failure tokens.
    Fatal { token: String },
    Ignored,
}

/// Classifies log lines as progress, fatal or ignored.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    progress: Regex,
    failure_tokens: Vec<String>,
}

impl LineClassifier {
    /// `progress` must have one capture group holding the block number.
    pub fn new(progress: Regex, failure_tokens: Vec<String>) -> Self {
        Self {
            progress,
            failure_tokens,
        }
    }

    pub fn classify(&self, line: &str) -> LineClass {
        if let Some(token) = self
            .failure_tokens
            .iter()
            .find(|t| !t.is_empty() && line.contains(t.as_str()))
        {
            return LineClass::Fatal {
                token: token.clone(),
            };
        }

        match self.progress.captures(line) {
            Some(caps) => LineClass::Progress {
                block: caps.get(1).and_then(|m| m.as_str().parse().ok()),
            },
            None => LineClass::Ignored,
        }
    }
}

/// Tracks the highest checkpoint boundary crossed by a sync run.
///
/// Only a progress line carrying exactly the next expected boundary moves
/// the tracker forward, one granularity step at a time. Other numbers in the
/// log never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointTracker {
    current: Checkpoint,
    granularity: u64,
}

impl CheckpointTracker {
    pub fn new(start: Checkpoint, granularity: u64) -> Self {
        Self {
            current: start,
            granularity: granularity.max(1),
        }
    }

    pub fn current(&self) -> Checkpoint {
        self.current
    }

    pub fn expected_next(&self) -> Checkpoint {
        self.current.next_boundary(self.granularity)
    }

    /// Record a progress marker. Returns true if it advanced the tracker.
    pub fn observe(&mut self, block: u64) -> bool {
        let next = self.expected_next();
        if block == next.block() {
            self.current = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PROGRESS_PATTERN;

    fn classifier() -> LineClassifier {
        LineClassifier::new(
            Regex::new(DEFAULT_PROGRESS_PATTERN).unwrap(),
            vec!["exit status".to_string(), "fail".to_string()],
        )
    }

    #[test]
    fn test_progress_line_carries_block() {
        assert_eq!(
            classifier().classify("INFO 12:00:01 Track: block 40, 1.2 tx/s"),
            LineClass::Progress { block: Some(40) }
        );
    }

    #[test]
    fn test_failure_tokens_win() {
        assert_eq!(
            classifier().classify("run failed: exit status 1"),
            LineClass::Fatal {
                token: "exit status".to_string()
            }
        );
        assert_eq!(
            classifier().classify("Track: block 40 validation fail"),
            LineClass::Fatal {
                token: "fail".to_string()
            }
        );
    }

    #[test]
    fn test_unrelated_lines_are_ignored() {
        assert_eq!(
            classifier().classify("processed 40 transactions"),
            LineClass::Ignored
        );
        assert_eq!(classifier().classify(""), LineClass::Ignored);
    }

    #[test]
    fn test_oversized_block_number_is_still_progress() {
        assert_eq!(
            classifier().classify("Track: block 999999999999999999999999"),
            LineClass::Progress { block: None }
        );
    }

    #[test]
    fn test_empty_failure_token_never_matches() {
        let c = LineClassifier::new(Regex::new(DEFAULT_PROGRESS_PATTERN).unwrap(), vec![String::new()]);
        assert_eq!(c.classify("anything"), LineClass::Ignored);
    }

    #[test]
    fn test_tracker_advances_one_step_per_boundary() {
        let mut t = CheckpointTracker::new(Checkpoint::ZERO, 10);
        assert_eq!(t.expected_next(), Checkpoint::new(10));
        assert!(t.observe(10));
        assert!(t.observe(20));
        assert!(t.observe(30));
        assert_eq!(t.current(), Checkpoint::new(30));
    }

    #[test]
    fn test_tracker_ignores_non_boundary_numbers() {
        let mut t = CheckpointTracker::new(Checkpoint::new(40), 10);
        assert!(!t.observe(41));
        assert!(!t.observe(40));
        assert!(!t.observe(60));
        assert_eq!(t.current(), Checkpoint::new(40));
        assert!(t.observe(50));
        assert_eq!(t.current(), Checkpoint::new(50));
    }

    #[test]
    fn test_tracker_aligns_unaligned_start() {
        let mut t = CheckpointTracker::new(Checkpoint::new(5), 10);
        assert_eq!(t.expected_next(), Checkpoint::new(10));
        assert!(t.observe(10));
        assert_eq!(t.current(), Checkpoint::new(10));
    }
}
