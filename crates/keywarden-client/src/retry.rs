//! Failure-reporting policy for the long-running loops.
//!
//! Consecutive failures are reported verbatim only a handful of times, then
//! suppressed until the next success, keeping logs bounded during long
//! outages.

/// How many consecutive failures are reported before suppression kicks in.
pub const FAILURE_REPORT_LIMIT: usize = 5;

/// What a loop should do with the failure it just observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Log the failure verbatim.
    Report,
    /// Log one notice that further failures are suppressed.
    AnnounceSuppression,
    /// Stay quiet.
    Silent,
}

#[derive(Debug, Default)]
pub struct FailureLog {
    consecutive: usize,
}

impl FailureLog {
    pub fn new() -> Self {
        FailureLog::default()
    }

    /// Record a failure and decide how loudly to report it.
    pub fn failure(&mut self) -> FailureVerdict {
        let verdict = match self.consecutive {
            n if n < FAILURE_REPORT_LIMIT => FailureVerdict::Report,
            n if n == FAILURE_REPORT_LIMIT => FailureVerdict::AnnounceSuppression,
            _ => FailureVerdict::Silent,
        };
        self.consecutive += 1;
        verdict
    }

    /// Record a success. Returns true when the loop was failing before, so
    /// the caller can log the recovery.
    pub fn success(&mut self) -> bool {
        let recovered = self.consecutive > 0;
        self.consecutive = 0;
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failures_report_then_one_notice_then_silence() {
        let mut log = FailureLog::new();
        for _ in 0..FAILURE_REPORT_LIMIT {
            assert_eq!(log.failure(), FailureVerdict::Report);
        }
        assert_eq!(log.failure(), FailureVerdict::AnnounceSuppression);
        for _ in 0..20 {
            assert_eq!(log.failure(), FailureVerdict::Silent);
        }
    }

    #[test]
    fn success_resets_the_policy() {
        let mut log = FailureLog::new();
        assert!(!log.success());

        for _ in 0..10 {
            log.failure();
        }
        assert!(log.success());
        assert_eq!(log.failure(), FailureVerdict::Report);
    }
}
