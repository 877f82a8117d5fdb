//! What a window run produced.

use std::fmt;

use facilitator_core::AggregationWindow;
use facilitator_storage::BatchKey;
use serde::Serialize;

/// Why an ingestion batch was left out of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The ingestion batch failed structural checks.
    Malformed,
    /// The ingestion batch signature did not verify.
    Unauthenticated,
    /// The peer's validation batch failed structural checks.
    PeerMalformed,
    /// The peer's validation batch signature did not verify.
    PeerUnauthenticated,
    /// Storage kept failing after retries.
    StorageUnavailable,
    /// Processing failed for another reason.
    Failed,
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Unauthenticated => "unauthenticated",
            Self::PeerMalformed => "peer_malformed",
            Self::PeerUnauthenticated => "peer_unauthenticated",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Failed => "failed",
        }
    }

    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::Unauthenticated | Self::PeerUnauthenticated)
    }

    /// The batch may succeed on a later run, so the window cannot be summed yet.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable | Self::Failed)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBatch {
    pub key: BatchKey,
    pub reason: SkipReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowStatus {
    /// The sum batch was written by this run.
    Completed,
    /// A sum batch already existed; nothing was written.
    AlreadyProcessed,
    /// Some batches are not finished: a peer validation batch never arrived,
    /// a batch failed and will be retried, or a partly written sum batch is in
    /// the way. No sum was written.
    Incomplete { waiting_on: Vec<BatchKey> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    pub window: AggregationWindow,
    pub status: WindowStatus,
    pub valid_packets: u64,
    pub invalid_packets: u64,
    pub skipped: Vec<SkippedBatch>,
    pub sum_key: Option<BatchKey>,
}

impl WindowOutcome {
    pub fn already_processed(window: AggregationWindow, sum_key: BatchKey) -> Self {
        Self {
            window,
            status: WindowStatus::AlreadyProcessed,
            valid_packets: 0,
            invalid_packets: 0,
            skipped: Vec::new(),
            sum_key: Some(sum_key),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.status,
            WindowStatus::Completed | WindowStatus::AlreadyProcessed
        )
    }
}

/// A window whose run ended in an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowFailure {
    pub window: AggregationWindow,
    pub error: String,
}

/// Totals across a set of windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<WindowOutcome>,
    pub failures: Vec<WindowFailure>,
}

impl RunReport {
    pub fn windows_processed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_complete()).count()
    }

    pub fn valid_packets(&self) -> u64 {
        self.outcomes.iter().map(|o| o.valid_packets).sum()
    }

    pub fn invalid_packets(&self) -> u64 {
        self.outcomes.iter().map(|o| o.invalid_packets).sum()
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SkippedBatch> {
        self.outcomes.iter().flat_map(|o| o.skipped.iter())
    }
}
