//! Facilitator Core
//!
//! Identifiers, time windows, batch kinds and the failure taxonomy shared by
//! every facilitator crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a party: an ingestion server or one of the two data share processors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(pub String);

impl PartyId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the statistic being aggregated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregationId(pub String);

impl AggregationId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("interval end {end} is not after start {start}")]
    Empty { start: i64, end: i64 },
}

/// Half-open time interval `[start, end)` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn new(start: i64, end: i64) -> Result<Self, IntervalError> {
        if end <= start {
            return Err(IntervalError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// True when `other` lies entirely inside this interval.
    pub fn contains_interval(&self, other: &Interval) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// One unit of end-to-end processing: an aggregation over a time interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationWindow {
    pub aggregation_id: AggregationId,
    pub interval: Interval,
}

impl AggregationWindow {
    pub fn new(aggregation_id: AggregationId, interval: Interval) -> Self {
        Self {
            aggregation_id,
            interval,
        }
    }
}

impl fmt::Display for AggregationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.aggregation_id, self.interval)
    }
}

/// The three batch variants sharing one header/signature shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BatchKind {
    Ingestion = 0,
    Validation = 1,
    Sum = 2,
}

impl BatchKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ingestion),
            1 => Some(Self::Validation),
            2 => Some(Self::Sum),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Validation => "validation",
            Self::Sum => "sum",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the orchestrator reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network or object store hiccup: retry with backoff.
    Transient,
    /// Input or peer batch absent: re-poll later.
    NotReady,
    /// A conditional write found existing output: treat as success.
    AlreadyProcessed,
    /// Schema, digest or count mismatch: skip the batch, never retry as-is.
    Malformed,
    /// Bad signature or unknown signer: skip the batch, report as a security event.
    Authentication,
    /// A validation fragment without its counterpart: reject the packet.
    ProtocolMismatch,
    /// Misconfiguration or local I/O failure that retrying will not fix.
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Errors that the orchestrator needs to route by class.
pub trait Classify {
    fn class(&self) -> FailureClass;
}
