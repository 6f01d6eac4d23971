// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Executor Error System
//!
//! Every layer of an executor stack reports failures through [`ExecutorError`].
//! The type is [`Clone`] so that a single failed operation (a shared construction,
//! a single-flight resolution) can be handed to every waiter unchanged.
//!
//! Errors fall into a small set of categories which callers inspect to decide what
//! to do next, rather than the error deciding for them:
//!
//! - caller input problems ([`ExecutorError::InvalidCardinality`],
//!   [`ExecutorError::InvalidArgument`]) are never retried;
//! - [`ExecutorError::ExecutorConstruction`] is transient: the next request for the
//!   same cardinality builds again;
//! - [`ExecutorError::ParticipantUnavailable`] and [`ExecutorError::RangeFailed`]
//!   carry the participant range that failed so that reconstruction can be targeted;
//! - [`ExecutorError::CapacityExceeded`] is fatal to the request.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::value::Value;

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;

/// Contiguous, half-open range of participant indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantRange {
    pub start: usize,
    pub end: usize,
}

impl ParticipantRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Range covering exactly one participant.
    pub fn single(index: usize) -> Self {
        Self::new(index, index + 1)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index < self.end
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl From<Range<usize>> for ParticipantRange {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

impl fmt::Display for ParticipantRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error("invalid cardinality: {0}")]
    InvalidCardinality(String),

    #[error("executor construction failed: {message}")]
    ExecutorConstruction {
        message: String,
        #[source]
        source: Option<Arc<ExecutorError>>,
    },

    #[error("requested {requested} participants, limit is {limit}")]
    CapacityExceeded { requested: usize, limit: usize },

    #[error("participants {range} unavailable")]
    ParticipantUnavailable {
        range: ParticipantRange,
        #[source]
        source: Arc<ExecutorError>,
        /// Result reported from the ranges that did complete; only populated under
        /// the best-effort failure policy.
        partial: Option<Arc<Value>>,
    },

    #[error("participants {range} failed")]
    RangeFailed {
        range: ParticipantRange,
        #[source]
        source: Arc<ExecutorError>,
    },

    #[error("connection to {endpoint} failed: {message}")]
    Connectivity { endpoint: String, message: String },

    #[error("computation failed: {0}")]
    Computation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("value handle was not produced by {executor}")]
    ForeignHandle { executor: String },

    #[error("unknown reference: {0}")]
    UnknownReference(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is closed")]
    Closed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    pub fn construction(message: impl Into<String>, source: Option<ExecutorError>) -> Self {
        ExecutorError::ExecutorConstruction {
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    pub fn connectivity(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutorError::Connectivity {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ExecutorError::InvalidArgument(message.into())
    }

    pub fn computation(message: impl Into<String>) -> Self {
        ExecutorError::Computation(message.into())
    }

    pub fn closed(what: impl Into<String>) -> Self {
        ExecutorError::Closed(what.into())
    }

    /// Attribute a failure to a participant range.
    ///
    /// Loss of connectivity anywhere in the cause chain becomes
    /// [`ExecutorError::ParticipantUnavailable`]; anything else becomes
    /// [`ExecutorError::RangeFailed`]. The original error stays reachable via
    /// [`std::error::Error::source`].
    pub fn scoped_to(self, range: impl Into<ParticipantRange>) -> Self {
        let range = range.into();
        if self.indicates_participant_loss() {
            ExecutorError::ParticipantUnavailable {
                range,
                source: Arc::new(self),
                partial: None,
            }
        } else {
            ExecutorError::RangeFailed {
                range,
                source: Arc::new(self),
            }
        }
    }

    /// Attach a partial result to a [`ExecutorError::ParticipantUnavailable`].
    /// Other variants are returned unchanged.
    pub fn with_partial(self, value: Value) -> Self {
        match self {
            ExecutorError::ParticipantUnavailable { range, source, .. } => {
                ExecutorError::ParticipantUnavailable {
                    range,
                    source,
                    partial: Some(Arc::new(value)),
                }
            }
            other => other,
        }
    }

    /// The participant range named by this error, if any.
    pub fn range(&self) -> Option<&ParticipantRange> {
        match self {
            ExecutorError::ParticipantUnavailable { range, .. }
            | ExecutorError::RangeFailed { range, .. } => Some(range),
            _ => None,
        }
    }

    pub fn partial(&self) -> Option<&Value> {
        match self {
            ExecutorError::ParticipantUnavailable { partial, .. } => partial.as_deref(),
            _ => None,
        }
    }

    /// True if the failure means some participant can no longer be reached.
    ///
    /// Walks the cause chain, so a connectivity failure deep inside a child stack
    /// is still recognized at the root.
    pub fn indicates_participant_loss(&self) -> bool {
        match self {
            ExecutorError::Connectivity { .. } | ExecutorError::ParticipantUnavailable { .. } => {
                true
            }
            ExecutorError::RangeFailed { source, .. } => source.indicates_participant_loss(),
            ExecutorError::ExecutorConstruction {
                source: Some(source),
                ..
            } => source.indicates_participant_loss(),
            _ => false,
        }
    }

    /// True if repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::ExecutorConstruction { .. } | ExecutorError::Connectivity { .. } => {
                true
            }
            ExecutorError::ParticipantUnavailable { .. } => true,
            _ => false,
        }
    }
}

impl From<ConfigError> for ExecutorError {
    fn from(err: ConfigError) -> Self {
        ExecutorError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ExecutorError {
    fn from(err: validator::ValidationErrors) -> Self {
        ExecutorError::Config(err.to_string())
    }
}
