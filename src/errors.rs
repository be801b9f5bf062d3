use std::fmt;

use crate::engine::EngineError;

/// Enum to represent errors related to building and tearing down a test network.
#[derive(thiserror::Error, Debug)]
pub enum QuorumContainerError {
    /// Represents an IO error, wrapping a standard `std::io::Error`.
    #[error("io error {0}")]
    IOError(#[from] std::io::Error),

    /// The declarative build description is malformed.
    #[error("invalid build spec: {0}")]
    Config(String),

    /// A container engine call failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The engine rejected the creation of the build network.
    #[error("create network {name} failed: {source}")]
    NetworkCreate {
        /// Name of the network that could not be created.
        name: String,
        /// The underlying engine failure.
        #[source]
        source: EngineError,
    },

    /// The network subnet has fewer free addresses than requested.
    #[error("address pool exhausted: requested {requested}, {available} available")]
    AddressPoolExhausted {
        /// Number of addresses asked for.
        requested: usize,
        /// Number of addresses still free in the pool.
        available: usize,
    },

    /// The identity collaborator failed.
    #[error("identity generation failed: {0}")]
    IdentityGeneration(String),

    /// The genesis collaborator failed.
    #[error("genesis generation failed: {0}")]
    GenesisGeneration(String),

    /// The one-shot key generation container did not succeed.
    #[error("key generation in container {container} failed with exit code {code}")]
    KeyGeneration {
        /// Id of the ephemeral container.
        container: String,
        /// Exit code reported by the engine.
        code: i64,
    },

    /// An operation was attempted from a state that does not allow it.
    #[error("cannot {operation} while builder is {state}")]
    InvalidState {
        /// What the caller tried to do.
        operation: &'static str,
        /// The state the builder was in.
        state: String,
    },

    /// One or more units of a parallel stage failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// The failure of a single unit inside a parallel run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// Position of the unit in the submitted work list.
    pub index: usize,
    /// Rendered error chain of the unit.
    pub message: String,
}

/// Collects every failing unit of one parallel run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateError {
    title: String,
    total: usize,
    succeeded: usize,
    failures: Vec<UnitFailure>,
}

impl AggregateError {
    pub(crate) fn new(
        title: impl Into<String>,
        total: usize,
        succeeded: usize,
        mut failures: Vec<UnitFailure>,
    ) -> Self {
        failures.sort_by_key(|failure| failure.index);
        Self {
            title: title.into(),
            total,
            succeeded,
            failures,
        }
    }

    /// Merges several aggregates into one, prefixing each message with the
    /// title of the run it came from.
    pub fn combine(title: impl Into<String>, parts: Vec<AggregateError>) -> Self {
        let mut total = 0;
        let mut succeeded = 0;
        let mut failures = Vec::new();
        for part in parts {
            total += part.total;
            succeeded += part.succeeded;
            failures.extend(part.failures.into_iter().map(|failure| UnitFailure {
                index: failure.index,
                message: format!("{}: {}", part.title, failure.message),
            }));
        }
        Self {
            title: title.into(),
            total,
            succeeded,
            failures,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failures(&self) -> &[UnitFailure] {
        &self.failures
    }

    /// Indices of the failed units, in increasing order.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|failure| failure.index).collect()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} succeeded",
            self.title, self.succeeded, self.total
        )?;
        for failure in &self.failures {
            write!(f, "\n  [{}] {}", failure.index, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
