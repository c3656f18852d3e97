use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure to turn expression text into a compiled expression.
///
/// Every variant is recoverable: the caller re-prompts for new text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("Unknown name '{name}'")]
    UnknownName { name: String },
    #[error("Disallowed construct in expression: {construct}")]
    DisallowedConstruct { construct: String },
    #[error("Expression {index}: {source}")]
    Component {
        index: usize,
        #[source]
        source: Box<ParseError>,
    },
}

impl ParseError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn disallowed(construct: impl Into<String>) -> Self {
        ParseError::DisallowedConstruct {
            construct: construct.into(),
        }
    }

    /// Strips any component wrappers and returns the underlying error.
    pub fn root(&self) -> &ParseError {
        match self {
            ParseError::Component { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Failure raised by a compiled expression at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum EvalError {
    #[error("{function} is undefined for argument {argument}")]
    Domain {
        function: &'static str,
        argument: f64,
    },
    #[error("expression produced a non-finite value ({value})")]
    NonFinite { value: f64 },
}

/// Where in the independent-variable space a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Location {
    Point { x: f64 },
    Index { n: i64 },
    Node { x: f64, y: f64 },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Point { x } => write!(f, "x = {x}"),
            Location::Index { n } => write!(f, "n = {n}"),
            Location::Node { x, y } => write!(f, "(x, y) = ({x}, {y})"),
        }
    }
}

/// Error returned at every engine boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Grid of {requested} points per axis exceeds the limit of {limit}")]
    GridSize { requested: usize, limit: usize },
    #[error("Evaluation failed at {location}: {source}")]
    Evaluation {
        location: Location,
        #[source]
        source: EvalError,
    },
    #[error("Solver failure: {0}")]
    SolverFailure(String),
    #[error("Recurrence diverged at n = {index} (value {value})")]
    Divergence { index: i64, value: f64 },
}

/// Coarse classification of a [`SolveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    Validation,
    Evaluation,
    SolverFailure,
    Divergence,
}

impl SolveError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        SolveError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SolveError::Parse(_) => ErrorKind::Parse,
            SolveError::Validation(_) | SolveError::GridSize { .. } => ErrorKind::Validation,
            SolveError::Evaluation { .. } => ErrorKind::Evaluation,
            SolveError::SolverFailure(_) => ErrorKind::SolverFailure,
            SolveError::Divergence { .. } => ErrorKind::Divergence,
        }
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            SolveError::Evaluation { location, .. } => Some(*location),
            SolveError::Divergence { index, .. } => Some(Location::Index { n: *index }),
            _ => None,
        }
    }
}

/// Serializable form of a failure handed back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<Location>,
}

impl From<&SolveError> for FailureReport {
    fn from(err: &SolveError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            location: err.location(),
        }
    }
}
