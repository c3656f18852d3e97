//! Plain value types passed between the parser, the engines and the caller.

use crate::equation_engine::{compile_system, CompiledExpression};
use crate::error::{ParseError, SolveError};
use crate::registry::{FunctionSet, StateAccessor, Symbols};
use crate::statistics::ResidualMetrics;
use serde::{Deserialize, Serialize};

/// Upper bound on samples per axis for any 1D output.
pub const MAX_POINTS: usize = 1_000_000;

/// Raw user input for one expression or expression list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionSpec {
    /// One text for scalar equations, one per component for vector systems.
    pub texts: Vec<String>,
    /// Declared independent variable names.
    pub independent: Vec<String>,
    /// Length of the `y[...]` accessor; `None` for field expressions.
    pub state_len: Option<usize>,
    #[serde(default)]
    pub parameters: Vec<(String, f64)>,
}

impl ExpressionSpec {
    pub fn symbols(&self) -> Symbols {
        let independent: Vec<&str> = self.independent.iter().map(String::as_str).collect();
        let state = self.state_len.map(|len| StateAccessor {
            name: "y".to_string(),
            len,
        });
        Symbols::new(&independent, state).with_parameters(self.parameters.iter().cloned())
    }

    /// Compiles every text against one shared symbol table.
    pub fn compile(&self, functions: &FunctionSet) -> Result<Vec<CompiledExpression>, ParseError> {
        compile_system(&self.texts, &self.symbols(), functions)
    }
}

/// A value imposed on one flat state component at one point.
///
/// `state_index` is `component * order + derivative`; a point equal to the
/// domain start makes the condition an initial value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialCondition {
    pub state_index: usize,
    pub point: f64,
    pub value: f64,
}

impl InitialCondition {
    pub fn new(state_index: usize, point: f64, value: f64) -> Self {
        Self {
            state_index,
            point,
            value,
        }
    }
}

/// Evenly sampled interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub start: f64,
    pub end: f64,
    pub points: usize,
}

impl DomainSpec {
    pub fn new(start: f64, end: f64, points: usize) -> Self {
        Self { start, end, points }
    }

    pub fn validate(&self) -> Result<(), SolveError> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(SolveError::validation("domain bounds must be finite"));
        }
        if self.end <= self.start {
            return Err(SolveError::validation(format!(
                "domain end ({}) must be greater than start ({})",
                self.end, self.start
            )));
        }
        if self.points < 2 || self.points > MAX_POINTS {
            return Err(SolveError::validation(format!(
                "number of points must be between 2 and {MAX_POINTS}, got {}",
                self.points
            )));
        }
        Ok(())
    }

    /// Sample abscissae; the last one is exactly `end`.
    pub fn samples(&self) -> Vec<f64> {
        linspace(self.start, self.end, self.points)
    }

    pub fn spacing(&self) -> f64 {
        (self.end - self.start) / (self.points.saturating_sub(1).max(1)) as f64
    }
}

/// Inclusive signed index range for recurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDomain {
    pub start: i64,
    pub end: i64,
}

impl IndexDomain {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> Result<(), SolveError> {
        if self.end <= self.start {
            return Err(SolveError::validation(format!(
                "index end ({}) must be greater than start ({})",
                self.end, self.start
            )));
        }
        if self.len() > MAX_POINTS {
            return Err(SolveError::validation(format!(
                "index range of {} terms exceeds the limit of {MAX_POINTS}",
                self.len()
            )));
        }
        Ok(())
    }
}

pub(crate) fn linspace(start: f64, end: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (points - 1) as f64;
            let mut out: Vec<f64> = (0..points).map(|i| start + step * i as f64).collect();
            out[points - 1] = end;
            out
        }
    }
}

/// Sampled solver output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SolutionData {
    /// One state vector per sample of a 1D independent variable.
    Trajectory { x: Vec<f64>, states: Vec<Vec<f64>> },
    /// Scalar field on a grid, `values[j][i]` at `(x[i], y[j])`.
    Field {
        x: Vec<f64>,
        y: Vec<f64>,
        values: Vec<Vec<f64>>,
    },
}

/// Solver bookkeeping attached to every result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SolverMeta {
    pub method: String,
    pub success: bool,
    pub message: String,
    pub function_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub lu_decompositions: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub shooting_iterations: Option<usize>,
    /// Abscissa at which an automatic method switched to its stiff integrator.
    pub stiffness_switch_at: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    pub data: SolutionData,
    pub meta: SolverMeta,
    pub residual: Option<ResidualMetrics>,
}

impl SolveResult {
    pub fn x(&self) -> &[f64] {
        match &self.data {
            SolutionData::Trajectory { x, .. } | SolutionData::Field { x, .. } => x,
        }
    }

    /// Per-sample state vectors; empty for fields.
    pub fn states(&self) -> &[Vec<f64>] {
        match &self.data {
            SolutionData::Trajectory { states, .. } => states,
            SolutionData::Field { .. } => &[],
        }
    }

    /// Samples of one flat state component.
    pub fn component(&self, index: usize) -> Vec<f64> {
        self.states()
            .iter()
            .map(|s| s.get(index).copied().unwrap_or(f64::NAN))
            .collect()
    }

    pub fn dimension(&self) -> usize {
        self.states().first().map_or(0, Vec::len)
    }
}

/// Which projection of a transform to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformView {
    Curve,
    Coefficients,
}

/// Transform output: `values` against `abscissa`, labeled for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    pub view: TransformView,
    pub abscissa: Vec<f64>,
    pub values: Vec<f64>,
    pub x_label: String,
    pub y_label: String,
    pub title: String,
}
