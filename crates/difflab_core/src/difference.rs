//! Forward iteration of recurrences `y[n + order] = f(n, y[n], ..., y[n + order - 1])`.

use crate::equation_engine::CompiledExpression;
use crate::error::{EvalError, Location, SolveError};
use crate::types::{IndexDomain, SolutionData, SolveResult, SolverMeta};
use log::{error, info};

#[derive(Debug, Clone, PartialEq)]
pub struct DifferenceProblem {
    pub order: usize,
    /// Compiled against `n` and the window accessor `y[0..order]`.
    pub equation: CompiledExpression,
    /// `[y_start, ..., y_{start + order - 1}]`.
    pub seeds: Vec<f64>,
    pub domain: IndexDomain,
}

/// Iterates the recurrence over the inclusive index range.
///
/// Sample `i` is the window `[y_n, ..., y_{n + order - 1}]` at `n = start + i`,
/// so the first component of every sample is the sequence itself.
pub fn solve(problem: &DifferenceProblem) -> Result<SolveResult, SolveError> {
    let order = problem.order;
    if order == 0 {
        return Err(SolveError::validation("recurrence order must be at least 1"));
    }
    if problem.seeds.len() != order {
        return Err(SolveError::validation(format!(
            "a recurrence of order {order} needs {order} seed values, got {}",
            problem.seeds.len()
        )));
    }
    if problem.seeds.iter().any(|s| !s.is_finite()) {
        return Err(SolveError::validation("seed values must be finite"));
    }
    problem.domain.validate()?;

    let IndexDomain { start, end } = problem.domain;
    let len = problem.domain.len();
    info!("Iterating recurrence of order {order} from n = {start} to n = {end}");

    let mut x = Vec::with_capacity(len);
    let mut states = Vec::with_capacity(len);
    let mut window = problem.seeds.clone();
    let mut stack = Vec::with_capacity(32);
    x.push(start as f64);
    states.push(window.clone());

    for n in start..end {
        let next = problem
            .equation
            .evaluate_with(&[n as f64], &window, &mut stack)
            .map_err(|source| {
                let err = match source {
                    EvalError::NonFinite { value } => SolveError::Divergence { index: n, value },
                    source => SolveError::Evaluation {
                        location: Location::Index { n },
                        source,
                    },
                };
                error!("Difference equation iteration failed: {err}");
                err
            })?;
        window.rotate_left(1);
        window[order - 1] = next;
        x.push((n + 1) as f64);
        states.push(window.clone());
    }

    info!("Difference equation solved: {len} points from n = {start} to n = {end}");
    Ok(SolveResult {
        data: SolutionData::Trajectory { x, states },
        meta: SolverMeta {
            method: "recurrence".to_string(),
            success: true,
            message: "Solved successfully".to_string(),
            function_evaluations: len - 1,
            ..SolverMeta::default()
        },
        residual: None,
    })
}
