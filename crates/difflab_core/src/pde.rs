//! Poisson problems `-(u_xx + u_yy) = f(x, y)` on a rectangle.
//!
//! The 5-point stencil couples every interior node to its four neighbours;
//! boundary nodes hold a constant Dirichlet value and move to the right-hand
//! side. The resulting matrix is symmetric positive definite, so it is
//! factored once with a sparse Cholesky and solved directly.

use crate::equation_engine::CompiledExpression;
use crate::error::{Location, SolveError};
use crate::types::{DomainSpec, SolutionData, SolveResult, SolverMeta};
use log::{error, info};
use nalgebra::DMatrix;
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use serde::{Deserialize, Serialize};

/// Hard ceiling on grid points per axis.
pub const MAX_GRID_POINTS: usize = 256;
/// Smallest grid with at least one interior node.
pub const MIN_GRID_POINTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct PdeProblem {
    /// Source term compiled against the coordinates `x` and `y`.
    pub equation: CompiledExpression,
    pub x: DomainSpec,
    pub y: DomainSpec,
    /// Dirichlet value on the whole boundary.
    pub boundary: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdeSettings {
    /// Per-axis grid ceiling, itself capped by [`MAX_GRID_POINTS`].
    pub max_grid_points: usize,
}

impl Default for PdeSettings {
    fn default() -> Self {
        Self {
            max_grid_points: MAX_GRID_POINTS,
        }
    }
}

impl PdeSettings {
    pub fn limit(&self) -> usize {
        self.max_grid_points.min(MAX_GRID_POINTS)
    }
}

pub fn solve(problem: &PdeProblem, settings: &PdeSettings) -> Result<SolveResult, SolveError> {
    let limit = settings.limit();
    for axis in [&problem.x, &problem.y] {
        if axis.points > limit {
            return Err(SolveError::GridSize {
                requested: axis.points,
                limit,
            });
        }
    }
    problem.x.validate()?;
    problem.y.validate()?;
    let (nx, ny) = (problem.x.points, problem.y.points);
    if nx < MIN_GRID_POINTS || ny < MIN_GRID_POINTS {
        return Err(SolveError::validation(format!(
            "grid must have at least {MIN_GRID_POINTS} points per axis, got {nx} x {ny}"
        )));
    }
    if !problem.boundary.is_finite() {
        return Err(SolveError::validation("boundary value must be finite"));
    }

    info!(
        "Solving Poisson problem on a {nx}x{ny} grid over [{}, {}] x [{}, {}]",
        problem.x.start, problem.x.end, problem.y.start, problem.y.end
    );

    let xs = problem.x.samples();
    let ys = problem.y.samples();
    let hx = problem.x.spacing();
    let hy = problem.y.spacing();
    let cx = 1.0 / (hx * hx);
    let cy = 1.0 / (hy * hy);
    let diag = 2.0 * (cx + cy);
    let boundary = problem.boundary;

    let (mx, my) = (nx - 2, ny - 2);
    let unknowns = mx * my;
    let index = |i: usize, j: usize| (j - 1) * mx + (i - 1);

    let mut coo = CooMatrix::new(unknowns, unknowns);
    let mut b = vec![0.0; unknowns];
    let mut stack = Vec::with_capacity(32);

    for j in 1..ny - 1 {
        for i in 1..nx - 1 {
            let k = index(i, j);
            coo.push(k, k, diag);

            if i > 1 {
                coo.push(k, index(i - 1, j), -cx);
            } else {
                b[k] += cx * boundary;
            }
            if i < nx - 2 {
                coo.push(k, index(i + 1, j), -cx);
            } else {
                b[k] += cx * boundary;
            }
            if j > 1 {
                coo.push(k, index(i, j - 1), -cy);
            } else {
                b[k] += cy * boundary;
            }
            if j < ny - 2 {
                coo.push(k, index(i, j + 1), -cy);
            } else {
                b[k] += cy * boundary;
            }

            let (x, y) = (xs[i], ys[j]);
            b[k] += problem
                .equation
                .evaluate_with(&[x, y], &[], &mut stack)
                .map_err(|source| SolveError::Evaluation {
                    location: Location::Node { x, y },
                    source,
                })?;
        }
    }

    let matrix = CscMatrix::from(&coo);
    let cholesky = CscCholesky::factor(&matrix).map_err(|err| {
        let message = format!("sparse Cholesky factorization failed: {err}");
        error!("{message}");
        SolveError::SolverFailure(message)
    })?;
    let rhs = DMatrix::from_column_slice(unknowns, 1, &b);
    let solution = cholesky.solve(&rhs);

    let mut values = vec![vec![boundary; nx]; ny];
    for (j, row) in values.iter_mut().enumerate().take(ny - 1).skip(1) {
        for (i, value) in row.iter_mut().enumerate().take(nx - 1).skip(1) {
            *value = solution[(index(i, j), 0)];
        }
    }

    info!("Poisson problem solved: {unknowns} interior unknowns");
    Ok(SolveResult {
        data: SolutionData::Field {
            x: xs,
            y: ys,
            values,
        },
        meta: SolverMeta {
            method: "5-point finite difference (sparse Cholesky)".to_string(),
            success: true,
            message: "OK".to_string(),
            function_evaluations: unknowns,
            ..SolverMeta::default()
        },
        residual: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::compile;
    use crate::error::ErrorKind;
    use crate::registry::{FunctionSet, Symbols};
    use std::f64::consts::PI;

    fn problem(text: &str, n: usize, boundary: f64) -> PdeProblem {
        let symbols = Symbols::field().with_parameters([("k", PI)]);
        PdeProblem {
            equation: compile(text, &symbols, &FunctionSet::standard()).expect("compiles"),
            x: DomainSpec::new(0.0, 1.0, n),
            y: DomainSpec::new(0.0, 1.0, n),
            boundary,
        }
    }

    fn field(result: &SolveResult) -> &[Vec<f64>] {
        match &result.data {
            SolutionData::Field { values, .. } => values,
            other => panic!("expected a field, got {other:?}"),
        }
    }

    #[test]
    fn laplace_with_zero_boundary_is_zero() {
        let result = solve(&problem("0", 17, 0.0), &PdeSettings::default()).expect("solves");
        let values = field(&result);
        assert_eq!(values.len(), 17);
        assert!(values.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn constant_boundary_gives_constant_field() {
        let result = solve(&problem("0", 12, 3.5), &PdeSettings::default()).expect("solves");
        for v in field(&result).iter().flatten() {
            assert!((v - 3.5).abs() < 1e-10, "{v}");
        }
    }

    #[test]
    fn sine_source_matches_analytic_solution() {
        let n = 41;
        let result = solve(
            &problem("2 * k^2 * sin(k * x) * sin(k * y)", n, 0.0),
            &PdeSettings::default(),
        )
        .expect("solves");
        let SolutionData::Field { x, y, values } = &result.data else {
            panic!("expected a field");
        };
        let mut worst = 0.0f64;
        for (j, row) in values.iter().enumerate() {
            for (i, v) in row.iter().enumerate() {
                let exact = (PI * x[i]).sin() * (PI * y[j]).sin();
                worst = worst.max((v - exact).abs());
            }
        }
        assert!(worst < 2e-3, "max error {worst}");
        assert_eq!(result.meta.function_evaluations, 39 * 39);
        assert!(result.meta.method.contains("Cholesky"));
        assert_eq!(result.meta.lu_decompositions, 0);
    }

    #[test]
    fn oversized_grid_is_rejected_before_assembly() {
        let err = solve(&problem("0", 300, 0.0), &PdeSettings::default()).expect_err("too big");
        assert_eq!(
            err,
            SolveError::GridSize {
                requested: 300,
                limit: MAX_GRID_POINTS
            }
        );
        let tight = PdeSettings { max_grid_points: 16 };
        assert!(matches!(
            solve(&problem("0", 20, 0.0), &tight),
            Err(SolveError::GridSize { limit: 16, .. })
        ));
    }

    #[test]
    fn degenerate_grid_is_invalid() {
        let err = solve(&problem("0", 2, 0.0), &PdeSettings::default()).expect_err("no interior");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn evaluation_error_names_the_node() {
        let err = solve(&problem("log(x - 0.5)", 5, 0.0), &PdeSettings::default())
            .expect_err("log of a negative number");
        assert_eq!(err.location(), Some(Location::Node { x: 0.25, y: 0.25 }));
    }
}
