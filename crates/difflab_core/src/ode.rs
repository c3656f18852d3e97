//! Order-k ODEs and vector ODE systems.
//!
//! An order-k component `y^(k) = f(x, y, y', ..., y^(k-1))` becomes the block
//! `[y, y', ..., y^(k-1)]` of a first-order state. Components are laid out in
//! declared order, so flat index `c * order + i` is derivative `i` of
//! component `c`. Conditions at the domain start make an initial-value
//! problem; conditions elsewhere are met by shooting.

mod shooting;

pub use shooting::ShootingSettings;

use crate::autodiff::Dual;
use crate::equation_engine::CompiledExpression;
use crate::error::{EvalError, SolveError};
use crate::solvers::{integrate, IntegrationMethod, IntegrationStats, Tolerances};
use crate::statistics::ode_residual;
use crate::traits::{DynamicalSystem, Scalar};
use crate::types::{DomainSpec, InitialCondition, SolutionData, SolveResult, SolverMeta};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Relative distance within which a condition point counts as the domain start.
const START_MATCH: f64 = 1e-12;

/// First-order form of one or more compiled order-k equations.
///
/// Each expression sees the whole flat state through `y[...]`.
pub struct OdeSystem<'a> {
    order: usize,
    equations: &'a [CompiledExpression],
    // Reused VM stacks; this makes the system !Sync, which no engine needs.
    real_stack: RefCell<Vec<f64>>,
    dual_stack: RefCell<Vec<Dual>>,
}

impl<'a> OdeSystem<'a> {
    pub fn new(order: usize, equations: &'a [CompiledExpression]) -> Self {
        Self {
            order,
            equations,
            real_stack: RefCell::new(Vec::with_capacity(64)),
            dual_stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn components(&self) -> usize {
        self.equations.len()
    }

    fn evaluate_into<T: Scalar>(
        &self,
        x: T,
        state: &[T],
        out: &mut [T],
        stack: &mut Vec<T>,
    ) -> Result<(), EvalError> {
        let k = self.order;
        for (c, equation) in self.equations.iter().enumerate() {
            let block = c * k;
            for i in 0..k - 1 {
                out[block + i] = state[block + i + 1];
            }
            out[block + k - 1] = equation.evaluate_with(&[x], state, stack)?;
        }
        Ok(())
    }
}

impl DynamicalSystem<f64> for OdeSystem<'_> {
    fn dimension(&self) -> usize {
        self.order * self.equations.len()
    }

    fn apply(&self, x: f64, state: &[f64], out: &mut [f64]) -> Result<(), EvalError> {
        let mut stack = self.real_stack.borrow_mut();
        self.evaluate_into(x, state, out, &mut stack)
    }
}

impl DynamicalSystem<Dual> for OdeSystem<'_> {
    fn dimension(&self) -> usize {
        self.order * self.equations.len()
    }

    fn apply(&self, x: Dual, state: &[Dual], out: &mut [Dual]) -> Result<(), EvalError> {
        let mut stack = self.dual_stack.borrow_mut();
        self.evaluate_into(x, state, out, &mut stack)
    }
}

/// A compiled ODE (or vector ODE) with its conditions and output grid.
#[derive(Debug, Clone, PartialEq)]
pub struct OdeProblem {
    pub order: usize,
    /// One right-hand side per component, compiled against `y[0..order * len]`.
    pub equations: Vec<CompiledExpression>,
    pub conditions: Vec<InitialCondition>,
    pub domain: DomainSpec,
}

impl OdeProblem {
    pub fn dimension(&self) -> usize {
        self.order * self.equations.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdeOptions {
    pub method: IntegrationMethod,
    pub tolerances: Tolerances,
    pub shooting: ShootingSettings,
}

impl Default for OdeOptions {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Rk45,
            tolerances: Tolerances::default(),
            shooting: ShootingSettings::default(),
        }
    }
}

/// Conditions split into start values and conditions at later points.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConditionPlan {
    /// Start value per flat state index; `None` marks a shooting unknown.
    pub fixed: Vec<Option<f64>>,
    pub targets: Vec<InitialCondition>,
}

impl ConditionPlan {
    pub fn is_initial_value(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn unknowns(&self) -> Vec<usize> {
        self.fixed
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.is_none().then_some(i))
            .collect()
    }
}

pub(crate) fn plan_conditions(
    conditions: &[InitialCondition],
    dimension: usize,
    domain: &DomainSpec,
) -> Result<ConditionPlan, SolveError> {
    let mut fixed = vec![None; dimension];
    let mut targets = Vec::new();
    let at_start = |p: f64| (p - domain.start).abs() <= START_MATCH * domain.start.abs().max(1.0);

    for condition in conditions {
        if condition.state_index >= dimension {
            return Err(SolveError::validation(format!(
                "condition refers to state index {} but the system has {dimension} states",
                condition.state_index
            )));
        }
        if !condition.point.is_finite() || !condition.value.is_finite() {
            return Err(SolveError::validation(format!(
                "condition on state {} must have a finite point and value",
                condition.state_index
            )));
        }
        if at_start(condition.point) {
            if fixed[condition.state_index].is_some() {
                return Err(SolveError::validation(format!(
                    "state {} has more than one initial value",
                    condition.state_index
                )));
            }
            fixed[condition.state_index] = Some(condition.value);
        } else if condition.point > domain.start && condition.point <= domain.end {
            targets.push(*condition);
        } else {
            return Err(SolveError::validation(format!(
                "condition point {} lies outside the domain [{}, {}]",
                condition.point, domain.start, domain.end
            )));
        }
    }

    let plan = ConditionPlan { fixed, targets };
    let unknowns = plan.unknowns().len();
    if plan.is_initial_value() {
        if let Some(missing) = plan.fixed.iter().position(Option::is_none) {
            return Err(SolveError::validation(format!(
                "missing initial value for state {missing}"
            )));
        }
    } else if unknowns != plan.targets.len() {
        return Err(SolveError::validation(format!(
            "{} conditions away from the start cannot determine {unknowns} unknown initial values",
            plan.targets.len()
        )));
    }
    Ok(plan)
}

/// Solves an ODE problem on its uniform output grid.
pub fn solve(problem: &OdeProblem, options: &OdeOptions) -> Result<SolveResult, SolveError> {
    if problem.order == 0 {
        return Err(SolveError::validation("ODE order must be at least 1"));
    }
    if problem.equations.is_empty() {
        return Err(SolveError::validation("ODE system has no equations"));
    }
    problem.domain.validate()?;
    options.tolerances.validate()?;
    options.shooting.validate()?;

    let dimension = problem.dimension();
    let plan = plan_conditions(&problem.conditions, dimension, &problem.domain)?;
    let system = OdeSystem::new(problem.order, &problem.equations);
    let method = options.method;

    info!(
        "Solving ODE: method={method}, order={}, components={}, span=[{}, {}], points={}",
        problem.order,
        problem.equations.len(),
        problem.domain.start,
        problem.domain.end,
        problem.domain.points
    );

    let mut stats = IntegrationStats::default();
    let (y0, shooting_iterations) = if plan.is_initial_value() {
        (plan.fixed.iter().map(|v| v.unwrap_or(0.0)).collect(), None)
    } else {
        let outcome = shooting::shoot(
            &system,
            method,
            &plan,
            problem.domain.start,
            &options.tolerances,
            &options.shooting,
        )?;
        stats.absorb(&outcome.stats);
        (outcome.initial_state, Some(outcome.iterations))
    };

    let samples = problem.domain.samples();
    let trajectory = integrate(
        &system,
        method,
        &y0,
        problem.domain.start,
        &samples,
        &options.tolerances,
    )
    .map_err(|err| {
        error!("Solver failed ({method}): {err}");
        SolveError::from(err)
    })?;
    stats.absorb(&trajectory.stats);

    let message = match shooting_iterations {
        Some(n) => format!("Shooting converged after {n} iterations."),
        None => "The solver successfully reached the end of the integration interval.".to_string(),
    };
    let meta = SolverMeta {
        method: method.name().to_string(),
        success: true,
        message,
        function_evaluations: stats.function_evaluations,
        jacobian_evaluations: stats.jacobian_evaluations,
        lu_decompositions: stats.lu_decompositions,
        accepted_steps: stats.accepted_steps,
        rejected_steps: stats.rejected_steps,
        shooting_iterations,
        stiffness_switch_at: stats.stiffness_switch_at,
    };
    let mut result = SolveResult {
        data: SolutionData::Trajectory {
            x: trajectory.x,
            states: trajectory.states,
        },
        meta,
        residual: None,
    };
    result.residual = Some(ode_residual(&result, problem.order, &problem.equations)?);

    info!(
        "Solver succeeded: {} points, {} evaluations",
        result.x().len(),
        result.meta.function_evaluations
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::compile_system;
    use crate::error::{ErrorKind, Location};
    use crate::registry::{FunctionSet, Symbols};
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn problem(
        order: usize,
        texts: &[&str],
        params: &[(&str, f64)],
        conditions: Vec<InitialCondition>,
        domain: DomainSpec,
    ) -> OdeProblem {
        let symbols = Symbols::ode(order * texts.len())
            .with_parameters(params.iter().map(|(n, v)| (*n, *v)));
        let equations =
            compile_system(texts, &symbols, &FunctionSet::standard()).expect("expressions compile");
        OdeProblem {
            order,
            equations,
            conditions,
            domain,
        }
    }

    #[test]
    fn exponential_growth_matches_closed_form() {
        let k = 1.3;
        let p = problem(
            1,
            &["k * y[0]"],
            &[("k", k)],
            vec![InitialCondition::new(0, 0.0, 1.0)],
            DomainSpec::new(0.0, 1.0, 100),
        );
        let result = solve(&p, &OdeOptions::default()).expect("solve succeeds");
        assert_eq!(result.x().len(), 100);
        assert!(result.x().windows(2).all(|w| w[0] < w[1]));
        for (x, y) in result.x().iter().zip(result.component(0)) {
            assert!((y - (k * x).exp()).abs() < 1e-6 * (k * x).exp(), "x = {x}");
        }
        assert!(result.meta.success);
        assert_eq!(result.meta.method, "RK45");
        assert!(result.meta.function_evaluations > 0);
        let residual = result.residual.expect("residual attached");
        assert!(residual.rms < 1e-2, "residual {}", residual.rms);
        assert!(residual.max < 0.1, "residual {}", residual.max);
    }

    #[test]
    fn second_order_reduction_gives_harmonic_motion() {
        let p = problem(
            2,
            &["-y[0]"],
            &[],
            vec![
                InitialCondition::new(0, 0.0, 1.0),
                InitialCondition::new(1, 0.0, 0.0),
            ],
            DomainSpec::new(0.0, 2.0 * PI, 201),
        );
        let result = solve(&p, &OdeOptions::default()).expect("solve succeeds");
        assert_eq!(result.dimension(), 2);
        for (x, state) in result.x().iter().zip(result.states()) {
            assert_abs_diff_eq!(state[0], x.cos(), epsilon = 1e-6);
            assert_abs_diff_eq!(state[1], -x.sin(), epsilon = 1e-6);
        }
    }

    #[test]
    fn shooting_recovers_sine() {
        let p = problem(
            2,
            &["-y[0]"],
            &[],
            vec![
                InitialCondition::new(0, 0.0, 0.0),
                InitialCondition::new(0, FRAC_PI_2, 1.0),
            ],
            DomainSpec::new(0.0, PI, 101),
        );
        let result = solve(&p, &OdeOptions::default()).expect("shooting converges");
        assert!(result.meta.shooting_iterations.is_some());
        for (x, y) in result.x().iter().zip(result.component(0)) {
            assert_abs_diff_eq!(y, x.sin(), epsilon = 1e-5);
        }
    }

    #[test]
    fn shooting_reports_inconsistent_boundary_data() {
        let p = problem(
            2,
            &["-y[0]"],
            &[],
            vec![
                InitialCondition::new(0, 0.0, 0.0),
                InitialCondition::new(0, PI, 1.0),
            ],
            DomainSpec::new(0.0, PI, 101),
        );
        let err = solve(&p, &OdeOptions::default()).expect_err("no solution exists");
        assert_eq!(err.kind(), ErrorKind::SolverFailure);
    }

    #[test]
    fn shooting_resolves_short_interval_boundary_data() {
        // y'' = 0 with y(0) = 0 and y(h) = h: the start slope is exactly 1.
        let h = 1e-7;
        let p = problem(
            2,
            &["0"],
            &[],
            vec![
                InitialCondition::new(0, 0.0, 0.0),
                InitialCondition::new(0, h, h),
            ],
            DomainSpec::new(0.0, h, 11),
        );
        let result = solve(&p, &OdeOptions::default()).expect("shooting converges");
        assert!(result.meta.shooting_iterations.unwrap_or(0) >= 1);
        assert_abs_diff_eq!(result.states()[0][1], 1.0, epsilon = 1e-6);
        let end = result.states().last().expect("samples")[0];
        assert!((end - h).abs() <= 1e-6 * h, "y(h) = {end:e}");
    }

    #[test]
    fn vector_system_can_be_shot() {
        // x' = v, v' = -x written as two first-order components.
        let p = problem(
            1,
            &["y[1]", "-y[0]"],
            &[],
            vec![
                InitialCondition::new(0, 0.0, 0.0),
                InitialCondition::new(0, 1.0, 1.0f64.sin() * 2.0),
            ],
            DomainSpec::new(0.0, 1.0, 11),
        );
        let result = solve(&p, &OdeOptions::default()).expect("shooting converges");
        let last = result.states().last().expect("samples");
        assert_abs_diff_eq!(last[0], 2.0 * 1.0f64.sin(), epsilon = 1e-6);
        assert_abs_diff_eq!(result.states()[0][1], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn evaluation_error_names_the_point() {
        let p = problem(
            1,
            &["-1 / sqrt(y[0])"],
            &[],
            vec![InitialCondition::new(0, 0.0, 1.0)],
            DomainSpec::new(0.0, 2.0, 50),
        );
        let err = solve(&p, &OdeOptions::default()).expect_err("state goes negative");
        assert_eq!(err.kind(), ErrorKind::Evaluation);
        match err.location() {
            Some(Location::Point { x }) => assert!(x > 0.0 && x <= 2.0, "x = {x}"),
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn condition_validation() {
        let missing = problem(
            2,
            &["-y[0]"],
            &[],
            vec![InitialCondition::new(0, 0.0, 1.0)],
            DomainSpec::new(0.0, 1.0, 10),
        );
        let err = solve(&missing, &OdeOptions::default()).expect_err("y'(0) missing");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let duplicate = problem(
            1,
            &["y[0]"],
            &[],
            vec![
                InitialCondition::new(0, 0.0, 1.0),
                InitialCondition::new(0, 0.0, 2.0),
            ],
            DomainSpec::new(0.0, 1.0, 10),
        );
        assert!(solve(&duplicate, &OdeOptions::default()).is_err());

        let outside = problem(
            1,
            &["y[0]"],
            &[],
            vec![InitialCondition::new(0, 5.0, 1.0)],
            DomainSpec::new(0.0, 1.0, 10),
        );
        assert_eq!(
            solve(&outside, &OdeOptions::default())
                .expect_err("point beyond end")
                .kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn repeated_solves_are_identical() {
        let p = problem(
            2,
            &["-0.3 * y[1] - sin(y[0])"],
            &[],
            vec![
                InitialCondition::new(0, 0.0, 1.0),
                InitialCondition::new(1, 0.0, 0.0),
            ],
            DomainSpec::new(0.0, 10.0, 64),
        );
        let options = OdeOptions {
            method: IntegrationMethod::Auto,
            ..OdeOptions::default()
        };
        let first = solve(&p, &options).expect("first solve");
        let second = solve(&p, &options).expect("second solve");
        assert_eq!(first, second);
    }
}
