use super::ConditionPlan;
use crate::error::SolveError;
use crate::solvers::{integrate, DifferentiableSystem, IntegrationMethod, IntegrationStats, Tolerances};
use crate::types::InitialCondition;
use log::{debug, error, info};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Jacobians whose smallest singular value falls below this fraction of the
/// largest are treated as singular.
const SINGULAR_RATIO: f64 = 1e-6;

/// A condition whose residual moves by less than this fraction of the largest
/// change its component shows anywhere along the trajectory is undetermined.
const INSENSITIVE_RATIO: f64 = 1e-4;

/// Interior points at which conditioned components are sampled for sensitivity.
const SENSITIVITY_SAMPLES: usize = 32;

/// Broyden iteration controls for multi-point conditions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShootingSettings {
    pub max_iterations: usize,
    /// Converged when every `|residual_k| <= tolerance * (1 + |target_k|)` and
    /// every Newton correction satisfies `|step_j| <= tolerance * (1 + |s_j|)`.
    pub tolerance: f64,
    /// Relative finite-difference step for the initial Jacobian.
    pub perturbation: f64,
}

impl Default for ShootingSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-6,
            perturbation: 1e-4,
        }
    }
}

impl ShootingSettings {
    pub fn validate(&self) -> Result<(), SolveError> {
        if self.max_iterations == 0 {
            return Err(SolveError::validation(
                "shooting max_iterations must be greater than zero",
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(SolveError::validation(
                "shooting tolerance must be positive and finite",
            ));
        }
        if !(self.perturbation.is_finite() && self.perturbation > 0.0) {
            return Err(SolveError::validation(
                "shooting perturbation must be positive and finite",
            ));
        }
        Ok(())
    }
}

pub(crate) struct ShootingOutcome {
    pub initial_state: Vec<f64>,
    pub iterations: usize,
    pub stats: IntegrationStats,
}

/// One integration from a trial start.
struct Shot {
    residual: DVector<f64>,
    /// Conditioned component of each target (rows) at every sample point (columns).
    profiles: DMatrix<f64>,
}

/// Forward-difference Jacobian with the largest per-condition change seen
/// anywhere along the perturbed trajectories.
struct Sensitivity {
    jacobian: DMatrix<f64>,
    peaks: DVector<f64>,
}

struct Shooter<'a, S> {
    system: &'a S,
    method: IntegrationMethod,
    x0: f64,
    tol: &'a Tolerances,
    fixed: &'a [Option<f64>],
    unknowns: Vec<usize>,
    targets: &'a [InitialCondition],
    /// Sorted, deduplicated target abscissae and sensitivity samples.
    points: Vec<f64>,
    /// Column of `points` holding each target.
    target_columns: Vec<usize>,
    stats: IntegrationStats,
}

impl<S: DifferentiableSystem> Shooter<'_, S> {
    fn initial_state(&self, trial: &DVector<f64>) -> Vec<f64> {
        let mut y0: Vec<f64> = self.fixed.iter().map(|v| v.unwrap_or(0.0)).collect();
        for (slot, index) in self.unknowns.iter().enumerate() {
            y0[*index] = trial[slot];
        }
        y0
    }

    /// Integrates from `trial`; the residual is integrated value minus target.
    fn shoot_once(&mut self, trial: &DVector<f64>) -> Result<Shot, SolveError> {
        let y0 = self.initial_state(trial);
        let trajectory = integrate(self.system, self.method, &y0, self.x0, &self.points, self.tol)?;
        self.stats.absorb(&trajectory.stats);
        if trajectory.states.len() != self.points.len() {
            return Err(SolveError::SolverFailure(
                "shooting trajectory is missing sample points".into(),
            ));
        }

        let mut residual = DVector::zeros(self.targets.len());
        let mut profiles = DMatrix::zeros(self.targets.len(), self.points.len());
        for (k, target) in self.targets.iter().enumerate() {
            for (column, state) in trajectory.states.iter().enumerate() {
                profiles[(k, column)] = state[target.state_index];
            }
            residual[k] = profiles[(k, self.target_columns[k])] - target.value;
        }
        Ok(Shot { residual, profiles })
    }

    fn forward_difference(
        &mut self,
        trial: &DVector<f64>,
        base: &Shot,
        perturbation: f64,
    ) -> Result<Sensitivity, SolveError> {
        let m = trial.len();
        let mut jacobian = DMatrix::zeros(base.residual.len(), m);
        let mut peaks = DVector::zeros(base.residual.len());
        for j in 0..m {
            let delta = perturbation * trial[j].abs().max(1.0);
            let mut shifted = trial.clone();
            shifted[j] += delta;
            let shot = self.shoot_once(&shifted)?;
            jacobian.set_column(j, &((&shot.residual - &base.residual) / delta));
            for k in 0..peaks.len() {
                let change = (shot.profiles.row(k) - base.profiles.row(k)).amax() / delta;
                peaks[k] = f64::max(peaks[k], change);
            }
        }
        Ok(Sensitivity { jacobian, peaks })
    }

    /// Residual small against each target and Newton correction small against each unknown.
    fn converged(
        &self,
        r: &DVector<f64>,
        trial: &DVector<f64>,
        step: &DVector<f64>,
        tolerance: f64,
    ) -> bool {
        let residual_small = r
            .iter()
            .zip(self.targets)
            .all(|(rk, t)| rk.is_finite() && rk.abs() <= tolerance * (1.0 + t.value.abs()));
        let step_small = step
            .iter()
            .zip(trial.iter())
            .all(|(dj, sj)| dj.is_finite() && dj.abs() <= tolerance * (1.0 + sj.abs()));
        residual_small && step_small
    }
}

/// Why `jacobian` cannot be trusted, if it cannot.
fn singularity(jacobian: &DMatrix<f64>, peaks: &DVector<f64>) -> Option<String> {
    for (k, peak) in peaks.iter().enumerate() {
        let reach = jacobian.row(k).amax();
        if !(reach.is_finite() && reach > INSENSITIVE_RATIO * peak) {
            return Some(format!(
                "condition {k} moves by {reach:.3e} per unit change of the unknowns \
                 while its component moves by up to {peak:.3e} along the trajectory"
            ));
        }
    }
    let singular_values = jacobian.clone().singular_values();
    let largest = singular_values.iter().fold(0.0f64, |a, s| a.max(*s));
    let smallest = singular_values.iter().fold(f64::INFINITY, |a, s| a.min(*s));
    if !(largest > 0.0 && smallest.is_finite() && smallest >= SINGULAR_RATIO * largest) {
        return Some(format!(
            "smallest singular value {smallest:.3e} against largest {largest:.3e}"
        ));
    }
    None
}

fn ensure_regular(
    jacobian: &DMatrix<f64>,
    peaks: &DVector<f64>,
    iteration: usize,
) -> Result<(), SolveError> {
    if let Some(reason) = singularity(jacobian, peaks) {
        let message = format!(
            "shooting Jacobian is singular at iteration {iteration} ({reason}); \
             the boundary conditions are inconsistent or do not determine the solution"
        );
        error!("{message}");
        return Err(SolveError::SolverFailure(message));
    }
    Ok(())
}

/// Finds the unknown start values that satisfy every condition away from the start.
///
/// Broyden's method seeded with a forward-difference Jacobian; the Jacobian is
/// rebuilt by differences whenever an update fails to reduce the residual or
/// leaves it singular.
pub(crate) fn shoot<S: DifferentiableSystem>(
    system: &S,
    method: IntegrationMethod,
    plan: &ConditionPlan,
    x0: f64,
    tol: &Tolerances,
    settings: &ShootingSettings,
) -> Result<ShootingOutcome, SolveError> {
    let last = plan
        .targets
        .iter()
        .map(|t| t.point)
        .fold(x0, f64::max);
    let mut points: Vec<f64> = (1..=SENSITIVITY_SAMPLES)
        .map(|i| x0 + (last - x0) * i as f64 / SENSITIVITY_SAMPLES as f64)
        .chain(plan.targets.iter().map(|t| t.point))
        .collect();
    points.sort_by(f64::total_cmp);
    points.dedup();
    let target_columns = plan
        .targets
        .iter()
        .map(|t| points.iter().position(|p| *p == t.point))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| SolveError::SolverFailure("target point was not sampled".into()))?;

    let mut shooter = Shooter {
        system,
        method,
        x0,
        tol,
        fixed: &plan.fixed,
        unknowns: plan.unknowns(),
        targets: &plan.targets,
        points,
        target_columns,
        stats: IntegrationStats::default(),
    };
    info!(
        "Shooting for {} unknown initial values against {} conditions",
        shooter.unknowns.len(),
        shooter.targets.len()
    );

    let mut trial = DVector::zeros(shooter.unknowns.len());
    let mut shot = shooter.shoot_once(&trial)?;
    let Sensitivity {
        jacobian: mut jac,
        mut peaks,
    } = shooter.forward_difference(&trial, &shot, settings.perturbation)?;

    for iteration in 0..=settings.max_iterations {
        ensure_regular(&jac, &peaks, iteration)?;
        let step = jac
            .clone()
            .lu()
            .solve(&(-&shot.residual))
            .ok_or_else(|| SolveError::SolverFailure("shooting Jacobian is singular".into()))?;
        debug!(
            "Shooting iteration {iteration}: |residual| = {:.3e}, |step| = {:.3e}",
            shot.residual.norm(),
            step.norm()
        );
        if shooter.converged(&shot.residual, &trial, &step, settings.tolerance) {
            info!("Shooting converged after {iteration} iterations");
            return Ok(ShootingOutcome {
                initial_state: shooter.initial_state(&trial),
                iterations: iteration,
                stats: shooter.stats,
            });
        }
        if iteration == settings.max_iterations {
            break;
        }

        let next = &trial + &step;
        let next_shot = shooter.shoot_once(&next)?;
        let step_norm = step.norm_squared();
        if step_norm > 0.0 {
            let predicted = &jac * &step;
            jac += ((&next_shot.residual - &shot.residual) - predicted) * step.transpose() / step_norm;
        }
        if next_shot.residual.norm() >= shot.residual.norm() || singularity(&jac, &peaks).is_some() {
            debug!("Broyden update rejected; rebuilding the shooting Jacobian");
            let rebuilt = shooter.forward_difference(&next, &next_shot, settings.perturbation)?;
            jac = rebuilt.jacobian;
            peaks = rebuilt.peaks;
        }
        trial = next;
        shot = next_shot;
    }

    let message = format!(
        "shooting did not converge within {} iterations (|residual| = {:.3e})",
        settings.max_iterations,
        shot.residual.norm()
    );
    error!("{message}");
    Err(SolveError::SolverFailure(message))
}
