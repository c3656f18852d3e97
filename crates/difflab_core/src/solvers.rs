//! Adaptive-step integration of first-order systems.
//!
//! [`integrate`] drives a [`Steppable`] method across a set of output
//! abscissae, truncating steps so every output is hit exactly.

mod explicit;
mod implicit;

pub use explicit::{ExplicitRk, Tableau, DOPRI5, RK23, TSIT5};
pub use implicit::Sdirk21;

use crate::autodiff::Dual;
use crate::error::{EvalError, Location, SolveError};
use crate::traits::DynamicalSystem;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A system that can be evaluated in `f64` and differentiated with dual numbers.
pub trait DifferentiableSystem: DynamicalSystem<f64> + DynamicalSystem<Dual> {}

impl<S: DynamicalSystem<f64> + DynamicalSystem<Dual>> DifferentiableSystem for S {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntegrationMethod {
    /// Bogacki–Shampine 3(2).
    Rk23,
    /// Dormand–Prince 5(4).
    Rk45,
    /// Tsitouras 5(4).
    #[serde(alias = "DOP853")]
    Tsit5,
    /// Two-stage L-stable SDIRK of order 2 with an embedded first-order estimate.
    #[serde(alias = "RADAU", alias = "BDF")]
    Sdirk21,
    /// Dormand–Prince until stiffness is detected, then SDIRK21.
    #[serde(alias = "LSODA")]
    Auto,
}

impl IntegrationMethod {
    pub const ALL: [IntegrationMethod; 5] = [
        IntegrationMethod::Rk23,
        IntegrationMethod::Rk45,
        IntegrationMethod::Tsit5,
        IntegrationMethod::Sdirk21,
        IntegrationMethod::Auto,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IntegrationMethod::Rk23 => "RK23",
            IntegrationMethod::Rk45 => "RK45",
            IntegrationMethod::Tsit5 => "TSIT5",
            IntegrationMethod::Sdirk21 => "SDIRK21",
            IntegrationMethod::Auto => "AUTO",
        }
    }

    pub fn is_implicit(self) -> bool {
        matches!(self, IntegrationMethod::Sdirk21)
    }
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IntegrationMethod {
    type Err = SolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.trim().to_ascii_uppercase().as_str() {
            "RK23" => IntegrationMethod::Rk23,
            "RK45" => IntegrationMethod::Rk45,
            "TSIT5" | "DOP853" => IntegrationMethod::Tsit5,
            "SDIRK21" | "RADAU" | "BDF" => IntegrationMethod::Sdirk21,
            "AUTO" | "LSODA" => IntegrationMethod::Auto,
            other => {
                return Err(SolveError::validation(format!(
                    "unknown integration method '{other}'"
                )))
            }
        };
        Ok(method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    pub rtol: f64,
    pub atol: f64,
    /// Largest step allowed; `None` or non-positive means unlimited.
    pub max_step: Option<f64>,
    /// Attempted-step budget per integration.
    pub max_steps: usize,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            atol: 1e-10,
            max_step: None,
            max_steps: 1_000_000,
        }
    }
}

impl Tolerances {
    pub fn validate(&self) -> Result<(), SolveError> {
        if !(self.rtol.is_finite() && self.rtol > 0.0) {
            return Err(SolveError::validation("rtol must be positive and finite"));
        }
        if !(self.atol.is_finite() && self.atol > 0.0) {
            return Err(SolveError::validation("atol must be positive and finite"));
        }
        if self.max_step.is_some_and(|m| !m.is_finite()) {
            return Err(SolveError::validation("max_step must be finite"));
        }
        if self.max_steps == 0 {
            return Err(SolveError::validation("max_steps must be greater than zero"));
        }
        Ok(())
    }

    fn scale(&self, a: f64, b: f64) -> f64 {
        self.atol + self.rtol * a.abs().max(b.abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub function_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub lu_decompositions: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub stiffness_switch_at: Option<f64>,
}

impl IntegrationStats {
    /// Adds another run's counters; keeps the first recorded stiffness switch.
    pub fn absorb(&mut self, other: &IntegrationStats) {
        self.function_evaluations += other.function_evaluations;
        self.jacobian_evaluations += other.jacobian_evaluations;
        self.lu_decompositions += other.lu_decompositions;
        self.accepted_steps += other.accepted_steps;
        self.rejected_steps += other.rejected_steps;
        self.stiffness_switch_at = self.stiffness_switch_at.or(other.stiffness_switch_at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum IntegrationError {
    #[error("right-hand side failed at x = {x}: {source}")]
    Evaluation {
        x: f64,
        #[source]
        source: EvalError,
    },
    #[error("step size collapsed to {h:e} at x = {x}")]
    StepSizeTooSmall { x: f64, h: f64 },
    #[error("step budget of {steps} exhausted at x = {x}")]
    StepBudgetExhausted { x: f64, steps: usize },
}

impl From<IntegrationError> for SolveError {
    fn from(err: IntegrationError) -> Self {
        match err {
            IntegrationError::Evaluation { x, source } => SolveError::Evaluation {
                location: Location::Point { x },
                source,
            },
            other => SolveError::SolverFailure(other.to_string()),
        }
    }
}

/// Result of one attempted step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Scaled RMS of the embedded error estimate; accept when `<= 1`.
    pub error_norm: f64,
    /// False when an implicit stage solve failed.
    pub converged: bool,
}

/// A one-step method with an embedded error estimate.
pub trait Steppable {
    /// Order `q` of the error estimate; the controller uses exponent `1/(q+1)`.
    fn error_order(&self) -> usize;

    /// Attempts a step of size `h` from `(x, state)` and writes the candidate to `out`.
    #[allow(clippy::too_many_arguments)]
    fn attempt<S: DifferentiableSystem>(
        &mut self,
        system: &S,
        x: f64,
        state: &[f64],
        h: f64,
        tol: &Tolerances,
        out: &mut [f64],
        stats: &mut IntegrationStats,
    ) -> Result<StepOutcome, IntegrationError>;

    /// Called after the driver accepts the last attempted step, landing at `x`.
    fn accept(&mut self, x: f64, stats: &mut IntegrationStats);
}

pub(crate) fn rhs<S: DifferentiableSystem>(
    system: &S,
    x: f64,
    state: &[f64],
    out: &mut [f64],
    stats: &mut IntegrationStats,
) -> Result<(), IntegrationError> {
    stats.function_evaluations += 1;
    <S as DynamicalSystem<f64>>::apply(system, x, state, out)
        .map_err(|source| IntegrationError::Evaluation { x, source })
}

/// Root-mean-square of `values[i] / scale(i)`.
pub(crate) fn scaled_rms(values: impl Iterator<Item = (f64, f64)>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (value, scale) in values {
        let r = value / scale;
        sum += r * r;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

/// Hard-coded stiffness detection thresholds for the automatic method.
const STIFF_RATIO: f64 = 3.25;
const STIFF_HITS_TO_SWITCH: usize = 15;
const NONSTIFF_HITS_TO_RESET: usize = 6;

/// Dormand–Prince with a one-way switch to SDIRK21 on persistent stiffness.
pub struct AutoSwitching {
    explicit: ExplicitRk,
    implicit: Sdirk21,
    stiff: bool,
    stiff_hits: usize,
    nonstiff_hits: usize,
}

impl AutoSwitching {
    pub fn new(dim: usize) -> Self {
        Self {
            explicit: ExplicitRk::new(&DOPRI5, dim),
            implicit: Sdirk21::new(dim),
            stiff: false,
            stiff_hits: 0,
            nonstiff_hits: 0,
        }
    }

    pub fn is_stiff(&self) -> bool {
        self.stiff
    }
}

impl Steppable for AutoSwitching {
    fn error_order(&self) -> usize {
        if self.stiff {
            self.implicit.error_order()
        } else {
            self.explicit.error_order()
        }
    }

    fn attempt<S: DifferentiableSystem>(
        &mut self,
        system: &S,
        x: f64,
        state: &[f64],
        h: f64,
        tol: &Tolerances,
        out: &mut [f64],
        stats: &mut IntegrationStats,
    ) -> Result<StepOutcome, IntegrationError> {
        if self.stiff {
            self.implicit.attempt(system, x, state, h, tol, out, stats)
        } else {
            self.explicit.attempt(system, x, state, h, tol, out, stats)
        }
    }

    fn accept(&mut self, x: f64, stats: &mut IntegrationStats) {
        if self.stiff {
            self.implicit.accept(x, stats);
            return;
        }
        self.explicit.accept(x, stats);
        match self.explicit.stiffness_ratio() {
            Some(ratio) if ratio > STIFF_RATIO => {
                self.nonstiff_hits = 0;
                self.stiff_hits += 1;
                if self.stiff_hits >= STIFF_HITS_TO_SWITCH {
                    warn!("Stiffness detected at x = {x}; switching to SDIRK21");
                    self.stiff = true;
                    stats.stiffness_switch_at = Some(x);
                }
            }
            Some(_) => {
                self.nonstiff_hits += 1;
                if self.nonstiff_hits >= NONSTIFF_HITS_TO_RESET {
                    self.stiff_hits = 0;
                }
            }
            None => {}
        }
    }
}

enum Stepper {
    Explicit(ExplicitRk),
    Implicit(Sdirk21),
    Auto(AutoSwitching),
}

impl Stepper {
    fn new(method: IntegrationMethod, dim: usize) -> Self {
        match method {
            IntegrationMethod::Rk23 => Stepper::Explicit(ExplicitRk::new(&RK23, dim)),
            IntegrationMethod::Rk45 => Stepper::Explicit(ExplicitRk::new(&DOPRI5, dim)),
            IntegrationMethod::Tsit5 => Stepper::Explicit(ExplicitRk::new(&TSIT5, dim)),
            IntegrationMethod::Sdirk21 => Stepper::Implicit(Sdirk21::new(dim)),
            IntegrationMethod::Auto => Stepper::Auto(AutoSwitching::new(dim)),
        }
    }
}

impl Steppable for Stepper {
    fn error_order(&self) -> usize {
        match self {
            Stepper::Explicit(s) => s.error_order(),
            Stepper::Implicit(s) => s.error_order(),
            Stepper::Auto(s) => s.error_order(),
        }
    }

    fn attempt<S: DifferentiableSystem>(
        &mut self,
        system: &S,
        x: f64,
        state: &[f64],
        h: f64,
        tol: &Tolerances,
        out: &mut [f64],
        stats: &mut IntegrationStats,
    ) -> Result<StepOutcome, IntegrationError> {
        match self {
            Stepper::Explicit(s) => s.attempt(system, x, state, h, tol, out, stats),
            Stepper::Implicit(s) => s.attempt(system, x, state, h, tol, out, stats),
            Stepper::Auto(s) => s.attempt(system, x, state, h, tol, out, stats),
        }
    }

    fn accept(&mut self, x: f64, stats: &mut IntegrationStats) {
        match self {
            Stepper::Explicit(s) => s.accept(x, stats),
            Stepper::Implicit(s) => s.accept(x, stats),
            Stepper::Auto(s) => s.accept(x, stats),
        }
    }
}

/// States recorded at the requested output abscissae.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub x: Vec<f64>,
    pub states: Vec<Vec<f64>>,
    pub stats: IntegrationStats,
}

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

fn minimum_step(x: f64) -> f64 {
    16.0 * f64::EPSILON * x.abs().max(1.0)
}

#[allow(clippy::too_many_arguments)]
fn initial_step<S: DifferentiableSystem>(
    system: &S,
    x0: f64,
    y0: &[f64],
    f0: &[f64],
    order: usize,
    tol: &Tolerances,
    h_max: f64,
    stats: &mut IntegrationStats,
) -> Result<f64, IntegrationError> {
    let scale: Vec<f64> = y0.iter().map(|y| tol.scale(*y, *y)).collect();
    let d0 = scaled_rms(y0.iter().copied().zip(scale.iter().copied()));
    let d1 = scaled_rms(f0.iter().copied().zip(scale.iter().copied()));
    let h0 = (if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    })
    .min(h_max);

    let y1: Vec<f64> = y0.iter().zip(f0).map(|(y, f)| y + h0 * f).collect();
    let mut f1 = vec![0.0; y0.len()];
    rhs(system, x0 + h0, &y1, &mut f1, stats)?;
    let d2 = scaled_rms(
        f1.iter()
            .zip(f0)
            .map(|(a, b)| a - b)
            .zip(scale.iter().copied()),
    ) / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / (order as f64 + 1.0))
    };
    Ok((100.0 * h0).min(h1).min(h_max))
}

/// Integrates `system` from `(x0, y0)` and records the state at each of `outputs`.
///
/// `outputs` must be non-decreasing and not before `x0`; outputs equal to `x0`
/// record the initial state.
pub fn integrate<S: DifferentiableSystem>(
    system: &S,
    method: IntegrationMethod,
    y0: &[f64],
    x0: f64,
    outputs: &[f64],
    tol: &Tolerances,
) -> Result<Trajectory, IntegrationError> {
    let dim = y0.len();
    let mut stats = IntegrationStats::default();
    let mut xs = Vec::with_capacity(outputs.len());
    let mut states = Vec::with_capacity(outputs.len());

    let mut next = 0;
    while next < outputs.len() && outputs[next] <= x0 {
        xs.push(outputs[next]);
        states.push(y0.to_vec());
        next += 1;
    }
    let Some(&end) = outputs.last() else {
        return Ok(Trajectory { x: xs, states, stats });
    };
    if next == outputs.len() {
        return Ok(Trajectory { x: xs, states, stats });
    }

    let span = end - x0;
    let h_max = tol
        .max_step
        .filter(|m| *m > 0.0)
        .map_or(span, |m| m.min(span));

    let mut stepper = Stepper::new(method, dim);
    let mut x = x0;
    let mut y = y0.to_vec();
    let mut y_new = vec![0.0; dim];

    let mut f0 = vec![0.0; dim];
    rhs(system, x, &y, &mut f0, &mut stats)?;
    let mut h = initial_step(
        system,
        x,
        &y,
        &f0,
        stepper.error_order(),
        tol,
        h_max,
        &mut stats,
    )?;

    let mut attempts = 0usize;
    let mut last_rejected = false;

    while next < outputs.len() {
        let target = outputs[next];
        let h_min = minimum_step(x);
        if attempts >= tol.max_steps {
            return Err(IntegrationError::StepBudgetExhausted {
                x,
                steps: tol.max_steps,
            });
        }

        let mut h_try = h.min(h_max);
        let landing = x + h_try >= target - h_min;
        if landing {
            h_try = target - x;
        }
        attempts += 1;

        let outcome = stepper.attempt(system, x, &y, h_try, tol, &mut y_new, &mut stats)?;
        let exponent = -1.0 / (stepper.error_order() as f64 + 1.0);

        if outcome.converged && outcome.error_norm <= 1.0 {
            x = if landing { target } else { x + h_try };
            std::mem::swap(&mut y, &mut y_new);
            stats.accepted_steps += 1;
            stepper.accept(x, &mut stats);
            while next < outputs.len() && outputs[next] <= x {
                xs.push(outputs[next]);
                states.push(y.clone());
                next += 1;
            }

            let mut factor = if outcome.error_norm == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * outcome.error_norm.powf(exponent)).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            if last_rejected {
                factor = factor.min(1.0);
            }
            last_rejected = false;
            let proposed = h_try * factor;
            h = if landing { h.max(proposed) } else { proposed };
        } else {
            stats.rejected_steps += 1;
            let factor = if !outcome.converged {
                0.5
            } else if outcome.error_norm.is_finite() {
                (SAFETY * outcome.error_norm.powf(exponent)).clamp(MIN_FACTOR, 1.0)
            } else {
                MIN_FACTOR
            };
            h = h_try * factor;
            last_rejected = true;
            debug!(
                "Rejected step at x = {x}: h = {h_try:e}, error = {:.3e}, converged = {}",
                outcome.error_norm, outcome.converged
            );
            if h < h_min {
                return Err(IntegrationError::StepSizeTooSmall { x, h });
            }
        }
    }

    Ok(Trajectory {
        x: xs,
        states,
        stats,
    })
}
