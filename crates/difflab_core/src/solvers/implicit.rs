use super::{
    rhs, scaled_rms, DifferentiableSystem, IntegrationError, IntegrationStats, StepOutcome,
    Steppable, Tolerances,
};
use crate::autodiff::jacobian;
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

/// Diagonal coefficient of the L-stable two-stage SDIRK.
const GAMMA: f64 = 1.0 - std::f64::consts::FRAC_1_SQRT_2;
const MAX_NEWTON_ITERATIONS: usize = 8;
/// Newton stops once the scaled stage correction falls below this.
const NEWTON_TOLERANCE: f64 = 0.01;

/// Two-stage, stiffly accurate SDIRK of order 2.
///
/// Stages solve `k_i = f(x + c_i h, y + h sum_j a_ij k_j)` by simplified Newton
/// with the matrix `I - h γ J`, `J` taken once per step from dual-number sweeps.
/// The embedded first-order solution is `y + h k1`.
pub struct Sdirk21 {
    jacobian: Option<DMatrix<f64>>,
    factorization: Option<(f64, LU<f64, Dyn, Dyn>)>,
    k1: Vec<f64>,
    k2: Vec<f64>,
    base: Vec<f64>,
    stage: Vec<f64>,
    residual: Vec<f64>,
    first_stage_ready: bool,
}

impl Sdirk21 {
    pub fn new(dim: usize) -> Self {
        Self {
            jacobian: None,
            factorization: None,
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            base: vec![0.0; dim],
            stage: vec![0.0; dim],
            residual: vec![0.0; dim],
            first_stage_ready: false,
        }
    }
}

struct NewtonContext<'a> {
    lu: &'a LU<f64, Dyn, Dyn>,
    hg: f64,
    tol: &'a Tolerances,
}

impl NewtonContext<'_> {
    /// Solves `k = f(xs, base + hγ k)` in place; returns false on divergence.
    #[allow(clippy::too_many_arguments)]
    fn solve<S: DifferentiableSystem>(
        &self,
        system: &S,
        xs: f64,
        base: &[f64],
        k: &mut [f64],
        stage: &mut [f64],
        residual: &mut [f64],
        stats: &mut IntegrationStats,
    ) -> Result<bool, IntegrationError> {
        let mut previous = f64::INFINITY;
        for _ in 0..MAX_NEWTON_ITERATIONS {
            for d in 0..k.len() {
                stage[d] = base[d] + self.hg * k[d];
            }
            rhs(system, xs, stage, residual, stats)?;
            for d in 0..k.len() {
                residual[d] -= k[d];
            }
            let Some(delta) = self.lu.solve(&DVector::from_column_slice(residual)) else {
                return Ok(false);
            };
            for d in 0..k.len() {
                k[d] += delta[d];
            }
            let norm = scaled_rms(
                delta
                    .iter()
                    .enumerate()
                    .map(|(d, dk)| (self.hg * dk, self.tol.scale(stage[d], stage[d]))),
            );
            if !norm.is_finite() || norm > 2.0 * previous {
                return Ok(false);
            }
            if norm < NEWTON_TOLERANCE {
                return Ok(true);
            }
            previous = norm;
        }
        Ok(false)
    }
}

impl Steppable for Sdirk21 {
    fn error_order(&self) -> usize {
        1
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
        let n = state.len();

        if self.jacobian.is_none() {
            let jac = jacobian(system, x, state)
                .map_err(|source| IntegrationError::Evaluation { x, source })?;
            stats.jacobian_evaluations += 1;
            self.jacobian = Some(DMatrix::from_row_slice(n, n, &jac));
        }
        let hg = h * GAMMA;
        let stale = self
            .factorization
            .as_ref()
            .map_or(true, |(factored_hg, _)| *factored_hg != hg);
        if stale {
            let Some(jac) = self.jacobian.as_ref() else {
                return Ok(StepOutcome {
                    error_norm: f64::INFINITY,
                    converged: false,
                });
            };
            let matrix = DMatrix::<f64>::identity(n, n) - jac * hg;
            self.factorization = Some((hg, matrix.lu()));
            stats.lu_decompositions += 1;
        }
        let Some((_, lu)) = self.factorization.as_ref() else {
            return Ok(StepOutcome {
                error_norm: f64::INFINITY,
                converged: false,
            });
        };

        if !self.first_stage_ready {
            rhs(system, x, state, &mut self.k1, stats)?;
            self.first_stage_ready = true;
        }
        // k1 enters holding f(x, y) as the predictor.
        let newton = NewtonContext { lu, hg, tol };

        self.base.copy_from_slice(state);
        if !newton.solve(
            system,
            x + GAMMA * h,
            &self.base,
            &mut self.k1,
            &mut self.stage,
            &mut self.residual,
            stats,
        )? {
            self.first_stage_ready = false;
            return Ok(StepOutcome {
                error_norm: f64::INFINITY,
                converged: false,
            });
        }

        for d in 0..n {
            self.base[d] = state[d] + h * (1.0 - GAMMA) * self.k1[d];
        }
        self.k2.copy_from_slice(&self.k1);
        if !newton.solve(
            system,
            x + h,
            &self.base,
            &mut self.k2,
            &mut self.stage,
            &mut self.residual,
            stats,
        )? {
            self.first_stage_ready = false;
            return Ok(StepOutcome {
                error_norm: f64::INFINITY,
                converged: false,
            });
        }

        for d in 0..n {
            out[d] = state[d] + h * ((1.0 - GAMMA) * self.k1[d] + GAMMA * self.k2[d]);
        }
        let error_norm = scaled_rms((0..n).map(|d| {
            (
                h * GAMMA * (self.k2[d] - self.k1[d]),
                tol.scale(state[d], out[d]),
            )
        }));

        // A rejected step retries from the same point; restore the predictor.
        self.first_stage_ready = false;

        Ok(StepOutcome {
            error_norm,
            converged: true,
        })
    }

    fn accept(&mut self, _x: f64, _stats: &mut IntegrationStats) {
        // Stiffly accurate: k2 = f(x + h, y_new).
        std::mem::swap(&mut self.k1, &mut self.k2);
        self.first_stage_ready = true;
        self.jacobian = None;
        self.factorization = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_makes_the_method_l_stable() {
        // R(z) = (1 + (1 - 2γ) z) / (1 - γ z)^2 tends to zero as z -> -inf.
        let r = |z: f64| (1.0 + (1.0 - 2.0 * GAMMA) * z) / (1.0 - GAMMA * z).powi(2);
        assert!(r(-1e6).abs() < 1e-5);
        assert!(r(-1.0).abs() < 1.0);
        assert!((GAMMA * GAMMA - 2.0 * GAMMA + 0.5).abs() < 1e-15);
    }
}
