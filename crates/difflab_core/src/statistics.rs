//! Descriptive statistics and residual metrics of solver output.
//!
//! Everything here is a pure function of a [`SolveResult`]; trajectories are
//! summarized through their first state component, fields over the grid.

use crate::equation_engine::CompiledExpression;
use crate::error::{Location, SolveError};
use crate::ode::OdeSystem;
use crate::traits::DynamicalSystem;
use crate::types::{SolutionData, SolveResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    Rms,
    Std,
    Max,
    Min,
    Integral,
    ZeroCrossings,
    Period,
    Amplitude,
    Energy,
}

impl Statistic {
    pub const ALL: [Statistic; 10] = [
        Statistic::Mean,
        Statistic::Rms,
        Statistic::Std,
        Statistic::Max,
        Statistic::Min,
        Statistic::Integral,
        Statistic::ZeroCrossings,
        Statistic::Period,
        Statistic::Amplitude,
        Statistic::Energy,
    ];
}

/// Requested statistics; an empty request means all of them.
fn selection(selected: &[Statistic]) -> BTreeSet<Statistic> {
    if selected.is_empty() {
        Statistic::ALL.into_iter().collect()
    } else {
        selected.iter().copied().collect()
    }
}

/// Mismatch between the solved derivative and the right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResidualMetrics {
    pub max: f64,
    pub mean: f64,
    pub rms: f64,
    pub function_evaluations: usize,
    pub jacobian_evaluations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extremum {
    pub value: f64,
    pub x: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

/// Oscillator energy with unit mass and frequency: `y[0]` position, `y[1]` velocity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Energy {
    pub kinetic_initial: f64,
    pub potential_initial: f64,
    pub total_initial: f64,
    pub kinetic_mean: f64,
    pub potential_mean: f64,
    pub total_mean: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrajectoryStatistics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Extremum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Extremum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integral: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zero_crossings: Option<usize>,
    /// Mean peak spacing; absent when fewer than two peaks are found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amplitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<Energy>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldStatistics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Extremum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Extremum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integral: Option<f64>,
    /// Sign changes along every grid row and column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zero_crossings: Option<usize>,
    /// Period along the central row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_x: Option<f64>,
    /// Period along the central column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amplitude: Option<f64>,
    /// Dirichlet energy `½∬|∇u|²`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatisticsSummary {
    Trajectory(TrajectoryStatistics),
    Field(FieldStatistics),
}

pub fn summarize(result: &SolveResult, selected: &[Statistic]) -> StatisticsSummary {
    let summary = match &result.data {
        SolutionData::Trajectory { x, states } => {
            StatisticsSummary::Trajectory(trajectory_statistics(x, states, selected))
        }
        SolutionData::Field { x, y, values } => {
            StatisticsSummary::Field(field_statistics(x, y, values, selected))
        }
    };
    debug!("Computed statistics: {summary:?}");
    summary
}

pub fn trajectory_statistics(
    x: &[f64],
    states: &[Vec<f64>],
    selected: &[Statistic],
) -> TrajectoryStatistics {
    let wanted = selection(selected);
    let primary: Vec<f64> = states
        .iter()
        .map(|s| s.first().copied().unwrap_or(f64::NAN))
        .collect();
    if primary.is_empty() {
        return TrajectoryStatistics::default();
    }
    let span = x[x.len() - 1] - x[0];
    let want = |s: Statistic| wanted.contains(&s);

    let mut out = TrajectoryStatistics::default();
    if want(Statistic::Mean) {
        out.mean = Some(if span == 0.0 {
            plain_mean(&primary)
        } else {
            trapezoid(x, &primary) / span
        });
    }
    if want(Statistic::Rms) {
        let squares: Vec<f64> = primary.iter().map(|v| v * v).collect();
        out.rms = Some(
            if span == 0.0 {
                plain_mean(&squares)
            } else {
                trapezoid(x, &squares) / span
            }
            .sqrt(),
        );
    }
    if want(Statistic::Std) {
        out.std = Some(std_dev(&primary));
    }
    if want(Statistic::Max) {
        out.max = arg_extremum(&primary, |a, b| a > b).map(|i| Extremum {
            value: primary[i],
            x: x[i],
            y: None,
        });
    }
    if want(Statistic::Min) {
        out.min = arg_extremum(&primary, |a, b| a < b).map(|i| Extremum {
            value: primary[i],
            x: x[i],
            y: None,
        });
    }
    if want(Statistic::Integral) {
        out.integral = Some(trapezoid(x, &primary));
    }
    if want(Statistic::ZeroCrossings) {
        out.zero_crossings = Some(zero_crossings(&primary));
    }
    if want(Statistic::Period) {
        out.period = estimate_period(x, &primary);
    }
    if want(Statistic::Amplitude) {
        out.amplitude = Some(amplitude(&primary));
    }
    if want(Statistic::Energy) && states[0].len() >= 2 {
        out.energy = Some(oscillator_energy(states));
    }
    out
}

/// Statistics of `values[j][i]` sampled at `(x[i], y[j])`.
pub fn field_statistics(
    x: &[f64],
    y: &[f64],
    values: &[Vec<f64>],
    selected: &[Statistic],
) -> FieldStatistics {
    let wanted = selection(selected);
    let want = |s: Statistic| wanted.contains(&s);
    let flat: Vec<f64> = values.iter().flatten().copied().collect();
    if flat.is_empty() || x.len() < 2 || y.len() < 2 {
        return FieldStatistics::default();
    }
    let area = (x[x.len() - 1] - x[0]) * (y[y.len() - 1] - y[0]);
    let nx = x.len();

    let mut out = FieldStatistics::default();
    if want(Statistic::Mean) {
        out.mean = Some(double_trapezoid(x, y, values) / area);
    }
    if want(Statistic::Rms) {
        let squares: Vec<Vec<f64>> = values
            .iter()
            .map(|row| row.iter().map(|v| v * v).collect())
            .collect();
        out.rms = Some((double_trapezoid(x, y, &squares) / area).sqrt());
    }
    if want(Statistic::Std) {
        out.std = Some(std_dev(&flat));
    }
    let locate = |k: usize| Extremum {
        value: flat[k],
        x: x[k % nx],
        y: Some(y[k / nx]),
    };
    if want(Statistic::Max) {
        out.max = arg_extremum(&flat, |a, b| a > b).map(locate);
    }
    if want(Statistic::Min) {
        out.min = arg_extremum(&flat, |a, b| a < b).map(locate);
    }
    if want(Statistic::Integral) {
        out.integral = Some(double_trapezoid(x, y, values));
    }
    if want(Statistic::ZeroCrossings) {
        let along_rows: usize = values.iter().map(|row| zero_crossings(row)).sum();
        let along_columns: usize = (0..nx).map(|i| zero_crossings(&column(values, i))).sum();
        out.zero_crossings = Some(along_rows + along_columns);
    }
    if want(Statistic::Period) {
        out.period_x = estimate_period(x, &values[y.len() / 2]);
        out.period_y = estimate_period(y, &column(values, nx / 2));
    }
    if want(Statistic::Amplitude) {
        out.amplitude = Some(amplitude(&flat));
    }
    if want(Statistic::Energy) {
        out.energy = Some(dirichlet_energy(x, y, values));
    }
    out
}

/// Compares the sampled derivative of an ODE solution with its right-hand side.
///
/// The per-sample residual is the Euclidean norm over the whole first-order
/// state; derivatives come from second-order finite differences.
pub fn ode_residual(
    result: &SolveResult,
    order: usize,
    equations: &[CompiledExpression],
) -> Result<ResidualMetrics, SolveError> {
    let (x, states) = match &result.data {
        SolutionData::Trajectory { x, states } => (x, states),
        SolutionData::Field { .. } => {
            return Err(SolveError::validation(
                "residual metrics need a trajectory, not a field",
            ))
        }
    };
    let mut metrics = ResidualMetrics {
        function_evaluations: result.meta.function_evaluations,
        jacobian_evaluations: result.meta.jacobian_evaluations,
        ..ResidualMetrics::default()
    };
    let dim = states.first().map_or(0, Vec::len);
    if x.len() < 2 || dim == 0 {
        return Ok(metrics);
    }

    let derivatives: Vec<Vec<f64>> = (0..dim)
        .map(|d| {
            let component: Vec<f64> = states.iter().map(|s| s[d]).collect();
            gradient(x, &component)
        })
        .collect();

    let system = OdeSystem::new(order, equations);
    let mut rhs = vec![0.0; dim];
    let mut residuals = Vec::with_capacity(x.len());
    for (i, (xi, state)) in x.iter().zip(states).enumerate() {
        system
            .apply(*xi, state, &mut rhs)
            .map_err(|source| SolveError::Evaluation {
                location: Location::Point { x: *xi },
                source,
            })?;
        let norm = rhs
            .iter()
            .enumerate()
            .map(|(d, f)| (f - derivatives[d][i]).powi(2))
            .sum::<f64>()
            .sqrt();
        residuals.push(norm);
    }

    metrics.max = residuals.iter().fold(0.0, |a: f64, r| a.max(*r));
    metrics.mean = plain_mean(&residuals);
    metrics.rms = (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt();
    Ok(metrics)
}

fn plain_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_dev(values: &[f64]) -> f64 {
    let mean = plain_mean(values);
    plain_mean(&values.iter().map(|v| (v - mean).powi(2)).collect::<Vec<_>>()).sqrt()
}

/// First index whose value beats every other under `better`.
fn arg_extremum(values: &[f64], better: impl Fn(f64, f64) -> bool) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, v) in values.iter().enumerate() {
        match best {
            Some(b) if !better(*v, values[b]) => {}
            _ => best = Some(i),
        }
    }
    best
}

fn amplitude(values: &[f64]) -> f64 {
    let max = values.iter().fold(f64::NEG_INFINITY, |a, v| a.max(*v));
    let min = values.iter().fold(f64::INFINITY, |a, v| a.min(*v));
    (max - min) / 2.0
}

pub(crate) fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
        .sum()
}

fn column(values: &[Vec<f64>], i: usize) -> Vec<f64> {
    values.iter().map(|row| row[i]).collect()
}

fn double_trapezoid(x: &[f64], y: &[f64], values: &[Vec<f64>]) -> f64 {
    let rows: Vec<f64> = values.iter().map(|row| trapezoid(x, row)).collect();
    trapezoid(y, &rows)
}

/// Sample derivative: second-order central differences inside, one-sided at the ends.
pub(crate) fn gradient(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = y.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mut out = vec![0.0; n];
    out[0] = (y[1] - y[0]) / (x[1] - x[0]);
    out[n - 1] = (y[n - 1] - y[n - 2]) / (x[n - 1] - x[n - 2]);
    for i in 1..n - 1 {
        let h0 = x[i] - x[i - 1];
        let h1 = x[i + 1] - x[i];
        out[i] = (h0 * h0 * y[i + 1] - h1 * h1 * y[i - 1] + (h1 * h1 - h0 * h0) * y[i])
            / (h0 * h1 * (h0 + h1));
    }
    out
}

/// Number of adjacent samples whose signs differ, zero counting as its own sign.
fn zero_crossings(values: &[f64]) -> usize {
    let sign = |v: f64| {
        if v > 0.0 {
            1
        } else if v < 0.0 {
            -1
        } else {
            0
        }
    };
    values
        .windows(2)
        .filter(|w| sign(w[0]) != sign(w[1]))
        .count()
}

/// Local maxima of `values`, thinned so no two are closer than `distance` samples.
///
/// Flat tops report their middle sample; taller peaks win when thinning.
fn find_peaks(values: &[f64], distance: usize) -> Vec<usize> {
    let n = values.len();
    let mut candidates = Vec::new();
    let mut i = 1;
    while i + 1 < n {
        if values[i - 1] < values[i] {
            let mut j = i;
            while j + 1 < n && values[j + 1] == values[i] {
                j += 1;
            }
            if j + 1 < n && values[j + 1] < values[i] {
                candidates.push((i + j) / 2);
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }

    let mut by_height = candidates.clone();
    by_height.sort_by(|a, b| values[*b].total_cmp(&values[*a]));
    let mut kept: Vec<usize> = Vec::new();
    for peak in by_height {
        if kept.iter().all(|k| k.abs_diff(peak) >= distance) {
            kept.push(peak);
        }
    }
    kept.sort_unstable();
    kept
}

/// Mean spacing between peaks of the mean-centred signal.
fn estimate_period(x: &[f64], values: &[f64]) -> Option<f64> {
    let mean = plain_mean(values);
    let centred: Vec<f64> = values.iter().map(|v| v - mean).collect();
    let peaks = find_peaks(&centred, (values.len() / 50).max(3));
    if peaks.len() < 2 {
        return None;
    }
    let spacings: Vec<f64> = peaks.windows(2).map(|p| x[p[1]] - x[p[0]]).collect();
    Some(plain_mean(&spacings))
}

fn oscillator_energy(states: &[Vec<f64>]) -> Energy {
    let kinetic: Vec<f64> = states.iter().map(|s| 0.5 * s[1] * s[1]).collect();
    let potential: Vec<f64> = states.iter().map(|s| 0.5 * s[0] * s[0]).collect();
    let total: Vec<f64> = kinetic.iter().zip(&potential).map(|(k, p)| k + p).collect();
    Energy {
        kinetic_initial: kinetic[0],
        potential_initial: potential[0],
        total_initial: total[0],
        kinetic_mean: plain_mean(&kinetic),
        potential_mean: plain_mean(&potential),
        total_mean: plain_mean(&total),
    }
}

fn dirichlet_energy(x: &[f64], y: &[f64], values: &[Vec<f64>]) -> f64 {
    let ux: Vec<Vec<f64>> = values.iter().map(|row| gradient(x, row)).collect();
    let uy_columns: Vec<Vec<f64>> = (0..x.len()).map(|i| gradient(y, &column(values, i))).collect();
    let density: Vec<Vec<f64>> = (0..y.len())
        .map(|j| {
            (0..x.len())
                .map(|i| 0.5 * (ux[j][i].powi(2) + uy_columns[i][j].powi(2)))
                .collect()
        })
        .collect();
    double_trapezoid(x, y, &density)
}
