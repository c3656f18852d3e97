//! Integral and series transforms of a scalar function `f(x)`.
//!
//! Every transform starts from uniform samples of the compiled function.
//! Spectral transforms use `rustfft`; the Laplace transform integrates the
//! samples with Simpson's rule; Taylor coefficients come from central
//! differences with one Richardson step.

use crate::equation_engine::CompiledExpression;
use crate::error::{Location, SolveError};
use crate::types::{linspace, DomainSpec, TransformResult, TransformView, MAX_POINTS};
use log::info;
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// Sample cap for the coefficient view of the original function.
const ORIGINAL_COEFFICIENT_SAMPLES: usize = 200;
/// Highest Taylor order finite differences resolve usefully in f64.
pub const MAX_TAYLOR_ORDER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Original,
    Fourier,
    Laplace,
    Taylor,
    Hilbert,
    ZTransform,
}

impl TransformKind {
    pub const ALL: [TransformKind; 6] = [
        TransformKind::Original,
        TransformKind::Fourier,
        TransformKind::Laplace,
        TransformKind::Taylor,
        TransformKind::Hilbert,
        TransformKind::ZTransform,
    ];

    pub fn title(self) -> &'static str {
        match self {
            TransformKind::Original => "Original (f(x))",
            TransformKind::Fourier => "Fourier (FFT)",
            TransformKind::Laplace => "Laplace (real axis)",
            TransformKind::Taylor => "Taylor series",
            TransformKind::Hilbert => "Hilbert (discrete)",
            TransformKind::ZTransform => "Z-transform (discrete)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformParams {
    pub taylor_order: usize,
    /// Expansion point; the domain midpoint when absent.
    pub taylor_center: Option<f64>,
    pub laplace_s_min: f64,
    pub laplace_s_max: f64,
    pub laplace_points: usize,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            taylor_order: 5,
            taylor_center: None,
            laplace_s_min: 0.1,
            laplace_s_max: 10.0,
            laplace_points: 200,
        }
    }
}

impl TransformParams {
    pub fn validate(&self) -> Result<(), SolveError> {
        if self.taylor_order > MAX_TAYLOR_ORDER {
            return Err(SolveError::validation(format!(
                "Taylor order must be at most {MAX_TAYLOR_ORDER}, got {}",
                self.taylor_order
            )));
        }
        if self.taylor_center.is_some_and(|c| !c.is_finite()) {
            return Err(SolveError::validation("Taylor center must be finite"));
        }
        DomainSpec::new(self.laplace_s_min, self.laplace_s_max, self.laplace_points)
            .validate()
            .map_err(|err| SolveError::validation(format!("Laplace range: {err}")))
    }
}

/// Applies `kind` to `function` sampled at `domain.points` points and projects it onto `view`.
pub fn transform(
    kind: TransformKind,
    view: TransformView,
    function: &CompiledExpression,
    domain: &DomainSpec,
    params: &TransformParams,
) -> Result<TransformResult, SolveError> {
    domain.validate()?;
    params.validate()?;
    info!(
        "Applying {} transform ({view:?}) over [{}, {}] with {} samples",
        kind.title(),
        domain.start,
        domain.end,
        domain.points
    );

    let n = domain.points;
    let (abscissa, values, x_label, y_label) = match (kind, view) {
        (TransformKind::Original, TransformView::Curve) => {
            let (xs, ys) = sample(function, domain.start, domain.end, n)?;
            (xs, ys, "x".to_string(), "f(x)".to_string())
        }
        (TransformKind::Original, TransformView::Coefficients) => {
            let count = n.min(ORIGINAL_COEFFICIENT_SAMPLES);
            let (_, ys) = sample(function, domain.start, domain.end, count)?;
            (indices(count), ys, "i (sample)".into(), "f(x_i)".into())
        }
        (TransformKind::Fourier | TransformKind::ZTransform, TransformView::Curve) => {
            let (_, ys) = sample(function, domain.start, domain.end, n)?;
            let magnitudes = half_magnitudes(&spectrum(&ys));
            let df = 1.0 / (n as f64 * domain.spacing());
            let freqs = (0..magnitudes.len()).map(|k| k as f64 * df).collect();
            let labels = if kind == TransformKind::Fourier {
                ("Frequency ω", "|F(ω)|")
            } else {
                ("k (index)", "|X[k]|")
            };
            (freqs, magnitudes, labels.0.into(), labels.1.into())
        }
        (TransformKind::Fourier, TransformView::Coefficients) => {
            let (_, ys) = sample(function, domain.start, domain.end, n)?;
            let magnitudes = half_magnitudes(&spectrum(&ys));
            (indices(magnitudes.len()), magnitudes, "k".into(), "|F[k]|".into())
        }
        (TransformKind::ZTransform, TransformView::Coefficients) => {
            let (_, ys) = sample(function, domain.start, domain.end, n)?;
            (indices(ys.len()), ys, "n".into(), "x[n]".into())
        }
        (TransformKind::Hilbert, TransformView::Curve) => {
            let (xs, ys) = sample(function, domain.start, domain.end, n)?;
            (xs, hilbert(&ys), "x".into(), "H[f](x)".into())
        }
        (TransformKind::Hilbert, TransformView::Coefficients) => {
            let (_, ys) = sample(function, domain.start, domain.end, n)?;
            let magnitudes = half_magnitudes(&analytic_spectrum(&ys));
            (indices(magnitudes.len()), magnitudes, "k".into(), "|H[k]|".into())
        }
        (TransformKind::Laplace, view) => {
            let (xs, ys) = sample(function, domain.start, domain.end, n)?;
            let s_values = linspace(params.laplace_s_min, params.laplace_s_max, params.laplace_points);
            let transformed = s_values.iter().map(|s| laplace(&xs, &ys, *s)).collect();
            match view {
                TransformView::Curve => (s_values, transformed, "s (real)".into(), "L(s)".into()),
                TransformView::Coefficients => (
                    indices(params.laplace_points),
                    transformed,
                    "i".into(),
                    "L(s_i)".into(),
                ),
            }
        }
        (TransformKind::Taylor, view) => {
            let center = params
                .taylor_center
                .unwrap_or(0.5 * (domain.start + domain.end));
            let coefficients = taylor_coefficients(function, center, params.taylor_order)?;
            match view {
                TransformView::Curve => {
                    let xs = domain.samples();
                    let ys = xs
                        .iter()
                        .map(|x| {
                            let t = x - center;
                            coefficients.iter().rev().fold(0.0, |acc, c| acc * t + c)
                        })
                        .collect();
                    (xs, ys, "x".into(), format!("Taylor_{}(x)", params.taylor_order))
                }
                TransformView::Coefficients => (
                    indices(coefficients.len()),
                    coefficients,
                    "i".into(),
                    "a_i".into(),
                ),
            }
        }
    };

    Ok(TransformResult {
        view,
        abscissa,
        values,
        x_label,
        y_label,
        title: kind.title().to_string(),
    })
}

fn indices(count: usize) -> Vec<f64> {
    (0..count).map(|i| i as f64).collect()
}

fn evaluate(function: &CompiledExpression, x: f64, stack: &mut Vec<f64>) -> Result<f64, SolveError> {
    function
        .evaluate_with(&[x], &[], stack)
        .map_err(|source| SolveError::Evaluation {
            location: Location::Point { x },
            source,
        })
}

fn sample(
    function: &CompiledExpression,
    start: f64,
    end: f64,
    count: usize,
) -> Result<(Vec<f64>, Vec<f64>), SolveError> {
    if count > MAX_POINTS {
        return Err(SolveError::validation(format!(
            "sample count {count} exceeds the limit of {MAX_POINTS}"
        )));
    }
    let xs = linspace(start, end, count);
    let mut stack = Vec::with_capacity(32);
    let ys = xs
        .iter()
        .map(|x| evaluate(function, *x, &mut stack))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((xs, ys))
}

fn spectrum(values: &[f64]) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = values.iter().map(|v| Complex::new(*v, 0.0)).collect();
    FftPlanner::<f64>::new()
        .plan_fft_forward(buffer.len())
        .process(&mut buffer);
    buffer
}

/// Spectrum of the analytic signal: positive frequencies doubled, negative ones removed.
fn analytic_spectrum(values: &[f64]) -> Vec<Complex<f64>> {
    let mut buffer = spectrum(values);
    let n = buffer.len();
    for (k, bin) in buffer.iter_mut().enumerate() {
        let weight = if k == 0 || (n % 2 == 0 && k == n / 2) {
            1.0
        } else if k < (n + 1) / 2 {
            2.0
        } else {
            0.0
        };
        *bin *= weight;
    }
    buffer
}

fn hilbert(values: &[f64]) -> Vec<f64> {
    let mut buffer = analytic_spectrum(values);
    let n = buffer.len();
    FftPlanner::<f64>::new()
        .plan_fft_inverse(n)
        .process(&mut buffer);
    buffer.iter().map(|c| c.im / n as f64).collect()
}

fn half_magnitudes(spectrum: &[Complex<f64>]) -> Vec<f64> {
    spectrum[..spectrum.len() / 2].iter().map(|c| c.norm()).collect()
}

/// Composite Simpson over uniform samples; an even count closes with one trapezoid.
fn simpson(values: &[f64], h: f64) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let simpson_end = if n % 2 == 1 { n } else { n - 1 };
    let mut sum = 0.0;
    if simpson_end >= 3 {
        sum += values[0] + values[simpson_end - 1];
        for (i, v) in values.iter().enumerate().take(simpson_end - 1).skip(1) {
            sum += if i % 2 == 1 { 4.0 * v } else { 2.0 * v };
        }
        sum *= h / 3.0;
    }
    if simpson_end < n {
        sum += 0.5 * h * (values[n - 2] + values[n - 1]);
    }
    sum
}

/// `∫ f(t) e^{-s t} dt` over the sampled interval.
fn laplace(xs: &[f64], ys: &[f64], s: f64) -> f64 {
    let h = xs.get(1).zip(xs.first()).map_or(0.0, |(b, a)| b - a);
    let integrand: Vec<f64> = xs.iter().zip(ys).map(|(t, f)| f * (-s * t).exp()).collect();
    simpson(&integrand, h)
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Central difference `δ^n f(c) / h^n` on half-step offsets; error `O(h^2)`.
fn central_difference(
    function: &CompiledExpression,
    center: f64,
    order: usize,
    h: f64,
    stack: &mut Vec<f64>,
) -> Result<f64, SolveError> {
    let mut sum = 0.0;
    for k in 0..=order {
        let offset = (order as f64 / 2.0 - k as f64) * h;
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        sum += sign * binomial(order, k) * evaluate(function, center + offset, stack)?;
    }
    Ok(sum / h.powi(order as i32))
}

fn taylor_coefficients(
    function: &CompiledExpression,
    center: f64,
    order: usize,
) -> Result<Vec<f64>, SolveError> {
    let mut stack = Vec::with_capacity(32);
    let mut coefficients = Vec::with_capacity(order + 1);
    let mut factorial = 1.0;
    for n in 0..=order {
        if n > 0 {
            factorial *= n as f64;
        }
        let derivative = if n == 0 {
            evaluate(function, center, &mut stack)?
        } else {
            // Balances O(h^4) truncation against rounding in the n-th difference.
            let h = f64::EPSILON.powf(1.0 / (n as f64 + 4.0)) * center.abs().max(1.0);
            let coarse = central_difference(function, center, n, h, &mut stack)?;
            let fine = central_difference(function, center, n, 0.5 * h, &mut stack)?;
            (4.0 * fine - coarse) / 3.0
        };
        coefficients.push(derivative / factorial);
    }
    Ok(coefficients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::compile;
    use crate::error::ErrorKind;
    use crate::registry::{FunctionSet, Symbols};
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn function(text: &str) -> CompiledExpression {
        compile(text, &Symbols::scalar(), &FunctionSet::standard()).expect("compiles")
    }

    fn run(kind: TransformKind, view: TransformView, text: &str, domain: DomainSpec) -> TransformResult {
        transform(kind, view, &function(text), &domain, &TransformParams::default())
            .expect("transform succeeds")
    }

    #[test]
    fn taylor_coefficients_of_exp_and_sin() {
        let exp = run(
            TransformKind::Taylor,
            TransformView::Coefficients,
            "exp(x)",
            DomainSpec::new(-1.0, 1.0, 101),
        );
        let expected = [1.0, 1.0, 0.5, 1.0 / 6.0, 1.0 / 24.0, 1.0 / 120.0];
        assert_eq!(exp.values.len(), 6);
        for (got, want) in exp.values.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-5);
        }

        let sin = run(
            TransformKind::Taylor,
            TransformView::Coefficients,
            "sin(x)",
            DomainSpec::new(-2.0, 2.0, 101),
        );
        let expected = [0.0, 1.0, 0.0, -1.0 / 6.0, 0.0, 1.0 / 120.0];
        for (got, want) in sin.values.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-5);
        }
    }

    #[test]
    fn taylor_curve_is_close_near_the_center() {
        let curve = run(
            TransformKind::Taylor,
            TransformView::Curve,
            "cos(x)",
            DomainSpec::new(-0.5, 0.5, 11),
        );
        assert_eq!(curve.y_label, "Taylor_5(x)");
        for (x, y) in curve.abscissa.iter().zip(&curve.values) {
            assert_abs_diff_eq!(*y, x.cos(), epsilon = 1e-4);
        }
    }

    #[test]
    fn fourier_peak_sits_at_the_signal_frequency() {
        let result = run(
            TransformKind::Fourier,
            TransformView::Curve,
            "sin(2 * pi * 5 * x)",
            DomainSpec::new(0.0, 1.0, 1024),
        );
        assert_eq!(result.values.len(), 512);
        let peak = result
            .values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| result.abscissa[k])
            .expect("non-empty spectrum");
        assert!((peak - 5.0).abs() < 0.1, "peak at {peak}");
    }

    #[test]
    fn hilbert_of_a_constant_vanishes() {
        let result = run(
            TransformKind::Hilbert,
            TransformView::Curve,
            "3",
            DomainSpec::new(0.0, 1.0, 64),
        );
        assert!(result.values.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn hilbert_turns_cosine_into_sine() {
        let result = run(
            TransformKind::Hilbert,
            TransformView::Curve,
            "cos(x)",
            DomainSpec::new(0.0, 8.0 * PI, 1024),
        );
        for i in 256..768 {
            let x = result.abscissa[i];
            assert_abs_diff_eq!(result.values[i], x.sin(), epsilon = 0.05);
        }
    }

    #[test]
    fn laplace_of_unit_step_on_a_window() {
        let result = run(
            TransformKind::Laplace,
            TransformView::Curve,
            "1",
            DomainSpec::new(0.0, 10.0, 1024),
        );
        assert_eq!(result.abscissa.len(), 200);
        for (s, value) in result.abscissa.iter().zip(&result.values) {
            let exact = (1.0 - (-10.0 * s).exp()) / s;
            assert!((value - exact).abs() < 1e-4 * exact, "s = {s}");
        }
    }

    #[test]
    fn coefficient_views() {
        let original = run(
            TransformKind::Original,
            TransformView::Coefficients,
            "x",
            DomainSpec::new(0.0, 1.0, 1024),
        );
        assert_eq!(original.values.len(), 200);
        assert_eq!(original.values[199], 1.0);

        let z = run(
            TransformKind::ZTransform,
            TransformView::Coefficients,
            "2 * x",
            DomainSpec::new(0.0, 1.0, 5),
        );
        assert_eq!(z.values, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert_eq!(z.abscissa, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn simpson_is_exact_for_cubics() {
        let xs = linspace(0.0, 2.0, 9);
        let ys: Vec<f64> = xs.iter().map(|x| x * x * x).collect();
        assert_abs_diff_eq!(simpson(&ys, 0.25), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn sampling_failure_names_the_point() {
        let err = transform(
            TransformKind::Original,
            TransformView::Curve,
            &function("log(x)"),
            &DomainSpec::new(-1.0, 1.0, 11),
            &TransformParams::default(),
        )
        .expect_err("log of a negative number");
        assert_eq!(err.kind(), ErrorKind::Evaluation);
        assert_eq!(err.location(), Some(Location::Point { x: -1.0 }));
    }
}
