//! Request-level entry points: resolve the equation, fill gaps from the
//! configuration, dispatch to an engine and summarize the result.
//!
//! Nothing here touches the filesystem; requests and reports are plain serde
//! data so a host can ship them across any boundary.

use crate::catalogue::{self, CatalogueEntry, EquationType};
use crate::config::LabConfig;
use crate::difference::{self, DifferenceProblem};
use crate::equation_engine::{compile, compile_system, CompiledExpression};
use crate::error::SolveError;
use crate::ode::{self, OdeProblem};
use crate::pde::{self, PdeProblem};
use crate::registry::{FunctionSet, Symbols};
use crate::solvers::IntegrationMethod;
use crate::statistics::{summarize, Statistic, StatisticsSummary};
use crate::transforms::{transform, TransformKind, TransformParams};
use crate::types::{
    DomainSpec, IndexDomain, InitialCondition, SolveResult, TransformResult, TransformView,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Grid points per axis for PDE requests that do not choose.
pub const DEFAULT_GRID_POINTS: usize = 51;
/// Samples for transform requests that do not choose.
pub const DEFAULT_TRANSFORM_POINTS: usize = 1024;

const DEFAULT_INTERVAL: [f64; 2] = [0.0, 10.0];
const DEFAULT_RECTANGLE: [f64; 4] = [0.0, 1.0, 0.0, 1.0];

/// The equation to solve: a catalogue key or expression text, plus parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EquationInput {
    pub catalogue_key: Option<String>,
    /// Ignored when `catalogue_key` is set.
    pub expressions: Vec<String>,
    /// Values for declared parameters; override catalogue defaults.
    pub parameters: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OdeRequest {
    #[serde(flatten)]
    pub equation: EquationInput,
    /// Per-component order; from the catalogue or `1` when absent.
    pub order: Option<usize>,
    pub domain: Option<[f64; 2]>,
    pub points: Option<usize>,
    /// Flat values at the domain start, `y[0..len]`.
    pub initial_values: Option<Vec<f64>>,
    /// Extra conditions, possibly away from the start.
    pub conditions: Vec<InitialCondition>,
    pub method: Option<IntegrationMethod>,
    pub rtol: Option<f64>,
    pub atol: Option<f64>,
    pub max_step: Option<f64>,
    pub statistics: Vec<Statistic>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferenceRequest {
    #[serde(flatten)]
    pub equation: EquationInput,
    pub order: Option<usize>,
    pub domain: Option<[i64; 2]>,
    pub seeds: Option<Vec<f64>>,
    pub statistics: Vec<Statistic>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PdeRequest {
    #[serde(flatten)]
    pub equation: EquationInput,
    /// `[x_min, x_max, y_min, y_max]`.
    pub domain: Option<[f64; 4]>,
    pub nx: Option<usize>,
    pub ny: Option<usize>,
    pub boundary: Option<f64>,
    pub statistics: Vec<Statistic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "equation_type", rename_all = "snake_case")]
pub enum SolveRequest {
    Ode(OdeRequest),
    VectorOde(OdeRequest),
    Difference(DifferenceRequest),
    Pde(PdeRequest),
}

impl SolveRequest {
    pub fn equation_type(&self) -> EquationType {
        match self {
            SolveRequest::Ode(_) => EquationType::Ode,
            SolveRequest::VectorOde(_) => EquationType::VectorOde,
            SolveRequest::Difference(_) => EquationType::Difference,
            SolveRequest::Pde(_) => EquationType::Pde,
        }
    }

    fn equation(&self) -> &EquationInput {
        match self {
            SolveRequest::Ode(r) | SolveRequest::VectorOde(r) => &r.equation,
            SolveRequest::Difference(r) => &r.equation,
            SolveRequest::Pde(r) => &r.equation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub equation_type: EquationType,
    /// Catalogue name or the expression text(s).
    pub label: String,
    pub result: SolveResult,
    pub statistics: StatisticsSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    /// A function of `x`.
    pub expression: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    pub kind: TransformKind,
    #[serde(default = "default_view")]
    pub view: TransformView,
    pub domain: [f64; 2],
    #[serde(default)]
    pub points: Option<usize>,
    #[serde(default)]
    pub params: TransformParams,
}

fn default_view() -> TransformView {
    TransformView::Curve
}

/// The equation after catalogue lookup.
struct Resolved<'a> {
    entry: Option<&'static CatalogueEntry>,
    texts: &'a [String],
    parameters: Vec<(String, f64)>,
}

impl Resolved<'_> {
    fn label(&self) -> String {
        match self.entry {
            Some(entry) => entry.name.clone(),
            None => self.texts.join("; "),
        }
    }

    fn texts(&self) -> &[String] {
        match self.entry {
            Some(entry) => &entry.expressions,
            None => self.texts,
        }
    }

    fn compile(&self, symbols: Symbols) -> Result<Vec<CompiledExpression>, SolveError> {
        let symbols = match self.entry {
            Some(entry) => symbols.with_parameters(entry.default_parameters()),
            None => symbols,
        };
        let symbols = symbols.with_parameters(self.parameters.iter().cloned());
        Ok(compile_system(self.texts(), &symbols, &FunctionSet::standard())?)
    }
}

fn resolve(input: &EquationInput, kind: EquationType) -> Result<Resolved<'_>, SolveError> {
    let parameters: Vec<(String, f64)> =
        input.parameters.iter().map(|(k, v)| (k.clone(), *v)).collect();
    if let Some((name, value)) = parameters.iter().find(|(_, v)| !v.is_finite()) {
        return Err(SolveError::validation(format!(
            "parameter '{name}' must be finite, got {value}"
        )));
    }

    let Some(key) = input.catalogue_key.as_deref() else {
        if input.expressions.iter().all(|t| t.trim().is_empty()) {
            return Err(SolveError::validation("no expression given"));
        }
        return Ok(Resolved {
            entry: None,
            texts: &input.expressions,
            parameters,
        });
    };

    let entry = catalogue::get(key)
        .ok_or_else(|| SolveError::validation(format!("unknown catalogue equation '{key}'")))?;
    if entry.equation_type != kind {
        return Err(SolveError::validation(format!(
            "catalogue equation '{key}' is {}, not {kind}",
            entry.equation_type
        )));
    }
    if let Some((name, _)) = parameters
        .iter()
        .find(|(name, _)| !entry.parameters.contains_key(name))
    {
        return Err(SolveError::validation(format!(
            "'{key}' has no parameter named '{name}'"
        )));
    }
    Ok(Resolved {
        entry: Some(entry),
        texts: &[],
        parameters,
    })
}

/// Solves one request and attaches its statistics summary.
pub fn run(request: &SolveRequest, config: &LabConfig) -> Result<SolveReport, SolveError> {
    let kind = request.equation_type();
    let resolved = resolve(request.equation(), kind)?;
    let label = resolved.label();
    info!("Running {kind} request for '{label}'");

    let outcome = match request {
        SolveRequest::Ode(r) | SolveRequest::VectorOde(r) => run_ode(r, kind, &resolved, config),
        SolveRequest::Difference(r) => run_difference(r, &resolved),
        SolveRequest::Pde(r) => run_pde(r, &resolved, config),
    };
    let (result, selected) = outcome.inspect_err(|err| error!("{kind} request failed: {err}"))?;

    let statistics = summarize(&result, selected);
    Ok(SolveReport {
        equation_type: kind,
        label,
        result,
        statistics,
    })
}

fn run_ode<'r>(
    request: &'r OdeRequest,
    kind: EquationType,
    resolved: &Resolved<'_>,
    config: &LabConfig,
) -> Result<(SolveResult, &'r [Statistic]), SolveError> {
    let components = resolved.texts().len();
    if kind == EquationType::Ode && components != 1 {
        return Err(SolveError::validation(format!(
            "a scalar ODE takes exactly one expression, got {components}"
        )));
    }
    let order = request
        .order
        .or(resolved.entry.map(|e| e.order))
        .unwrap_or(1);
    if order == 0 {
        return Err(SolveError::validation("ODE order must be at least 1"));
    }
    let dimension = order * components;
    let equations = resolved.compile(Symbols::ode(dimension))?;

    let [start, end] = match (request.domain, resolved.entry) {
        (Some(domain), _) => domain,
        (None, Some(entry)) => interval(&entry.default_domain)?,
        (None, None) => DEFAULT_INTERVAL,
    };
    let domain = DomainSpec::new(start, end, request.points.unwrap_or(config.solver.num_points));

    let initial_values = match (&request.initial_values, resolved.entry) {
        (Some(values), _) => values.clone(),
        (None, Some(entry)) if request.conditions.is_empty() => {
            entry.default_initial_conditions.clone()
        }
        (None, _) => Vec::new(),
    };
    if initial_values.len() > dimension {
        return Err(SolveError::validation(format!(
            "{} initial values given for a system with {dimension} states",
            initial_values.len()
        )));
    }
    let mut conditions: Vec<InitialCondition> = initial_values
        .iter()
        .enumerate()
        .map(|(i, v)| InitialCondition::new(i, start, *v))
        .collect();
    conditions.extend_from_slice(&request.conditions);

    let mut options = config.ode_options();
    if let Some(method) = request.method {
        options.method = method;
    }
    if let Some(rtol) = request.rtol {
        options.tolerances.rtol = rtol;
    }
    if let Some(atol) = request.atol {
        options.tolerances.atol = atol;
    }
    if let Some(max_step) = request.max_step {
        options.tolerances.max_step = (max_step > 0.0).then_some(max_step);
    }

    let problem = OdeProblem {
        order,
        equations,
        conditions,
        domain,
    };
    Ok((ode::solve(&problem, &options)?, &request.statistics))
}

fn run_difference<'r>(
    request: &'r DifferenceRequest,
    resolved: &Resolved<'_>,
) -> Result<(SolveResult, &'r [Statistic]), SolveError> {
    if resolved.texts().len() != 1 {
        return Err(SolveError::validation(
            "a difference equation takes exactly one expression",
        ));
    }
    let order = request
        .order
        .or(resolved.entry.map(|e| e.order))
        .unwrap_or(1);
    let mut equations = resolved.compile(Symbols::recurrence(order))?;
    let equation = equations
        .pop()
        .ok_or_else(|| SolveError::validation("no expression given"))?;

    let [start, end] = match (request.domain, resolved.entry) {
        (Some(domain), _) => domain,
        (None, Some(entry)) => {
            let [start, end] = interval(&entry.default_domain)?;
            [start.round() as i64, end.round() as i64]
        }
        (None, None) => [DEFAULT_INTERVAL[0] as i64, DEFAULT_INTERVAL[1] as i64],
    };
    let seeds = match (&request.seeds, resolved.entry) {
        (Some(seeds), _) => seeds.clone(),
        (None, Some(entry)) => entry.default_initial_conditions.clone(),
        (None, None) => vec![1.0; order],
    };

    let problem = DifferenceProblem {
        order,
        equation,
        seeds,
        domain: IndexDomain::new(start, end),
    };
    Ok((difference::solve(&problem)?, &request.statistics))
}

fn run_pde<'r>(
    request: &'r PdeRequest,
    resolved: &Resolved<'_>,
    config: &LabConfig,
) -> Result<(SolveResult, &'r [Statistic]), SolveError> {
    if resolved.texts().len() != 1 {
        return Err(SolveError::validation("a PDE takes exactly one source expression"));
    }
    let mut equations = resolved.compile(Symbols::field())?;
    let equation = equations
        .pop()
        .ok_or_else(|| SolveError::validation("no expression given"))?;

    let [x0, x1, y0, y1] = match (request.domain, resolved.entry) {
        (Some(domain), _) => domain,
        (None, Some(entry)) => rectangle(&entry.default_domain)?,
        (None, None) => DEFAULT_RECTANGLE,
    };
    let boundary = request
        .boundary
        .or(resolved
            .entry
            .and_then(|e| e.default_initial_conditions.first().copied()))
        .unwrap_or(0.0);

    let problem = PdeProblem {
        equation,
        x: DomainSpec::new(x0, x1, request.nx.unwrap_or(DEFAULT_GRID_POINTS)),
        y: DomainSpec::new(y0, y1, request.ny.unwrap_or(DEFAULT_GRID_POINTS)),
        boundary,
    };
    Ok((pde::solve(&problem, &config.pde_settings())?, &request.statistics))
}

fn interval(values: &[f64]) -> Result<[f64; 2], SolveError> {
    match values {
        [start, end, ..] => Ok([*start, *end]),
        _ => Err(SolveError::validation("default domain needs a start and an end")),
    }
}

fn rectangle(values: &[f64]) -> Result<[f64; 4], SolveError> {
    match values {
        [x0, x1, y0, y1, ..] => Ok([*x0, *x1, *y0, *y1]),
        _ => Err(SolveError::validation(
            "default PDE domain needs x and y bounds",
        )),
    }
}

/// Compiles a function of `x` and applies one transform to it.
pub fn run_transform(request: &TransformRequest) -> Result<TransformResult, SolveError> {
    let symbols = Symbols::scalar().with_parameters(request.parameters.clone());
    let function = compile(&request.expression, &symbols, &FunctionSet::standard())?;
    let [start, end] = request.domain;
    let domain = DomainSpec::new(start, end, request.points.unwrap_or(DEFAULT_TRANSFORM_POINTS));
    transform(request.kind, request.view, &function, &domain, &request.params)
        .inspect_err(|err| error!("{} transform failed: {err}", request.kind.title()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::statistics::StatisticsSummary;
    use crate::types::SolutionData;

    fn custom(texts: &[&str]) -> EquationInput {
        EquationInput {
            catalogue_key: None,
            expressions: texts.iter().map(|t| t.to_string()).collect(),
            parameters: BTreeMap::new(),
        }
    }

    fn keyed(key: &str) -> EquationInput {
        EquationInput {
            catalogue_key: Some(key.to_string()),
            ..EquationInput::default()
        }
    }

    #[test]
    fn custom_ode_uses_configured_point_count() {
        let mut config = LabConfig::default();
        config.solver.num_points = 50;
        let request = SolveRequest::Ode(OdeRequest {
            equation: custom(&["-y[0]"]),
            domain: Some([0.0, 1.0]),
            initial_values: Some(vec![1.0]),
            statistics: vec![Statistic::Mean],
            ..OdeRequest::default()
        });
        let report = run(&request, &config).expect("solves");
        assert_eq!(report.result.x().len(), 50);
        assert_eq!(report.label, "-y[0]");
        let StatisticsSummary::Trajectory(stats) = report.statistics else {
            panic!("trajectory expected");
        };
        assert!(stats.mean.is_some());
        assert!(stats.rms.is_none());
    }

    #[test]
    fn catalogue_ode_runs_with_defaults() {
        let request = SolveRequest::Ode(OdeRequest {
            equation: keyed("exponential"),
            points: Some(101),
            ..OdeRequest::default()
        });
        let report = run(&request, &LabConfig::default()).expect("solves");
        assert_eq!(report.label, "Exponential Growth");
        let y = report.result.component(0);
        let last = *y.last().expect("samples");
        assert!((last - 2.5f64.exp()).abs() < 1e-5, "{last}");
    }

    #[test]
    fn catalogue_parameters_are_checked() {
        let mut equation = keyed("harmonic");
        equation.parameters.insert("omicron".to_string(), 1.0);
        let request = SolveRequest::Ode(OdeRequest {
            equation,
            ..OdeRequest::default()
        });
        let err = run(&request, &LabConfig::default()).expect_err("unknown parameter");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn catalogue_type_must_match_request() {
        let request = SolveRequest::Pde(PdeRequest {
            equation: keyed("fibonacci"),
            ..PdeRequest::default()
        });
        let err = run(&request, &LabConfig::default()).expect_err("wrong type");
        assert!(err.to_string().contains("difference"), "{err}");
    }

    #[test]
    fn shooting_request_mixes_start_values_and_targets() {
        let request = SolveRequest::Ode(OdeRequest {
            equation: custom(&["-y[0]"]),
            order: Some(2),
            domain: Some([0.0, std::f64::consts::FRAC_PI_2]),
            points: Some(64),
            initial_values: Some(vec![0.0]),
            conditions: vec![InitialCondition::new(0, std::f64::consts::FRAC_PI_2, 1.0)],
            ..OdeRequest::default()
        });
        let report = run(&request, &LabConfig::default()).expect("shoots");
        assert!(report.result.meta.shooting_iterations.is_some());
        let slope = report.result.states()[0][1];
        assert!((slope - 1.0).abs() < 1e-4, "{slope}");
    }

    #[test]
    fn scalar_ode_rejects_expression_lists() {
        let request = SolveRequest::Ode(OdeRequest {
            equation: custom(&["y[1]", "-y[0]"]),
            initial_values: Some(vec![1.0, 0.0]),
            ..OdeRequest::default()
        });
        let err = run(&request, &LabConfig::default()).expect_err("two expressions");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn difference_request_from_catalogue() {
        let request = SolveRequest::Difference(DifferenceRequest {
            equation: keyed("fibonacci"),
            domain: Some([0, 10]),
            ..DifferenceRequest::default()
        });
        let report = run(&request, &LabConfig::default()).expect("iterates");
        assert_eq!(report.result.component(0)[10], 55.0);
    }

    #[test]
    fn pde_request_respects_configured_ceiling() {
        let mut config = LabConfig::default();
        config.pde.max_grid_points = 32;
        let request = SolveRequest::Pde(PdeRequest {
            equation: keyed("poisson_constant"),
            nx: Some(40),
            ..PdeRequest::default()
        });
        let err = run(&request, &config).expect_err("grid too large");
        assert_eq!(
            err,
            SolveError::GridSize {
                requested: 40,
                limit: 32
            }
        );
    }

    #[test]
    fn pde_request_with_custom_source() {
        let request = SolveRequest::Pde(PdeRequest {
            equation: custom(&["0"]),
            nx: Some(9),
            ny: Some(7),
            boundary: Some(2.0),
            ..PdeRequest::default()
        });
        let report = run(&request, &LabConfig::default()).expect("solves");
        let SolutionData::Field { values, .. } = &report.result.data else {
            panic!("field expected");
        };
        assert_eq!(values.len(), 7);
        assert_eq!(values[0].len(), 9);
    }

    #[test]
    fn empty_expression_is_rejected() {
        let request = SolveRequest::Ode(OdeRequest {
            equation: custom(&["  "]),
            ..OdeRequest::default()
        });
        assert!(run(&request, &LabConfig::default()).is_err());
    }

    #[test]
    fn transform_request_defaults() {
        let request = TransformRequest {
            expression: "a * x".to_string(),
            parameters: BTreeMap::from([("a".to_string(), 2.0)]),
            kind: TransformKind::Original,
            view: TransformView::Curve,
            domain: [0.0, 1.0],
            points: None,
            params: TransformParams::default(),
        };
        let result = run_transform(&request).expect("transforms");
        assert_eq!(result.values.len(), DEFAULT_TRANSFORM_POINTS);
        assert_eq!(*result.values.last().expect("samples"), 2.0);
    }
}
