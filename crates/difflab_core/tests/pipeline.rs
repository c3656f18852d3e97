use difflab_core::catalogue::{catalogue, EquationType};
use difflab_core::pipeline::{
    run, run_transform, DifferenceRequest, EquationInput, OdeRequest, PdeRequest, SolveRequest,
    TransformRequest,
};
use difflab_core::statistics::{Statistic, StatisticsSummary};
use difflab_core::transforms::TransformKind;
use difflab_core::types::{SolutionData, TransformView};
use difflab_core::{ErrorKind, FailureReport, LabConfig, Location};

fn from_catalogue(kind: EquationType, key: &str) -> SolveRequest {
    let equation = EquationInput {
        catalogue_key: Some(key.to_string()),
        ..EquationInput::default()
    };
    match kind {
        EquationType::Ode => SolveRequest::Ode(OdeRequest {
            equation,
            ..OdeRequest::default()
        }),
        EquationType::VectorOde => SolveRequest::VectorOde(OdeRequest {
            equation,
            ..OdeRequest::default()
        }),
        EquationType::Difference => SolveRequest::Difference(DifferenceRequest {
            equation,
            ..DifferenceRequest::default()
        }),
        EquationType::Pde => SolveRequest::Pde(PdeRequest {
            equation,
            nx: Some(21),
            ny: Some(21),
            ..PdeRequest::default()
        }),
    }
}

#[test]
fn every_catalogue_entry_solves_with_defaults() {
    let mut config = LabConfig::default();
    config.solver.num_points = 200;
    for entry in catalogue().entries() {
        let request = from_catalogue(entry.equation_type, &entry.key);
        let report = run(&request, &config)
            .unwrap_or_else(|err| panic!("{} failed: {err}", entry.key));
        assert_eq!(report.equation_type, entry.equation_type);
        assert_eq!(report.label, entry.name);
        assert!(report.result.meta.success, "{}", entry.key);
        match (&report.result.data, &report.statistics) {
            (SolutionData::Trajectory { x, states }, StatisticsSummary::Trajectory(stats)) => {
                assert_eq!(x.len(), states.len());
                assert!(stats.mean.is_some_and(f64::is_finite), "{}", entry.key);
            }
            (SolutionData::Field { .. }, StatisticsSummary::Field(stats)) => {
                assert!(stats.max.is_some(), "{}", entry.key);
            }
            _ => panic!("{}: statistics do not match the solution shape", entry.key),
        }
    }
}

#[test]
fn ode_reports_carry_residuals_other_engines_do_not() {
    let config = LabConfig::default();
    let ode = run(&from_catalogue(EquationType::Ode, "harmonic"), &config).expect("solves");
    let residual = ode.result.residual.expect("ODE residual");
    assert!(residual.rms.is_finite());

    let recurrence =
        run(&from_catalogue(EquationType::Difference, "logistic_map"), &config).expect("iterates");
    assert!(recurrence.result.residual.is_none());
}

#[test]
fn harmonic_statistics_see_the_oscillation() {
    let mut config = LabConfig::default();
    config.solver.num_points = 2000;
    let request = SolveRequest::Ode(OdeRequest {
        equation: EquationInput {
            catalogue_key: Some("harmonic".to_string()),
            ..EquationInput::default()
        },
        domain: Some([0.0, 40.0]),
        statistics: vec![Statistic::Period, Statistic::Amplitude, Statistic::Energy],
        ..OdeRequest::default()
    });
    let report = run(&request, &config).expect("solves");
    let StatisticsSummary::Trajectory(stats) = report.statistics else {
        panic!("trajectory expected");
    };
    let period = stats.period.expect("several peaks");
    assert!((period - 2.0 * std::f64::consts::PI).abs() < 0.05, "{period}");
    let amplitude = stats.amplitude.expect("amplitude");
    assert!((amplitude - 1.0).abs() < 1e-3, "{amplitude}");
    let energy = stats.energy.expect("two components");
    assert!((energy.total_mean - 0.5).abs() < 1e-4);
    assert!(stats.mean.is_none());
}

#[test]
fn failures_become_tagged_reports() {
    let request = SolveRequest::Ode(OdeRequest {
        equation: EquationInput {
            expressions: vec!["-1 / sqrt(y[0])".to_string()],
            ..EquationInput::default()
        },
        domain: Some([0.0, 5.0]),
        initial_values: Some(vec![1.0]),
        ..OdeRequest::default()
    });
    let err = run(&request, &LabConfig::default()).expect_err("y reaches zero");
    let report = FailureReport::from(&err);
    assert_eq!(report.kind, ErrorKind::Evaluation);
    assert!(matches!(report.location, Some(Location::Point { .. })));

    let parse = SolveRequest::Difference(DifferenceRequest {
        equation: EquationInput {
            expressions: vec!["import os".to_string()],
            ..EquationInput::default()
        },
        ..DifferenceRequest::default()
    });
    let err = run(&parse, &LabConfig::default()).expect_err("unsafe text");
    assert_eq!(err.kind(), ErrorKind::Parse);
}

#[test]
fn requests_deserialize_from_tagged_documents() {
    let request: SolveRequest = toml::from_str(
        r#"
        equation_type = "vector_ode"
        expressions = ["y[1]", "-w * y[0]"]
        parameters = { w = 4.0 }
        domain = [0.0, 3.0]
        points = 30
        initial_values = [0.0, 2.0]
        method = "TSIT5"
        "#,
    )
    .expect("deserializes");
    let report = run(&request, &LabConfig::default()).expect("solves");
    assert_eq!(report.equation_type, EquationType::VectorOde);
    assert_eq!(report.result.x().len(), 30);
    assert_eq!(report.result.meta.method, "TSIT5");
    // y0 = sin(2x) for w = 4.
    let last = *report.result.component(0).last().expect("samples");
    assert!((last - 6.0f64.sin()).abs() < 1e-6, "{last}");
}

#[test]
fn fourier_transform_request_finds_the_tone() {
    let request = TransformRequest {
        expression: "sin(2*pi*f*x)".to_string(),
        parameters: [("f".to_string(), 8.0)].into_iter().collect(),
        kind: TransformKind::Fourier,
        view: TransformView::Curve,
        domain: [0.0, 1.0],
        points: Some(513),
        params: Default::default(),
    };
    let result = run_transform(&request).expect("transforms");
    let (peak, _) = result
        .values
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
    assert!((result.abscissa[peak] - 8.0).abs() < 0.1, "{}", result.abscissa[peak]);
    assert_eq!(result.title, "Fourier (FFT)");
}
