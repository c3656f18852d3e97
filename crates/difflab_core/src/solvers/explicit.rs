use super::{
    rhs, scaled_rms, DifferentiableSystem, IntegrationError, IntegrationStats, StepOutcome,
    Steppable, Tolerances,
};

/// Butcher tableau of an embedded explicit pair.
///
/// Every pair here is first-same-as-last: the final row of `a` equals `b`,
/// so the last stage is `f(x + h, y_new)` and seeds the next step.
#[derive(Debug)]
pub struct Tableau {
    pub name: &'static str,
    pub c: &'static [f64],
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
    /// `b - b_hat`; the error estimate is `h * sum(e_j k_j)`.
    pub e: &'static [f64],
    pub error_order: usize,
    /// Enables the `h|λ|` estimate used by automatic stiffness detection.
    pub stiffness_check: bool,
}

impl Tableau {
    pub fn stages(&self) -> usize {
        self.c.len()
    }
}

pub static RK23: Tableau = Tableau {
    name: "RK23",
    c: &[0.0, 0.5, 0.75, 1.0],
    a: &[
        &[],
        &[0.5],
        &[0.0, 0.75],
        &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0],
    ],
    b: &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0],
    e: &[-5.0 / 72.0, 1.0 / 12.0, 1.0 / 9.0, -1.0 / 8.0],
    error_order: 2,
    stiffness_check: false,
};

pub static DOPRI5: Tableau = Tableau {
    name: "RK45",
    c: &[0.0, 0.2, 0.3, 0.8, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[0.2],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
        ],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    e: &[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ],
    error_order: 4,
    stiffness_check: true,
};

pub static TSIT5: Tableau = Tableau {
    name: "TSIT5",
    c: &[0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0],
    a: &[
        &[],
        &[0.161],
        &[-0.008480655492356989, 0.335480655492357],
        &[2.897153057105493, -6.359448489975075, 4.3622954328695815],
        &[
            5.325864828439257,
            -11.748883564062828,
            7.4955393428898365,
            -0.09249506636175525,
        ],
        &[
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.028269050394068383,
        ],
        &[
            0.09646076681806523,
            0.01,
            0.4798896504144996,
            1.379008574103742,
            -3.290069515436081,
            2.324710524099774,
        ],
    ],
    b: &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436081,
        2.324710524099774,
        0.0,
    ],
    e: &[
        -0.00178001105222577714,
        -0.0008164344596567469,
        0.007880878010261995,
        -0.1447110071732629,
        0.5823571654525552,
        -0.45808210592918697,
        1.0 / 66.0,
    ],
    error_order: 4,
    stiffness_check: false,
};

/// Embedded explicit Runge–Kutta stepper driven by a [`Tableau`].
pub struct ExplicitRk {
    tableau: &'static Tableau,
    k: Vec<Vec<f64>>,
    stage: Vec<f64>,
    previous_stage: Vec<f64>,
    first_stage_ready: bool,
    stiffness_ratio: Option<f64>,
}

impl ExplicitRk {
    pub fn new(tableau: &'static Tableau, dim: usize) -> Self {
        Self {
            tableau,
            k: vec![vec![0.0; dim]; tableau.stages()],
            stage: vec![0.0; dim],
            previous_stage: vec![0.0; dim],
            first_stage_ready: false,
            stiffness_ratio: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.tableau.name
    }

    /// `h|λ|` estimated from the last two stages of the latest attempt.
    pub fn stiffness_ratio(&self) -> Option<f64> {
        self.stiffness_ratio
    }
}

impl Steppable for ExplicitRk {
    fn error_order(&self) -> usize {
        self.tableau.error_order
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
        let tableau = self.tableau;
        let stages = tableau.stages();
        let n = state.len();

        if !self.first_stage_ready {
            rhs(system, x, state, &mut self.k[0], stats)?;
            self.first_stage_ready = true;
        }

        for i in 1..stages {
            for d in 0..n {
                let increment: f64 = tableau.a[i]
                    .iter()
                    .enumerate()
                    .map(|(j, a)| a * self.k[j][d])
                    .sum();
                self.stage[d] = state[d] + h * increment;
            }
            if tableau.stiffness_check && i == stages - 2 {
                self.previous_stage.copy_from_slice(&self.stage);
            }
            rhs(system, x + tableau.c[i] * h, &self.stage, &mut self.k[i], stats)?;
        }

        let mut error = vec![0.0; n];
        for d in 0..n {
            let mut solution = 0.0;
            let mut estimate = 0.0;
            for j in 0..stages {
                solution += tableau.b[j] * self.k[j][d];
                estimate += tableau.e[j] * self.k[j][d];
            }
            out[d] = state[d] + h * solution;
            error[d] = h * estimate;
        }

        let error_norm = scaled_rms(
            error
                .iter()
                .enumerate()
                .map(|(d, e)| (*e, tol.scale(state[d], out[d]))),
        );

        self.stiffness_ratio = if tableau.stiffness_check {
            let last = &self.k[stages - 1];
            let before = &self.k[stages - 2];
            let num: f64 = last.iter().zip(before).map(|(a, b)| (a - b).powi(2)).sum();
            let den: f64 = self
                .stage
                .iter()
                .zip(&self.previous_stage)
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            (den > 0.0).then(|| h * (num / den).sqrt())
        } else {
            None
        };

        Ok(StepOutcome {
            error_norm,
            converged: true,
        })
    }

    fn accept(&mut self, _x: f64, _stats: &mut IntegrationStats) {
        // First-same-as-last: the final stage is f(x + h, y_new).
        let last = self.tableau.stages() - 1;
        self.k.swap(0, last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_consistency(tableau: &Tableau) {
        let stages = tableau.stages();
        assert_eq!(tableau.a.len(), stages);
        assert_eq!(tableau.b.len(), stages);
        assert_eq!(tableau.e.len(), stages);
        for (i, row) in tableau.a.iter().enumerate() {
            let sum: f64 = row.iter().sum();
            assert!((sum - tableau.c[i]).abs() < 1e-12, "{} row {i}", tableau.name);
        }
        let b_sum: f64 = tableau.b.iter().sum();
        assert!((b_sum - 1.0).abs() < 1e-12, "{} weights", tableau.name);
        let e_sum: f64 = tableau.e.iter().sum();
        assert!(e_sum.abs() < 1e-12, "{} error weights", tableau.name);
        for (a, b) in tableau.a[stages - 1].iter().zip(tableau.b) {
            assert_eq!(a, b, "{} is not first-same-as-last", tableau.name);
        }
    }

    #[test]
    fn tableaux_are_consistent() {
        check_consistency(&RK23);
        check_consistency(&DOPRI5);
        check_consistency(&TSIT5);
    }
}
