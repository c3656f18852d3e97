//! Lab configuration: TOML file, then `DIFFLAB_*` environment overrides,
//! then validation.

use crate::logging::LogSettings;
use crate::ode::{OdeOptions, ShootingSettings};
use crate::pde::{PdeSettings, MAX_GRID_POINTS};
use crate::solvers::{IntegrationMethod, Tolerances};
use crate::types::MAX_POINTS;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ENV_PREFIX: &str = "DIFFLAB_";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSection {
    pub default_method: IntegrationMethod,
    /// Largest step; `0` means unlimited.
    pub max_step: f64,
    pub rtol: f64,
    pub atol: f64,
    /// Output samples when a request does not say.
    pub num_points: usize,
    pub max_steps: usize,
}

impl Default for SolverSection {
    fn default() -> Self {
        let tolerances = Tolerances::default();
        Self {
            default_method: IntegrationMethod::Rk45,
            max_step: 0.0,
            rtol: tolerances.rtol,
            atol: tolerances.atol,
            num_points: 1000,
            max_steps: tolerances.max_steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub solver: SolverSection,
    pub shooting: ShootingSettings,
    pub pde: PdeSettings,
    pub logging: LogSettings,
}

impl LabConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse configuration TOML")
    }

    /// Reads `path`, applies environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by `DIFFLAB_<SECTION>_<FIELD>`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        override_parsed(&get, "SOLVER_DEFAULT_METHOD", &mut self.solver.default_method)?;
        override_parsed(&get, "SOLVER_MAX_STEP", &mut self.solver.max_step)?;
        override_parsed(&get, "SOLVER_RTOL", &mut self.solver.rtol)?;
        override_parsed(&get, "SOLVER_ATOL", &mut self.solver.atol)?;
        override_parsed(&get, "SOLVER_NUM_POINTS", &mut self.solver.num_points)?;
        override_parsed(&get, "SOLVER_MAX_STEPS", &mut self.solver.max_steps)?;
        override_parsed(&get, "SHOOTING_MAX_ITERATIONS", &mut self.shooting.max_iterations)?;
        override_parsed(&get, "SHOOTING_TOLERANCE", &mut self.shooting.tolerance)?;
        override_parsed(&get, "PDE_MAX_GRID_POINTS", &mut self.pde.max_grid_points)?;

        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level.trim().to_string();
        }
        if let Some(file) = get("LOG_FILE") {
            let file = file.trim();
            self.logging.file = (!file.is_empty()).then(|| PathBuf::from(file));
        }
        if let Some(console) = get("LOG_CONSOLE") {
            self.logging.console = parse_flag(&console)
                .with_context(|| format!("{ENV_PREFIX}LOG_CONSOLE: invalid flag '{console}'"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let solver = &self.solver;
        if !(solver.rtol.is_finite() && solver.rtol > 0.0) {
            bail!("solver.rtol must be positive, got {}", solver.rtol);
        }
        if !(solver.atol.is_finite() && solver.atol > 0.0) {
            bail!("solver.atol must be positive, got {}", solver.atol);
        }
        if !(solver.max_step.is_finite() && solver.max_step >= 0.0) {
            bail!("solver.max_step must be zero or positive, got {}", solver.max_step);
        }
        if !(2..=MAX_POINTS).contains(&solver.num_points) {
            bail!(
                "solver.num_points must be between 2 and {MAX_POINTS}, got {}",
                solver.num_points
            );
        }
        if solver.max_steps == 0 {
            bail!("solver.max_steps must be greater than zero");
        }
        self.shooting
            .validate()
            .context("invalid [shooting] section")?;
        if self.pde.max_grid_points > MAX_GRID_POINTS {
            bail!(
                "pde.max_grid_points must not exceed {MAX_GRID_POINTS}, got {}",
                self.pde.max_grid_points
            );
        }
        if self.pde.max_grid_points < 3 {
            bail!("pde.max_grid_points must be at least 3");
        }
        self.logging.level_filter()?;
        Ok(())
    }

    pub fn tolerances(&self) -> Tolerances {
        Tolerances {
            rtol: self.solver.rtol,
            atol: self.solver.atol,
            max_step: (self.solver.max_step > 0.0).then_some(self.solver.max_step),
            max_steps: self.solver.max_steps,
        }
    }

    pub fn ode_options(&self) -> OdeOptions {
        OdeOptions {
            method: self.solver.default_method,
            tolerances: self.tolerances(),
            shooting: self.shooting,
        }
    }

    pub fn pde_settings(&self) -> PdeSettings {
        self.pde
    }
}

fn override_parsed<T, G>(get: &G, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("{ENV_PREFIX}{name}: invalid value '{raw}': {err}"))?;
    }
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = LabConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.solver.default_method, IntegrationMethod::Rk45);
        assert_eq!(config.solver.num_points, 1000);
        assert_eq!(config.shooting.max_iterations, 50);
        assert_eq!(config.pde.max_grid_points, 256);
        assert_eq!(config.tolerances().max_step, None);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config = LabConfig::from_toml_str(
            r#"
            [solver]
            default_method = "LSODA"
            rtol = 1e-6
            max_step = 0.5

            [logging]
            level = "debug"
            console = true
            "#,
        )
        .expect("parses");
        assert_eq!(config.solver.default_method, IntegrationMethod::Auto);
        assert_eq!(config.solver.rtol, 1e-6);
        assert_eq!(config.solver.atol, 1e-10);
        assert_eq!(config.tolerances().max_step, Some(0.5));
        assert!(config.logging.console);
        config.validate().expect("valid");
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = LabConfig::default();
        config
            .apply_overrides(env(&[
                ("DIFFLAB_SOLVER_DEFAULT_METHOD", "radau"),
                ("DIFFLAB_SOLVER_NUM_POINTS", "200"),
                ("DIFFLAB_SHOOTING_TOLERANCE", "1e-8"),
                ("DIFFLAB_PDE_MAX_GRID_POINTS", "64"),
                ("DIFFLAB_LOG_FILE", ""),
                ("DIFFLAB_LOG_CONSOLE", "yes"),
            ]))
            .expect("overrides apply");
        assert_eq!(config.solver.default_method, IntegrationMethod::Sdirk21);
        assert_eq!(config.solver.num_points, 200);
        assert_eq!(config.shooting.tolerance, 1e-8);
        assert_eq!(config.pde_settings().limit(), 64);
        assert_eq!(config.logging.file, None);
        assert!(config.logging.console);
    }

    #[test]
    fn malformed_override_names_the_variable() {
        let mut config = LabConfig::default();
        let err = config
            .apply_overrides(env(&[("DIFFLAB_SOLVER_RTOL", "tight")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("DIFFLAB_SOLVER_RTOL"), "{err}");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            "[solver]\nrtol = -1.0",
            "[solver]\nnum_points = 1",
            "[pde]\nmax_grid_points = 1000",
            "[shooting]\nmax_iterations = 0",
            "[logging]\nlevel = \"chatty\"",
        ];
        for text in cases {
            let config = LabConfig::from_toml_str(text).expect("parses");
            assert!(config.validate().is_err(), "accepted: {text}");
        }
        assert!(LabConfig::from_toml_str("[solver]\ndefault_method = \"EULER\"").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = LabConfig::load("/nonexistent/difflab.toml").expect_err("no such file");
        assert!(err.to_string().contains("difflab.toml"));
    }
}
