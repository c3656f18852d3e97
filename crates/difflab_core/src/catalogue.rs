//! Predefined equations bundled with the library.
//!
//! The catalogue is an embedded TOML document parsed once per process.
//! Entries without a display formula or without anything to evaluate are
//! skipped with a warning instead of failing the whole load.

use crate::equation_engine::{compile_system, CompiledExpression};
use crate::error::ParseError;
use crate::registry::{FunctionSet, Symbols};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const CATALOGUE_TOML: &str = include_str!("catalogue.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquationType {
    Ode,
    VectorOde,
    Difference,
    Pde,
}

impl EquationType {
    pub fn name(self) -> &'static str {
        match self {
            EquationType::Ode => "ode",
            EquationType::VectorOde => "vector_ode",
            EquationType::Difference => "difference",
            EquationType::Pde => "pde",
        }
    }
}

impl fmt::Display for EquationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EquationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ode" => Ok(EquationType::Ode),
            "vector_ode" => Ok(EquationType::VectorOde),
            "difference" => Ok(EquationType::Difference),
            "pde" => Ok(EquationType::Pde),
            other => Err(format!("unknown equation type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub default: f64,
    #[serde(default)]
    pub description: String,
}

/// One predefined equation, ready to compile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogueEntry {
    pub key: String,
    pub name: String,
    /// Compact display form, e.g. `y'' + ω²y = 0`.
    pub formula: String,
    pub description: String,
    pub equation_type: EquationType,
    /// Per-component order for ODEs, window length for recurrences.
    pub order: usize,
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// One text for scalar equations, one per component for vector ODEs.
    pub expressions: Vec<String>,
    /// Flat start state for ODEs, seeds for recurrences, boundary value for PDEs.
    pub default_initial_conditions: Vec<f64>,
    /// `[start, end]`, or `[x_min, x_max, y_min, y_max]` for PDEs.
    pub default_domain: Vec<f64>,
    pub variables: Vec<String>,
}

impl CatalogueEntry {
    pub fn default_parameters(&self) -> Vec<(String, f64)> {
        self.parameters
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default))
            .collect()
    }

    /// Name table for this entry with `overrides` applied over the defaults.
    pub fn symbols(&self, overrides: &[(String, f64)]) -> Symbols {
        let base = match self.equation_type {
            EquationType::Ode | EquationType::VectorOde => {
                Symbols::ode(self.order * self.expressions.len())
            }
            EquationType::Difference => Symbols::recurrence(self.order),
            EquationType::Pde => Symbols::field(),
        };
        base.with_parameters(self.default_parameters())
            .with_parameters(overrides.iter().cloned())
    }

    pub fn compile(
        &self,
        overrides: &[(String, f64)],
        functions: &FunctionSet,
    ) -> Result<Vec<CompiledExpression>, ParseError> {
        compile_system(&self.expressions, &self.symbols(overrides), functions)
    }
}

/// Entry as written in the TOML document; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEntry {
    key: Option<String>,
    name: Option<String>,
    formula: Option<String>,
    description: Option<String>,
    equation_type: Option<String>,
    order: Option<usize>,
    parameters: BTreeMap<String, ParameterSpec>,
    expression: Option<String>,
    expressions: Vec<String>,
    default_initial_conditions: Vec<f64>,
    default_domain: Vec<f64>,
    variables: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCatalogue {
    #[serde(default)]
    equation: Vec<RawEntry>,
}

impl RawEntry {
    fn into_entry(self, position: usize) -> Option<CatalogueEntry> {
        let key = match self.key.filter(|k| !k.trim().is_empty()) {
            Some(key) => key,
            None => {
                warn!("Catalogue entry #{position} has no key; skipping");
                return None;
            }
        };
        let formula = match self.formula.filter(|f| !f.trim().is_empty()) {
            Some(formula) => formula,
            None => {
                warn!("Equation '{key}' has no formula (required for display); skipping");
                return None;
            }
        };
        let mut expressions = self.expressions;
        if let Some(expression) = self.expression.filter(|e| !e.trim().is_empty()) {
            expressions.insert(0, expression);
        }
        if expressions.is_empty() {
            warn!("Equation '{key}' has neither an expression nor expressions; skipping");
            return None;
        }
        let equation_type = match self.equation_type.as_deref().map(str::parse::<EquationType>) {
            None if expressions.len() > 1 => EquationType::VectorOde,
            None => EquationType::Ode,
            Some(Ok(kind)) => kind,
            Some(Err(message)) => {
                warn!("Equation '{key}': {message}; skipping");
                return None;
            }
        };
        if equation_type != EquationType::VectorOde && expressions.len() > 1 {
            warn!(
                "Equation '{key}' is {equation_type} but lists {} expressions; skipping",
                expressions.len()
            );
            return None;
        }
        let order = self.order.unwrap_or(1);
        if order == 0 {
            warn!("Equation '{key}' has order 0; skipping");
            return None;
        }
        let variables = if !self.variables.is_empty() {
            self.variables
        } else {
            match equation_type {
                EquationType::Difference => vec!["n".to_string()],
                EquationType::Pde => vec!["x".to_string(), "y".to_string()],
                _ => vec!["x".to_string()],
            }
        };
        let default_domain = if self.default_domain.is_empty() {
            match equation_type {
                EquationType::Pde => vec![0.0, 1.0, 0.0, 1.0],
                _ => vec![0.0, 10.0],
            }
        } else {
            self.default_domain
        };
        let default_initial_conditions = if self.default_initial_conditions.is_empty() {
            vec![0.0]
        } else {
            self.default_initial_conditions
        };

        Some(CatalogueEntry {
            name: self.name.unwrap_or_else(|| key.clone()),
            key,
            formula,
            description: self.description.unwrap_or_default(),
            equation_type,
            order,
            parameters: self.parameters,
            expressions,
            default_initial_conditions,
            default_domain,
            variables,
        })
    }
}

/// Ordered, immutable set of predefined equations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalogue {
    entries: Vec<CatalogueEntry>,
}

impl Catalogue {
    /// Parses a catalogue document, dropping malformed or duplicate entries.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        let raw: RawCatalogue = toml::from_str(text)?;
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(raw.equation.len());
        for (position, raw_entry) in raw.equation.into_iter().enumerate() {
            let Some(entry) = raw_entry.into_entry(position) else {
                continue;
            };
            if !seen.insert(entry.key.clone()) {
                warn!("Duplicate equation key '{}'; keeping the first", entry.key);
                continue;
            }
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CatalogueEntry] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&CatalogueEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn of_type(&self, kind: EquationType) -> impl Iterator<Item = &CatalogueEntry> {
        self.entries.iter().filter(move |e| e.equation_type == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The bundled catalogue, parsed on first use.
pub fn catalogue() -> &'static Catalogue {
    static CATALOGUE: OnceLock<Catalogue> = OnceLock::new();
    CATALOGUE.get_or_init(|| match Catalogue::parse(CATALOGUE_TOML) {
        Ok(catalogue) => {
            info!("Loaded {} predefined equations", catalogue.len());
            catalogue
        }
        Err(err) => {
            error!("Bundled equation catalogue is unreadable: {err}");
            Catalogue::default()
        }
    })
}

pub fn get(key: &str) -> Option<&'static CatalogueEntry> {
    catalogue().get(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_catalogue_covers_every_equation_type() {
        let catalogue = catalogue();
        assert_eq!(catalogue.of_type(EquationType::Ode).count(), 9);
        assert_eq!(catalogue.of_type(EquationType::VectorOde).count(), 5);
        assert_eq!(catalogue.of_type(EquationType::Difference).count(), 5);
        assert_eq!(catalogue.of_type(EquationType::Pde).count(), 3);
    }

    #[test]
    fn every_entry_compiles_with_its_defaults() {
        let functions = FunctionSet::standard();
        for entry in catalogue().entries() {
            let compiled = entry
                .compile(&[], &functions)
                .unwrap_or_else(|err| panic!("{} failed to compile: {err}", entry.key));
            assert_eq!(compiled.len(), entry.expressions.len());
        }
    }

    #[test]
    fn defaults_are_consistent_with_the_equation_shape() {
        for entry in catalogue().entries() {
            match entry.equation_type {
                EquationType::Ode | EquationType::VectorOde => assert_eq!(
                    entry.default_initial_conditions.len(),
                    entry.order * entry.expressions.len(),
                    "{}",
                    entry.key
                ),
                EquationType::Difference => {
                    assert_eq!(entry.default_initial_conditions.len(), entry.order, "{}", entry.key)
                }
                EquationType::Pde => assert_eq!(entry.default_domain.len(), 4, "{}", entry.key),
            }
        }
    }

    #[test]
    fn harmonic_evaluates_with_overrides() {
        let entry = get("harmonic").expect("harmonic is bundled");
        let overrides = vec![("omega".to_string(), 2.0)];
        let compiled = entry
            .compile(&overrides, &FunctionSet::standard())
            .expect("compiles");
        assert_eq!(compiled[0].evaluate(&[0.0], &[1.0, 0.0]).expect("eval"), -4.0);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let text = r#"
            [[equation]]
            key = "no_formula"
            expression = "y[0]"

            [[equation]]
            key = "no_expression"
            formula = "y' = ?"

            [[equation]]
            key = "bad_type"
            formula = "y' = y"
            expression = "y[0]"
            equation_type = "integral"

            [[equation]]
            key = "ok"
            formula = "y' = y"
            expression = "y[0]"

            [[equation]]
            key = "ok"
            formula = "y' = 2y"
            expression = "2 * y[0]"
        "#;
        let catalogue = Catalogue::parse(text).expect("parses");
        assert_eq!(catalogue.keys().collect::<Vec<_>>(), vec!["ok"]);
        let entry = catalogue.get("ok").expect("kept");
        assert_eq!(entry.equation_type, EquationType::Ode);
        assert_eq!(entry.expressions, vec!["y[0]".to_string()]);
        assert_eq!(entry.default_domain, vec![0.0, 10.0]);
    }

    #[test]
    fn equation_type_names_round_trip() {
        for kind in [
            EquationType::Ode,
            EquationType::VectorOde,
            EquationType::Difference,
            EquationType::Pde,
        ] {
            assert_eq!(kind.name().parse::<EquationType>(), Ok(kind));
        }
        assert!("integral".parse::<EquationType>().is_err());
    }
}
