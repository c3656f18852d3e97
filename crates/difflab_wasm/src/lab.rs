//! JavaScript-facing lab handle.
//!
//! Requests arrive as plain JS objects shaped like the core's serde types;
//! reports and failures go back the same way. Failures are a serialized
//! `FailureReport`, so the host can branch on `kind` instead of parsing text.

use anyhow::Context;
use difflab_core::catalogue::{self, EquationType};
use difflab_core::pipeline::{run, run_transform, SolveRequest, TransformRequest};
use difflab_core::{FailureReport, LabConfig, SolveError};
use serde::Serialize;
use serde_wasm_bindgen::{from_value, Serializer};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmLab {
    config: LabConfig,
}

pub(crate) fn load_config(config_toml: Option<&str>) -> anyhow::Result<LabConfig> {
    let config = match config_toml.map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => LabConfig::from_toml_str(text)?,
        None => LabConfig::default(),
    };
    config.validate().context("invalid lab configuration")?;
    Ok(config)
}

pub(crate) fn to_js<T: Serialize>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&Serializer::json_compatible())
        .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

fn failure(err: &SolveError) -> JsValue {
    to_js(&FailureReport::from(err)).unwrap_or_else(|fallback| fallback)
}

#[wasm_bindgen]
impl WasmLab {
    #[wasm_bindgen(constructor)]
    pub fn new(config_toml: Option<String>) -> Result<WasmLab, JsValue> {
        console_error_panic_hook::set_once();
        let config = load_config(config_toml.as_deref())
            .map_err(|e| JsValue::from_str(&format!("{:#}", e)))?;
        Ok(WasmLab { config })
    }

    /// Effective configuration after defaults are filled in.
    pub fn config(&self) -> Result<JsValue, JsValue> {
        to_js(&self.config)
    }

    /// Runs a `SolveRequest` and returns a `SolveReport`.
    pub fn solve(&self, request: JsValue) -> Result<JsValue, JsValue> {
        let request: SolveRequest = from_value(request)
            .map_err(|e| JsValue::from_str(&format!("Invalid solve request: {}", e)))?;
        let report = run(&request, &self.config).map_err(|e| failure(&e))?;
        to_js(&report)
    }

    pub fn transform(&self, request: JsValue) -> Result<JsValue, JsValue> {
        let request: TransformRequest = from_value(request)
            .map_err(|e| JsValue::from_str(&format!("Invalid transform request: {}", e)))?;
        let result = run_transform(&request).map_err(|e| failure(&e))?;
        to_js(&result)
    }

    /// Catalogue entries, optionally restricted to one equation type.
    pub fn catalogue(&self, equation_type: Option<String>) -> Result<JsValue, JsValue> {
        let entries: Vec<_> = match equation_type {
            Some(name) => {
                let kind: EquationType = name.parse().map_err(|e: String| JsValue::from_str(&e))?;
                catalogue::catalogue().of_type(kind).collect()
            }
            None => catalogue::catalogue().entries().iter().collect(),
        };
        to_js(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use difflab_core::solvers::IntegrationMethod;

    #[test]
    fn blank_config_uses_defaults() {
        let config = load_config(Some("  ")).expect("defaults");
        assert_eq!(config, LabConfig::default());
    }

    #[test]
    fn config_text_is_parsed_and_validated() {
        let config = load_config(Some("[solver]\ndefault_method = \"TSIT5\"")).expect("valid");
        assert_eq!(config.solver.default_method, IntegrationMethod::Tsit5);

        let err = load_config(Some("[solver]\natol = 0.0")).expect_err("invalid");
        assert!(format!("{:#}", err).contains("atol"));
    }
}
