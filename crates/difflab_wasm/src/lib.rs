//! WASM bridge for the Differential Lab core.

mod lab;

pub use lab::WasmLab;

use difflab_core::equation_engine;
use js_sys::Array;
use wasm_bindgen::prelude::*;

/// Syntax problems in `text`; an empty array when it parses.
#[wasm_bindgen]
pub fn validate_expression(text: &str) -> Array {
    equation_engine::validate_expression(text)
        .into_iter()
        .map(|message| JsValue::from_str(&message))
        .collect()
}

/// Keys of every bundled catalogue equation, in catalogue order.
#[wasm_bindgen]
pub fn catalogue_keys() -> Array {
    difflab_core::catalogue::catalogue()
        .keys()
        .map(JsValue::from_str)
        .collect()
}
