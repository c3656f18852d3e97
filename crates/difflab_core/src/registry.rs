//! Name bindings shared by the compiler and every engine.
//!
//! A [`Symbols`] table declares which identifiers an expression may reference
//! and what each one resolves to at evaluation time. A [`FunctionSet`] is the
//! whitelist of callable builtins.

use serde::{Deserialize, Serialize};

/// What an identifier resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Binding {
    /// Position in the independent-variable slice.
    Independent(usize),
    /// The state-vector accessor (only valid when subscripted).
    State,
    /// Position in the parameter slice.
    Parameter(usize),
    Constant(f64),
}

/// The reserved state-vector accessor, e.g. `y` in `y[0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateAccessor {
    pub name: String,
    pub len: usize,
}

/// Declared names for one compilation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Symbols {
    independent: Vec<String>,
    state: Option<StateAccessor>,
    parameters: Vec<(String, f64)>,
}

impl Symbols {
    pub fn new(independent: &[&str], state: Option<StateAccessor>) -> Self {
        Self {
            independent: independent.iter().map(|s| s.to_string()).collect(),
            state,
            parameters: Vec::new(),
        }
    }

    /// `x` plus `y[0..len]`.
    pub fn ode(state_len: usize) -> Self {
        Self::new(
            &["x"],
            Some(StateAccessor {
                name: "y".to_string(),
                len: state_len,
            }),
        )
    }

    /// `n` plus the recurrence window `y[0..order]`.
    pub fn recurrence(order: usize) -> Self {
        Self::new(
            &["n"],
            Some(StateAccessor {
                name: "y".to_string(),
                len: order,
            }),
        )
    }

    /// `x` and `y` as coordinates, no state accessor.
    pub fn field() -> Self {
        Self::new(&["x", "y"], None)
    }

    /// A scalar function of `x`.
    pub fn scalar() -> Self {
        Self::new(&["x"], None)
    }

    /// Adds parameters; later duplicates overwrite earlier values.
    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        for (name, value) in parameters {
            let name = name.into();
            match self.parameters.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = value,
                None => self.parameters.push((name, value)),
            }
        }
        self
    }

    pub fn independent(&self) -> &[String] {
        &self.independent
    }

    pub fn state(&self) -> Option<&StateAccessor> {
        self.state.as_ref()
    }

    pub fn parameters(&self) -> &[(String, f64)] {
        &self.parameters
    }

    pub fn parameter_values(&self) -> Vec<f64> {
        self.parameters.iter().map(|(_, v)| *v).collect()
    }

    pub fn resolve(&self, name: &str) -> Option<Binding> {
        if let Some(idx) = self.independent.iter().position(|n| n == name) {
            return Some(Binding::Independent(idx));
        }
        if self.state.as_ref().is_some_and(|s| s.name == name) {
            return Some(Binding::State);
        }
        if let Some(idx) = self.parameters.iter().position(|(n, _)| n == name) {
            return Some(Binding::Parameter(idx));
        }
        constant(name).map(Binding::Constant)
    }
}

fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        _ => None,
    }
}

/// Whitelisted functions callable from expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Builtin {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Log10,
    Log2,
    Sqrt,
    Cbrt,
    Abs,
    Sinh,
    Cosh,
    Tanh,
    Asin,
    Acos,
    Atan,
    Atan2,
    Floor,
    Ceil,
    Round,
    Trunc,
    Sign,
    Heaviside,
    Pow,
    Min,
    Max,
}

impl Builtin {
    pub const ALL: [Builtin; 26] = [
        Builtin::Sin,
        Builtin::Cos,
        Builtin::Tan,
        Builtin::Exp,
        Builtin::Ln,
        Builtin::Log10,
        Builtin::Log2,
        Builtin::Sqrt,
        Builtin::Cbrt,
        Builtin::Abs,
        Builtin::Sinh,
        Builtin::Cosh,
        Builtin::Tanh,
        Builtin::Asin,
        Builtin::Acos,
        Builtin::Atan,
        Builtin::Atan2,
        Builtin::Floor,
        Builtin::Ceil,
        Builtin::Round,
        Builtin::Trunc,
        Builtin::Sign,
        Builtin::Heaviside,
        Builtin::Pow,
        Builtin::Min,
        Builtin::Max,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        let builtin = match name {
            "sin" => Builtin::Sin,
            "cos" => Builtin::Cos,
            "tan" => Builtin::Tan,
            "exp" => Builtin::Exp,
            "log" | "ln" => Builtin::Ln,
            "log10" => Builtin::Log10,
            "log2" => Builtin::Log2,
            "sqrt" => Builtin::Sqrt,
            "cbrt" => Builtin::Cbrt,
            "abs" => Builtin::Abs,
            "sinh" => Builtin::Sinh,
            "cosh" => Builtin::Cosh,
            "tanh" => Builtin::Tanh,
            "arcsin" | "asin" => Builtin::Asin,
            "arccos" | "acos" => Builtin::Acos,
            "arctan" | "atan" => Builtin::Atan,
            "arctan2" | "atan2" => Builtin::Atan2,
            "floor" => Builtin::Floor,
            "ceil" => Builtin::Ceil,
            "round" => Builtin::Round,
            "trunc" => Builtin::Trunc,
            "sign" => Builtin::Sign,
            "heaviside" => Builtin::Heaviside,
            "pow" => Builtin::Pow,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            _ => return None,
        };
        Some(builtin)
    }

    /// Canonical name, used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Exp => "exp",
            Builtin::Ln => "log",
            Builtin::Log10 => "log10",
            Builtin::Log2 => "log2",
            Builtin::Sqrt => "sqrt",
            Builtin::Cbrt => "cbrt",
            Builtin::Abs => "abs",
            Builtin::Sinh => "sinh",
            Builtin::Cosh => "cosh",
            Builtin::Tanh => "tanh",
            Builtin::Asin => "arcsin",
            Builtin::Acos => "arccos",
            Builtin::Atan => "arctan",
            Builtin::Atan2 => "arctan2",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Round => "round",
            Builtin::Trunc => "trunc",
            Builtin::Sign => "sign",
            Builtin::Heaviside => "heaviside",
            Builtin::Pow => "pow",
            Builtin::Min => "min",
            Builtin::Max => "max",
        }
    }

    /// Accepted argument counts as an inclusive range; `None` upper bound is variadic.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Builtin::Atan2 | Builtin::Pow => (2, Some(2)),
            Builtin::Heaviside => (1, Some(2)),
            Builtin::Min | Builtin::Max => (2, None),
            _ => (1, Some(1)),
        }
    }

    pub fn accepts(self, argc: usize) -> bool {
        let (lo, hi) = self.arity();
        argc >= lo && hi.map_or(true, |hi| argc <= hi)
    }
}

/// The set of builtins an expression may call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSet {
    allowed: Vec<Builtin>,
}

impl FunctionSet {
    pub fn standard() -> Self {
        Self {
            allowed: Builtin::ALL.to_vec(),
        }
    }

    pub fn only(allowed: &[Builtin]) -> Self {
        Self {
            allowed: allowed.to_vec(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Builtin> {
        Builtin::from_name(name).filter(|b| self.allowed.contains(b))
    }
}

impl Default for FunctionSet {
    fn default() -> Self {
        Self::standard()
    }
}
