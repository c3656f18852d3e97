use crate::error::EvalError;
use num_traits::{One, Zero};
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Numbers the expression VM evaluates with: `f64`, or `Dual` for derivatives.
///
/// The elementary functions are exactly the ones `registry::Builtin` dispatches.
pub trait Scalar:
    Copy
    + Debug
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// Converts an `f64` constant.
    fn lift(value: f64) -> Self;

    /// Real part used for domain checks and error reporting.
    fn real(self) -> f64;

    fn nan() -> Self {
        Self::lift(f64::NAN)
    }

    fn is_nan(self) -> bool {
        self.real().is_nan()
    }

    fn is_finite(self) -> bool {
        self.real().is_finite()
    }

    fn min(self, other: Self) -> Self {
        if self.real() < other.real() {
            self
        } else {
            other
        }
    }

    fn max(self, other: Self) -> Self {
        if self.real() > other.real() {
            self
        } else {
            other
        }
    }

    fn powf(self, exponent: Self) -> Self;
    fn atan2(self, abscissa: Self) -> Self;
    fn floor(self) -> Self;
    fn ceil(self) -> Self;
    fn round(self) -> Self;
    fn trunc(self) -> Self;
    fn abs(self) -> Self;
    fn sqrt(self) -> Self;
    fn cbrt(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn log10(self) -> Self;
    fn log2(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn asin(self) -> Self;
    fn acos(self) -> Self;
    fn atan(self) -> Self;
    fn sinh(self) -> Self;
    fn cosh(self) -> Self;
    fn tanh(self) -> Self;
}

macro_rules! forward_unary {
    ($($name:ident),* $(,)?) => {
        $(
            fn $name(self) -> Self {
                f64::$name(self)
            }
        )*
    };
}

impl Scalar for f64 {
    fn lift(value: f64) -> Self {
        value
    }

    fn real(self) -> f64 {
        self
    }

    fn min(self, other: Self) -> Self {
        f64::min(self, other)
    }

    fn max(self, other: Self) -> Self {
        f64::max(self, other)
    }

    fn powf(self, exponent: Self) -> Self {
        f64::powf(self, exponent)
    }

    fn atan2(self, abscissa: Self) -> Self {
        f64::atan2(self, abscissa)
    }

    forward_unary!(
        floor, ceil, round, trunc, abs, sqrt, cbrt, exp, ln, log10, log2, sin, cos, tan, asin,
        acos, atan, sinh, cosh, tanh,
    );
}

/// A first-order system `dy/dx = f(x, y)`.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: independent variable
    /// state: current state
    /// out: buffer receiving dy/dx
    fn apply(&self, x: T, state: &[T], out: &mut [T]) -> Result<(), EvalError>;
}
