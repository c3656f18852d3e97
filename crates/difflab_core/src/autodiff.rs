use crate::error::EvalError;
use crate::traits::{DynamicalSystem, Scalar};
use num_traits::{One, Zero};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Dual number for forward-mode differentiation of compiled expressions.
/// val: real part
/// eps: derivative along the seeded direction
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self { val, eps: 0.0 }
    }

    /// Applies the chain rule with `deriv = f'(val)`.
    /// A zero tangent stays zero even where `deriv` is infinite.
    fn chain(self, val: f64, deriv: f64) -> Self {
        let eps = if self.eps == 0.0 { 0.0 } else { self.eps * deriv };
        Self::new(val, eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Scalar for Dual {
    fn lift(value: f64) -> Self {
        Self::constant(value)
    }

    fn real(self) -> f64 {
        self.val
    }

    fn powf(self, n: Self) -> Self {
        let val_pow = self.val.powf(n.val);
        if n.eps == 0.0 {
            // Constant exponent: keeps negative bases with integral exponents finite.
            return self.chain(val_pow, n.val * self.val.powf(n.val - 1.0));
        }
        // x^y = exp(y * ln(x))
        let eps_new = val_pow * (n.eps * self.val.ln() + n.val * self.eps / self.val);
        Self::new(val_pow, eps_new)
    }

    fn atan2(self, other: Self) -> Self {
        // self is the ordinate, other the abscissa.
        let r2 = self.val * self.val + other.val * other.val;
        let eps = if r2 == 0.0 {
            0.0
        } else {
            (other.val * self.eps - self.val * other.eps) / r2
        };
        Self::new(self.val.atan2(other.val), eps)
    }

    // Piecewise constant.
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }

    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }
    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }

    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
}

/// Dense Jacobian `df/dy` at `(x, state)`, row-major, one dual sweep per column.
pub fn jacobian<S>(system: &S, x: f64, state: &[f64]) -> Result<Vec<f64>, EvalError>
where
    S: DynamicalSystem<Dual>,
{
    let n = state.len();
    let mut jac = vec![0.0; n * n];
    let mut dual_state = vec![Dual::zero(); n];
    let mut dual_out = dual_state.clone();
    let x_dual = Dual::constant(x);

    for j in 0..n {
        for i in 0..n {
            dual_state[i] = Dual::new(state[i], if i == j { 1.0 } else { 0.0 });
        }
        system.apply(x_dual, &dual_state, &mut dual_out)?;
        for i in 0..n {
            jac[i * n + j] = dual_out[i].eps;
        }
    }
    Ok(jac)
}
