// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The arithmetic kernel: binary operators, the built-in function
//! namespaces and elementwise broadcasting over vectors and matrices.
//! Everything here propagates units; additive operators align the
//! right operand to the left operand's unit, multiplicative operators
//! combine exponent vectors.

use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

use float_cmp::approx_eq;
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::Result;
use crate::math_err;
use crate::units::Unit;
use crate::value::{Matrix, Scalar, Value, ZERO_THRESHOLD};

/// Largest factorial argument with a finite f64 result.
const FACTORIAL_MAX: f64 = 170.0;

/// Hard cap on built vector/matrix extents.
const MAX_EXTENT: f64 = 1_000_000.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AngleMode {
    Degrees,
    Radians,
    Gradians,
}

impl AngleMode {
    /// Factor converting a bare number in this mode to radians.
    pub fn to_radians(self) -> f64 {
        match self {
            AngleMode::Degrees => std::f64::consts::PI / 180.0,
            AngleMode::Radians => 1.0,
            AngleMode::Gradians => std::f64::consts::PI / 200.0,
        }
    }
}

/// Which namespace a function name resolved into.  Scalar namespaces
/// take priority over vector/matrix ones on a name clash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Namespace {
    Function,
    Function2,
    Function3,
    MultiFunction,
    Interpolation,
    VectorFunction,
    MatrixFunction,
}

pub const FUNCTIONS_1: [&str; 41] = [
    "sin", "cos", "tan", "csc", "sec", "cot", "asin", "acos", "atan", "acsc", "asec", "acot",
    "sinh", "cosh", "tanh", "csch", "sech", "coth", "asinh", "acosh", "atanh", "acsch", "asech",
    "acoth", "ln", "log", "log_2", "exp", "abs", "sign", "sqr", "sqrt", "cbrt", "round", "floor",
    "ceiling", "trunc", "re", "im", "phase", "random",
];

pub const FUNCTIONS_2: [&str; 3] = ["atan2", "root", "mod"];

pub const FUNCTIONS_3: [&str; 1] = ["if"];

pub const MULTI_FUNCTIONS: [&str; 10] = [
    "min", "max", "sum", "sumsq", "srss", "average", "product", "mean", "switch", "take",
];

pub const INTERPOLATIONS: [&str; 2] = ["line", "spline"];

pub const VECTOR_FUNCTIONS: [&str; 4] = ["vector", "range", "len", "dot"];

pub const MATRIX_FUNCTIONS: [&str; 7] = [
    "matrix", "identity", "transpose", "det", "utriang", "ltriang", "symmetric",
];

lazy_static! {
    static ref NAMESPACES: std::collections::HashMap<&'static str, (Namespace, usize)> = {
        let mut m = std::collections::HashMap::new();
        // reverse priority: scalar namespaces inserted last win clashes
        for (i, n) in MATRIX_FUNCTIONS.iter().enumerate() {
            m.insert(*n, (Namespace::MatrixFunction, i));
        }
        for (i, n) in VECTOR_FUNCTIONS.iter().enumerate() {
            m.insert(*n, (Namespace::VectorFunction, i));
        }
        for (i, n) in INTERPOLATIONS.iter().enumerate() {
            m.insert(*n, (Namespace::Interpolation, i));
        }
        for (i, n) in MULTI_FUNCTIONS.iter().enumerate() {
            m.insert(*n, (Namespace::MultiFunction, i));
        }
        for (i, n) in FUNCTIONS_3.iter().enumerate() {
            m.insert(*n, (Namespace::Function3, i));
        }
        for (i, n) in FUNCTIONS_2.iter().enumerate() {
            m.insert(*n, (Namespace::Function2, i));
        }
        for (i, n) in FUNCTIONS_1.iter().enumerate() {
            m.insert(*n, (Namespace::Function, i));
        }
        m
    };
}

/// Resolve a built-in function name to its namespace and index.
pub fn resolve(name: &str) -> Option<(Namespace, usize)> {
    NAMESPACES.get(name).copied()
}

/// Exact argument count a namespace entry requires, or None when it is
/// variadic.
pub fn expected_argc(ns: Namespace, index: usize) -> Option<usize> {
    match ns {
        Namespace::Function => Some(1),
        Namespace::Function2 => Some(2),
        Namespace::Function3 => Some(3),
        Namespace::MultiFunction | Namespace::Interpolation => None,
        Namespace::VectorFunction => match VECTOR_FUNCTIONS[index] {
            "range" => Some(3),
            "dot" => Some(2),
            _ => Some(1),
        },
        Namespace::MatrixFunction => match MATRIX_FUNCTIONS[index] {
            "matrix" => Some(2),
            _ => Some(1),
        },
    }
}

/// True when the function's result depends only on its arguments, so a
/// constant call can be folded at compile time.
pub fn is_pure(ns: Namespace, index: usize) -> bool {
    match ns {
        Namespace::Function => FUNCTIONS_1[index] != "random",
        Namespace::VectorFunction => !matches!(VECTOR_FUNCTIONS[index], "vector" | "range"),
        Namespace::MatrixFunction => !matches!(
            MATRIX_FUNCTIONS[index],
            "identity" | "utriang" | "ltriang" | "symmetric" | "matrix"
        ),
        _ => true,
    }
}

fn almost_equal(a: f64, b: f64) -> bool {
    approx_eq!(f64, a, b, epsilon = 1e-14, ulps = 4)
        || (a - b).abs() <= 1e-14 * a.abs().max(b.abs())
}

/// Convert b's number into a's unit frame; errors when the exponent
/// vectors differ.  Absent units count as dimensionless scale 1.
fn align(a: &Scalar, b: &Scalar, op: char) -> Result<(f64, f64)> {
    let factor = match (&a.unit, &b.unit) {
        (None, None) => 1.0,
        (Some(ua), None) => {
            if ua.is_dimensionless() {
                1.0 / ua.scale()
            } else {
                return math_err!(
                    InconsistentUnits,
                    "inconsistent units in '{op}': '{}' and none",
                    ua.text()
                );
            }
        }
        (None, Some(ub)) => {
            if ub.is_dimensionless() {
                ub.scale()
            } else {
                return math_err!(
                    InconsistentUnits,
                    "inconsistent units in '{op}': none and '{}'",
                    ub.text()
                );
            }
        }
        (Some(ua), Some(ub)) => {
            if !ua.is_consistent_with(ub) {
                return math_err!(
                    InconsistentUnits,
                    "inconsistent units in '{op}': '{}' and '{}'",
                    ua.text(),
                    ub.text()
                );
            }
            ub.convert_factor(ua)
        }
    };
    Ok((b.re * factor, b.im * factor))
}

fn mul_units(a: &Option<Unit>, b: &Option<Unit>) -> Option<Unit> {
    match (a, b) {
        (None, None) => None,
        (Some(u), None) | (None, Some(u)) => Some(u.clone()),
        (Some(a), Some(b)) => a.multiply(b),
    }
}

fn div_units(a: &Option<Unit>, b: &Option<Unit>) -> Option<Unit> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => b.pow(-1.0),
        (Some(a), Some(b)) => a.divide(b),
    }
}

fn complex_mul(ar: f64, ai: f64, br: f64, bi: f64) -> (f64, f64) {
    (ar * br - ai * bi, ar * bi + ai * br)
}

fn complex_div(ar: f64, ai: f64, br: f64, bi: f64) -> (f64, f64) {
    let d = br * br + bi * bi;
    ((ar * br + ai * bi) / d, (ai * br - ar * bi) / d)
}

fn complex_ln(re: f64, im: f64) -> (f64, f64) {
    ((re * re + im * im).sqrt().ln(), im.atan2(re))
}

fn complex_exp(re: f64, im: f64) -> (f64, f64) {
    let r = re.exp();
    (r * im.cos(), r * im.sin())
}

/// Elementwise combination of two values with scalar-vs-aggregate
/// broadcasting; vector-vs-matrix never combines.
fn zip<F>(a: &Value, b: &Value, f: F) -> Result<Value>
where
    F: Fn(&Scalar, &Scalar) -> Result<Scalar>,
{
    match (a, b) {
        (Value::Scalar(x), Value::Scalar(y)) => Ok(Value::Scalar(f(x, y)?)),
        (Value::Scalar(x), Value::Vector(v)) => {
            let out: Result<Vec<Scalar>> = v.iter().map(|y| f(x, y)).collect();
            Ok(Value::Vector(out?))
        }
        (Value::Vector(v), Value::Scalar(y)) => {
            let out: Result<Vec<Scalar>> = v.iter().map(|x| f(x, y)).collect();
            Ok(Value::Vector(out?))
        }
        (Value::Vector(v), Value::Vector(w)) => {
            if v.len() != w.len() {
                return math_err!(
                    DimensionMismatch,
                    "vector lengths differ: {} and {}",
                    v.len(),
                    w.len()
                );
            }
            let out: Result<Vec<Scalar>> = v.iter().zip(w.iter()).map(|(x, y)| f(x, y)).collect();
            Ok(Value::Vector(out?))
        }
        (Value::Scalar(x), Value::Matrix(m)) => {
            let mut out = m.clone();
            for s in out.iter_mut() {
                *s = f(x, s)?;
            }
            Ok(Value::Matrix(out))
        }
        (Value::Matrix(m), Value::Scalar(y)) => {
            let mut out = m.clone();
            for s in out.iter_mut() {
                *s = f(s, y)?;
            }
            Ok(Value::Matrix(out))
        }
        (Value::Matrix(m), Value::Matrix(n)) => {
            if m.rows != n.rows || m.cols != n.cols {
                return math_err!(
                    DimensionMismatch,
                    "matrix shapes differ: {}x{} and {}x{}",
                    m.rows,
                    m.cols,
                    n.rows,
                    n.cols
                );
            }
            let mut out = m.clone();
            for (idx, s) in out.iter_mut().enumerate() {
                *s = f(s, n.at(idx / n.cols, idx % n.cols))?;
            }
            Ok(Value::Matrix(out))
        }
        _ => math_err!(
            DimensionMismatch,
            "cannot combine a {} with a {}",
            a.shape_name(),
            b.shape_name()
        ),
    }
}

fn map<F>(v: &Value, f: F) -> Result<Value>
where
    F: Fn(&Scalar) -> Result<Scalar>,
{
    match v {
        Value::Scalar(s) => Ok(Value::Scalar(f(s)?)),
        Value::Vector(v) => {
            let out: Result<Vec<Scalar>> = v.iter().map(&f).collect();
            Ok(Value::Vector(out?))
        }
        Value::Matrix(m) => {
            let mut out = m.clone();
            for s in out.iter_mut() {
                *s = f(s)?;
            }
            Ok(Value::Matrix(out))
        }
    }
}

fn flatten(args: &[Value]) -> Vec<&Scalar> {
    let mut out = Vec::new();
    for v in args {
        match v {
            Value::Scalar(s) => out.push(s),
            Value::Vector(v) => out.extend(v.iter()),
            Value::Matrix(m) => out.extend(m.iter()),
        }
    }
    out
}

/// Interpolation positions a hair outside `1..=n` still count.
const INTERP_DELTA: f64 = 1e-14;

/// Three-way sign, zero included.
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn interp_line(y: &[&Scalar], d: f64) -> Result<Value> {
    let i = (d.floor() as usize).max(1);
    let y1 = y[i - 1];
    if i as f64 == d || d >= y.len() as f64 {
        return Ok(Value::Scalar(y1.clone()));
    }
    let (next, _) = align(y1, y[i], ';')?;
    Ok(Value::Scalar(Scalar {
        re: y1.re + (next - y1.re) * (d - i as f64),
        im: 0.0,
        unit: y1.unit.clone(),
    }))
}

/// Hermite cubic through the two bracketing knots, with tangents
/// damped where the neighbours change direction.
fn interp_spline(y: &[&Scalar], d: f64) -> Result<Value> {
    let n = y.len();
    let i = (d.floor() as usize).max(1) - 1;
    let v = y[i];
    if i as f64 == d || d >= n as f64 {
        return Ok(Value::Scalar(v.clone()));
    }
    let unit = v.unit.clone();
    let y0 = v.re;
    let (y1, _) = align(v, y[i + 1], ';')?;
    let dy = y1 - y0;
    let mut a = dy;
    let mut b = dy;
    let dy = sign(dy);
    if i > 0 {
        let (y2, _) = align(v, y[i - 1], ';')?;
        a = (y1 - y2) * if sign(y0 - y2) == dy { 0.5 } else { 0.25 };
    }
    if i < n - 2 {
        let (y2, _) = align(v, y[i + 2], ';')?;
        b = (y2 - y0) * if sign(y2 - y1) == dy { 0.5 } else { 0.25 };
    }
    if i == 0 {
        a += (a - b) / 2.0;
    }
    if i == n - 2 {
        b += (b - a) / 2.0;
    }
    let t = d - i as f64 - 1.0;
    let re = y0 + ((y1 - y0) * (3.0 - 2.0 * t) * t + ((a + b) * t - a) * (t - 1.0)) * t;
    Ok(Value::Scalar(Scalar { re, im: 0.0, unit }))
}

fn integer_arg(s: &Scalar, what: &str) -> Result<usize> {
    if !s.is_real() || !s.is_unitless() || s.re.fract() != 0.0 || s.re < 1.0 || s.re > MAX_EXTENT {
        return math_err!(InvalidNumber, "{what} must be a positive integer");
    }
    Ok(s.re as usize)
}

pub struct Calculator {
    pub angle_mode: AngleMode,
    pub is_complex: bool,
    rng: RefCell<StdRng>,
}

impl Default for Calculator {
    fn default() -> Self {
        Calculator::new(AngleMode::Degrees, false)
    }
}

impl Calculator {
    pub fn new(angle_mode: AngleMode, is_complex: bool) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        Calculator {
            angle_mode,
            is_complex,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[cfg(test)]
    pub fn seeded(angle_mode: AngleMode, seed: u64) -> Self {
        Calculator {
            angle_mode,
            is_complex: false,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn operator(&self, op: char, a: &Value, b: &Value) -> Result<Value> {
        match op {
            '+' => zip(a, b, |x, y| self.add(x, y)),
            '-' => zip(a, b, |x, y| self.sub(x, y)),
            '*' => self.multiply(a, b),
            '/' | '÷' => zip(a, b, |x, y| self.divide(x, y)),
            '\\' => zip(a, b, |x, y| self.int_divide(x, y)),
            '⦼' | '%' => zip(a, b, |x, y| self.remainder(x, y)),
            '^' => zip(a, b, |x, y| self.power(x, y)),
            '<' => zip(a, b, |x, y| self.compare(x, y, op)),
            '>' => zip(a, b, |x, y| self.compare(x, y, op)),
            '≤' => zip(a, b, |x, y| self.compare(x, y, op)),
            '≥' => zip(a, b, |x, y| self.compare(x, y, op)),
            '≡' => zip(a, b, |x, y| self.compare(x, y, op)),
            '≠' => zip(a, b, |x, y| self.compare(x, y, op)),
            '∧' => zip(a, b, |x, y| {
                Ok(Scalar::real((x.is_truthy() && y.is_truthy()) as u8 as f64))
            }),
            '∨' => zip(a, b, |x, y| {
                Ok(Scalar::real((x.is_truthy() || y.is_truthy()) as u8 as f64))
            }),
            '⊕' => zip(a, b, |x, y| {
                Ok(Scalar::real((x.is_truthy() != y.is_truthy()) as u8 as f64))
            }),
            _ => math_err!(InvalidSymbol, "unknown operator '{op}'"),
        }
    }

    fn add(&self, a: &Scalar, b: &Scalar) -> Result<Scalar> {
        let (br, bi) = align(a, b, '+')?;
        Ok(Scalar {
            re: a.re + br,
            im: a.im + bi,
            unit: a.unit.clone(),
        })
    }

    fn sub(&self, a: &Scalar, b: &Scalar) -> Result<Scalar> {
        let (br, bi) = align(a, b, '-')?;
        Ok(Scalar {
            re: a.re - br,
            im: a.im - bi,
            unit: a.unit.clone(),
        })
    }

    /// `*` needs true matrix multiplication when both sides are
    /// matrices or a matrix meets a vector; everything else is
    /// elementwise with unit combination.
    fn multiply(&self, a: &Value, b: &Value) -> Result<Value> {
        match (a, b) {
            (Value::Matrix(m), Value::Matrix(n)) => self.mat_mul(m, n),
            (Value::Matrix(m), Value::Vector(v)) => {
                let col = Matrix::from_rows(v.iter().map(|s| vec![s.clone()]).collect())?;
                match self.mat_mul(m, &col)? {
                    Value::Matrix(r) => Ok(Value::Vector(
                        (0..r.rows).map(|i| r.at(i, 0).clone()).collect(),
                    )),
                    other => Ok(other),
                }
            }
            _ => zip(a, b, |x, y| self.mul_scalar(x, y)),
        }
    }

    fn mul_scalar(&self, a: &Scalar, b: &Scalar) -> Result<Scalar> {
        let (re, im) = complex_mul(a.re, a.im, b.re, b.im);
        Ok(Scalar {
            re,
            im,
            unit: mul_units(&a.unit, &b.unit),
        })
    }

    fn mat_mul(&self, m: &Matrix, n: &Matrix) -> Result<Value> {
        if m.cols != n.rows {
            return math_err!(
                DimensionMismatch,
                "matrix product shapes differ: {}x{} * {}x{}",
                m.rows,
                m.cols,
                n.rows,
                n.cols
            );
        }
        let mut out = Matrix::new(m.rows, n.cols);
        for i in 0..m.rows {
            for j in 0..n.cols {
                let mut acc = self.mul_scalar(m.at(i, 0), n.at(0, j))?;
                for k in 1..m.cols {
                    let term = self.mul_scalar(m.at(i, k), n.at(k, j))?;
                    acc = self.add(&acc, &term)?;
                }
                *out.at_mut(i, j) = acc;
            }
        }
        Ok(Value::Matrix(out))
    }

    fn divide(&self, a: &Scalar, b: &Scalar) -> Result<Scalar> {
        let (re, im) = if a.is_real() && b.is_real() {
            (a.re / b.re, 0.0)
        } else {
            complex_div(a.re, a.im, b.re, b.im)
        };
        Ok(Scalar {
            re,
            im,
            unit: div_units(&a.unit, &b.unit),
        })
    }

    fn int_divide(&self, a: &Scalar, b: &Scalar) -> Result<Scalar> {
        if !a.is_real() || !b.is_real() {
            return math_err!(NonRealResult, "integer division needs real operands");
        }
        if b.re == 0.0 {
            return math_err!(DivisionByZero, "integer division by zero");
        }
        Ok(Scalar {
            re: (a.re / b.re).trunc(),
            im: 0.0,
            unit: div_units(&a.unit, &b.unit),
        })
    }

    fn remainder(&self, a: &Scalar, b: &Scalar) -> Result<Scalar> {
        if !a.is_real() || !b.is_real() {
            return math_err!(NonRealResult, "remainder needs real operands");
        }
        let (br, _) = align(a, b, '%')?;
        if br == 0.0 {
            return math_err!(DivisionByZero, "remainder with zero divisor");
        }
        Ok(Scalar {
            re: a.re - br * (a.re / br).floor(),
            im: 0.0,
            unit: a.unit.clone(),
        })
    }

    fn power(&self, a: &Scalar, b: &Scalar) -> Result<Scalar> {
        if !b.is_unitless() {
            return math_err!(InvalidUnits, "exponent must be dimensionless");
        }
        let has_unit = a.unit.as_ref().map(|u| !u.is_dimensionless()).unwrap_or(false);
        if has_unit {
            if !a.is_real() || !b.is_real() {
                return math_err!(NonRealResult, "cannot raise a complex value carrying units");
            }
            let unit = a.unit.as_ref().unwrap().pow(b.re);
            return Ok(Scalar {
                re: a.re.powf(b.re),
                im: 0.0,
                unit,
            });
        }
        if a.is_real() && b.is_real() {
            // a negative base with a fractional exponent only widens to
            // complex in complex mode
            if !(self.is_complex && a.re < 0.0 && b.re.fract() != 0.0) {
                return Ok(Scalar::real(a.re.powf(b.re)));
            }
        } else if !self.is_complex {
            return math_err!(NonRealResult, "cannot raise complex values in real mode");
        }
        // complex: a^b = exp(b ln a)
        let (lr, li) = complex_ln(a.re, a.im);
        let (er, ei) = complex_mul(b.re, b.im, lr, li);
        let (re, im) = complex_exp(er, ei);
        Ok(Scalar::complex(re, im))
    }

    fn compare(&self, a: &Scalar, b: &Scalar, op: char) -> Result<Scalar> {
        if !a.is_real() || !b.is_real() {
            return math_err!(NonRealResult, "cannot order complex values with '{op}'");
        }
        let (br, _) = align(a, b, op)?;
        let eq = almost_equal(a.re, br);
        let result = match op {
            '<' => a.re < br && !eq,
            '>' => a.re > br && !eq,
            '≤' => a.re < br || eq,
            '≥' => a.re > br || eq,
            '≡' => eq,
            '≠' => !eq,
            _ => unreachable!(),
        };
        Ok(Scalar::real(result as u8 as f64))
    }

    pub fn negate(&self, v: &Value) -> Result<Value> {
        map(v, |s| {
            Ok(Scalar {
                re: -s.re,
                im: -s.im,
                unit: s.unit.clone(),
            })
        })
    }

    pub fn factorial(&self, v: &Value) -> Result<Value> {
        map(v, |s| {
            if !s.is_real() || !s.is_unitless() {
                return math_err!(InvalidNumber, "factorial needs a real dimensionless argument");
            }
            if s.re < 0.0 || s.re.fract() != 0.0 || s.re > FACTORIAL_MAX {
                return math_err!(
                    InvalidNumber,
                    "factorial argument must be an integer in [0, {FACTORIAL_MAX}]"
                );
            }
            let mut acc = 1.0;
            let mut k = 2.0;
            while k <= s.re {
                acc *= k;
                k += 1.0;
            }
            Ok(Scalar::real(acc))
        })
    }

    /// Angle argument in radians: angle units convert exactly, bare
    /// numbers scale by the session's angle mode.
    fn angle_in(&self, s: &Scalar) -> Result<f64> {
        match s.unit {
            Some(ref u) if u.is_angle() => {
                let rad = Unit::find("rad").unwrap();
                Ok(s.re * u.convert_factor(&rad))
            }
            Some(ref u) if !u.is_dimensionless() => {
                math_err!(InvalidUnits, "trigonometric argument cannot carry '{}'", u.text())
            }
            Some(ref u) => Ok(s.re * u.scale() * self.angle_mode.to_radians()),
            None => Ok(s.re * self.angle_mode.to_radians()),
        }
    }

    /// Inverse-trig results come back as bare numbers in the session's
    /// angle mode.
    fn angle_out(&self, rad: f64) -> Scalar {
        Scalar::real(rad / self.angle_mode.to_radians())
    }

    fn require_real_unitless(s: &Scalar, name: &str) -> Result<f64> {
        if !s.is_real() {
            return math_err!(NonRealResult, "'{name}' needs a real argument");
        }
        if !s.is_unitless() {
            return math_err!(InvalidUnits, "'{name}' needs a dimensionless argument");
        }
        Ok(s.re * s.unit.as_ref().map(|u| u.scale()).unwrap_or(1.0))
    }

    pub fn function(&self, index: usize, v: &Value) -> Result<Value> {
        let name = FUNCTIONS_1[index];
        map(v, |s| self.function_scalar(name, s))
    }

    fn function_scalar(&self, name: &str, s: &Scalar) -> Result<Scalar> {
        match name {
            "abs" => {
                return Ok(Scalar {
                    re: (s.re * s.re + s.im * s.im).sqrt(),
                    im: 0.0,
                    unit: s.unit.clone(),
                })
            }
            "re" => {
                return Ok(Scalar {
                    re: s.re,
                    im: 0.0,
                    unit: s.unit.clone(),
                })
            }
            "im" => {
                return Ok(Scalar {
                    re: s.im,
                    im: 0.0,
                    unit: s.unit.clone(),
                })
            }
            "phase" => {
                return Ok(self.angle_out(s.im.atan2(s.re)));
            }
            "sqr" | "sqrt" => {
                if s.is_real() && s.re >= 0.0 {
                    let unit = s.unit.as_ref().and_then(|u| u.pow(0.5));
                    return Ok(Scalar {
                        re: s.re.sqrt(),
                        im: 0.0,
                        unit,
                    });
                }
                if !s.is_unitless() {
                    return math_err!(NonRealResult, "square root of a negative united value");
                }
                if !self.is_complex {
                    return Ok(Scalar::nan());
                }
                // principal complex root
                let (lr, li) = complex_ln(s.re, s.im);
                let (re, im) = complex_exp(lr * 0.5, li * 0.5);
                return Ok(Scalar::complex(re, im));
            }
            "cbrt" => {
                let x = Self::require_real_unitless(s, name)?;
                return Ok(Scalar::real(x.cbrt()));
            }
            "sign" => {
                if !s.is_real() {
                    return math_err!(NonRealResult, "'sign' needs a real argument");
                }
                return Ok(Scalar::real(if s.re > 0.0 {
                    1.0
                } else if s.re < 0.0 {
                    -1.0
                } else {
                    0.0
                }));
            }
            "round" | "floor" | "ceiling" | "trunc" => {
                if !s.is_real() {
                    return math_err!(NonRealResult, "'{name}' needs a real argument");
                }
                let re = match name {
                    "round" => s.re.round(),
                    "floor" => s.re.floor(),
                    "ceiling" => s.re.ceil(),
                    _ => s.re.trunc(),
                };
                return Ok(Scalar {
                    re,
                    im: 0.0,
                    unit: s.unit.clone(),
                });
            }
            "random" => {
                if !s.is_real() {
                    return math_err!(NonRealResult, "'random' needs a real bound");
                }
                let x: f64 = self.rng.borrow_mut().random();
                return Ok(Scalar {
                    re: x * s.re,
                    im: 0.0,
                    unit: s.unit.clone(),
                });
            }
            "exp" => {
                if !s.is_unitless() {
                    return math_err!(InvalidUnits, "'{name}' needs a dimensionless argument");
                }
                let scale = s.unit.as_ref().map(|u| u.scale()).unwrap_or(1.0);
                if s.is_real() {
                    return Ok(Scalar::real((s.re * scale).exp()));
                }
                if !self.is_complex {
                    return math_err!(NonRealResult, "'{name}' of a complex value");
                }
                let (re, im) = complex_exp(s.re * scale, s.im * scale);
                return Ok(Scalar::complex(re, im));
            }
            "ln" | "log" | "log_2" => {
                if !s.is_unitless() {
                    return math_err!(InvalidUnits, "'{name}' needs a dimensionless argument");
                }
                let scale = s.unit.as_ref().map(|u| u.scale()).unwrap_or(1.0);
                let base_ln = match name {
                    "log" => std::f64::consts::LN_10,
                    "log_2" => std::f64::consts::LN_2,
                    _ => 1.0,
                };
                if s.is_real() && (s.re >= 0.0 || !self.is_complex) {
                    return Ok(Scalar::real((s.re * scale).ln() / base_ln));
                }
                if !self.is_complex {
                    return math_err!(NonRealResult, "'{name}' of a complex value");
                }
                let (lr, li) = complex_ln(s.re * scale, s.im * scale);
                return Ok(Scalar::complex(lr / base_ln, li / base_ln));
            }
            _ => {}
        }
        // trig and hyperbolic families: real arguments only
        if !s.is_real() {
            return math_err!(NonRealResult, "'{name}' does not accept complex arguments");
        }
        let result = match name {
            "sin" => Scalar::real(self.angle_in(s)?.sin()),
            "cos" => Scalar::real(self.angle_in(s)?.cos()),
            "tan" => Scalar::real(self.angle_in(s)?.tan()),
            "csc" => Scalar::real(1.0 / self.angle_in(s)?.sin()),
            "sec" => Scalar::real(1.0 / self.angle_in(s)?.cos()),
            "cot" => Scalar::real(1.0 / self.angle_in(s)?.tan()),
            "asin" => self.angle_out(Self::require_real_unitless(s, name)?.asin()),
            "acos" => self.angle_out(Self::require_real_unitless(s, name)?.acos()),
            "atan" => self.angle_out(Self::require_real_unitless(s, name)?.atan()),
            "acsc" => self.angle_out((1.0 / Self::require_real_unitless(s, name)?).asin()),
            "asec" => self.angle_out((1.0 / Self::require_real_unitless(s, name)?).acos()),
            "acot" => self.angle_out((1.0 / Self::require_real_unitless(s, name)?).atan()),
            "sinh" => Scalar::real(Self::require_real_unitless(s, name)?.sinh()),
            "cosh" => Scalar::real(Self::require_real_unitless(s, name)?.cosh()),
            "tanh" => Scalar::real(Self::require_real_unitless(s, name)?.tanh()),
            "csch" => Scalar::real(1.0 / Self::require_real_unitless(s, name)?.sinh()),
            "sech" => Scalar::real(1.0 / Self::require_real_unitless(s, name)?.cosh()),
            "coth" => Scalar::real(1.0 / Self::require_real_unitless(s, name)?.tanh()),
            "asinh" => Scalar::real(Self::require_real_unitless(s, name)?.asinh()),
            "acosh" => Scalar::real(Self::require_real_unitless(s, name)?.acosh()),
            "atanh" => Scalar::real(Self::require_real_unitless(s, name)?.atanh()),
            "acsch" => Scalar::real((1.0 / Self::require_real_unitless(s, name)?).asinh()),
            "asech" => Scalar::real((1.0 / Self::require_real_unitless(s, name)?).acosh()),
            "acoth" => Scalar::real((1.0 / Self::require_real_unitless(s, name)?).atanh()),
            _ => return math_err!(InvalidFunction, "unknown function '{name}'"),
        };
        Ok(result)
    }

    pub fn function2(&self, index: usize, a: &Value, b: &Value) -> Result<Value> {
        let name = FUNCTIONS_2[index];
        zip(a, b, |x, y| match name {
            "atan2" => {
                let (yr, _) = align(x, y, ';')?;
                Ok(self.angle_out(x.re.atan2(yr)))
            }
            "root" => {
                let n = Self::require_real_unitless(y, name)?;
                if n == 0.0 {
                    return math_err!(DivisionByZero, "zero root degree");
                }
                let inv = Scalar::real(1.0 / n);
                // odd integer roots of negatives stay real
                if x.re < 0.0 && n.fract() == 0.0 && (n as i64) % 2 != 0 {
                    let pos = Scalar {
                        re: -x.re,
                        im: x.im,
                        unit: x.unit.clone(),
                    };
                    let r = self.power(&pos, &inv)?;
                    return Ok(Scalar {
                        re: -r.re,
                        im: r.im,
                        unit: r.unit,
                    });
                }
                self.power(x, &inv)
            }
            "mod" => self.remainder(x, y),
            _ => math_err!(InvalidFunction, "unknown function '{name}'"),
        })
    }

    pub fn function3(&self, index: usize, a: &Value, b: &Value, c: &Value) -> Result<Value> {
        match FUNCTIONS_3[index] {
            "if" => {
                let cond = a.as_scalar()?;
                if cond.is_truthy() {
                    Ok(b.clone())
                } else {
                    Ok(c.clone())
                }
            }
            name => math_err!(InvalidFunction, "unknown function '{name}'"),
        }
    }

    pub fn multi_function(&self, index: usize, args: &[Value]) -> Result<Value> {
        let name = MULTI_FUNCTIONS[index];
        if args.is_empty() {
            return math_err!(ArgumentCount, "'{name}' needs at least one argument");
        }
        match name {
            "switch" => {
                // switch(c1; v1; c2; v2; ...; default)
                let mut i = 0;
                while i + 1 < args.len() {
                    if args[i].as_scalar()?.is_truthy() {
                        return Ok(args[i + 1].clone());
                    }
                    i += 2;
                }
                if i < args.len() {
                    return Ok(args[i].clone());
                }
                Ok(Value::Scalar(Scalar::nan()))
            }
            "take" => {
                let n = integer_arg(args[0].as_scalar()?, "'take' selector")?;
                if n > args.len() - 1 {
                    return math_err!(IndexOutOfRange, "'take' selector {n} exceeds argument count");
                }
                Ok(args[n].clone())
            }
            _ => {
                let flat = flatten(args);
                let first = flat[0].clone();
                let mut acc = match name {
                    "sumsq" | "srss" => self.mul_scalar(&first, &first)?,
                    _ => first,
                };
                let mut count = 1usize;
                for s in &flat[1..] {
                    count += 1;
                    acc = match name {
                        "min" => {
                            let (sr, _) = align(&acc, s, ';')?;
                            if sr < acc.re {
                                Scalar {
                                    re: sr,
                                    im: 0.0,
                                    unit: acc.unit.clone(),
                                }
                            } else {
                                acc
                            }
                        }
                        "max" => {
                            let (sr, _) = align(&acc, s, ';')?;
                            if sr > acc.re {
                                Scalar {
                                    re: sr,
                                    im: 0.0,
                                    unit: acc.unit.clone(),
                                }
                            } else {
                                acc
                            }
                        }
                        "sum" | "average" | "mean" => self.add(&acc, s)?,
                        "sumsq" | "srss" => {
                            let sq = self.mul_scalar(s, s)?;
                            self.add(&acc, &sq)?
                        }
                        "product" => self.mul_scalar(&acc, s)?,
                        _ => return math_err!(InvalidFunction, "unknown function '{name}'"),
                    };
                }
                let result = match name {
                    "average" | "mean" => Scalar {
                        re: acc.re / count as f64,
                        im: acc.im / count as f64,
                        unit: acc.unit,
                    },
                    "srss" => {
                        let unit = acc.unit.as_ref().and_then(|u| u.pow(0.5));
                        Scalar {
                            re: acc.re.sqrt(),
                            im: 0.0,
                            unit,
                        }
                    }
                    _ => acc,
                };
                Ok(Value::Scalar(result))
            }
        }
    }

    /// `line`/`spline`: interpolate between the trailing arguments at a
    /// 1-based fractional position.  A position outside `1..=n` (beyond
    /// float tolerance) is NaN, as is a subnormal one.
    pub fn interpolation(&self, index: usize, args: &[Value]) -> Result<Value> {
        let name = INTERPOLATIONS[index];
        if args.len() < 2 {
            return math_err!(
                ArgumentCount,
                "'{name}' needs a position and at least one value"
            );
        }
        let x = args[0].as_scalar()?;
        if !x.is_real() || !x.is_unitless() {
            return math_err!(NonRealResult, "'{name}' position must be a plain real number");
        }
        let y = flatten(&args[1..]);
        let d = x.re;
        let n = y.len() as f64;
        if !d.is_normal() || d < 1.0 - INTERP_DELTA || d > n * (1.0 + INTERP_DELTA) {
            return Ok(Value::Scalar(Scalar::nan()));
        }
        match name {
            "line" => interp_line(&y, d),
            _ => interp_spline(&y, d),
        }
    }

    pub fn vector_function(&self, index: usize, args: &[Value]) -> Result<Value> {
        let name = VECTOR_FUNCTIONS[index];
        match name {
            "vector" => {
                let n = integer_arg(args[0].as_scalar()?, "vector length")?;
                Ok(Value::Vector(vec![Scalar::zero(); n]))
            }
            "range" => {
                let start = args[0].as_scalar()?;
                let end = args[1].as_scalar()?;
                let step = args[2].as_scalar()?;
                let (er, _) = align(start, end, ';')?;
                let (sr, _) = align(start, step, ';')?;
                if sr == 0.0 || (er - start.re).signum() * sr.signum() < 0.0 {
                    return math_err!(InvalidNumber, "range step does not reach the end value");
                }
                let count = ((er - start.re) / sr).floor() + 1.0;
                if count > MAX_EXTENT {
                    return math_err!(IndexOutOfRange, "range produces too many elements");
                }
                let mut out = Vec::with_capacity(count as usize);
                let mut k = 0.0;
                while k < count {
                    out.push(Scalar {
                        re: start.re + k * sr,
                        im: 0.0,
                        unit: start.unit.clone(),
                    });
                    k += 1.0;
                }
                Ok(Value::Vector(out))
            }
            "len" => match &args[0] {
                Value::Vector(v) => Ok(Value::real(v.len() as f64)),
                Value::Matrix(m) => Ok(Value::real((m.rows * m.cols) as f64)),
                Value::Scalar(_) => Ok(Value::real(1.0)),
            },
            "dot" => match (&args[0], &args[1]) {
                (Value::Vector(a), Value::Vector(b)) => {
                    if a.len() != b.len() {
                        return math_err!(
                            DimensionMismatch,
                            "dot product lengths differ: {} and {}",
                            a.len(),
                            b.len()
                        );
                    }
                    let mut acc = self.mul_scalar(&a[0], &b[0])?;
                    for (x, y) in a.iter().zip(b.iter()).skip(1) {
                        let term = self.mul_scalar(x, y)?;
                        acc = self.add(&acc, &term)?;
                    }
                    Ok(Value::Scalar(acc))
                }
                _ => math_err!(DimensionMismatch, "'dot' needs two vectors"),
            },
            _ => math_err!(InvalidFunction, "unknown function '{name}'"),
        }
    }

    pub fn matrix_function(&self, index: usize, args: &[Value]) -> Result<Value> {
        let name = MATRIX_FUNCTIONS[index];
        match name {
            "matrix" => {
                let rows = integer_arg(args[0].as_scalar()?, "matrix row count")?;
                let cols = integer_arg(args[1].as_scalar()?, "matrix column count")?;
                Ok(Value::Matrix(Matrix::new(rows, cols)))
            }
            "identity" => {
                let n = integer_arg(args[0].as_scalar()?, "identity size")?;
                let mut m = Matrix::new(n, n);
                for i in 0..n {
                    *m.at_mut(i, i) = Scalar::real(1.0);
                }
                Ok(Value::Matrix(m))
            }
            "utriang" | "ltriang" | "symmetric" => {
                let n = integer_arg(args[0].as_scalar()?, "matrix size")?;
                Ok(Value::Matrix(Matrix::new(n, n)))
            }
            "transpose" => match &args[0] {
                Value::Matrix(m) => {
                    let mut out = Matrix::new(m.cols, m.rows);
                    for i in 0..m.rows {
                        for j in 0..m.cols {
                            *out.at_mut(j, i) = m.at(i, j).clone();
                        }
                    }
                    Ok(Value::Matrix(out))
                }
                Value::Vector(v) => Ok(Value::Matrix(Matrix::from_rows(vec![v.clone()])?)),
                Value::Scalar(s) => Ok(Value::Scalar(s.clone())),
            },
            "det" => match &args[0] {
                Value::Matrix(m) => self.determinant(m),
                _ => math_err!(DimensionMismatch, "'det' needs a matrix"),
            },
            _ => math_err!(InvalidFunction, "unknown function '{name}'"),
        }
    }

    /// Gaussian elimination with partial pivoting over the bare
    /// numbers; the unit of the result is the element unit to the nth
    /// power.
    fn determinant(&self, m: &Matrix) -> Result<Value> {
        if m.rows != m.cols {
            return math_err!(
                DimensionMismatch,
                "determinant of a non-square {}x{} matrix",
                m.rows,
                m.cols
            );
        }
        let n = m.rows;
        let unit = m.at(0, 0).unit.clone();
        let mut a = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                let s = m.at(i, j);
                if !s.is_real() {
                    return math_err!(NonRealResult, "determinant needs a real matrix");
                }
                let (re, _) = align(m.at(0, 0), s, ';')?;
                a[i * n + j] = re;
            }
        }
        let mut det = 1.0;
        for col in 0..n {
            let mut pivot = col;
            for row in col + 1..n {
                if a[row * n + col].abs() > a[pivot * n + col].abs() {
                    pivot = row;
                }
            }
            if a[pivot * n + col] == 0.0 {
                det = 0.0;
                break;
            }
            if pivot != col {
                for j in 0..n {
                    a.swap(col * n + j, pivot * n + j);
                }
                det = -det;
            }
            det *= a[col * n + col];
            for row in col + 1..n {
                let factor = a[row * n + col] / a[col * n + col];
                for j in col..n {
                    a[row * n + j] -= factor * a[col * n + j];
                }
            }
        }
        let unit = unit.and_then(|u| u.pow(n as f64));
        Ok(Value::Scalar(Scalar {
            re: det,
            im: 0.0,
            unit,
        }))
    }

    /// 1-based element access: `v[i]` or `M[i; j]`.
    pub fn index(&self, target: &Value, indices: &[Value]) -> Result<Value> {
        match target {
            Value::Vector(v) => {
                if indices.len() != 1 {
                    return math_err!(ArgumentCount, "vector index takes one subscript");
                }
                let i = integer_arg(indices[0].as_scalar()?, "vector index")?;
                if i > v.len() {
                    return math_err!(
                        IndexOutOfRange,
                        "index {i} out of range for a vector of {}",
                        v.len()
                    );
                }
                Ok(Value::Scalar(v[i - 1].clone()))
            }
            Value::Matrix(m) => {
                if indices.len() != 2 {
                    return math_err!(ArgumentCount, "matrix index takes two subscripts");
                }
                let i = integer_arg(indices[0].as_scalar()?, "matrix row index")?;
                let j = integer_arg(indices[1].as_scalar()?, "matrix column index")?;
                if i > m.rows || j > m.cols {
                    return math_err!(
                        IndexOutOfRange,
                        "index [{i}; {j}] out of range for a {}x{} matrix",
                        m.rows,
                        m.cols
                    );
                }
                Ok(Value::Scalar(m.at(i - 1, j - 1).clone()))
            }
            Value::Scalar(_) => math_err!(DimensionMismatch, "cannot index into a scalar"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    fn calc() -> Calculator {
        Calculator::seeded(AngleMode::Radians, 7)
    }

    fn scalar(v: &Value) -> &Scalar {
        v.as_scalar().unwrap()
    }

    #[test]
    fn addition_aligns_units() {
        let c = calc();
        let m = Unit::find("m").unwrap();
        let cm = Unit::find("cm").unwrap();
        let a = Value::Scalar(Scalar::with_unit(3.0, m));
        let b = Value::Scalar(Scalar::with_unit(2.0, cm));
        let r = c.operator('+', &a, &b).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 3.02));
        assert_eq!(scalar(&r).unit.as_ref().unwrap().text(), "m");
    }

    #[test]
    fn inconsistent_addition_fails() {
        let c = calc();
        let m = Unit::find("m").unwrap();
        let s = Unit::find("s").unwrap();
        let a = Value::Scalar(Scalar::with_unit(1.0, m));
        let b = Value::Scalar(Scalar::with_unit(1.0, s));
        let err = c.operator('+', &a, &b).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::InconsistentUnits);
    }

    #[test]
    fn percent_addition() {
        let c = calc();
        let pct = Unit::find("%").unwrap();
        let a = Value::real(1.0);
        let b = Value::Scalar(Scalar::with_unit(5.0, pct));
        let r = c.operator('+', &a, &b).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 1.05));
    }

    #[test]
    fn multiplication_combines_units() {
        let c = calc();
        let kn = Unit::find("kN").unwrap();
        let m = Unit::find("m").unwrap();
        let a = Value::Scalar(Scalar::with_unit(2.0, kn));
        let b = Value::Scalar(Scalar::with_unit(3.0, m));
        let r = c.operator('*', &a, &b).unwrap();
        let s = scalar(&r).clone().normalized();
        // 2 kN * 3 m = 6 kN*m = 6000 J
        assert_eq!(s.unit.as_ref().unwrap().text(), "J");
        assert!(approx_eq!(f64, s.re, 6000.0));
    }

    #[test]
    fn power_requires_dimensionless_exponent() {
        let c = calc();
        let m = Unit::find("m").unwrap();
        let base = Value::Scalar(Scalar::with_unit(3.0, m.clone()));
        let exp = Value::Scalar(Scalar::with_unit(2.0, m));
        assert!(c.operator('^', &base, &exp).is_err());

        let r = c.operator('^', &base, &Value::real(2.0)).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 9.0));
    }

    #[test]
    fn comparison_tolerance() {
        let c = calc();
        let a = Value::real(0.1 + 0.2);
        let b = Value::real(0.3);
        let r = c.operator('≡', &a, &b).unwrap();
        assert_eq!(scalar(&r).re, 1.0);
        let r = c.operator('<', &a, &b).unwrap();
        assert_eq!(scalar(&r).re, 0.0);
    }

    #[test]
    fn integer_division_and_remainder() {
        let c = calc();
        let r = c.operator('\\', &Value::real(7.0), &Value::real(2.0)).unwrap();
        assert_eq!(scalar(&r).re, 3.0);
        let r = c.operator('%', &Value::real(7.0), &Value::real(2.0)).unwrap();
        assert_eq!(scalar(&r).re, 1.0);
        assert!(c.operator('\\', &Value::real(1.0), &Value::real(0.0)).is_err());
    }

    #[test]
    fn trig_respects_angle_mode() {
        let deg = Calculator::seeded(AngleMode::Degrees, 1);
        let (_, sin_idx) = resolve("sin").unwrap();
        let r = deg.function(sin_idx, &Value::real(90.0)).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 1.0));

        // explicit angle unit wins over the mode
        let rad_unit = Unit::find("rad").unwrap();
        let v = Value::Scalar(Scalar::with_unit(std::f64::consts::FRAC_PI_2, rad_unit));
        let r = deg.function(sin_idx, &v).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 1.0));
    }

    #[test]
    fn factorial_rules() {
        let c = calc();
        let r = c.factorial(&Value::real(5.0)).unwrap();
        assert_eq!(scalar(&r).re, 120.0);
        assert!(c.factorial(&Value::real(-1.0)).is_err());
        assert!(c.factorial(&Value::real(2.5)).is_err());
    }

    #[test]
    fn if_selects_on_threshold() {
        let c = calc();
        let (_, idx) = resolve("if").unwrap();
        assert_eq!(idx, 0);
        let r = c
            .function3(0, &Value::real(1e-13), &Value::real(1.0), &Value::real(2.0))
            .unwrap();
        assert_eq!(scalar(&r).re, 2.0);
    }

    #[test]
    fn multi_functions() {
        let c = calc();
        let args = [Value::real(3.0), Value::real(1.0), Value::real(2.0)];
        let (_, min_idx) = resolve("min").unwrap();
        let r = c.multi_function(min_idx, &args).unwrap();
        assert_eq!(scalar(&r).re, 1.0);
        let (_, sum_idx) = resolve("sum").unwrap();
        let r = c.multi_function(sum_idx, &args).unwrap();
        assert_eq!(scalar(&r).re, 6.0);
        let (_, take_idx) = resolve("take").unwrap();
        let r = c
            .multi_function(take_idx, &[Value::real(2.0), Value::real(10.0), Value::real(20.0)])
            .unwrap();
        assert_eq!(scalar(&r).re, 20.0);
    }

    #[test]
    fn vector_and_matrix_builders() {
        let c = calc();
        let (_, range_idx) = resolve("range").unwrap();
        let r = c
            .vector_function(
                range_idx,
                &[Value::real(1.0), Value::real(5.0), Value::real(1.0)],
            )
            .unwrap();
        match r {
            Value::Vector(ref v) => assert_eq!(v.len(), 5),
            _ => panic!("expected vector"),
        }
        let (_, id_idx) = resolve("identity").unwrap();
        let m = c.matrix_function(id_idx, &[Value::real(3.0)]).unwrap();
        let (_, det_idx) = resolve("det").unwrap();
        let d = c.matrix_function(det_idx, &[m]).unwrap();
        assert_eq!(scalar(&d).re, 1.0);
    }

    #[test]
    fn indexing_is_one_based() {
        let c = calc();
        let v = Value::Vector(vec![
            Scalar::real(1.0),
            Scalar::real(2.0),
            Scalar::real(3.0),
        ]);
        let r = c.index(&v, &[Value::real(2.0)]).unwrap();
        assert_eq!(scalar(&r).re, 2.0);
        assert!(c.index(&v, &[Value::real(4.0)]).is_err());
        assert!(c.index(&v, &[Value::real(0.0)]).is_err());
    }

    #[test]
    fn purity_exclusions() {
        let (ns, idx) = resolve("random").unwrap();
        assert!(!is_pure(ns, idx));
        let (ns, idx) = resolve("identity").unwrap();
        assert!(!is_pure(ns, idx));
        let (ns, idx) = resolve("sin").unwrap();
        assert!(is_pure(ns, idx));
        let (ns, idx) = resolve("transpose").unwrap();
        assert!(is_pure(ns, idx));
    }

    #[test]
    fn scalar_namespace_priority() {
        // no clash today, but resolution order is scalar-first
        assert_eq!(resolve("sin").unwrap().0, Namespace::Function);
        assert_eq!(resolve("dot").unwrap().0, Namespace::VectorFunction);
        assert_eq!(resolve("det").unwrap().0, Namespace::MatrixFunction);
    }

    #[test]
    fn random_is_bounded() {
        let c = Calculator::seeded(AngleMode::Radians, 42);
        let (_, random_idx) = resolve("random").unwrap();
        for _ in 0..10 {
            let r = c.function(random_idx, &Value::real(5.0)).unwrap();
            let x = scalar(&r).re;
            assert!((0.0..5.0).contains(&x));
        }
    }

    #[test]
    fn exp_and_ln_scale_dimensionless_arguments() {
        let c = calc();
        let pct = Unit::find("%").unwrap();
        let (_, exp_idx) = resolve("exp").unwrap();
        let r = c
            .function(exp_idx, &Value::Scalar(Scalar::with_unit(50.0, pct.clone())))
            .unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 0.5f64.exp(), epsilon = 1e-12));

        let (_, ln_idx) = resolve("ln").unwrap();
        let r = c
            .function(ln_idx, &Value::Scalar(Scalar::with_unit(100.0, pct)))
            .unwrap();
        assert!(scalar(&r).re.abs() < 1e-12);
    }

    #[test]
    fn real_mode_never_widens_to_complex() {
        let c = calc();
        let (_, sqrt_idx) = resolve("sqrt").unwrap();
        let r = c.function(sqrt_idx, &Value::real(-1.0)).unwrap();
        assert!(scalar(&r).re.is_nan());
        assert_eq!(scalar(&r).im, 0.0);

        let (_, ln_idx) = resolve("ln").unwrap();
        let r = c.function(ln_idx, &Value::real(-1.0)).unwrap();
        assert!(scalar(&r).re.is_nan());

        let r = c.operator('^', &Value::real(-8.0), &Value::real(0.5)).unwrap();
        assert!(scalar(&r).re.is_nan());
    }

    #[test]
    fn complex_mode_takes_principal_branches() {
        let c = Calculator::new(AngleMode::Radians, true);
        let (_, sqrt_idx) = resolve("sqrt").unwrap();
        let i = c.function(sqrt_idx, &Value::real(-1.0)).unwrap();
        assert!(scalar(&i).re.abs() < 1e-12);
        assert!(approx_eq!(f64, scalar(&i).im, 1.0, epsilon = 1e-12));

        let (_, exp_idx) = resolve("exp").unwrap();
        let r = c.function(exp_idx, &i).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 1.0f64.cos(), epsilon = 1e-12));
        assert!(approx_eq!(f64, scalar(&r).im, 1.0f64.sin(), epsilon = 1e-12));

        let (_, ln_idx) = resolve("ln").unwrap();
        let r = c.function(ln_idx, &Value::real(-1.0)).unwrap();
        assert!(scalar(&r).re.abs() < 1e-12);
        assert!(approx_eq!(f64, scalar(&r).im, std::f64::consts::PI, epsilon = 1e-12));
    }

    #[test]
    fn line_interpolates_between_knots() {
        let c = calc();
        let (ns, idx) = resolve("line").unwrap();
        assert_eq!(ns, Namespace::Interpolation);
        let args = [
            Value::real(2.5),
            Value::real(1.0),
            Value::real(2.0),
            Value::real(4.0),
        ];
        let r = c.interpolation(idx, &args).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 3.0, epsilon = 1e-12));

        // exact knot positions return the knot
        let args = [Value::real(3.0), Value::real(1.0), Value::real(2.0), Value::real(4.0)];
        assert_eq!(scalar(&c.interpolation(idx, &args).unwrap()).re, 4.0);

        // out-of-range positions are NaN
        let args = [Value::real(0.5), Value::real(1.0), Value::real(2.0)];
        assert!(scalar(&c.interpolation(idx, &args).unwrap()).re.is_nan());
    }

    #[test]
    fn line_aligns_knot_units() {
        let c = calc();
        let m = Unit::find("m").unwrap();
        let cm = Unit::find("cm").unwrap();
        let (_, idx) = resolve("line").unwrap();
        let args = [
            Value::real(1.5),
            Value::Scalar(Scalar::with_unit(1.0, m)),
            Value::Scalar(Scalar::with_unit(300.0, cm)),
        ];
        let r = c.interpolation(idx, &args).unwrap();
        assert!(approx_eq!(f64, scalar(&r).re, 2.0, epsilon = 1e-12));
        assert_eq!(scalar(&r).unit.as_ref().unwrap().text(), "m");
    }

    #[test]
    fn spline_passes_through_the_knots() {
        let c = calc();
        let (_, idx) = resolve("spline").unwrap();
        let knots = [1.0, 4.0, 9.0, 16.0];
        for (i, y) in knots.iter().enumerate() {
            let mut args = vec![Value::real(i as f64 + 1.0)];
            args.extend(knots.iter().map(|k| Value::real(*k)));
            let r = c.interpolation(idx, &args).unwrap();
            assert!(approx_eq!(f64, scalar(&r).re, *y, epsilon = 1e-12));
        }
        // between knots the curve stays within the bracketing values
        let mut args = vec![Value::real(2.5)];
        args.extend(knots.iter().map(|k| Value::real(*k)));
        let r = c.interpolation(idx, &args).unwrap();
        let v = scalar(&r).re;
        assert!(v > 4.0 && v < 9.0, "spline(2.5) = {v}");
    }
}
