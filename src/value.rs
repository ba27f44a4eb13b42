// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Runtime values: a unit-carrying complex scalar, a vector of scalars,
//! or a rectangular matrix.  All arithmetic on these lives in the
//! calculator kernel; this module owns construction, shape checks, unit
//! application and target-unit conversion.

use std::fmt;

use crate::common::Result;
use crate::math_err;
use crate::units::Unit;

/// Truthiness threshold: a scalar whose |re| falls below this counts as
/// false in conditions and comparisons.
pub const ZERO_THRESHOLD: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq)]
pub struct Scalar {
    pub re: f64,
    pub im: f64,
    pub unit: Option<Unit>,
}

impl Scalar {
    pub fn real(re: f64) -> Self {
        Scalar {
            re,
            im: 0.0,
            unit: None,
        }
    }

    pub fn complex(re: f64, im: f64) -> Self {
        Scalar { re, im, unit: None }
    }

    pub fn with_unit(re: f64, unit: Unit) -> Self {
        Scalar {
            re,
            im: 0.0,
            unit: Some(unit),
        }
    }

    pub fn zero() -> Self {
        Scalar::real(0.0)
    }

    pub fn nan() -> Self {
        Scalar::real(f64::NAN)
    }

    pub fn is_real(&self) -> bool {
        self.im == 0.0
    }

    pub fn is_unitless(&self) -> bool {
        match self.unit {
            None => true,
            Some(ref u) => u.is_dimensionless(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        self.re.abs() >= ZERO_THRESHOLD
    }

    /// Convert to an explicit target unit.  Pure temperature units get
    /// the additive offset on top of the scale multiply.
    pub fn convert_to(&self, target: &Unit) -> Result<Scalar> {
        match self.unit {
            None => {
                if target.is_dimensionless() {
                    Ok(Scalar {
                        re: self.re / target.scale(),
                        im: self.im / target.scale(),
                        unit: Some(target.clone()),
                    })
                } else {
                    math_err!(
                        InconsistentUnits,
                        "cannot convert a unitless value to '{}'",
                        target.text()
                    )
                }
            }
            Some(ref u) => {
                if !u.is_consistent_with(target) {
                    return math_err!(
                        InconsistentUnits,
                        "inconsistent units: '{}' and '{}'",
                        u.text(),
                        target.text()
                    );
                }
                let factor = u.convert_factor(target);
                let offset = if u.is_temperature() && target.is_temperature() {
                    u.temp_offset(target)
                } else {
                    0.0
                };
                Ok(Scalar {
                    re: self.re * factor + offset,
                    im: self.im * factor,
                    unit: Some(target.clone()),
                })
            }
        }
    }

    /// Rewrite an anonymous compound unit to its field's canonical
    /// derived unit (N, J, W, Pa, V, ...).  Named units pass through.
    pub fn normalized(self) -> Scalar {
        match self.unit {
            Some(ref u) => match u.normalized() {
                Some((canonical, factor)) => Scalar {
                    re: self.re * factor,
                    im: self.im * factor,
                    unit: Some(canonical),
                },
                None => self,
            },
            None => self,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    data: Vec<Scalar>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![Scalar::zero(); rows * cols],
        }
    }

    pub fn from_rows(rows: Vec<Vec<Scalar>>) -> Result<Matrix> {
        let nrows = rows.len();
        let ncols = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        if nrows == 0 || ncols == 0 {
            return math_err!(DimensionMismatch, "empty matrix literal");
        }
        let mut m = Matrix::new(nrows, ncols);
        for (i, row) in rows.into_iter().enumerate() {
            for (j, v) in row.into_iter().enumerate() {
                m.data[i * ncols + j] = v;
            }
        }
        Ok(m)
    }

    /// 0-based access; bounds are the caller's responsibility.
    pub fn at(&self, row: usize, col: usize) -> &Scalar {
        &self.data[row * self.cols + col]
    }

    pub fn at_mut(&mut self, row: usize, col: usize) -> &mut Scalar {
        &mut self.data[row * self.cols + col]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scalar> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Scalar> {
        self.data.iter_mut()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Vector(Vec<Scalar>),
    Matrix(Matrix),
}

impl Value {
    pub fn real(re: f64) -> Self {
        Value::Scalar(Scalar::real(re))
    }

    pub fn as_scalar(&self) -> Result<&Scalar> {
        match self {
            Value::Scalar(s) => Ok(s),
            Value::Vector(_) => math_err!(DimensionMismatch, "scalar expected, got a vector"),
            Value::Matrix(_) => math_err!(DimensionMismatch, "scalar expected, got a matrix"),
        }
    }

    pub fn into_scalar(self) -> Result<Scalar> {
        match self {
            Value::Scalar(s) => Ok(s),
            Value::Vector(_) => math_err!(DimensionMismatch, "scalar expected, got a vector"),
            Value::Matrix(_) => math_err!(DimensionMismatch, "scalar expected, got a matrix"),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Scalar(_))
    }

    /// True when every scalar inside is a plain real number.
    pub fn is_real(&self) -> bool {
        match self {
            Value::Scalar(s) => s.is_real(),
            Value::Vector(v) => v.iter().all(Scalar::is_real),
            Value::Matrix(m) => m.iter().all(Scalar::is_real),
        }
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
        }
    }

    /// Attach a unit literal to a value, element-wise for aggregates.
    /// A value that already carries units multiplies them in.
    pub fn apply_unit(self, unit: &Unit) -> Value {
        fn apply(s: &mut Scalar, unit: &Unit) {
            s.unit = match s.unit.take() {
                None => Some(unit.clone()),
                Some(u) => u.multiply(unit),
            };
        }
        match self {
            Value::Scalar(mut s) => {
                apply(&mut s, unit);
                Value::Scalar(s)
            }
            Value::Vector(mut v) => {
                for s in v.iter_mut() {
                    apply(s, unit);
                }
                Value::Vector(v)
            }
            Value::Matrix(mut m) => {
                for s in m.iter_mut() {
                    apply(s, unit);
                }
                Value::Matrix(m)
            }
        }
    }

    pub fn convert_to(&self, target: &Unit) -> Result<Value> {
        match self {
            Value::Scalar(s) => Ok(Value::Scalar(s.convert_to(target)?)),
            Value::Vector(v) => {
                let converted: Result<Vec<Scalar>> =
                    v.iter().map(|s| s.convert_to(target)).collect();
                Ok(Value::Vector(converted?))
            }
            Value::Matrix(m) => {
                let mut out = m.clone();
                for s in out.iter_mut() {
                    *s = s.convert_to(target)?;
                }
                Ok(Value::Matrix(out))
            }
        }
    }

    pub fn normalized(self) -> Value {
        match self {
            Value::Scalar(s) => Value::Scalar(s.normalized()),
            Value::Vector(v) => Value::Vector(v.into_iter().map(Scalar::normalized).collect()),
            Value::Matrix(mut m) => {
                for s in m.iter_mut() {
                    *s = s.clone().normalized();
                }
                Value::Matrix(m)
            }
        }
    }
}

fn fmt_scalar(s: &Scalar, f: &mut fmt::Formatter) -> fmt::Result {
    if s.im == 0.0 {
        write!(f, "{}", s.re)?;
    } else if s.re == 0.0 {
        write!(f, "{}i", s.im)?;
    } else if s.im < 0.0 {
        write!(f, "{} - {}i", s.re, -s.im)?;
    } else {
        write!(f, "{} + {}i", s.re, s.im)?;
    }
    if let Some(ref u) = s.unit {
        let text = u.text();
        if !text.is_empty() {
            write!(f, " {text}")?;
        }
    }
    Ok(())
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_scalar(self, f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Scalar(s) => fmt_scalar(s, f),
            Value::Vector(v) => {
                write!(f, "[")?;
                for (i, s) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    fmt_scalar(s, f)?;
                }
                write!(f, "]")
            }
            Value::Matrix(m) => {
                write!(f, "[")?;
                for row in 0..m.rows {
                    if row > 0 {
                        write!(f, " | ")?;
                    }
                    for col in 0..m.cols {
                        if col > 0 {
                            write!(f, "; ")?;
                        }
                        fmt_scalar(m.at(row, col), f)?;
                    }
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn scalar_conversion_with_units() {
        let cm = Unit::find("cm").unwrap();
        let m = Unit::find("m").unwrap();
        let v = Scalar::with_unit(200.0, cm).convert_to(&m).unwrap();
        assert!(approx_eq!(f64, v.re, 2.0));
        assert_eq!(v.unit.unwrap().text(), "m");
    }

    #[test]
    fn inconsistent_conversion_fails() {
        let s = Unit::find("s").unwrap();
        let m = Unit::find("m").unwrap();
        let err = Scalar::with_unit(1.0, s).convert_to(&m).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::InconsistentUnits);
    }

    #[test]
    fn matrix_ragged_rows_pad_with_zero() {
        let m = Matrix::from_rows(vec![
            vec![Scalar::real(1.0), Scalar::real(2.0)],
            vec![Scalar::real(3.0)],
        ])
        .unwrap();
        assert_eq!(m.rows, 2);
        assert_eq!(m.cols, 2);
        assert_eq!(m.at(1, 1).re, 0.0);
    }

    #[test]
    fn truthiness_threshold() {
        assert!(!Scalar::real(1e-13).is_truthy());
        assert!(Scalar::real(1e-11).is_truthy());
    }

    #[test]
    fn display_forms() {
        let m = Unit::find("m").unwrap();
        assert_eq!(format!("{}", Scalar::with_unit(2.5, m)), "2.5 m");
        assert_eq!(format!("{}", Scalar::complex(1.0, -2.0)), "1 - 2i");
        let v = Value::Vector(vec![Scalar::real(1.0), Scalar::real(2.0)]);
        assert_eq!(format!("{v}"), "[1; 2]");
    }
}
