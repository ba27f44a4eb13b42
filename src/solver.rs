// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Numeric primitives behind the solver blocks: bracketed root
//! finding (Anderson-Bjorck false position with a sign-change scan),
//! golden-section extrema, adaptive Simpson and Romberg quadrature,
//! and Richardson-extrapolated differentiation.  Everything works on
//! bare numbers; the block layer owns units and variable binding.
//! "No solution" is reported as NaN, not as an error.

use crate::common::Result;

/// Objective callback; failures (cancellation, evaluation errors)
/// propagate out of the solver untouched.
pub type Func<'a> = &'a mut dyn FnMut(f64) -> Result<f64>;

const MAX_ITERATIONS: usize = 100;
const SCAN_STEPS: usize = 32;
const GOLDEN: f64 = 0.618_033_988_749_894_9;
const SIMPSON_DEPTH: usize = 40;
const ROMBERG_LEVELS: usize = 20;

pub struct Solver {
    pub precision: f64,
}

impl Default for Solver {
    fn default() -> Self {
        Solver { precision: 1e-14 }
    }
}

impl Solver {
    fn tol(&self, a: f64, b: f64) -> f64 {
        self.precision * a.abs().max(b.abs()).max(1.0)
    }

    /// Root of f in [a, b].  If the endpoints do not bracket a sign
    /// change, the interval is scanned first; NaN when no crossing
    /// exists.
    pub fn root(&self, f: Func, a: f64, b: f64) -> Result<f64> {
        let fa = f(a)?;
        if fa == 0.0 {
            return Ok(a);
        }
        let fb = f(b)?;
        if fb == 0.0 {
            return Ok(b);
        }
        if fa * fb < 0.0 {
            return self.false_position(f, a, fa, b, fb);
        }
        // scan for a bracket
        let step = (b - a) / SCAN_STEPS as f64;
        let mut x0 = a;
        let mut y0 = fa;
        for i in 1..=SCAN_STEPS {
            let x1 = a + step * i as f64;
            let y1 = f(x1)?;
            if y1 == 0.0 {
                return Ok(x1);
            }
            if y0 * y1 < 0.0 {
                return self.false_position(f, x0, y0, x1, y1);
            }
            x0 = x1;
            y0 = y1;
        }
        Ok(f64::NAN)
    }

    /// Anderson-Bjorck modified false position.
    fn false_position(&self, f: Func, a: f64, fa: f64, b: f64, fb: f64) -> Result<f64> {
        let (mut a, mut fa, mut b, mut fb) = (a, fa, b, fb);
        let mut x = a;
        for _ in 0..MAX_ITERATIONS {
            x = b - fb * (b - a) / (fb - fa);
            let fx = f(x)?;
            if fx == 0.0 || (b - a).abs() < self.tol(a, b) {
                return Ok(x);
            }
            if fx * fb < 0.0 {
                a = b;
                fa = fb;
            } else {
                let m = 1.0 - fx / fb;
                fa *= if m > 0.0 { m } else { 0.5 };
            }
            b = x;
            fb = fx;
        }
        Ok(x)
    }

    /// Arg-extremum of f over [a, b] by golden-section search; returns
    /// (x, f(x)).  The endpoints compete with the interior optimum.
    pub fn extremum(&self, f: Func, a: f64, b: f64, maximize: bool) -> Result<(f64, f64)> {
        let sign = if maximize { 1.0 } else { -1.0 };
        let (mut lo, mut hi) = (a, b);
        let mut x1 = hi - GOLDEN * (hi - lo);
        let mut x2 = lo + GOLDEN * (hi - lo);
        let mut y1 = sign * f(x1)?;
        let mut y2 = sign * f(x2)?;
        for _ in 0..MAX_ITERATIONS {
            if (hi - lo).abs() < self.tol(a, b) {
                break;
            }
            if y1 < y2 {
                lo = x1;
                x1 = x2;
                y1 = y2;
                x2 = lo + GOLDEN * (hi - lo);
                y2 = sign * f(x2)?;
            } else {
                hi = x2;
                x2 = x1;
                y2 = y1;
                x1 = hi - GOLDEN * (hi - lo);
                y1 = sign * f(x1)?;
            }
        }
        let xm = (lo + hi) / 2.0;
        let mut best = (xm, f(xm)?);
        for x in [a, b] {
            let y = f(x)?;
            if sign * y > sign * best.1 {
                best = (x, y);
            }
        }
        Ok(best)
    }

    /// Definite integral by adaptive Simpson subdivision.
    pub fn area(&self, f: Func, a: f64, b: f64) -> Result<f64> {
        if a == b {
            return Ok(0.0);
        }
        let fa = f(a)?;
        let fb = f(b)?;
        let m = (a + b) / 2.0;
        let fm = f(m)?;
        let whole = (b - a) / 6.0 * (fa + 4.0 * fm + fb);
        let eps = self.precision.max(1e-13) * (b - a).abs().max(1.0);
        adaptive_simpson(f, a, fa, b, fb, m, fm, whole, eps, SIMPSON_DEPTH)
    }

    /// Definite integral by Romberg extrapolation of the trapezoid
    /// rule; a different engine than `area` for smooth integrands.
    pub fn integral(&self, f: Func, a: f64, b: f64) -> Result<f64> {
        if a == b {
            return Ok(0.0);
        }
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(ROMBERG_LEVELS);
        let mut h = b - a;
        let mut sum = (f(a)? + f(b)?) / 2.0;
        rows.push(vec![h * sum]);
        let eps = self.precision.max(1e-13);
        for level in 1..ROMBERG_LEVELS {
            let points = 1usize << (level - 1);
            h /= 2.0;
            for i in 0..points {
                sum += f(a + h * (2 * i + 1) as f64)?;
            }
            let mut row = vec![h * sum];
            let prev = &rows[level - 1];
            let mut factor = 4.0;
            for j in 0..prev.len() {
                let value = (factor * row[j] - prev[j]) / (factor - 1.0);
                row.push(value);
                factor *= 4.0;
            }
            let last = *row.last().unwrap();
            let prev_last = *prev.last().unwrap();
            if level > 3 && (last - prev_last).abs() <= eps * last.abs().max(1.0) {
                return Ok(last);
            }
            rows.push(row);
        }
        Ok(*rows.last().unwrap().last().unwrap())
    }

    /// First derivative at x: central differences with two Richardson
    /// refinements.
    pub fn slope(&self, f: Func, x: f64) -> Result<f64> {
        let h = x.abs().max(1.0) * 1e-3;
        let d1 = (f(x + h)? - f(x - h)?) / (2.0 * h);
        let h2 = h / 2.0;
        let d2 = (f(x + h2)? - f(x - h2)?) / (2.0 * h2);
        let h4 = h / 4.0;
        let d4 = (f(x + h4)? - f(x - h4)?) / (2.0 * h4);
        let r1 = (4.0 * d2 - d1) / 3.0;
        let r2 = (4.0 * d4 - d2) / 3.0;
        Ok((16.0 * r2 - r1) / 15.0)
    }
}

#[allow(clippy::too_many_arguments)]
fn adaptive_simpson(
    f: Func,
    a: f64,
    fa: f64,
    b: f64,
    fb: f64,
    m: f64,
    fm: f64,
    whole: f64,
    eps: f64,
    depth: usize,
) -> Result<f64> {
    let lm = (a + m) / 2.0;
    let rm = (m + b) / 2.0;
    let flm = f(lm)?;
    let frm = f(rm)?;
    let left = (m - a) / 6.0 * (fa + 4.0 * flm + fm);
    let right = (b - m) / 6.0 * (fm + 4.0 * frm + fb);
    let delta = left + right - whole;
    if depth == 0 || delta.abs() <= 15.0 * eps {
        return Ok(left + right + delta / 15.0);
    }
    let half = eps / 2.0;
    Ok(adaptive_simpson(f, a, fa, m, fm, lm, flm, left, half, depth - 1)?
        + adaptive_simpson(f, m, fm, b, fb, rm, frm, right, half, depth - 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    fn solver() -> Solver {
        Solver::default()
    }

    #[test]
    fn root_of_a_bracketed_function() {
        let s = solver();
        let mut f = |x: f64| Ok(x * x - 2.0);
        let r = s.root(&mut f, 1.0, 2.0).unwrap();
        assert!(approx_eq!(f64, r, std::f64::consts::SQRT_2, epsilon = 1e-10));
    }

    #[test]
    fn root_scans_when_endpoints_agree_in_sign() {
        let s = solver();
        // both endpoints positive, crossing inside
        let mut f = |x: f64| Ok((x - 1.0) * (x - 3.0));
        let r = s.root(&mut f, 0.0, 2.5).unwrap();
        assert!(approx_eq!(f64, r, 1.0, epsilon = 1e-9));
    }

    #[test]
    fn no_crossing_is_nan() {
        let s = solver();
        let mut f = |x: f64| Ok(x * x + 1.0);
        let r = s.root(&mut f, -5.0, 5.0).unwrap();
        assert!(r.is_nan());
    }

    #[test]
    fn extrema_by_golden_section() {
        let s = solver();
        let mut f = |x: f64| Ok(-(x - 2.0) * (x - 2.0) + 5.0);
        let (x, y) = s.extremum(&mut f, 0.0, 4.0, true).unwrap();
        assert!(approx_eq!(f64, x, 2.0, epsilon = 1e-6));
        assert!(approx_eq!(f64, y, 5.0, epsilon = 1e-9));

        // minimum at an endpoint
        let mut g = |x: f64| Ok(x);
        let (x, y) = s.extremum(&mut g, 1.0, 3.0, false).unwrap();
        assert!(approx_eq!(f64, x, 1.0, epsilon = 1e-6));
        assert!(approx_eq!(f64, y, 1.0, epsilon = 1e-6));
    }

    #[test]
    fn quadrature_engines_agree() {
        let s = solver();
        let mut f = |x: f64| Ok(x.sin());
        let area = s.area(&mut f, 0.0, std::f64::consts::PI).unwrap();
        let mut f = |x: f64| Ok(x.sin());
        let integral = s.integral(&mut f, 0.0, std::f64::consts::PI).unwrap();
        assert!(approx_eq!(f64, area, 2.0, epsilon = 1e-9));
        assert!(approx_eq!(f64, integral, 2.0, epsilon = 1e-9));
    }

    #[test]
    fn empty_interval_integrates_to_zero() {
        let s = solver();
        let mut f = |x: f64| Ok(x);
        assert_eq!(s.area(&mut f, 2.0, 2.0).unwrap(), 0.0);
    }

    #[test]
    fn slope_matches_the_analytic_derivative() {
        let s = solver();
        let mut f = |x: f64| Ok(x * x * x);
        let d = s.slope(&mut f, 2.0).unwrap();
        assert!(approx_eq!(f64, d, 12.0, epsilon = 1e-8));
        let mut f = |x: f64| Ok(x.exp());
        let d = s.slope(&mut f, 0.0).unwrap();
        assert!(approx_eq!(f64, d, 1.0, epsilon = 1e-8));
    }

    #[test]
    fn callback_errors_propagate() {
        let s = solver();
        let mut f = |_x: f64| crate::math_err!(Interrupted);
        let err = s.root(&mut f, 0.0, 1.0).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::Interrupted);
    }
}
