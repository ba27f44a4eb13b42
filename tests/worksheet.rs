// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use float_cmp::approx_eq;
use worksheet_engine::{AngleMode, ErrorCode, MathParser, Settings, Value};

fn parser() -> MathParser {
    MathParser::new(Settings {
        angle_mode: AngleMode::Radians,
        ..Settings::default()
    })
}

fn num(p: &mut MathParser, text: &str) -> f64 {
    scalar(p, text).0
}

fn scalar(p: &mut MathParser, text: &str) -> (f64, String) {
    let v = p.calculate(text).unwrap().unwrap();
    match v {
        Value::Scalar(s) => (s.re, s.unit.map(|u| u.text()).unwrap_or_default()),
        other => panic!("expected a scalar, got {other}"),
    }
}

#[test]
fn unit_arithmetic_converts_into_the_left_frame() {
    let mut p = parser();
    let (re, unit) = scalar(&mut p, "3m + 2cm");
    assert!(approx_eq!(f64, re, 3.02));
    assert_eq!(unit, "m");

    let (re, unit) = scalar(&mut p, "3m + 2cm | mm");
    assert!(approx_eq!(f64, re, 3020.0));
    assert_eq!(unit, "mm");
}

#[test]
fn compound_units_normalize_to_derived_names() {
    let mut p = parser();
    let (re, unit) = scalar(&mut p, "2kN * 3m");
    assert!(approx_eq!(f64, re, 6000.0));
    assert_eq!(unit, "J");
}

#[test]
fn temperature_offsets_only_at_explicit_conversion() {
    let mut p = parser();
    let (re, unit) = scalar(&mut p, "100°C | °F");
    assert!(approx_eq!(f64, re, 212.0, epsilon = 1e-9));
    assert_eq!(unit, "°F");
}

#[test]
fn root_block_approximates_sqrt_two() {
    let mut p = parser();
    let v = num(&mut p, "$root{x^2 - 2; x = 1 : 2}");
    assert!(approx_eq!(f64, v, std::f64::consts::SQRT_2, epsilon = 1e-10));
}

#[test]
fn repeat_block_sums_one_to_five() {
    let mut p = parser();
    assert_eq!(num(&mut p, "$repeat{ans = ans + i @ i = 1 : 5}"), 15.0);
}

#[test]
fn vector_subscripts_are_one_based() {
    let mut p = parser();
    assert_eq!(num(&mut p, "[1; 2; 3][2]"), 2.0);
}

#[test]
fn trailing_operator_is_incomplete() {
    let mut p = parser();
    let err = p.calculate("2 +").unwrap_err();
    assert_eq!(err.code, ErrorCode::IncompleteExpression);
    assert_eq!(format!("{}", err.code), "incomplete_expression");
}

#[test]
fn one_argument_calls_are_memoized() {
    let mut p = parser();
    // random() makes a second body evaluation observable
    p.calculate("f(x) = random(1000000) + x * 0").unwrap();
    let first = num(&mut p, "f(1)");
    let second = num(&mut p, "f(1)");
    assert_eq!(first, second);
    let other = num(&mut p, "f(2)");
    assert_ne!(first, other);
}

#[test]
fn recursive_definitions_evaluate_to_nan() {
    let mut p = parser();
    p.calculate("f(x) = f(x) + 1").unwrap();
    assert!(num(&mut p, "f(1)").is_nan());
}

#[test]
fn compiled_and_interpreted_results_agree() {
    let mut p = parser();
    p.calculate("a = 3").unwrap();
    p.calculate("v = [1; 2; 3]").unwrap();
    for text in [
        "2^10 - 24",
        "a * (1 + 2) - a!",
        "sqrt(a + 1)",
        "sum(a; 2; 7) + v[2]",
        "if(a > 2; 10; 20)",
    ] {
        let parsed = p.parse(text).unwrap();
        let direct = p.evaluate(&parsed).unwrap().unwrap();
        p.compile(&parsed).unwrap();
        let compiled = p.evaluate(&parsed).unwrap().unwrap();
        assert_eq!(direct, compiled, "mismatch for '{text}'");
    }
}

#[test]
fn inconsistent_solver_bounds_never_reach_the_solver() {
    let mut p = parser();
    let err = p.calculate("$root{x - 2 @ x = 1m : 3s}").unwrap_err();
    assert_eq!(err.code, ErrorCode::InconsistentUnits);
}

#[test]
fn a_small_worksheet() {
    let mut p = parser();
    p.calculate("b = 30cm").unwrap();
    p.calculate("h = 50cm").unwrap();
    let (re, unit) = scalar(&mut p, "A = b * h | cm^2");
    assert!(approx_eq!(f64, re, 1500.0));
    assert_eq!(unit, "cm^2");

    p.calculate("f(x) = x^3 / 12").unwrap();
    let v = num(&mut p, "$integral{f(x) @ x = 0 : 2}");
    assert!(approx_eq!(f64, v, 1.0 / 3.0, epsilon = 1e-9));

    // a failing statement leaves earlier results intact
    assert!(p.calculate("h = 1m + 1s").is_err());
    let (re, unit) = scalar(&mut p, "h");
    assert!(approx_eq!(f64, re, 50.0));
    assert_eq!(unit, "cm");
}

#[test]
fn degree_mode_applies_to_trig() {
    let mut p = MathParser::default();
    assert!(approx_eq!(f64, num(&mut p, "sin(30)"), 0.5, epsilon = 1e-12));
    assert!(approx_eq!(f64, num(&mut p, "asin(0.5)"), 30.0, epsilon = 1e-9));
    assert!(approx_eq!(
        f64,
        num(&mut p, "sin(π / 6 * 1rad)"),
        0.5,
        epsilon = 1e-12
    ));
}

#[test]
fn interpolation_functions_read_knot_lists() {
    let mut p = parser();
    assert!(approx_eq!(f64, num(&mut p, "line(2.5; 1; 2; 4)"), 3.0, epsilon = 1e-12));
    let (re, unit) = scalar(&mut p, "line(1.5; 1m; 300cm)");
    assert!(approx_eq!(f64, re, 2.0, epsilon = 1e-12));
    assert_eq!(unit, "m");
    assert!(num(&mut p, "spline(0.5; 1; 4; 9)").is_nan());
}

#[test]
fn complex_mode_is_a_session_setting() {
    let mut p = parser();
    assert!(num(&mut p, "sqrt(-1)").is_nan());

    let mut p = MathParser::new(Settings {
        angle_mode: AngleMode::Radians,
        is_complex: true,
        ..Settings::default()
    });
    let v = p.calculate("exp(sqrt(-1))").unwrap().unwrap();
    match v {
        Value::Scalar(s) => {
            assert!(approx_eq!(f64, s.re, 1.0f64.cos(), epsilon = 1e-12));
            assert!(approx_eq!(f64, s.im, 1.0f64.sin(), epsilon = 1e-12));
        }
        other => panic!("expected a scalar, got {other}"),
    }
}
