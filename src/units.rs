// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Dimensional units: an exponent vector over 8 base dimensions plus a
//! single scale factor relative to the coherent base unit of each
//! dimension (gram, metre, second, ampere, kelvin-degree, mole,
//! candela, radian).  Two units are consistent iff their exponent
//! vectors match; conversion between consistent units is a scale
//! multiply, with an additive offset only for pure temperature units.

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

use crate::common::Result;
use crate::math_err;

pub const DIM_COUNT: usize = 8;

const DIM_NAMES: [&str; DIM_COUNT] = ["g", "m", "s", "A", "K", "mol", "cd", "rad"];

const MASS: usize = 0;
const LENGTH: usize = 1;
const TIME: usize = 2;
const CURRENT: usize = 3;
const TEMP: usize = 4;
#[allow(dead_code)]
const AMOUNT: usize = 5;
#[allow(dead_code)]
const LUMINOSITY: usize = 6;
const ANGLE: usize = 7;

/// The physical domain a compound unit most plausibly belongs to,
/// used to pick a canonical derived unit when reporting results.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Mechanical,
    Electrical,
    Other,
}

#[derive(Clone, Debug)]
pub struct Unit {
    powers: [f32; DIM_COUNT],
    scale: f64,
    text: Option<String>,
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.powers == other.powers && self.scale == other.scale
    }
}

impl Unit {
    fn new(powers: [f32; DIM_COUNT], scale: f64, text: &str) -> Self {
        Unit {
            powers,
            scale,
            text: Some(text.to_string()),
        }
    }

    fn base(dim: usize, scale: f64, text: &str) -> Self {
        let mut powers = [0f32; DIM_COUNT];
        powers[dim] = 1.0;
        Unit::new(powers, scale, text)
    }

    /// Look up a named unit in the builtin table.
    pub fn find(name: &str) -> Option<Unit> {
        UNITS.get(name).cloned()
    }

    pub fn exists(name: &str) -> bool {
        UNITS.contains_key(name)
    }

    pub fn powers(&self) -> &[f32; DIM_COUNT] {
        &self.powers
    }

    /// Bit-exact identity of the unit, usable as a hash-map key.
    pub fn key(&self) -> ([u32; DIM_COUNT], u64) {
        let mut powers = [0u32; DIM_COUNT];
        for (i, p) in self.powers.iter().enumerate() {
            powers[i] = p.to_bits();
        }
        (powers, self.scale.to_bits())
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_dimensionless(&self) -> bool {
        self.powers.iter().all(|p| *p == 0.0)
    }

    /// A pure temperature unit (K, °C, °F or R), eligible for an
    /// additive conversion offset.
    pub fn is_temperature(&self) -> bool {
        self.powers[TEMP] == 1.0
            && self
                .powers
                .iter()
                .enumerate()
                .all(|(i, p)| i == TEMP || *p == 0.0)
    }

    pub fn is_angle(&self) -> bool {
        self.powers[ANGLE] == 1.0
            && self
                .powers
                .iter()
                .enumerate()
                .all(|(i, p)| i == ANGLE || *p == 0.0)
    }

    pub fn is_consistent_with(&self, other: &Unit) -> bool {
        self.powers == other.powers
    }

    /// Consistency across optional units: absent units count as
    /// dimensionless.
    pub fn is_consistent(a: Option<&Unit>, b: Option<&Unit>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(u), None) | (None, Some(u)) => u.is_dimensionless(),
            (Some(a), Some(b)) => a.is_consistent_with(b),
        }
    }

    /// Multiplicative factor converting a number in `self` to `target`.
    /// The units must already be consistent.
    pub fn convert_factor(&self, target: &Unit) -> f64 {
        self.scale / target.scale
    }

    /// Additive delta applied after the scale multiply when converting
    /// between pure temperature units.
    pub fn temp_offset(&self, target: &Unit) -> f64 {
        let src = self.text.as_deref().unwrap_or("");
        let tgt = target.text.as_deref().unwrap_or("");
        match src {
            "°C" => match tgt {
                "K" => 273.15,
                "°F" => 32.0,
                "R" => 491.67,
                _ => 0.0,
            },
            "K" => match tgt {
                "°C" => -273.15,
                "°F" => -459.67,
                _ => 0.0,
            },
            "°F" => match tgt {
                "°C" => -160.0 / 9.0,
                "K" => 255.372222222222,
                "R" => 459.67,
                _ => 0.0,
            },
            "R" => match tgt {
                "°C" => -273.15,
                "°F" => -459.67,
                _ => 0.0,
            },
            _ => 0.0,
        }
    }

    pub fn multiply(&self, other: &Unit) -> Option<Unit> {
        let mut powers = [0f32; DIM_COUNT];
        for i in 0..DIM_COUNT {
            powers[i] = self.powers[i] + other.powers[i];
        }
        Self::combined(powers, self.scale * other.scale)
    }

    pub fn divide(&self, other: &Unit) -> Option<Unit> {
        let mut powers = [0f32; DIM_COUNT];
        for i in 0..DIM_COUNT {
            powers[i] = self.powers[i] - other.powers[i];
        }
        Self::combined(powers, self.scale / other.scale)
    }

    pub fn pow(&self, exp: f64) -> Option<Unit> {
        let mut powers = [0f32; DIM_COUNT];
        for i in 0..DIM_COUNT {
            powers[i] = self.powers[i] * exp as f32;
        }
        Self::combined(powers, self.scale.powf(exp))
    }

    fn combined(powers: [f32; DIM_COUNT], scale: f64) -> Option<Unit> {
        if powers.iter().all(|p| *p == 0.0) && scale == 1.0 {
            return None;
        }
        Some(Unit {
            powers,
            scale,
            text: None,
        })
    }

    pub fn field(&self) -> Field {
        if self.powers[CURRENT] != 0.0 {
            return Field::Electrical;
        }
        if self.powers[MASS] == 1.0 && (self.powers[TIME] == -2.0 || self.powers[TIME] == -3.0) {
            return Field::Mechanical;
        }
        Field::Other
    }

    /// Rewrite an anonymous compound unit to the canonical derived unit
    /// of its physical field (N, J, W, Pa; V, Ω, F, ...).  Returns the
    /// canonical unit and the factor converting a number to it, or None
    /// when the unit is already named or has no canonical form.
    pub fn normalized(&self) -> Option<(Unit, f64)> {
        if self.text.is_some() {
            return None;
        }
        let candidates: &[&str] = match self.field() {
            Field::Mechanical => &["N", "J", "W", "Pa"],
            Field::Electrical => &["V", "Ω", "F", "S", "Wb", "T", "H", "C", "W"],
            Field::Other => return None,
        };
        for name in candidates {
            let u = UNITS.get(*name).unwrap();
            if self.is_consistent_with(u) {
                let factor = self.convert_factor(u);
                return Some((u.clone(), factor));
            }
        }
        None
    }

    /// Display text: the defined name, or a composition from base
    /// dimensions for anonymous compounds.
    pub fn text(&self) -> String {
        if let Some(ref t) = self.text {
            return t.clone();
        }
        let mut num = String::new();
        let mut den = String::new();
        for i in 0..DIM_COUNT {
            let p = self.powers[i];
            if p == 0.0 {
                continue;
            }
            let (target, abs) = if p > 0.0 {
                (&mut num, p)
            } else {
                (&mut den, -p)
            };
            if !target.is_empty() {
                target.push('·');
            }
            target.push_str(DIM_NAMES[i]);
            if abs != 1.0 {
                target.push('^');
                if abs.fract() == 0.0 {
                    target.push_str(&format!("{}", abs as i32));
                } else {
                    target.push_str(&format!("{abs}"));
                }
            }
        }
        match (num.is_empty(), den.is_empty()) {
            (true, true) => String::new(),
            (false, true) => num,
            (true, false) => format!("1/{den}"),
            (false, false) => format!("{num}/{den}"),
        }
    }

    /// Parse a trailing units expression like `kN*m`, `m/s^2`, `kJ`.
    /// Only `*`, `/` and integer/fractional `^` are meaningful in a
    /// units expression.
    pub fn parse(text: &str) -> Result<Unit> {
        let text = text.trim();
        if text.is_empty() {
            return math_err!(InvalidUnits, "empty units expression");
        }
        let mut result: Option<Unit> = None;
        let mut op = '*';
        let mut rest = text;
        loop {
            let end = rest
                .char_indices()
                .find(|(_, c)| *c == '*' || *c == '/' || *c == '·')
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let term = rest[..end].trim();
            let unit = Self::parse_term(term)?;
            result = Some(match result {
                None => unit,
                Some(prev) => {
                    let combined = if op == '/' {
                        prev.divide(&unit)
                    } else {
                        prev.multiply(&unit)
                    };
                    combined.unwrap_or_else(|| Unit {
                        powers: [0.0; DIM_COUNT],
                        scale: 1.0,
                        text: None,
                    })
                }
            });
            if end == rest.len() {
                break;
            }
            let sep = rest[end..].chars().next().unwrap();
            op = if sep == '·' { '*' } else { sep };
            rest = &rest[end + sep.len_utf8()..];
        }
        match result {
            // keep the written form for display
            Some(mut u) => {
                if u.text.is_none() {
                    u.text = Some(text.to_string());
                }
                Ok(u)
            }
            None => math_err!(InvalidUnits, "error parsing '{text}' as units"),
        }
    }

    fn parse_term(term: &str) -> Result<Unit> {
        let (name, exp) = match term.find('^') {
            Some(i) => {
                let exp: f64 = term[i + 1..].trim().parse().map_err(|_| {
                    crate::math_error!(InvalidUnits, "invalid exponent in units '{term}'")
                })?;
                (term[..i].trim(), exp)
            }
            None => (term, 1.0),
        };
        let unit = Unit::find(name)
            .ok_or_else(|| crate::math_error!(InvalidUnits, "undefined units '{name}'"))?;
        if exp == 1.0 {
            Ok(unit)
        } else {
            unit.pow(exp)
                .ok_or_else(|| crate::math_error!(InvalidUnits, "invalid exponent in units '{term}'"))
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

fn insert_prefixed(map: &mut HashMap<String, Unit>, unit: &Unit, name: &str) {
    const PREFIXES: [(&str, f64); 14] = [
        ("T", 1e12),
        ("G", 1e9),
        ("M", 1e6),
        ("k", 1e3),
        ("h", 1e2),
        ("da", 1e1),
        ("d", 1e-1),
        ("c", 1e-2),
        ("m", 1e-3),
        ("µ", 1e-6),
        ("n", 1e-9),
        ("p", 1e-12),
        ("f", 1e-15),
        ("μ", 1e-6), // both micro code points in common use
    ];
    for (prefix, factor) in PREFIXES {
        let prefixed = format!("{prefix}{name}");
        let unit = Unit {
            powers: unit.powers,
            scale: unit.scale * factor,
            text: Some(prefixed.clone()),
        };
        map.entry(prefixed).or_insert(unit);
    }
}

lazy_static! {
    static ref UNITS: HashMap<String, Unit> = {
        let mut m: HashMap<String, Unit> = HashMap::new();
        let mut add = |u: Unit| {
            m.insert(u.text.clone().unwrap(), u);
        };

        // base dimensions
        add(Unit::base(MASS, 1.0, "g"));
        add(Unit::base(LENGTH, 1.0, "m"));
        add(Unit::base(TIME, 1.0, "s"));
        add(Unit::base(CURRENT, 1.0, "A"));
        add(Unit::base(TEMP, 1.0, "K"));
        add(Unit::base(TEMP, 1.0, "°C"));
        add(Unit::base(TEMP, 5.0 / 9.0, "°F"));
        add(Unit::base(TEMP, 5.0 / 9.0, "R"));
        add(Unit::base(AMOUNT, 1.0, "mol"));
        add(Unit::base(LUMINOSITY, 1.0, "cd"));
        add(Unit::base(ANGLE, 1.0, "rad"));

        // angle
        add(Unit::base(ANGLE, std::f64::consts::PI / 180.0, "deg"));
        add(Unit::base(ANGLE, std::f64::consts::PI / 180.0, "°"));
        add(Unit::base(ANGLE, std::f64::consts::PI / 200.0, "grad"));
        add(Unit::base(ANGLE, 2.0 * std::f64::consts::PI, "rev"));

        // mass (non-metric)
        add(Unit::base(MASS, 1e6, "t"));
        add(Unit::base(MASS, 453.59237, "lb"));
        add(Unit::base(MASS, 28.349523125, "oz"));

        // length (non-metric)
        add(Unit::base(LENGTH, 0.0254, "in"));
        add(Unit::base(LENGTH, 0.3048, "ft"));
        add(Unit::base(LENGTH, 0.9144, "yd"));
        add(Unit::base(LENGTH, 1609.344, "mi"));

        // time
        add(Unit::base(TIME, 60.0, "min"));
        add(Unit::base(TIME, 3600.0, "h"));
        add(Unit::base(TIME, 86400.0, "d"));

        // dimensionless ratios
        add(Unit {
            powers: [0.0; DIM_COUNT],
            scale: 0.01,
            text: Some("%".to_string()),
        });
        add(Unit {
            powers: [0.0; DIM_COUNT],
            scale: 0.001,
            text: Some("‰".to_string()),
        });

        // derived mechanical: powers over [g m s A K mol cd rad]
        add(Unit::new([1.0, 1.0, -2.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1e3, "N"));
        add(Unit::new([1.0, 2.0, -2.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1e3, "J"));
        add(Unit::new([1.0, 2.0, -3.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1e3, "W"));
        add(Unit::new([1.0, -1.0, -2.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1e3, "Pa"));
        add(Unit::new([1.0, -1.0, -2.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1e8, "bar"));
        add(Unit::new([0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1.0, "Hz"));
        add(Unit::new([0.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1e-3, "L"));

        // derived electrical
        add(Unit::new([0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], 1.0, "C"));
        add(Unit::new([1.0, 2.0, -3.0, -1.0, 0.0, 0.0, 0.0, 0.0], 1e3, "V"));
        add(Unit::new([1.0, 2.0, -3.0, -2.0, 0.0, 0.0, 0.0, 0.0], 1e3, "Ω"));
        add(Unit::new([-1.0, -2.0, 3.0, 2.0, 0.0, 0.0, 0.0, 0.0], 1e-3, "S"));
        add(Unit::new([-1.0, -2.0, 4.0, 2.0, 0.0, 0.0, 0.0, 0.0], 1e-3, "F"));
        add(Unit::new([1.0, 2.0, -2.0, -1.0, 0.0, 0.0, 0.0, 0.0], 1e3, "Wb"));
        add(Unit::new([1.0, 0.0, -2.0, -1.0, 0.0, 0.0, 0.0, 0.0], 1e3, "T"));
        add(Unit::new([1.0, 2.0, -2.0, -2.0, 0.0, 0.0, 0.0, 0.0], 1e3, "H"));

        // metric-prefixed families; named units above take priority
        let prefixable = [
            "m", "s", "g", "A", "N", "Pa", "J", "W", "V", "F", "H", "Wb", "T", "S", "Hz", "L",
            "mol", "Ω",
        ];
        let base: Vec<(String, Unit)> = prefixable
            .iter()
            .filter_map(|n| m.get(*n).map(|u| (n.to_string(), u.clone())))
            .collect();
        for (name, unit) in base {
            insert_prefixed(&mut m, &unit, &name);
        }
        m
    };
}
