// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Solver blocks: the `$keyword{body @ var = a : b}` forms.  The
//! session splits the script on un-nested delimiters, runs each piece
//! through the full front end with the bound variable in scope, and
//! builds one of these.  Evaluation compiles the body lazily, checks
//! bound-unit consistency before any numeric work, and hands a bare
//! closure to the numeric solver.  `$sup`/`$inf` publish the
//! arg-extremum as `<var>_sup`/`<var>_inf`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{compile, Program};
use crate::common::Result;
use crate::interpreter::{self, EvalEnv};
use crate::math_err;
use crate::solver::Solver;
use crate::token::{Token, TokenData};
use crate::units::Unit;
use crate::value::{Scalar, Value};
use crate::variable::VarCell;

/// Iteration ceiling for `$repeat`/`$sum`/`$product`.
const LOOP_CAP: f64 = 1_000_000_000.0;

/// Two target samples may differ by at most this much, relative to the
/// target's magnitude, for the target of `$root{f(x) = target; ...}`
/// to count as constant.
const TARGET_TOLERANCE: f64 = 1e-14;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolverKind {
    Find,
    Root,
    Sup,
    Inf,
    Area,
    Integral,
    Slope,
    Repeat,
    Sum,
    Product,
}

impl SolverKind {
    pub fn from_keyword(keyword: &str) -> Option<SolverKind> {
        Some(match keyword {
            "find" => SolverKind::Find,
            "root" => SolverKind::Root,
            "sup" => SolverKind::Sup,
            "inf" => SolverKind::Inf,
            "area" => SolverKind::Area,
            "integral" => SolverKind::Integral,
            "slope" => SolverKind::Slope,
            "repeat" => SolverKind::Repeat,
            "sum" => SolverKind::Sum,
            "product" => SolverKind::Product,
            _ => return None,
        })
    }

    /// Loop forms step the variable themselves; the rest hand it to
    /// the numeric solver.
    pub fn is_loop(self) -> bool {
        matches!(self, SolverKind::Repeat | SolverKind::Sum | SolverKind::Product)
    }

    pub fn needs_upper_bound(self) -> bool {
        self != SolverKind::Slope
    }
}

/// The raw sub-expressions of a block script, split on un-nested
/// `@`, `=` and `:`.
#[derive(Debug)]
pub struct ScriptParts {
    pub body: String,
    pub target: Option<String>,
    pub var: String,
    pub lower: String,
    pub upper: Option<String>,
}

pub(crate) fn split_top_level(text: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ if c == delim && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Split `body @ var = lower : upper` into its pieces; a top-level `;`
/// may stand in for the `@`.  For `$root` an un-nested `=` in the body
/// splits off the target expression.
pub fn split_script(kind: SolverKind, script: &str) -> Result<ScriptParts> {
    let halves = split_top_level(script, '@');
    let (body_part, clause) = match halves.len() {
        2 => (halves[0].trim(), halves[1]),
        1 => {
            let pieces = split_top_level(script, ';');
            if pieces.len() != 2 {
                return math_err!(
                    InvalidSolver,
                    "expected 'expression @ variable = bounds', got '{script}'"
                );
            }
            (pieces[0].trim(), pieces[1])
        }
        _ => {
            return math_err!(
                InvalidSolver,
                "expected 'expression @ variable = bounds', got '{script}'"
            )
        }
    };
    let mut body = body_part.to_string();
    let mut target = None;
    if kind == SolverKind::Root {
        let sides = split_top_level(body_part, '=');
        if sides.len() == 2 {
            body = sides[0].trim().to_string();
            target = Some(sides[1].trim().to_string());
        } else if sides.len() > 2 {
            return math_err!(InvalidSolver, "more than one '=' in the solver body");
        }
    }
    let binding = split_top_level(clause, '=');
    if binding.len() != 2 {
        return math_err!(InvalidSolver, "expected 'variable = bounds' after '@'");
    }
    let var = binding[0].trim().to_string();
    if var.is_empty() {
        return math_err!(InvalidSolver, "missing solver variable name");
    }
    let range = split_top_level(binding[1], ':');
    let (lower, upper) = match range.len() {
        1 => (range[0].trim().to_string(), None),
        2 => (
            range[0].trim().to_string(),
            Some(range[1].trim().to_string()),
        ),
        _ => return math_err!(InvalidSolver, "too many ':' in the solver bounds"),
    };
    if kind.needs_upper_bound() && upper.is_none() {
        return math_err!(InvalidSolver, "missing upper bound");
    }
    Ok(ScriptParts {
        body,
        target,
        var,
        lower,
        upper,
    })
}

/// A block body is either a pure expression or an assignment statement
/// (the loop forms routinely update an accumulator).
pub enum Body {
    Expr(Vec<Token>),
    Assign { target: String, rhs: Vec<Token> },
}

impl Body {
    fn rpn(&self) -> &[Token] {
        match self {
            Body::Expr(rpn) => rpn,
            Body::Assign { rhs, .. } => rhs,
        }
    }
}

pub struct SolveBlock {
    pub kind: SolverKind,
    pub var_name: String,
    var_cell: VarCell,
    body: Body,
    target: Option<Vec<Token>>,
    lower: Vec<Token>,
    upper: Option<Vec<Token>>,
    precision: f64,
    dep_names: Vec<String>,
    dep_stamps: RefCell<HashMap<String, u64>>,
    compiled: RefCell<Option<Rc<Program>>>,
    result: RefCell<Option<Value>>,
}

/// Puts the bound variable in front of the session's table.
struct BoundEnv<'a> {
    inner: &'a mut dyn EvalEnv,
    name: &'a str,
    cell: &'a VarCell,
}

impl<'a> EvalEnv for BoundEnv<'a> {
    fn calculator(&self) -> &crate::calculator::Calculator {
        self.inner.calculator()
    }

    fn var_cell(&mut self, name: &str) -> Option<VarCell> {
        if name == self.name {
            return Some(Rc::clone(self.cell));
        }
        self.inner.var_cell(name)
    }

    fn define_cell(&mut self, name: &str) -> VarCell {
        if name == self.name {
            return Rc::clone(self.cell);
        }
        self.inner.define_cell(name)
    }

    fn call_custom(&mut self, index: usize, args: Vec<Value>) -> Result<Value> {
        self.inner.call_custom(index, args)
    }

    fn eval_solver(&mut self, id: usize) -> Result<Value> {
        self.inner.eval_solver(id)
    }

    fn check_cancelled(&self) -> Result<()> {
        self.inner.check_cancelled()
    }
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

fn assign_bound(cell: &VarCell, x: f64, unit: &Option<Unit>) {
    cell.borrow_mut().assign(Value::Scalar(Scalar {
        re: x,
        im: 0.0,
        unit: unit.clone(),
    }));
}

/// The bare number of `s` expressed in `unit`'s frame.
fn scalar_in(s: &Scalar, unit: &Option<Unit>) -> Result<f64> {
    if !s.is_real() {
        return math_err!(NonRealResult, "solver expressions must stay real");
    }
    match unit {
        Some(u) => Ok(s.convert_to(u)?.re),
        None => {
            if s.is_unitless() {
                Ok(s.re * s.unit.as_ref().map(|u| u.scale()).unwrap_or(1.0))
            } else {
                math_err!(
                    InconsistentUnits,
                    "expected a dimensionless value, got '{}'",
                    s.unit.as_ref().unwrap().text()
                )
            }
        }
    }
}

impl SolveBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: SolverKind,
        var_name: String,
        var_cell: VarCell,
        body: Body,
        target: Option<Vec<Token>>,
        lower: Vec<Token>,
        upper: Option<Vec<Token>>,
    ) -> Self {
        let mut dep_names = Vec::new();
        for token in body.rpn() {
            if matches!(token.data, TokenData::Variable)
                && token.text != var_name
                && !dep_names.contains(&token.text)
            {
                dep_names.push(token.text.clone());
            }
        }
        SolveBlock {
            kind,
            var_name,
            var_cell,
            body,
            target,
            lower,
            upper,
            precision: 1e-14,
            dep_names,
            dep_stamps: RefCell::new(HashMap::new()),
            compiled: RefCell::new(None),
            result: RefCell::new(None),
        }
    }

    pub fn last_result(&self) -> Option<Value> {
        self.result.borrow().clone()
    }

    fn invalidate_if_stale(&self, env: &mut dyn EvalEnv) {
        let mut stamps = self.dep_stamps.borrow_mut();
        let mut stale = false;
        for name in &self.dep_names {
            let Some(cell) = env.var_cell(name) else {
                continue;
            };
            let current = cell.borrow().generation();
            if stamps.insert(name.clone(), current) != Some(current) {
                stale = true;
            }
        }
        if stale {
            *self.compiled.borrow_mut() = None;
        }
    }

    fn bound(&self, rpn: &[Token], env: &mut dyn EvalEnv) -> Result<Scalar> {
        let value = interpreter::evaluate(rpn, env)?;
        let scalar = value.into_scalar()?;
        if !scalar.is_real() {
            return math_err!(NonRealResult, "solver bounds must be real");
        }
        Ok(scalar)
    }

    pub fn evaluate(&self, env: &mut dyn EvalEnv) -> Result<Value> {
        env.check_cancelled()?;
        self.invalidate_if_stale(env);

        let lower = self.bound(&self.lower, env)?;
        let bound_unit = lower.unit.clone();
        let a = lower.re;
        let b = match self.upper {
            Some(ref rpn) => {
                let upper = self.bound(rpn, env)?;
                // inconsistent bounds must fail before any numeric work
                Some(scalar_in(&upper, &bound_unit)?)
            }
            None => None,
        };

        let program = {
            let mut slot = self.compiled.borrow_mut();
            match slot.as_ref() {
                Some(p) => Rc::clone(p),
                None => {
                    let mut scoped = BoundEnv {
                        inner: env,
                        name: &self.var_name,
                        cell: &self.var_cell,
                    };
                    let p = Rc::new(compile(self.body.rpn(), &mut scoped)?);
                    *slot = Some(Rc::clone(&p));
                    p
                }
            }
        };

        let result = self.dispatch(env, &program, a, b, &bound_unit)?;
        *self.result.borrow_mut() = Some(result.clone());
        Ok(result)
    }

    fn dispatch(
        &self,
        env: &mut dyn EvalEnv,
        program: &Rc<Program>,
        a: f64,
        b: Option<f64>,
        bound_unit: &Option<Unit>,
    ) -> Result<Value> {
        if self.kind.is_loop() {
            return self.run_loop(env, program, a, b.unwrap(), bound_unit);
        }

        let mut scoped = BoundEnv {
            inner: env,
            name: &self.var_name,
            cell: &self.var_cell,
        };

        // run once at the lower bound to learn the body's unit
        assign_bound(&self.var_cell, a, bound_unit);
        let first = program.run(&mut scoped)?.into_scalar()?;
        let body_unit = first.unit.clone();

        // a $root target must be constant over the interval
        let target_value = match self.target {
            Some(ref target_rpn) => {
                let t1 = interpreter::evaluate(target_rpn, &mut scoped)?.into_scalar()?;
                let y1 = scalar_in(&t1, &body_unit)?;
                if let Some(b) = b {
                    assign_bound(&self.var_cell, b, bound_unit);
                    let t2 = interpreter::evaluate(target_rpn, &mut scoped)?.into_scalar()?;
                    let y2 = scalar_in(&t2, &body_unit)?;
                    if (y2 - y1).abs() > TARGET_TOLERANCE * y1.abs().max(1.0) {
                        return math_err!(
                            ConstantExpected,
                            "the target of '$root' varies over the interval"
                        );
                    }
                }
                y1
            }
            None => 0.0,
        };

        let solver = Solver {
            precision: self.precision,
        };
        let body_unit_ref = &body_unit;
        let mut eval_at = |x: f64| -> Result<f64> {
            scoped.check_cancelled()?;
            assign_bound(scoped.cell, x, bound_unit);
            let value = program.run(&mut scoped)?.into_scalar()?;
            scalar_in(&value, body_unit_ref)
        };

        match self.kind {
            SolverKind::Find | SolverKind::Root => {
                let mut g = |x: f64| Ok(eval_at(x)? - target_value);
                let x = solver.root(&mut g, a, b.unwrap())?;
                if x.is_nan() {
                    return math_err!(
                        NoSolution,
                        "no solution for '{}' in the given interval",
                        self.var_name
                    );
                }
                Ok(Value::Scalar(Scalar {
                    re: x,
                    im: 0.0,
                    unit: bound_unit.clone(),
                }))
            }
            SolverKind::Sup | SolverKind::Inf => {
                let maximize = self.kind == SolverKind::Sup;
                let (x, y) = solver.extremum(&mut eval_at, a, b.unwrap(), maximize)?;
                drop(eval_at);
                let suffix = if maximize { "sup" } else { "inf" };
                scoped.inner.set_var(
                    &format!("{}_{suffix}", self.var_name),
                    Value::Scalar(Scalar {
                        re: x,
                        im: 0.0,
                        unit: bound_unit.clone(),
                    }),
                );
                Ok(Value::Scalar(Scalar {
                    re: y,
                    im: 0.0,
                    unit: body_unit,
                }))
            }
            SolverKind::Area => {
                let y = solver.area(&mut eval_at, a, b.unwrap())?;
                Ok(Value::Scalar(Scalar {
                    re: y,
                    im: 0.0,
                    unit: mul_units(&body_unit, bound_unit),
                }))
            }
            SolverKind::Integral => {
                let y = solver.integral(&mut eval_at, a, b.unwrap())?;
                Ok(Value::Scalar(Scalar {
                    re: y,
                    im: 0.0,
                    unit: mul_units(&body_unit, bound_unit),
                }))
            }
            SolverKind::Slope => {
                let d = solver.slope(&mut eval_at, a)?;
                Ok(Value::Scalar(Scalar {
                    re: d,
                    im: 0.0,
                    unit: div_units(&body_unit, bound_unit),
                }))
            }
            _ => unreachable!("loop kinds handled above"),
        }
    }

    /// `$repeat`/`$sum`/`$product`: step the variable by one from the
    /// lower to the upper bound, running the body each time.
    fn run_loop(
        &self,
        env: &mut dyn EvalEnv,
        program: &Rc<Program>,
        a: f64,
        b: f64,
        bound_unit: &Option<Unit>,
    ) -> Result<Value> {
        // the range is inclusive at both ends
        if b - a + 1.0 > LOOP_CAP {
            return math_err!(
                IterationLimit,
                "loop of {} iterations exceeds the cap",
                b - a + 1.0
            );
        }
        let assign_target: Option<VarCell> = match self.body {
            Body::Assign { ref target, .. } => Some(env.define_cell(target)),
            Body::Expr(_) => None,
        };
        if let Some(ref cell) = assign_target {
            // an unset accumulator starts at zero
            if !cell.borrow().is_assigned() {
                cell.borrow_mut().assign(Value::real(0.0));
            }
        }
        let mut scoped = BoundEnv {
            inner: env,
            name: &self.var_name,
            cell: &self.var_cell,
        };
        let mut acc: Option<Value> = None;
        let mut x = a;
        while x <= b {
            scoped.check_cancelled()?;
            assign_bound(scoped.cell, x, bound_unit);
            let value = program.run(&mut scoped)?;
            if let Some(ref cell) = assign_target {
                cell.borrow_mut().assign(value.clone());
            }
            acc = Some(match (self.kind, acc) {
                (SolverKind::Sum, Some(prev)) => scoped.calculator().operator('+', &prev, &value)?,
                (SolverKind::Product, Some(prev)) => {
                    scoped.calculator().operator('*', &prev, &value)?
                }
                _ => value,
            });
            x += 1.0;
        }
        match acc {
            Some(v) => Ok(v),
            None => Ok(Value::Scalar(Scalar::nan())),
        }
    }
}
