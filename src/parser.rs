// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The session façade.  `MathParser` owns the variable table, the user
//! function registry, the solver blocks and the per-line equation
//! cache, and wires them into the front end (`tokenize` → `validate` →
//! RPN) and the two back ends (direct evaluation and compiled
//! programs).  Statements are split here: `target = expr` and
//! `name(params) = body` never reach the evaluator as raw `=` tokens.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bytecode::{compile, Program};
use crate::calculator::{self, AngleMode, Calculator};
use crate::common::Result;
use crate::functions::{CustomFunction, FunctionRegistry};
use crate::interpreter::{self, EvalEnv};
use crate::lexer::{self, tokenize, LexEnv};
use crate::math_err;
use crate::rpn;
use crate::solve_block::{split_script, split_top_level, Body, SolveBlock, SolverKind};
use crate::token::{Token, TokenData};
use crate::units::Unit;
use crate::validator::validate;
use crate::value::Value;
use crate::variable::{Backup, VarCell, Variable};

/// Session-wide knobs.  `decimals` and `max_output_count` shape
/// `format_value`; `substitute` is read by report writers that render
/// statements with variable values substituted in.
#[derive(Clone, Debug)]
pub struct Settings {
    pub angle_mode: AngleMode,
    pub is_complex: bool,
    pub decimals: u8,
    pub substitute: bool,
    pub max_output_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            angle_mode: AngleMode::Degrees,
            is_complex: false,
            decimals: 6,
            substitute: true,
            max_output_count: 20,
        }
    }
}

/// The left side of `target = expr`: a bare variable or one element of
/// a vector or matrix, with each subscript kept as its own RPN slice.
struct AssignTarget {
    name: String,
    subscripts: Vec<Vec<Token>>,
}

enum Statement {
    Expression(Vec<Token>),
    Assignment {
        target: AssignTarget,
        rpn: Vec<Token>,
    },
    FunctionDef {
        name: String,
    },
}

/// One statement after the full front end has run.  Holds the RPN and,
/// once `compile` has been called, the constant-folded program.
pub struct Parsed {
    statement: Statement,
    target_unit: Option<Unit>,
    compiled: RefCell<Option<Rc<Program>>>,
    /// Solver slots this statement allocated; reclaimed when the
    /// statement leaves the session.
    solver_ids: Vec<usize>,
}

impl Parsed {
    pub fn is_compiled(&self) -> bool {
        self.compiled.borrow().is_some()
    }
}

struct CachedLine {
    text: String,
    parsed: Rc<Parsed>,
}

pub struct MathParser {
    calc: Calculator,
    settings: Settings,
    vars: HashMap<String, VarCell>,
    funcs: FunctionRegistry,
    solvers: Vec<Option<Rc<SolveBlock>>>,
    free_solvers: Vec<usize>,
    pending_solvers: Vec<usize>,
    cache: HashMap<usize, CachedLine>,
    inputs: Vec<f64>,
    backup: Backup,
    cancelled: Arc<AtomicBool>,
}

impl Default for MathParser {
    fn default() -> Self {
        MathParser::new(Settings::default())
    }
}

/// Lexing scope for function bodies and solver sub-expressions: the
/// given names resolve as variables ahead of the session tables.
struct ScopeLex<'a> {
    inner: &'a mut MathParser,
    names: &'a [String],
}

impl<'a> LexEnv for ScopeLex<'a> {
    fn is_variable(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name) || self.inner.is_variable(name)
    }

    fn custom_function(&self, name: &str) -> Option<usize> {
        self.inner.custom_function(name)
    }

    fn allocate_solver(&mut self, keyword: &str, script: &str) -> Result<usize> {
        self.inner.allocate_solver(keyword, script)
    }

    fn input_value(&self, slot: usize) -> Option<f64> {
        self.inner.input_value(slot)
    }
}

impl LexEnv for MathParser {
    fn is_variable(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    fn custom_function(&self, name: &str) -> Option<usize> {
        self.funcs.index_of(name)
    }

    fn allocate_solver(&mut self, keyword: &str, script: &str) -> Result<usize> {
        let Some(kind) = SolverKind::from_keyword(&keyword.to_ascii_lowercase()) else {
            return math_err!(InvalidSolver, "unknown solver '${keyword}'");
        };
        let parts = split_script(kind, script)?;
        if !lexer::is_letter(parts.var.chars().next().unwrap_or(' '))
            || !parts.var.chars().all(lexer::is_id_continue)
        {
            return math_err!(InvalidSolver, "'{}' is not a variable name", parts.var);
        }

        // the loop forms may assign an accumulator in the body
        let mut scope = vec![parts.var.clone()];
        let body = if kind.is_loop() {
            let sides = split_top_level(&parts.body, '=');
            match sides.len() {
                1 => Body::Expr(self.lex_sub(&parts.body, &scope)?),
                2 => {
                    let target = sides[0].trim().to_string();
                    if !lexer::is_letter(target.chars().next().unwrap_or(' '))
                        || !target.chars().all(lexer::is_id_continue)
                    {
                        return math_err!(
                            InvalidSolver,
                            "'{target}' is not an assignable variable"
                        );
                    }
                    let rhs_text = sides[1].trim().to_string();
                    // the accumulator cell must exist before the body
                    // compiles against it
                    self.define_cell(&target);
                    scope.push(target.clone());
                    Body::Assign {
                        target,
                        rhs: self.lex_sub(&rhs_text, &scope)?,
                    }
                }
                _ => return math_err!(InvalidSolver, "more than one '=' in the loop body"),
            }
        } else {
            Body::Expr(self.lex_sub(&parts.body, &scope)?)
        };

        let target = match parts.target {
            Some(ref t) => Some(self.lex_sub(t, &scope)?),
            None => None,
        };
        let lower = self.lex_sub(&parts.lower, &scope)?;
        let upper = match parts.upper {
            Some(ref u) => Some(self.lex_sub(u, &scope)?),
            None => None,
        };

        let block = Rc::new(SolveBlock::new(
            kind,
            parts.var,
            Variable::empty(),
            body,
            target,
            lower,
            upper,
        ));
        let id = match self.free_solvers.pop() {
            Some(id) => {
                self.solvers[id] = Some(block);
                id
            }
            None => {
                self.solvers.push(Some(block));
                self.solvers.len() - 1
            }
        };
        self.pending_solvers.push(id);
        Ok(id)
    }

    fn input_value(&self, slot: usize) -> Option<f64> {
        self.inputs.get(slot).copied()
    }
}

impl EvalEnv for MathParser {
    fn calculator(&self) -> &Calculator {
        &self.calc
    }

    fn var_cell(&mut self, name: &str) -> Option<VarCell> {
        self.vars.get(name).cloned()
    }

    fn define_cell(&mut self, name: &str) -> VarCell {
        Rc::clone(
            self.vars
                .entry(name.to_string())
                .or_insert_with(Variable::empty),
        )
    }

    fn call_custom(&mut self, index: usize, args: Vec<Value>) -> Result<Value> {
        let Some(func) = self.funcs.get(index) else {
            return math_err!(InvalidFunction, "unknown function index {index}");
        };
        func.call(args, self)
    }

    fn eval_solver(&mut self, id: usize) -> Result<Value> {
        let Some(block) = self.solvers.get(id).and_then(|s| s.as_ref()).map(Rc::clone) else {
            return math_err!(InvalidSolver, "unknown solver block {id}");
        };
        block.evaluate(self)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return math_err!(Interrupted, "the calculation was cancelled");
        }
        Ok(())
    }
}

impl MathParser {
    pub fn new(settings: Settings) -> Self {
        MathParser {
            calc: Calculator::new(settings.angle_mode, settings.is_complex),
            settings,
            vars: HashMap::new(),
            funcs: FunctionRegistry::default(),
            solvers: Vec::new(),
            free_solvers: Vec::new(),
            pending_solvers: Vec::new(),
            cache: HashMap::new(),
            inputs: Vec::new(),
            backup: Backup::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Changing the mode invalidates everything folded under the old
    /// one: the equation cache, the solver blocks it references, and
    /// compiled function bodies.
    pub fn set_settings(&mut self, settings: Settings) {
        self.calc = Calculator::new(settings.angle_mode, settings.is_complex);
        self.settings = settings;
        self.cache.clear();
        self.solvers.clear();
        self.free_solvers.clear();
        self.pending_solvers.clear();
        self.funcs.invalidate_all();
    }

    /// A handle the host can set from another thread to stop the
    /// current calculation at the next poll point.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Values for the statement's `?` input fields, in order.
    pub fn set_inputs(&mut self, values: Vec<f64>) {
        self.inputs = values;
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.define_cell(name).borrow_mut().assign(value);
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.vars.get(name).and_then(|c| c.borrow().get().cloned())
    }

    pub fn clear(&mut self) {
        self.vars.clear();
        self.funcs.clear();
        self.solvers.clear();
        self.free_solvers.clear();
        self.pending_solvers.clear();
        self.cache.clear();
        self.inputs.clear();
        self.backup.clear();
    }

    /// Run the full front end over one statement.  Function definitions
    /// are registered here and need no evaluation.
    pub fn parse(&mut self, text: &str) -> Result<Parsed> {
        self.pending_solvers.clear();
        if let Some((name, params, body)) = function_def(text) {
            self.define_function(&name, params, &body)?;
            // solver blocks in the body stay alive with the function
            self.pending_solvers.clear();
            return Ok(Parsed {
                statement: Statement::FunctionDef { name },
                target_unit: None,
                compiled: RefCell::new(None),
                solver_ids: Vec::new(),
            });
        }
        let out = tokenize(text, self)?;
        validate(&out.tokens, &|i| self.funcs.arity(i))?;
        let statement = match out.tokens.iter().position(is_assign) {
            Some(eq) => {
                let target = assign_target(&out.tokens[..eq])?;
                let rpn = rpn::build(out.tokens[eq + 1..].to_vec())?;
                Statement::Assignment { target, rpn }
            }
            None => Statement::Expression(rpn::build(out.tokens)?),
        };
        Ok(Parsed {
            statement,
            target_unit: out.target_unit,
            compiled: RefCell::new(None),
            solver_ids: std::mem::take(&mut self.pending_solvers),
        })
    }

    /// Compile the statement's RPN into a constant-folded program that
    /// subsequent `evaluate` calls run instead of the interpreter.
    pub fn compile(&mut self, parsed: &Parsed) -> Result<()> {
        let rpn = match &parsed.statement {
            Statement::Expression(rpn) => rpn,
            Statement::Assignment { rpn, .. } => rpn,
            Statement::FunctionDef { .. } => return Ok(()),
        };
        let program = Rc::new(compile(rpn, self)?);
        *parsed.compiled.borrow_mut() = Some(program);
        Ok(())
    }

    /// Evaluate a parsed statement.  `None` for function definitions.
    pub fn evaluate(&mut self, parsed: &Parsed) -> Result<Option<Value>> {
        self.check_cancelled()?;
        match &parsed.statement {
            Statement::FunctionDef { .. } => Ok(None),
            Statement::Expression(rpn) => {
                let value = self.run(parsed, rpn)?;
                Ok(Some(interpreter::finish(
                    value,
                    parsed.target_unit.as_ref(),
                )?))
            }
            Statement::Assignment { target, rpn } => {
                let cell = self.define_cell(&target.name);
                self.backup.record(&cell);
                match self.assign(parsed, target, rpn, &cell) {
                    Ok(value) => {
                        self.backup.clear();
                        Ok(Some(value))
                    }
                    Err(e) => {
                        self.backup.restore();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Parse and evaluate in one step.  The statement's solver slots
    /// are reclaimed afterwards; long-lived statements go through
    /// `calculate_line`.
    pub fn calculate(&mut self, text: &str) -> Result<Option<Value>> {
        let parsed = self.parse(text)?;
        let result = self.evaluate(&parsed);
        self.release_solvers(&parsed);
        result
    }

    /// Cached variant keyed by worksheet line id: the front end and any
    /// compiled program are reused while the line's text is unchanged.
    pub fn calculate_line(&mut self, id: usize, text: &str) -> Result<Option<Value>> {
        if let Some(line) = self.cache.get(&id) {
            if line.text == text {
                let parsed = Rc::clone(&line.parsed);
                return self.evaluate(&parsed);
            }
        }
        let parsed = Rc::new(self.parse(text)?);
        let replaced = self.cache.insert(
            id,
            CachedLine {
                text: text.to_string(),
                parsed: Rc::clone(&parsed),
            },
        );
        if let Some(old) = replaced {
            self.release_solvers(&old.parsed);
        }
        self.evaluate(&parsed)
    }

    fn release_solvers(&mut self, parsed: &Parsed) {
        for &id in &parsed.solver_ids {
            if self.solvers.get(id).map(|s| s.is_some()).unwrap_or(false) {
                self.solvers[id] = None;
                self.free_solvers.push(id);
            }
        }
    }

    /// Register `name(params) = body`.  The body is lexed with the
    /// parameters in scope; every other identifier must already exist.
    pub fn define_function(&mut self, name: &str, params: Vec<String>, body: &str) -> Result<()> {
        if calculator::resolve(name).is_some() {
            return math_err!(InvalidFunction, "cannot redefine built-in '{name}'");
        }
        // pre-register so the body can mention the function itself
        let index = self.funcs.reserve(name);
        let rpn = self.lex_sub(body, &params)?;
        let func = CustomFunction::new(name, params, rpn, self)?;
        self.funcs.install(index, func);
        Ok(())
    }

    fn run(&mut self, parsed: &Parsed, rpn: &[Token]) -> Result<Value> {
        let program = parsed.compiled.borrow().as_ref().map(Rc::clone);
        match program {
            Some(p) => p.run(self),
            None => interpreter::evaluate(rpn, self),
        }
    }

    fn assign(
        &mut self,
        parsed: &Parsed,
        target: &AssignTarget,
        rpn: &[Token],
        cell: &VarCell,
    ) -> Result<Value> {
        let value = self.run(parsed, rpn)?;
        let value = interpreter::finish(value, parsed.target_unit.as_ref())?;
        if target.subscripts.is_empty() {
            cell.borrow_mut().assign(value.clone());
            return Ok(value);
        }

        let scalar = match value {
            Value::Scalar(ref s) => s.clone(),
            ref other => {
                return math_err!(
                    DimensionMismatch,
                    "cannot store a {} in one element",
                    other.shape_name()
                )
            }
        };
        let mut indices = Vec::with_capacity(target.subscripts.len());
        for sub in &target.subscripts {
            let v = interpreter::evaluate(sub, self)?;
            indices.push(subscript(&v)?);
        }
        let mut current = cell.borrow().value(&target.name)?;
        match (&mut current, indices.as_slice()) {
            (Value::Vector(v), [i]) => {
                if *i == 0 || *i > v.len() {
                    return math_err!(IndexOutOfRange, "element {i} of {}", v.len());
                }
                v[i - 1] = scalar;
            }
            (Value::Matrix(m), [i, j]) => {
                if *i == 0 || *i > m.rows || *j == 0 || *j > m.cols {
                    return math_err!(
                        IndexOutOfRange,
                        "element ({i}; {j}) of {}x{}",
                        m.rows,
                        m.cols
                    );
                }
                *m.at_mut(i - 1, j - 1) = scalar;
            }
            (other, subs) => {
                return math_err!(
                    DimensionMismatch,
                    "a {} does not take {} subscript(s)",
                    other.shape_name(),
                    subs.len()
                )
            }
        }
        cell.borrow_mut().assign(current);
        Ok(value)
    }

    /// Front end for a sub-expression (function body, solver piece)
    /// with extra names in variable scope.
    fn lex_sub(&mut self, text: &str, scope: &[String]) -> Result<Vec<Token>> {
        let mut env = ScopeLex {
            inner: self,
            names: scope,
        };
        let out = tokenize(text, &mut env)?;
        validate(&out.tokens, &|i| env.inner.funcs.arity(i))?;
        rpn::build(out.tokens)
    }

    /// Render a value with the session's `decimals` and
    /// `max_output_count` settings.
    pub fn format_value(&self, value: &Value) -> String {
        let dec = self.settings.decimals as usize;
        let one = |s: &crate::value::Scalar| {
            let mut out = trim_number(s.re, dec);
            if s.im != 0.0 {
                let im = trim_number(s.im.abs(), dec);
                out.push_str(if s.im < 0.0 { " - " } else { " + " });
                out.push_str(&im);
                out.push('i');
            }
            if let Some(ref u) = s.unit {
                let text = u.text();
                if !text.is_empty() {
                    out.push(' ');
                    out.push_str(&text);
                }
            }
            out
        };
        match value {
            Value::Scalar(s) => one(s),
            Value::Vector(v) => {
                let mut parts: Vec<String> = v
                    .iter()
                    .take(self.settings.max_output_count)
                    .map(one)
                    .collect();
                if v.len() > self.settings.max_output_count {
                    parts.push("...".to_string());
                }
                format!("[{}]", parts.join("; "))
            }
            Value::Matrix(m) => {
                let mut rows = Vec::with_capacity(m.rows);
                for r in 0..m.rows.min(self.settings.max_output_count) {
                    let row: Vec<String> = (0..m.cols)
                        .take(self.settings.max_output_count)
                        .map(|c| one(m.at(r, c)))
                        .collect();
                    rows.push(row.join("; "));
                }
                if m.rows > self.settings.max_output_count {
                    rows.push("...".to_string());
                }
                format!("[{}]", rows.join(" | "))
            }
        }
    }
}

fn is_assign(t: &Token) -> bool {
    matches!(t.data, TokenData::Operator('='))
}

fn trim_number(x: f64, decimals: usize) -> String {
    if !x.is_finite() {
        return format!("{x}");
    }
    let mut s = format!("{x:.decimals$}");
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

/// Rebuild the assignment target from the tokens left of `=`.  The
/// grammar check has already passed, so the shapes here are a bare
/// variable or `name[i]` / `name[i; j]`.
fn assign_target(prefix: &[Token]) -> Result<AssignTarget> {
    match prefix {
        [t] if matches!(t.data, TokenData::Variable) => Ok(AssignTarget {
            name: t.text.clone(),
            subscripts: Vec::new(),
        }),
        [head, open, inner @ .., close]
            if matches!(head.data, TokenData::Variable)
                && matches!(open.data, TokenData::Index { rank: 0 })
                && matches!(close.data, TokenData::SquareBracketRight) =>
        {
            let mut subscripts = Vec::new();
            let mut depth = 0i32;
            let mut piece: Vec<Token> = Vec::new();
            for t in inner {
                match t.data {
                    TokenData::BracketLeft
                    | TokenData::SquareBracketLeft
                    | TokenData::Index { rank: 0 } => depth += 1,
                    TokenData::BracketRight | TokenData::SquareBracketRight => depth -= 1,
                    TokenData::Divisor if depth == 0 => {
                        subscripts.push(rpn::build(std::mem::take(&mut piece))?);
                        continue;
                    }
                    _ => {}
                }
                piece.push(t.clone());
            }
            subscripts.push(rpn::build(piece)?);
            Ok(AssignTarget {
                name: head.text.clone(),
                subscripts,
            })
        }
        _ => math_err!(
            ImproperAssignment,
            "the left side of '=' must be a variable or an element"
        ),
    }
}

/// 1-based integer subscript out of an evaluated index expression.
fn subscript(v: &Value) -> Result<usize> {
    let s = v.as_scalar()?;
    if !s.is_real() || !s.is_unitless() || s.re.fract() != 0.0 || s.re < 0.0 {
        return math_err!(IndexOutOfRange, "subscripts must be positive integers");
    }
    Ok(s.re as usize)
}

/// Recognize `name(p1; p2; ...) = body` and split it.  Returns None
/// when the statement is not shaped like a definition; misuse of a
/// built-in name is caught later by `define_function`.
fn function_def(text: &str) -> Option<(String, Vec<String>, String)> {
    let text = text.trim();
    let mut chars = text.char_indices();
    let (_, first) = chars.next()?;
    if !lexer::is_letter(first) {
        return None;
    }
    let mut open = None;
    for (i, c) in chars {
        if c == '(' {
            open = Some(i);
            break;
        }
        if !lexer::is_id_continue(c) {
            return None;
        }
    }
    let open = open?;
    let name = &text[..open];
    let close = text[open..].find(')').map(|i| open + i)?;
    let rest = text[close + 1..].trim_start();
    let body = rest.strip_prefix('=')?.trim();
    if body.is_empty() {
        return None;
    }
    let mut params = Vec::new();
    let inside = text[open + 1..close].trim();
    if !inside.is_empty() {
        for p in inside.split(';') {
            let p = p.trim();
            let mut cs = p.chars();
            let valid = cs.next().map(lexer::is_letter).unwrap_or(false)
                && cs.all(lexer::is_id_continue);
            if !valid {
                return None;
            }
            params.push(p.to_string());
        }
    }
    Some((name.to_string(), params, body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorCode;
    use float_cmp::approx_eq;

    fn parser() -> MathParser {
        MathParser::new(Settings {
            angle_mode: AngleMode::Radians,
            ..Settings::default()
        })
    }

    fn num(p: &mut MathParser, text: &str) -> f64 {
        p.calculate(text)
            .unwrap()
            .unwrap()
            .as_scalar()
            .unwrap()
            .re
    }

    #[test]
    fn plain_calculation() {
        let mut p = parser();
        assert_eq!(num(&mut p, "2 + 3 * 4"), 14.0);
    }

    #[test]
    fn degree_mode_is_the_default() {
        let mut p = MathParser::default();
        assert!(approx_eq!(f64, num(&mut p, "sin(90)"), 1.0));
    }

    #[test]
    fn assignment_defines_and_updates() {
        let mut p = parser();
        assert_eq!(num(&mut p, "a = 2"), 2.0);
        assert_eq!(num(&mut p, "b = a * 3"), 6.0);
        assert_eq!(num(&mut p, "a = a + 1"), 3.0);
        assert_eq!(num(&mut p, "b"), 6.0);
    }

    #[test]
    fn failed_assignment_rolls_back() {
        let mut p = parser();
        p.calculate("a = 5").unwrap();
        let err = p.calculate("a = 1m + 1s").unwrap_err();
        assert_eq!(err.code, ErrorCode::InconsistentUnits);
        assert_eq!(num(&mut p, "a"), 5.0);
    }

    #[test]
    fn element_assignment() {
        let mut p = parser();
        p.calculate("v = [1; 2; 3]").unwrap();
        p.calculate("v[2] = 9").unwrap();
        assert_eq!(num(&mut p, "v[2]"), 9.0);
        let err = p.calculate("v[5] = 0").unwrap_err();
        assert_eq!(err.code, ErrorCode::IndexOutOfRange);

        p.calculate("M = [1; 2 | 3; 4]").unwrap();
        p.calculate("M[2; 1] = 7").unwrap();
        assert_eq!(num(&mut p, "M[2; 1]"), 7.0);
    }

    #[test]
    fn incomplete_expression_is_rejected() {
        let mut p = parser();
        let err = p.calculate("2 +").unwrap_err();
        assert_eq!(err.code, ErrorCode::IncompleteExpression);
    }

    #[test]
    fn function_definition_and_call() {
        let mut p = parser();
        assert!(p.calculate("f(x) = x^2 + 1").unwrap().is_none());
        assert_eq!(num(&mut p, "f(3)"), 10.0);
        assert_eq!(num(&mut p, "f(f(1))"), 5.0);
    }

    #[test]
    fn two_parameter_function() {
        let mut p = parser();
        p.calculate("hyp(a; b) = sqrt(a^2 + b^2)").unwrap();
        assert_eq!(num(&mut p, "hyp(3; 4)"), 5.0);
    }

    #[test]
    fn self_recursion_yields_nan() {
        let mut p = parser();
        p.calculate("f(x) = f(x) + 1").unwrap();
        assert!(num(&mut p, "f(1)").is_nan());
    }

    #[test]
    fn builtins_cannot_be_redefined() {
        let mut p = parser();
        let err = p.calculate("sin(x) = x").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFunction);
    }

    #[test]
    fn root_block_end_to_end() {
        let mut p = parser();
        let v = num(&mut p, "$root{x^2 - 2 @ x = 1 : 2}");
        assert!(approx_eq!(f64, v, std::f64::consts::SQRT_2, epsilon = 1e-10));
    }

    #[test]
    fn repeat_block_accumulates() {
        let mut p = parser();
        assert_eq!(num(&mut p, "$repeat{ans = ans + i @ i = 1 : 5}"), 15.0);
        assert_eq!(num(&mut p, "ans"), 15.0);
    }

    #[test]
    fn sup_block_publishes_the_argument() {
        let mut p = parser();
        let v = num(&mut p, "$sup{-(x - 2)^2 + 5 @ x = 0 : 4}");
        assert!(approx_eq!(f64, v, 5.0, epsilon = 1e-9));
        let x = p.variable("x_sup").unwrap();
        assert!(approx_eq!(f64, x.as_scalar().unwrap().re, 2.0, epsilon = 1e-6));
    }

    #[test]
    fn compile_matches_evaluate() {
        let mut p = parser();
        p.calculate("a = 3").unwrap();
        for text in ["2^10 - 24", "a * (1 + 2)", "sqrt(a + 1) | %", "min(a; 2; 7)"] {
            let parsed = p.parse(text).unwrap();
            let direct = p.evaluate(&parsed).unwrap().unwrap();
            p.compile(&parsed).unwrap();
            assert!(parsed.is_compiled());
            let compiled = p.evaluate(&parsed).unwrap().unwrap();
            assert_eq!(direct, compiled, "mismatch for '{text}'");
        }
    }

    #[test]
    fn cached_lines_reuse_the_front_end() {
        let mut p = parser();
        p.calculate_line(1, "a = 1").unwrap();
        assert_eq!(
            p.calculate_line(2, "a + 1").unwrap().unwrap(),
            Value::real(2.0)
        );
        p.calculate_line(1, "a = 10").unwrap();
        assert_eq!(
            p.calculate_line(2, "a + 1").unwrap().unwrap(),
            Value::real(11.0)
        );
        // changed text replaces the cached line
        assert_eq!(
            p.calculate_line(2, "a + 2").unwrap().unwrap(),
            Value::real(12.0)
        );
    }

    #[test]
    fn cancellation_interrupts() {
        let mut p = parser();
        p.cancel_flag().store(true, Ordering::Relaxed);
        let err = p.calculate("1 + 1").unwrap_err();
        assert_eq!(err.code, ErrorCode::Interrupted);
    }

    #[test]
    fn inputs_fill_question_marks() {
        let mut p = parser();
        p.set_inputs(vec![4.0]);
        assert_eq!(num(&mut p, "? * 2"), 8.0);
        p.set_inputs(Vec::new());
        let err = p.calculate("? * 2").unwrap_err();
        assert_eq!(err.code, ErrorCode::UndefinedInput);
    }

    #[test]
    fn target_units_apply_to_assignments() {
        let mut p = parser();
        p.calculate("L = 3m + 2cm | cm").unwrap();
        let v = p.variable("L").unwrap();
        let s = v.as_scalar().unwrap().clone();
        assert!(approx_eq!(f64, s.re, 302.0));
        assert_eq!(s.unit.unwrap().text(), "cm");
    }

    #[test]
    fn format_value_honors_settings() {
        let mut p = parser();
        let v = p.calculate("2 / 3").unwrap().unwrap();
        assert_eq!(p.format_value(&v), "0.666667");
        let v = p.calculate("[1; 2; 3]").unwrap().unwrap();
        assert_eq!(p.format_value(&v), "[1; 2; 3]");
    }

    #[test]
    fn clear_resets_the_session() {
        let mut p = parser();
        p.calculate("a = 1").unwrap();
        p.clear();
        let err = p.calculate("a").unwrap_err();
        assert_eq!(err.code, ErrorCode::UndefinedVariable);
    }

    #[test]
    fn solver_slots_are_reclaimed() {
        let mut p = parser();
        for _ in 0..4 {
            let x = num(&mut p, "$root{x^2 - 2 @ x = 1 : 2}");
            assert!(approx_eq!(f64, x, std::f64::consts::SQRT_2, epsilon = 1e-8));
        }
        assert_eq!(p.solvers.len(), 1);
        assert!(p.solvers[0].is_none());
    }

    #[test]
    fn function_bodies_keep_their_solver_blocks() {
        let mut p = parser();
        p.calculate("f(a) = a + $root{x^2 - 2 @ x = 1 : 2}").unwrap();
        p.calculate("1 + 1").unwrap();
        let expect = 10.0 + std::f64::consts::SQRT_2;
        assert!(approx_eq!(f64, num(&mut p, "f(10)"), expect, epsilon = 1e-8));
    }

    #[test]
    fn function_def_recognizer() {
        let (name, params, body) = function_def("f(x; y) = x + y").unwrap();
        assert_eq!(name, "f");
        assert_eq!(params, vec!["x", "y"]);
        assert_eq!(body, "x + y");
        assert!(function_def("f(3) = 2").is_none());
        assert!(function_def("a = 2").is_none());
        assert!(function_def("f(x)").is_none());
    }
}
