// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! User-defined functions.  The body is kept as RPN and compiled
//! lazily; parameters are shared cells bound into the compiled program.
//! One- and two-argument functions memoize results keyed by bit-equal
//! scalar arguments.  The memo cache and the compiled body are dropped
//! whenever a captured global's generation stamp changes.  Functions
//! detected as self-recursive at definition time always evaluate to
//! NaN.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ordered_float::OrderedFloat;

use crate::bytecode::{compile, Program};
use crate::common::Result;
use crate::interpreter::EvalEnv;
use crate::math_err;
use crate::token::{Token, TokenData};
use crate::units::DIM_COUNT;
use crate::value::{Scalar, Value};
use crate::variable::{VarCell, Variable};

/// Memo entries past this count evict the whole cache.
const MEMO_CAP: usize = 1_000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ScalarKey {
    re: OrderedFloat<f64>,
    im: OrderedFloat<f64>,
    unit: Option<([u32; DIM_COUNT], u64)>,
}

impl ScalarKey {
    fn of(s: &Scalar) -> Self {
        ScalarKey {
            re: OrderedFloat(s.re),
            im: OrderedFloat(s.im),
            unit: s.unit.as_ref().map(|u| u.key()),
        }
    }
}

type MemoKey = Vec<ScalarKey>;

#[derive(Debug)]
pub struct CustomFunction {
    pub name: String,
    params: Vec<String>,
    param_cells: Vec<VarCell>,
    rpn: Vec<Token>,
    recursive: std::cell::Cell<bool>,
    deps: Vec<(String, VarCell)>,
    dep_stamps: RefCell<Vec<u64>>,
    compiled: RefCell<Option<Rc<Program>>>,
    memo: RefCell<HashMap<MemoKey, Value>>,
}

/// Resolves parameter names ahead of the enclosing session.
struct ScopedEnv<'a> {
    inner: &'a mut dyn EvalEnv,
    scope: &'a [(String, VarCell)],
}

impl<'a> EvalEnv for ScopedEnv<'a> {
    fn calculator(&self) -> &crate::calculator::Calculator {
        self.inner.calculator()
    }

    fn var_cell(&mut self, name: &str) -> Option<VarCell> {
        if let Some((_, cell)) = self.scope.iter().find(|(n, _)| n == name) {
            return Some(Rc::clone(cell));
        }
        self.inner.var_cell(name)
    }

    fn define_cell(&mut self, name: &str) -> VarCell {
        if let Some((_, cell)) = self.scope.iter().find(|(n, _)| n == name) {
            return Rc::clone(cell);
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

impl CustomFunction {
    /// Bind a new function: fresh parameter cells, and capture the
    /// cells of every global the body reads so their stamps can be
    /// watched.  Globals must already exist.
    pub fn new(
        name: &str,
        params: Vec<String>,
        rpn: Vec<Token>,
        env: &mut dyn EvalEnv,
    ) -> Result<Self> {
        let param_cells: Vec<VarCell> = params.iter().map(|_| Variable::empty()).collect();
        let mut deps: Vec<(String, VarCell)> = Vec::new();
        for token in &rpn {
            if matches!(token.data, TokenData::Variable)
                && !params.iter().any(|p| *p == token.text)
                && !deps.iter().any(|(n, _)| *n == token.text)
            {
                let cell = env.var_cell(&token.text).ok_or_else(|| {
                    crate::math_error!(
                        UndefinedVariable,
                        "'{}' uses undefined variable '{}'",
                        name,
                        token.text
                    )
                })?;
                deps.push((token.text.clone(), cell));
            }
        }
        let stamps = deps.iter().map(|(_, c)| c.borrow().generation()).collect();
        Ok(CustomFunction {
            name: name.to_string(),
            params,
            param_cells,
            rpn,
            recursive: std::cell::Cell::new(false),
            deps,
            dep_stamps: RefCell::new(stamps),
            compiled: RefCell::new(None),
            memo: RefCell::new(HashMap::new()),
        })
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn mark_recursive(&self) {
        self.recursive.set(true);
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive.get()
    }

    /// The indexes of other user functions the body calls, for the
    /// registry's call-graph walk.
    pub fn callees(&self) -> impl Iterator<Item = usize> + '_ {
        self.rpn.iter().filter_map(|t| match t.data {
            TokenData::CustomFunction { index, .. } => Some(index),
            _ => None,
        })
    }

    fn invalidate_if_stale(&self) {
        let mut stamps = self.dep_stamps.borrow_mut();
        let mut stale = false;
        for (i, (_, cell)) in self.deps.iter().enumerate() {
            let current = cell.borrow().generation();
            if stamps[i] != current {
                stamps[i] = current;
                stale = true;
            }
        }
        if stale {
            self.memo.borrow_mut().clear();
            *self.compiled.borrow_mut() = None;
        }
    }

    fn memo_key(&self, args: &[Value]) -> Option<MemoKey> {
        if args.len() > 2 {
            return None;
        }
        let mut key = Vec::with_capacity(args.len());
        for a in args {
            match a {
                Value::Scalar(s) => key.push(ScalarKey::of(s)),
                _ => return None,
            }
        }
        Some(key)
    }

    pub fn call(&self, args: Vec<Value>, env: &mut dyn EvalEnv) -> Result<Value> {
        if self.recursive.get() {
            return Ok(Value::Scalar(Scalar::nan()));
        }
        if args.len() != self.params.len() {
            return math_err!(
                ArgumentCount,
                "'{}' expects {} argument(s), got {}",
                self.name,
                self.params.len(),
                args.len()
            );
        }
        self.invalidate_if_stale();
        let key = self.memo_key(&args);
        if let Some(ref key) = key {
            if let Some(hit) = self.memo.borrow().get(key) {
                return Ok(hit.clone());
            }
        }
        for (cell, arg) in self.param_cells.iter().zip(args.into_iter()) {
            cell.borrow_mut().assign(arg);
        }
        let scope: Vec<(String, VarCell)> = self
            .params
            .iter()
            .cloned()
            .zip(self.param_cells.iter().cloned())
            .collect();
        let mut scoped = ScopedEnv {
            inner: env,
            scope: &scope,
        };
        let program = {
            let mut slot = self.compiled.borrow_mut();
            match slot.as_ref() {
                Some(p) => Rc::clone(p),
                None => {
                    let p = Rc::new(compile(&self.rpn, &mut scoped)?);
                    *slot = Some(Rc::clone(&p));
                    p
                }
            }
        };
        let result = program.run(&mut scoped)?;
        if let Some(key) = key {
            let mut memo = self.memo.borrow_mut();
            if memo.len() >= MEMO_CAP {
                memo.clear();
            }
            memo.insert(key, result.clone());
        }
        Ok(result)
    }

    /// Drop the compiled body and the memo so the next call rebuilds
    /// them; used when session settings change under the function.
    pub fn invalidate(&self) {
        self.memo.borrow_mut().clear();
        *self.compiled.borrow_mut() = None;
    }

    #[cfg(test)]
    pub(crate) fn memo_len(&self) -> usize {
        self.memo.borrow().len()
    }
}

/// The session's function table.  Definition order gives each function
/// a stable index; redefinition replaces in place so existing call
/// tokens stay valid.
#[derive(Default)]
pub struct FunctionRegistry {
    funcs: Vec<Rc<CustomFunction>>,
    names: Vec<String>,
}

impl FunctionRegistry {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, index: usize) -> Option<Rc<CustomFunction>> {
        self.funcs.get(index).map(Rc::clone)
    }

    pub fn arity(&self, index: usize) -> Option<usize> {
        self.funcs.get(index).map(|f| f.arity())
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Reserve a slot so the body of `name` can refer to itself while
    /// it is being lexed.
    pub fn reserve(&mut self, name: &str) -> usize {
        match self.index_of(name) {
            Some(i) => i,
            None => {
                self.names.push(name.to_string());
                self.funcs.push(Rc::new(placeholder(name)));
                self.names.len() - 1
            }
        }
    }

    /// Install a definition and re-run recursion detection: a function
    /// that can reach itself through the call graph is marked and will
    /// evaluate to NaN.
    pub fn install(&mut self, index: usize, func: CustomFunction) {
        self.funcs[index] = Rc::new(func);
        for i in 0..self.funcs.len() {
            if self.reaches(i, i, &mut vec![false; self.funcs.len()]) {
                self.funcs[i].mark_recursive();
            }
        }
    }

    fn reaches(&self, from: usize, target: usize, seen: &mut Vec<bool>) -> bool {
        for callee in self.funcs[from].callees() {
            if callee == target {
                return true;
            }
            if callee < seen.len() && !seen[callee] {
                seen[callee] = true;
                if self.reaches(callee, target, seen) {
                    return true;
                }
            }
        }
        false
    }

    pub fn invalidate_all(&self) {
        for f in &self.funcs {
            f.invalidate();
        }
    }

    pub fn clear(&mut self) {
        self.funcs.clear();
        self.names.clear();
    }
}

fn placeholder(name: &str) -> CustomFunction {
    CustomFunction {
        name: name.to_string(),
        params: Vec::new(),
        param_cells: Vec::new(),
        rpn: Vec::new(),
        recursive: std::cell::Cell::new(false),
        deps: Vec::new(),
        dep_stamps: RefCell::new(Vec::new()),
        compiled: RefCell::new(None),
        memo: RefCell::new(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::testenv::SimpleEnv;
    use crate::lexer::testenv::StaticEnv;
    use crate::lexer::tokenize;
    use crate::rpn;

    fn body(text: &str, params: &[&str], funcs: &[&str]) -> Vec<Token> {
        let mut env = StaticEnv::with_vars(params);
        env.vars.push("a".to_string());
        env.funcs = funcs.iter().map(|s| s.to_string()).collect();
        let out = tokenize(text, &mut env).unwrap();
        rpn::build(out.tokens).unwrap()
    }

    fn re(v: &Value) -> f64 {
        v.as_scalar().unwrap().re
    }

    #[test]
    fn parameters_bind_and_evaluate() {
        let mut env = SimpleEnv::new();
        let f = CustomFunction::new(
            "f",
            vec!["x".to_string()],
            body("x ^ 2 + 1", &["x"], &[]),
            &mut env,
        )
        .unwrap();
        assert_eq!(re(&f.call(vec![Value::real(3.0)], &mut env).unwrap()), 10.0);
        assert_eq!(re(&f.call(vec![Value::real(4.0)], &mut env).unwrap()), 17.0);
    }

    #[test]
    fn memoization_evaluates_once_per_argument() {
        let mut env = SimpleEnv::new();
        // random() makes repeated evaluation observable
        let f = CustomFunction::new(
            "f",
            vec!["x".to_string()],
            body("random(100) + x * 0", &["x"], &[]),
            &mut env,
        )
        .unwrap();
        let first = re(&f.call(vec![Value::real(1.0)], &mut env).unwrap());
        let second = re(&f.call(vec![Value::real(1.0)], &mut env).unwrap());
        assert_eq!(first, second);
        assert_eq!(f.memo_len(), 1);
        let other = re(&f.call(vec![Value::real(2.0)], &mut env).unwrap());
        assert_ne!(first, other);
        assert_eq!(f.memo_len(), 2);
    }

    #[test]
    fn global_change_clears_the_memo() {
        let mut env = SimpleEnv::new();
        env.set("a", Value::real(1.0));
        let f = CustomFunction::new(
            "f",
            vec!["x".to_string()],
            body("x + a", &["x"], &[]),
            &mut env,
        )
        .unwrap();
        assert_eq!(re(&f.call(vec![Value::real(2.0)], &mut env).unwrap()), 3.0);
        env.vars
            .get("a")
            .unwrap()
            .borrow_mut()
            .assign(Value::real(10.0));
        assert_eq!(re(&f.call(vec![Value::real(2.0)], &mut env).unwrap()), 12.0);
    }

    #[test]
    fn undefined_global_fails_at_definition() {
        let mut env = SimpleEnv::new();
        let err = CustomFunction::new(
            "f",
            vec!["x".to_string()],
            body("x + zz", &["x", "zz"], &[]),
            &mut env,
        )
        .unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::UndefinedVariable);
    }

    #[test]
    fn recursive_functions_return_nan() {
        let mut env = SimpleEnv::new();
        let mut registry = FunctionRegistry::default();
        let idx = registry.reserve("f");
        let f = CustomFunction::new(
            "f",
            vec!["x".to_string()],
            body("f(x) + 1", &["x"], &["f"]),
            &mut env,
        )
        .unwrap();
        registry.install(idx, f);
        let f = registry.get(idx).unwrap();
        assert!(f.is_recursive());
        let v = f.call(vec![Value::real(1.0)], &mut env).unwrap();
        assert!(re(&v).is_nan());
    }

    #[test]
    fn mutual_recursion_is_detected() {
        let mut env = SimpleEnv::new();
        let mut registry = FunctionRegistry::default();
        let fi = registry.reserve("f");
        let gi = registry.reserve("g");
        let f = CustomFunction::new(
            "f",
            vec!["x".to_string()],
            body("g(x)", &["x"], &["f", "g"]),
            &mut env,
        )
        .unwrap();
        registry.install(fi, f);
        let g = CustomFunction::new(
            "g",
            vec!["x".to_string()],
            body("f(x)", &["x"], &["f", "g"]),
            &mut env,
        )
        .unwrap();
        registry.install(gi, g);
        assert!(registry.get(fi).unwrap().is_recursive());
        assert!(registry.get(gi).unwrap().is_recursive());
    }
}
