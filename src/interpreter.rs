// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The direct evaluator: one pass over an RPN slice with an explicit
//! value stack.  Assignment never reaches this level; the session
//! splits `target = expr` before evaluation, so the slice here is a
//! pure expression.  Custom functions and solver blocks are dispatched
//! back through the session via `EvalEnv`.

use crate::calculator::Calculator;
use crate::common::Result;
use crate::math_err;
use crate::token::{Token, TokenData};
use crate::units::Unit;
use crate::value::{Scalar, Value};
use crate::variable::VarCell;

/// What evaluation needs from the session: the kernel, the variable
/// table, and re-entry points for user functions and solver blocks.
pub trait EvalEnv {
    fn calculator(&self) -> &Calculator;
    fn var_cell(&mut self, name: &str) -> Option<VarCell>;
    /// Get-or-create a cell; assignment targets and solver-published
    /// variables come into being through this.
    fn define_cell(&mut self, name: &str) -> VarCell;
    fn call_custom(&mut self, index: usize, args: Vec<Value>) -> Result<Value>;
    fn eval_solver(&mut self, id: usize) -> Result<Value>;
    fn check_cancelled(&self) -> Result<()> {
        Ok(())
    }
    fn set_var(&mut self, name: &str, value: Value) {
        self.define_cell(name).borrow_mut().assign(value);
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| crate::math_error!(StackEmpty, "evaluation stack ran dry"))
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<Vec<Value>> {
    if stack.len() < n {
        return math_err!(StackEmpty, "evaluation stack ran dry");
    }
    Ok(stack.split_off(stack.len() - n))
}

/// Evaluate one RPN slice to a value.
pub fn evaluate(rpn: &[Token], env: &mut dyn EvalEnv) -> Result<Value> {
    env.check_cancelled()?;
    let mut stack: Vec<Value> = Vec::with_capacity(rpn.len() / 2 + 1);
    for token in rpn {
        match &token.data {
            TokenData::Constant(s) => stack.push(Value::Scalar(s.clone())),
            TokenData::Unit(u) => stack.push(Value::Scalar(Scalar::with_unit(1.0, u.clone()))),
            TokenData::Variable => {
                let cell = env.var_cell(&token.text).ok_or_else(|| {
                    crate::math_error!(UndefinedVariable, "undefined variable: '{}'", token.text)
                })?;
                let value = cell.borrow().value(&token.text)?;
                stack.push(value);
            }
            TokenData::Input { value, .. } => match value {
                Some(v) => stack.push(Value::real(*v)),
                None => {
                    return math_err!(UndefinedInput, "input field has no value yet");
                }
            },
            TokenData::Operator('=') => {
                return math_err!(CannotEvaluate, "assignment reached the evaluator");
            }
            TokenData::Operator(op) => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(env.calculator().operator(*op, &a, &b)?);
            }
            TokenData::Negate => {
                let a = pop(&mut stack)?;
                stack.push(env.calculator().negate(&a)?);
            }
            TokenData::Factorial => {
                let a = pop(&mut stack)?;
                stack.push(env.calculator().factorial(&a)?);
            }
            TokenData::Function(index) => {
                let a = pop(&mut stack)?;
                stack.push(env.calculator().function(*index, &a)?);
            }
            TokenData::Function2(index) => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(env.calculator().function2(*index, &a, &b)?);
            }
            TokenData::Function3(index) => {
                let c = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(env.calculator().function3(*index, &a, &b, &c)?);
            }
            TokenData::MultiFunction { index, argc } => {
                let args = pop_n(&mut stack, *argc)?;
                stack.push(env.calculator().multi_function(*index, &args)?);
            }
            TokenData::Interpolation { index, argc } => {
                let args = pop_n(&mut stack, *argc)?;
                stack.push(env.calculator().interpolation(*index, &args)?);
            }
            TokenData::VectorFunction { index, argc } => {
                let args = pop_n(&mut stack, *argc)?;
                stack.push(env.calculator().vector_function(*index, &args)?);
            }
            TokenData::MatrixFunction { index, argc } => {
                let args = pop_n(&mut stack, *argc)?;
                stack.push(env.calculator().matrix_function(*index, &args)?);
            }
            TokenData::CustomFunction { index, argc } => {
                let args = pop_n(&mut stack, *argc)?;
                stack.push(env.call_custom(*index, args)?);
            }
            TokenData::VectorLit { len } => {
                let elems = pop_n(&mut stack, *len)?;
                let scalars: Result<Vec<Scalar>> =
                    elems.into_iter().map(Value::into_scalar).collect();
                stack.push(Value::Vector(scalars?));
            }
            TokenData::MatrixLit { rows, .. } => {
                let row_values = pop_n(&mut stack, *rows)?;
                let mut out_rows = Vec::with_capacity(*rows);
                for v in row_values {
                    match v {
                        Value::Vector(row) => out_rows.push(row),
                        other => {
                            return math_err!(
                                DimensionMismatch,
                                "matrix row is a {}",
                                other.shape_name()
                            )
                        }
                    }
                }
                stack.push(Value::Matrix(crate::value::Matrix::from_rows(out_rows)?));
            }
            TokenData::Index { rank } => {
                let indices = pop_n(&mut stack, *rank)?;
                let target = pop(&mut stack)?;
                stack.push(env.calculator().index(&target, &indices)?);
            }
            TokenData::Solver { id } => {
                let value = env.eval_solver(*id)?;
                stack.push(value);
            }
            TokenData::BracketLeft
            | TokenData::BracketRight
            | TokenData::SquareBracketLeft
            | TokenData::SquareBracketRight
            | TokenData::Divisor
            | TokenData::RowDivisor => {
                return math_err!(CannotEvaluate, "structural token in RPN: '{}'", token.text);
            }
        }
    }
    let result = pop(&mut stack)?;
    if !stack.is_empty() {
        return math_err!(StackLeak, "{} value(s) left on the stack", stack.len());
    }
    Ok(result)
}

/// Post-evaluation unit fixup: convert to the explicit target unit when
/// one was written, otherwise rewrite anonymous compound units to their
/// canonical derived form.
pub fn finish(value: Value, target: Option<&Unit>) -> Result<Value> {
    match target {
        Some(u) => value.convert_to(u),
        None => Ok(value.normalized()),
    }
}

#[cfg(test)]
pub(crate) mod testenv {
    use super::*;
    use crate::calculator::AngleMode;
    use crate::variable::Variable;
    use std::collections::HashMap;

    /// Session stand-in for evaluator and compiler tests: a variable
    /// map and the kernel, no user functions or solvers.
    pub struct SimpleEnv {
        pub calc: Calculator,
        pub vars: HashMap<String, VarCell>,
    }

    impl SimpleEnv {
        pub fn new() -> Self {
            SimpleEnv {
                calc: Calculator::seeded(AngleMode::Radians, 11),
                vars: HashMap::new(),
            }
        }

        pub fn set(&mut self, name: &str, value: Value) {
            self.vars
                .insert(name.to_string(), Variable::with_value(value));
        }
    }

    impl EvalEnv for SimpleEnv {
        fn calculator(&self) -> &Calculator {
            &self.calc
        }

        fn var_cell(&mut self, name: &str) -> Option<VarCell> {
            self.vars.get(name).cloned()
        }

        fn define_cell(&mut self, name: &str) -> VarCell {
            use std::rc::Rc;
            Rc::clone(
                self.vars
                    .entry(name.to_string())
                    .or_insert_with(Variable::empty),
            )
        }

        fn call_custom(&mut self, _index: usize, _args: Vec<Value>) -> Result<Value> {
            math_err!(InvalidFunction, "no custom functions in this test env")
        }

        fn eval_solver(&mut self, _id: usize) -> Result<Value> {
            math_err!(InvalidSolver, "no solver blocks in this test env")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testenv::SimpleEnv;
    use super::*;
    use crate::lexer::testenv::StaticEnv;
    use crate::lexer::tokenize;
    use crate::rpn;
    use float_cmp::approx_eq;

    fn eval(text: &str, env: &mut SimpleEnv) -> Result<Value> {
        let mut lex_env = StaticEnv {
            vars: env.vars.keys().cloned().collect(),
            ..Default::default()
        };
        let out = tokenize(text, &mut lex_env)?;
        let rpn = rpn::build(out.tokens)?;
        let value = evaluate(&rpn, env)?;
        finish(value, out.target_unit.as_ref())
    }

    fn re(v: &Value) -> f64 {
        v.as_scalar().unwrap().re
    }

    #[test]
    fn arithmetic_with_units() {
        let mut env = SimpleEnv::new();
        let v = eval("3m + 2cm", &mut env).unwrap();
        assert!(approx_eq!(f64, re(&v), 3.02));
        assert_eq!(v.as_scalar().unwrap().unit.as_ref().unwrap().text(), "m");
    }

    #[test]
    fn target_unit_conversion() {
        let mut env = SimpleEnv::new();
        let v = eval("3m + 2cm | cm", &mut env).unwrap();
        assert!(approx_eq!(f64, re(&v), 302.0));
        assert_eq!(v.as_scalar().unwrap().unit.as_ref().unwrap().text(), "cm");
    }

    #[test]
    fn derived_unit_normalization() {
        let mut env = SimpleEnv::new();
        let v = eval("2kN * 3m", &mut env).unwrap();
        assert_eq!(v.as_scalar().unwrap().unit.as_ref().unwrap().text(), "J");
        assert!(approx_eq!(f64, re(&v), 6000.0));
    }

    #[test]
    fn precedence_in_practice() {
        let mut env = SimpleEnv::new();
        assert_eq!(re(&eval("2 + 3 * 4", &mut env).unwrap()), 14.0);
        assert_eq!(re(&eval("-2^2", &mut env).unwrap()), -4.0);
        assert_eq!(re(&eval("2^3^2", &mut env).unwrap()), 512.0);
        assert_eq!(re(&eval("(2 + 3) * 4", &mut env).unwrap()), 20.0);
    }

    #[test]
    fn vector_literal_and_index() {
        let mut env = SimpleEnv::new();
        assert_eq!(re(&eval("[1; 2; 3][2]", &mut env).unwrap()), 2.0);
        let err = eval("[1; 2; 3][4]", &mut env).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::IndexOutOfRange);
    }

    #[test]
    fn matrix_literal_and_index() {
        let mut env = SimpleEnv::new();
        assert_eq!(re(&eval("[1; 2 | 3; 4][2; 1]", &mut env).unwrap()), 3.0);
        assert_eq!(re(&eval("det([2; 0 | 0; 3])", &mut env).unwrap()), 6.0);
    }

    #[test]
    fn variables_resolve_from_cells() {
        let mut env = SimpleEnv::new();
        env.set("a", Value::real(5.0));
        assert_eq!(re(&eval("a * 2 + 1", &mut env).unwrap()), 11.0);
        let err = eval("zz + 1", &mut env).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::UndefinedVariable);
    }

    #[test]
    fn input_fields_need_values() {
        let mut env = SimpleEnv::new();
        assert_eq!(re(&eval("?{2.5} * 2", &mut env).unwrap()), 5.0);
        let err = eval("? * 2", &mut env).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::UndefinedInput);
    }

    #[test]
    fn functions_and_factorial() {
        let mut env = SimpleEnv::new();
        assert!(approx_eq!(f64, re(&eval("sin(π / 2)", &mut env).unwrap()), 1.0));
        assert_eq!(re(&eval("5! / 4!", &mut env).unwrap()), 5.0);
        assert_eq!(re(&eval("min(4; 1; 3)", &mut env).unwrap()), 1.0);
        assert_eq!(re(&eval("if(1 > 2; 10; 20)", &mut env).unwrap()), 20.0);
    }
}
