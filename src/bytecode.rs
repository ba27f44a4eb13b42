// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Compile-for-reuse: an RPN slice becomes a flat instruction program
//! run by a tight loop with the same semantics as the direct
//! evaluator.  Variable reads bind their cells at compile time, and
//! constant subexpressions fold into single `Const` instructions.
//! Folding skips the non-pure builtins (`random` and the fresh
//! vector/matrix builders), custom functions, solver blocks and
//! anything touching a variable.

use crate::common::Result;
use crate::interpreter::EvalEnv;
use crate::math_err;
use crate::token::{Token, TokenData};
use crate::value::{Matrix, Scalar, Value};
use crate::variable::VarCell;

#[derive(Clone, Debug)]
pub enum Instr {
    Const(Value),
    Load { cell: VarCell, name: String },
    Op(char),
    Negate,
    Factorial,
    Function(usize),
    Function2(usize),
    Function3(usize),
    MultiFunction { index: usize, argc: usize },
    Interpolation { index: usize, argc: usize },
    VectorFunction { index: usize, argc: usize },
    MatrixFunction { index: usize, argc: usize },
    CustomFunction { index: usize, argc: usize },
    VectorLit(usize),
    MatrixLit(usize),
    Index(usize),
    Solver(usize),
}

#[derive(Clone, Debug, Default)]
pub struct Program {
    instrs: Vec<Instr>,
}

/// One compile-time stack slot: where its instructions start, and the
/// value when the whole subexpression is a known constant.
struct Slot {
    start: usize,
    constant: Option<Value>,
}

struct Compiler<'a> {
    env: &'a mut dyn EvalEnv,
    instrs: Vec<Instr>,
    slots: Vec<Slot>,
}

pub fn compile(rpn: &[Token], env: &mut dyn EvalEnv) -> Result<Program> {
    let mut c = Compiler {
        env,
        instrs: Vec::with_capacity(rpn.len()),
        slots: Vec::new(),
    };
    for token in rpn {
        c.compile_token(token)?;
    }
    if c.slots.len() != 1 {
        return math_err!(StackLeak, "{} value(s) left after compilation", c.slots.len());
    }
    Ok(Program { instrs: c.instrs })
}

impl<'a> Compiler<'a> {
    fn push_const(&mut self, value: Value) {
        let start = self.instrs.len();
        self.instrs.push(Instr::Const(value.clone()));
        self.slots.push(Slot {
            start,
            constant: Some(value),
        });
    }

    fn push_opaque(&mut self, instr: Instr) {
        let start = self.instrs.len();
        self.instrs.push(instr);
        self.slots.push(Slot {
            start,
            constant: None,
        });
    }

    fn pop_slots(&mut self, n: usize) -> Result<Vec<Slot>> {
        if self.slots.len() < n {
            return math_err!(StackEmpty, "compilation stack ran dry");
        }
        Ok(self.slots.split_off(self.slots.len() - n))
    }

    /// Consume `n` operand slots and one combining instruction.  When
    /// every operand is constant and the operation is pure, evaluate it
    /// now and replace the operand instructions with one `Const`.
    fn combine<F>(&mut self, n: usize, instr: Instr, pure: bool, fold: F) -> Result<()>
    where
        F: FnOnce(&dyn EvalEnv, &[Value]) -> Result<Value>,
    {
        let operands = self.pop_slots(n)?;
        let start = operands.first().map(|s| s.start).unwrap_or(self.instrs.len());
        if pure && operands.iter().all(|s| s.constant.is_some()) {
            let args: Vec<Value> = operands.into_iter().map(|s| s.constant.unwrap()).collect();
            let value = fold(self.env, &args)?;
            self.instrs.truncate(start);
            self.instrs.push(Instr::Const(value.clone()));
            self.slots.push(Slot {
                start,
                constant: Some(value),
            });
        } else {
            self.instrs.push(instr);
            self.slots.push(Slot {
                start,
                constant: None,
            });
        }
        Ok(())
    }

    fn compile_token(&mut self, token: &Token) -> Result<()> {
        use crate::calculator::{is_pure, Namespace};
        match &token.data {
            TokenData::Constant(s) => self.push_const(Value::Scalar(s.clone())),
            TokenData::Unit(u) => {
                self.push_const(Value::Scalar(Scalar::with_unit(1.0, u.clone())))
            }
            TokenData::Input { value, .. } => match value {
                Some(v) => self.push_const(Value::real(*v)),
                None => return math_err!(UndefinedInput, "input field has no value yet"),
            },
            TokenData::Variable => {
                let cell = self.env.var_cell(&token.text).ok_or_else(|| {
                    crate::math_error!(UndefinedVariable, "undefined variable: '{}'", token.text)
                })?;
                self.push_opaque(Instr::Load {
                    cell,
                    name: token.text.clone(),
                });
            }
            TokenData::Operator('=') => {
                return math_err!(CannotEvaluate, "assignment reached the compiler");
            }
            TokenData::Operator(op) => {
                let op = *op;
                self.combine(2, Instr::Op(op), true, |env, args| {
                    env.calculator().operator(op, &args[0], &args[1])
                })?;
            }
            TokenData::Negate => {
                self.combine(1, Instr::Negate, true, |env, args| {
                    env.calculator().negate(&args[0])
                })?;
            }
            TokenData::Factorial => {
                self.combine(1, Instr::Factorial, true, |env, args| {
                    env.calculator().factorial(&args[0])
                })?;
            }
            TokenData::Function(index) => {
                let index = *index;
                let pure = is_pure(Namespace::Function, index);
                self.combine(1, Instr::Function(index), pure, |env, args| {
                    env.calculator().function(index, &args[0])
                })?;
            }
            TokenData::Function2(index) => {
                let index = *index;
                self.combine(2, Instr::Function2(index), true, |env, args| {
                    env.calculator().function2(index, &args[0], &args[1])
                })?;
            }
            TokenData::Function3(index) => {
                let index = *index;
                self.combine(3, Instr::Function3(index), true, |env, args| {
                    env.calculator().function3(index, &args[0], &args[1], &args[2])
                })?;
            }
            TokenData::MultiFunction { index, argc } => {
                let (index, argc) = (*index, *argc);
                self.combine(
                    argc,
                    Instr::MultiFunction { index, argc },
                    true,
                    |env, args| env.calculator().multi_function(index, args),
                )?;
            }
            TokenData::Interpolation { index, argc } => {
                let (index, argc) = (*index, *argc);
                self.combine(
                    argc,
                    Instr::Interpolation { index, argc },
                    true,
                    |env, args| env.calculator().interpolation(index, args),
                )?;
            }
            TokenData::VectorFunction { index, argc } => {
                let (index, argc) = (*index, *argc);
                let pure = is_pure(Namespace::VectorFunction, index);
                self.combine(
                    argc,
                    Instr::VectorFunction { index, argc },
                    pure,
                    |env, args| env.calculator().vector_function(index, args),
                )?;
            }
            TokenData::MatrixFunction { index, argc } => {
                let (index, argc) = (*index, *argc);
                let pure = is_pure(Namespace::MatrixFunction, index);
                self.combine(
                    argc,
                    Instr::MatrixFunction { index, argc },
                    pure,
                    |env, args| env.calculator().matrix_function(index, args),
                )?;
            }
            TokenData::CustomFunction { index, argc } => {
                let (index, argc) = (*index, *argc);
                let slots = self.pop_slots(argc)?;
                let start = slots.first().map(|s| s.start).unwrap_or(self.instrs.len());
                self.instrs.push(Instr::CustomFunction { index, argc });
                self.slots.push(Slot {
                    start,
                    constant: None,
                });
            }
            TokenData::VectorLit { len } => {
                let len = *len;
                self.combine(len, Instr::VectorLit(len), true, |_, args| {
                    let scalars: Result<Vec<Scalar>> =
                        args.iter().cloned().map(Value::into_scalar).collect();
                    Ok(Value::Vector(scalars?))
                })?;
            }
            TokenData::MatrixLit { rows, .. } => {
                let rows = *rows;
                self.combine(rows, Instr::MatrixLit(rows), true, |_, args| {
                    build_matrix(args.to_vec())
                })?;
            }
            TokenData::Index { rank } => {
                let rank = *rank;
                self.combine(rank + 1, Instr::Index(rank), true, |env, args| {
                    env.calculator().index(&args[0], &args[1..])
                })?;
            }
            TokenData::Solver { id } => self.push_opaque(Instr::Solver(*id)),
            TokenData::BracketLeft
            | TokenData::BracketRight
            | TokenData::SquareBracketLeft
            | TokenData::SquareBracketRight
            | TokenData::Divisor
            | TokenData::RowDivisor => {
                return math_err!(CannotEvaluate, "structural token in RPN: '{}'", token.text);
            }
        }
        Ok(())
    }
}

fn build_matrix(rows: Vec<Value>) -> Result<Value> {
    let mut out_rows = Vec::with_capacity(rows.len());
    for v in rows {
        match v {
            Value::Vector(row) => out_rows.push(row),
            other => {
                return math_err!(DimensionMismatch, "matrix row is a {}", other.shape_name())
            }
        }
    }
    Ok(Value::Matrix(Matrix::from_rows(out_rows)?))
}

impl Program {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// True when folding reduced the whole program to one constant.
    pub fn is_constant(&self) -> bool {
        matches!(self.instrs.as_slice(), [Instr::Const(_)])
    }

    pub fn run(&self, env: &mut dyn EvalEnv) -> Result<Value> {
        env.check_cancelled()?;
        let mut stack: Vec<Value> = Vec::with_capacity(self.instrs.len() / 2 + 1);
        for instr in &self.instrs {
            match instr {
                Instr::Const(v) => stack.push(v.clone()),
                Instr::Load { cell, name } => {
                    let value = cell.borrow().value(name)?;
                    stack.push(value);
                }
                Instr::Op(op) => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(env.calculator().operator(*op, &a, &b)?);
                }
                Instr::Negate => {
                    let a = pop(&mut stack)?;
                    stack.push(env.calculator().negate(&a)?);
                }
                Instr::Factorial => {
                    let a = pop(&mut stack)?;
                    stack.push(env.calculator().factorial(&a)?);
                }
                Instr::Function(index) => {
                    let a = pop(&mut stack)?;
                    stack.push(env.calculator().function(*index, &a)?);
                }
                Instr::Function2(index) => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(env.calculator().function2(*index, &a, &b)?);
                }
                Instr::Function3(index) => {
                    let c = pop(&mut stack)?;
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(env.calculator().function3(*index, &a, &b, &c)?);
                }
                Instr::MultiFunction { index, argc } => {
                    let args = pop_n(&mut stack, *argc)?;
                    stack.push(env.calculator().multi_function(*index, &args)?);
                }
                Instr::Interpolation { index, argc } => {
                    let args = pop_n(&mut stack, *argc)?;
                    stack.push(env.calculator().interpolation(*index, &args)?);
                }
                Instr::VectorFunction { index, argc } => {
                    let args = pop_n(&mut stack, *argc)?;
                    stack.push(env.calculator().vector_function(*index, &args)?);
                }
                Instr::MatrixFunction { index, argc } => {
                    let args = pop_n(&mut stack, *argc)?;
                    stack.push(env.calculator().matrix_function(*index, &args)?);
                }
                Instr::CustomFunction { index, argc } => {
                    let args = pop_n(&mut stack, *argc)?;
                    stack.push(env.call_custom(*index, args)?);
                }
                Instr::VectorLit(len) => {
                    let elems = pop_n(&mut stack, *len)?;
                    let scalars: Result<Vec<Scalar>> =
                        elems.into_iter().map(Value::into_scalar).collect();
                    stack.push(Value::Vector(scalars?));
                }
                Instr::MatrixLit(rows) => {
                    let row_values = pop_n(&mut stack, *rows)?;
                    stack.push(build_matrix(row_values)?);
                }
                Instr::Index(rank) => {
                    let indices = pop_n(&mut stack, *rank)?;
                    let target = pop(&mut stack)?;
                    stack.push(env.calculator().index(&target, &indices)?);
                }
                Instr::Solver(id) => {
                    let value = env.eval_solver(*id)?;
                    stack.push(value);
                }
            }
        }
        let result = pop(&mut stack)?;
        if !stack.is_empty() {
            return math_err!(StackLeak, "{} value(s) left on the stack", stack.len());
        }
        Ok(result)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::testenv::SimpleEnv;
    use crate::interpreter::{self, finish};
    use crate::lexer::testenv::StaticEnv;
    use crate::lexer::tokenize;
    use crate::rpn;
    use float_cmp::approx_eq;

    fn front_end(text: &str, env: &SimpleEnv) -> Vec<Token> {
        let mut lex_env = StaticEnv {
            vars: env.vars.keys().cloned().collect(),
            ..Default::default()
        };
        let out = tokenize(text, &mut lex_env).unwrap();
        rpn::build(out.tokens).unwrap()
    }

    fn re(v: &Value) -> f64 {
        v.as_scalar().unwrap().re
    }

    #[test]
    fn constant_expressions_fold_to_one_instruction() {
        let mut env = SimpleEnv::new();
        let rpn = front_end("2 + 3 * 4 - sin(0)", &env);
        let program = compile(&rpn, &mut env).unwrap();
        assert!(program.is_constant());
        assert_eq!(re(&program.run(&mut env).unwrap()), 14.0);
    }

    #[test]
    fn variables_block_folding() {
        let mut env = SimpleEnv::new();
        env.set("a", Value::real(2.0));
        let rpn = front_end("a + 3 * 4", &env);
        let program = compile(&rpn, &mut env).unwrap();
        assert!(!program.is_constant());
        // the constant part still folded: load, const, add
        assert_eq!(program.len(), 3);
        assert_eq!(re(&program.run(&mut env).unwrap()), 14.0);
    }

    #[test]
    fn reruns_see_new_variable_values() {
        let mut env = SimpleEnv::new();
        env.set("a", Value::real(2.0));
        let rpn = front_end("a ^ 2", &env);
        let program = compile(&rpn, &mut env).unwrap();
        assert_eq!(re(&program.run(&mut env).unwrap()), 4.0);
        env.vars
            .get("a")
            .unwrap()
            .borrow_mut()
            .assign(Value::real(5.0));
        assert_eq!(re(&program.run(&mut env).unwrap()), 25.0);
    }

    #[test]
    fn random_is_not_folded() {
        let mut env = SimpleEnv::new();
        let rpn = front_end("random(1) + 1", &env);
        let program = compile(&rpn, &mut env).unwrap();
        assert!(!program.is_constant());
        let a = re(&program.run(&mut env).unwrap());
        let b = re(&program.run(&mut env).unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn matrix_builders_are_not_folded() {
        let mut env = SimpleEnv::new();
        let rpn = front_end("identity(3)", &env);
        let program = compile(&rpn, &mut env).unwrap();
        assert!(!program.is_constant());
        // a literal, by contrast, folds
        let rpn = front_end("[1; 2; 3]", &env);
        let program = compile(&rpn, &mut env).unwrap();
        assert!(program.is_constant());
    }

    #[test]
    fn compile_matches_evaluate() {
        let mut env = SimpleEnv::new();
        env.set("x", Value::real(1.5));
        for text in [
            "2 + 3 * 4",
            "x ^ 2 - x + 1",
            "3m + 2cm | cm",
            "[1; 2; 3][2] * 10",
            "min(x; 2; 3) + max(1; 2)",
            "det([1; 2 | 3; 4])",
            "if(x > 1; 10; 20)",
        ] {
            let mut lex_env = StaticEnv::with_vars(&["x"]);
            let out = tokenize(text, &mut lex_env).unwrap();
            let rpn = rpn::build(out.tokens).unwrap();
            let direct = finish(
                interpreter::evaluate(&rpn, &mut env).unwrap(),
                out.target_unit.as_ref(),
            )
            .unwrap();
            let program = compile(&rpn, &mut env).unwrap();
            let compiled =
                finish(program.run(&mut env).unwrap(), out.target_unit.as_ref()).unwrap();
            assert!(
                approx_eq!(f64, re(&direct), re(&compiled)),
                "diverged on {text}: {direct} vs {compiled}"
            );
        }
    }
}
