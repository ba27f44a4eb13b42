// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Tokens as they flow through the front end: the source text, an
//! operator precedence order, and a closed payload enum.  Tokens are
//! reclassified after lexing (an identifier becomes a unit once matched
//! against the unit table, a variable becomes a vector or matrix once
//! its bound shape is known), so payloads are mutated in place by the
//! RPN builder rather than rebuilt.

use crate::units::Unit;
use crate::value::Scalar;

/// Order value for anything that is not an operator.
pub const NOT_AN_OPERATOR: i8 = -1;

/// Unary negate binds tighter than every binary operator except `^`.
pub const NEGATE_ORDER: i8 = 1;

/// Implicit multiplication (constant-unit adjacency) binds one step
/// tighter than a written `*`.
pub const IMPLICIT_MUL_ORDER: i8 = 2;

pub const MUL_ORDER: i8 = 3;

/// Binary operator precedence: lower binds tighter.  `^` is the
/// tightest binary operator; `=` the loosest.
pub fn operator_order(op: char) -> i8 {
    match op {
        '^' => 0,
        '⦼' | '÷' | '/' | '\\' | '%' | '*' => MUL_ORDER,
        '-' => 4,
        '+' => 5,
        '<' | '>' | '≤' | '≥' | '≡' | '≠' => 6,
        '∧' => 7,
        '∨' | '⊕' => 8,
        '=' => 9,
        _ => NOT_AN_OPERATOR,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenData {
    Constant(Scalar),
    Unit(Unit),
    Variable,
    /// Interactive input field; carries the pre-resolved value when the
    /// host supplied one, and the field's per-line slot for reprompting.
    Input { value: Option<f64>, slot: usize },
    Operator(char),
    /// Unary negation, distinct from binary `-`.
    Negate,
    /// Postfix factorial.
    Factorial,
    Function(usize),
    Function2(usize),
    Function3(usize),
    MultiFunction { index: usize, argc: usize },
    Interpolation { index: usize, argc: usize },
    VectorFunction { index: usize, argc: usize },
    MatrixFunction { index: usize, argc: usize },
    CustomFunction { index: usize, argc: usize },
    BracketLeft,
    BracketRight,
    SquareBracketLeft,
    SquareBracketRight,
    /// `;` between function arguments or literal elements.
    Divisor,
    /// `|` between matrix literal rows.
    RowDivisor,
    /// Synthetic: collect the top `len` stack values into a vector.
    VectorLit { len: usize },
    /// Synthetic: collect `rows * cols` values into a matrix.
    MatrixLit { rows: usize, cols: usize },
    /// Synthetic: index into a vector (rank 1) or matrix (rank 2).
    Index { rank: usize },
    Solver { id: usize },
}

/// Coarse classification used by the grammar validator's adjacency
/// table and by the RPN builder's dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Constant,
    Unit,
    Variable,
    Input,
    Operator,
    Function,
    Function2,
    Function3,
    MultiFunction,
    Interpolation,
    VectorFunction,
    MatrixFunction,
    CustomFunction,
    BracketLeft,
    BracketRight,
    SquareBracketLeft,
    SquareBracketRight,
    Divisor,
    RowDivisor,
    Vector,
    Matrix,
    Index,
    Solver,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub text: String,
    pub order: i8,
    pub data: TokenData,
}

impl Token {
    pub fn new(text: impl Into<String>, data: TokenData) -> Self {
        Token {
            text: text.into(),
            order: NOT_AN_OPERATOR,
            data,
        }
    }

    pub fn operator(op: char) -> Self {
        Token {
            text: op.to_string(),
            order: operator_order(op),
            data: TokenData::Operator(op),
        }
    }

    pub fn constant(text: impl Into<String>, value: Scalar) -> Self {
        Token::new(text, TokenData::Constant(value))
    }

    pub fn negate() -> Self {
        Token {
            text: "-".to_string(),
            order: NEGATE_ORDER,
            data: TokenData::Negate,
        }
    }

    /// The synthetic `*` inserted between a constant and its adjacent
    /// unit literal; binds tighter than a written `*`.
    pub fn implicit_mul() -> Self {
        Token {
            text: "*".to_string(),
            order: IMPLICIT_MUL_ORDER,
            data: TokenData::Operator('*'),
        }
    }

    pub fn kind(&self) -> TokenKind {
        match self.data {
            TokenData::Constant(_) => TokenKind::Constant,
            TokenData::Unit(_) => TokenKind::Unit,
            TokenData::Variable => TokenKind::Variable,
            TokenData::Input { .. } => TokenKind::Input,
            TokenData::Operator(_) | TokenData::Negate | TokenData::Factorial => {
                TokenKind::Operator
            }
            TokenData::Function(_) => TokenKind::Function,
            TokenData::Function2(_) => TokenKind::Function2,
            TokenData::Function3(_) => TokenKind::Function3,
            TokenData::MultiFunction { .. } => TokenKind::MultiFunction,
            TokenData::Interpolation { .. } => TokenKind::Interpolation,
            TokenData::VectorFunction { .. } => TokenKind::VectorFunction,
            TokenData::MatrixFunction { .. } => TokenKind::MatrixFunction,
            TokenData::CustomFunction { .. } => TokenKind::CustomFunction,
            TokenData::BracketLeft => TokenKind::BracketLeft,
            TokenData::BracketRight => TokenKind::BracketRight,
            TokenData::SquareBracketLeft => TokenKind::SquareBracketLeft,
            TokenData::SquareBracketRight => TokenKind::SquareBracketRight,
            TokenData::Divisor => TokenKind::Divisor,
            TokenData::RowDivisor => TokenKind::RowDivisor,
            TokenData::VectorLit { .. } => TokenKind::Vector,
            TokenData::MatrixLit { .. } => TokenKind::Matrix,
            TokenData::Index { .. } => TokenKind::Index,
            TokenData::Solver { .. } => TokenKind::Solver,
        }
    }

    /// Operands: everything that pushes a value by itself.
    pub fn is_operand(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Constant
                | TokenKind::Unit
                | TokenKind::Variable
                | TokenKind::Input
                | TokenKind::Vector
                | TokenKind::Matrix
                | TokenKind::Solver
        )
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Function
                | TokenKind::Function2
                | TokenKind::Function3
                | TokenKind::MultiFunction
                | TokenKind::Interpolation
                | TokenKind::VectorFunction
                | TokenKind::MatrixFunction
                | TokenKind::CustomFunction
        )
    }
}
