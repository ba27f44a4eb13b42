// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;
use std::{error, result};

/// Failure class, mirroring the phases of a statement's life: the front
/// end (lexing, grammar), evaluation, and resource limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Lexical,
    Grammar,
    Evaluation,
    Resource,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError, // will never be produced
    InvalidSymbol,
    InvalidNumber,
    InvalidUnits,
    InvalidFunction,
    InvalidMacro,
    InvalidSolver,
    UnterminatedSolver,
    UnterminatedInput,
    EmptyExpression,
    MissingLeftBracket,
    MissingRightBracket,
    MissingSquareBracket,
    MissingOperand,
    MissingDelimiter,
    IncompleteExpression,
    InvalidSyntax,
    ImproperAssignment,
    AssignmentNotFirst,
    RecursionNotAllowed,
    ArgumentCount,
    UnexpectedDelimiter,
    TooDeeplyNested,
    UndefinedVariable,
    UndefinedInput,
    IndexOutOfRange,
    InconsistentUnits,
    DimensionMismatch,
    DivisionByZero,
    SingularMatrix,
    NonRealResult,
    ConstantExpected,
    NoSolution,
    StackEmpty,
    StackLeak,
    CannotEvaluate,
    Interrupted,
    IterationLimit,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            InvalidSymbol => "invalid_symbol",
            InvalidNumber => "invalid_number",
            InvalidUnits => "invalid_units",
            InvalidFunction => "invalid_function",
            InvalidMacro => "invalid_macro",
            InvalidSolver => "invalid_solver",
            UnterminatedSolver => "unterminated_solver",
            UnterminatedInput => "unterminated_input",
            EmptyExpression => "empty_expression",
            MissingLeftBracket => "missing_left_bracket",
            MissingRightBracket => "missing_right_bracket",
            MissingSquareBracket => "missing_square_bracket",
            MissingOperand => "missing_operand",
            MissingDelimiter => "missing_delimiter",
            IncompleteExpression => "incomplete_expression",
            InvalidSyntax => "invalid_syntax",
            ImproperAssignment => "improper_assignment",
            AssignmentNotFirst => "assignment_not_first",
            RecursionNotAllowed => "recursion_not_allowed",
            ArgumentCount => "argument_count",
            UnexpectedDelimiter => "unexpected_delimiter",
            TooDeeplyNested => "too_deeply_nested",
            UndefinedVariable => "undefined_variable",
            UndefinedInput => "undefined_input",
            IndexOutOfRange => "index_out_of_range",
            InconsistentUnits => "inconsistent_units",
            DimensionMismatch => "dimension_mismatch",
            DivisionByZero => "division_by_zero",
            SingularMatrix => "singular_matrix",
            NonRealResult => "non_real_result",
            ConstantExpected => "constant_expected",
            NoSolution => "no_solution",
            StackEmpty => "stack_empty",
            StackLeak => "stack_leak",
            CannotEvaluate => "cannot_evaluate",
            Interrupted => "interrupted",
            IterationLimit => "iteration_limit",
        };

        write!(f, "{name}")
    }
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            InvalidSymbol | InvalidNumber | InvalidUnits | InvalidMacro | InvalidSolver
            | UnterminatedSolver | UnterminatedInput | MissingSquareBracket => ErrorKind::Lexical,
            EmptyExpression | MissingLeftBracket | MissingRightBracket | MissingOperand
            | MissingDelimiter | IncompleteExpression | InvalidSyntax | ImproperAssignment
            | AssignmentNotFirst | RecursionNotAllowed | ArgumentCount | UnexpectedDelimiter
            | TooDeeplyNested | InvalidFunction => ErrorKind::Grammar,
            IterationLimit => ErrorKind::Resource,
            _ => ErrorKind::Evaluation,
        }
    }
}

/// The one exception type of the engine.  Every failure carries a code
/// (stable, machine-matchable) and a human-readable message; a failing
/// statement aborts with no partial result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MathError {
    pub code: ErrorCode,
    pub details: Option<String>,
}

impl MathError {
    pub fn new(code: ErrorCode, details: Option<String>) -> Self {
        MathError { code, details }
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl fmt::Display for MathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.details {
            Some(ref details) => write!(f, "{}: {}", self.code, details),
            None => write!(f, "{}", self.code),
        }
    }
}

impl error::Error for MathError {}

pub type Result<T> = result::Result<T, MathError>;

#[macro_export]
macro_rules! math_err {
    ($code:tt) => {{
        use $crate::common::{ErrorCode, MathError};
        Err(MathError::new(ErrorCode::$code, None))
    }};
    ($code:tt, $($arg:tt)*) => {{
        use $crate::common::{ErrorCode, MathError};
        Err(MathError::new(ErrorCode::$code, Some(format!($($arg)*))))
    }};
}

#[macro_export]
macro_rules! math_error {
    ($code:tt) => {{
        use $crate::common::{ErrorCode, MathError};
        MathError::new(ErrorCode::$code, None)
    }};
    ($code:tt, $($arg:tt)*) => {{
        use $crate::common::{ErrorCode, MathError};
        MathError::new(ErrorCode::$code, Some(format!($($arg)*)))
    }};
}
