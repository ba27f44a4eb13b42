// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

#![forbid(unsafe_code)]

pub mod common;

mod bytecode;
mod calculator;
mod functions;
mod interpreter;
mod lexer;
mod parser;
mod rpn;
mod solve_block;
mod solver;
mod token;
mod units;
mod validator;
mod value;
mod variable;

pub use self::calculator::AngleMode;
pub use self::common::{ErrorCode, ErrorKind, MathError, Result};
pub use self::parser::{MathParser, Parsed, Settings};
pub use self::units::Unit;
pub use self::value::{Matrix, Scalar, Value};
