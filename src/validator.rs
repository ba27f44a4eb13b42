// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Grammar checks over the lexed token list, before RPN conversion.
//! One forward pass: a token-category adjacency table, a context stack
//! for brackets/literals/subscripts with argument counting, and the
//! rule that `=` must be the first operator of the statement.

use smallvec::SmallVec;

use crate::calculator;
use crate::common::Result;
use crate::math_err;
use crate::token::{Token, TokenData, TokenKind};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Cat {
    Start,
    Operand,
    Operator,
    Negate,
    Postfix,
    Function,
    BracketLeft,
    BracketRight,
    SquareLeft,
    SquareRight,
    IndexOpen,
    Divisor,
}

fn category(t: &Token) -> Cat {
    match t.data {
        TokenData::Negate => Cat::Negate,
        TokenData::Factorial => Cat::Postfix,
        TokenData::Operator(_) => Cat::Operator,
        TokenData::BracketLeft => Cat::BracketLeft,
        TokenData::BracketRight => Cat::BracketRight,
        TokenData::SquareBracketLeft => Cat::SquareLeft,
        TokenData::SquareBracketRight => Cat::SquareRight,
        TokenData::Index { rank: 0 } => Cat::IndexOpen,
        TokenData::Divisor | TokenData::RowDivisor => Cat::Divisor,
        _ if t.is_function() => Cat::Function,
        _ => Cat::Operand,
    }
}

/// Can `next` legally follow `prev`?
fn adjacent(prev: Cat, next: Cat) -> bool {
    use Cat::*;
    match prev {
        Start | Operator | Divisor | SquareLeft | IndexOpen => matches!(
            next,
            Operand | Negate | Function | BracketLeft | SquareLeft
        ),
        Negate => matches!(next, Operand | Function | BracketLeft | SquareLeft),
        Operand | BracketRight | SquareRight | Postfix => matches!(
            next,
            Operator | Postfix | Divisor | BracketRight | SquareRight | IndexOpen
        ),
        Function => matches!(next, BracketLeft),
        BracketLeft => matches!(next, Operand | Negate | Function | BracketLeft | SquareLeft),
    }
}

fn can_end(cat: Cat) -> bool {
    matches!(
        cat,
        Cat::Operand | Cat::BracketRight | Cat::SquareRight | Cat::Postfix
    )
}

enum Context {
    Plain,
    Call { expected: Option<usize>, seen: usize },
    Literal,
    Index,
}

fn call_arity(data: &TokenData, custom_arity: &dyn Fn(usize) -> Option<usize>) -> Option<usize> {
    match data {
        TokenData::Function(_) => Some(1),
        TokenData::Function2(_) => Some(2),
        TokenData::Function3(_) => Some(3),
        TokenData::MultiFunction { .. } | TokenData::Interpolation { .. } => None,
        TokenData::VectorFunction { index, .. } => {
            calculator::expected_argc(calculator::Namespace::VectorFunction, *index)
        }
        TokenData::MatrixFunction { index, .. } => {
            calculator::expected_argc(calculator::Namespace::MatrixFunction, *index)
        }
        TokenData::CustomFunction { index, .. } => custom_arity(*index),
        _ => None,
    }
}

pub fn validate(tokens: &[Token], custom_arity: &dyn Fn(usize) -> Option<usize>) -> Result<()> {
    if tokens.is_empty() {
        return math_err!(EmptyExpression, "empty expression");
    }
    let mut prev = Cat::Start;
    let mut contexts: SmallVec<[Context; 16]> = SmallVec::new();
    let mut operator_count = 0usize;
    let mut pending_call: Option<Option<usize>> = None;

    for (i, token) in tokens.iter().enumerate() {
        let cat = category(token);
        if !adjacent(prev, cat) {
            return match (prev, cat) {
                (Cat::Operator | Cat::Negate | Cat::Start | Cat::Divisor, Cat::Operator) => {
                    math_err!(MissingOperand, "operator '{}' has no left operand", token.text)
                }
                (Cat::Operand | Cat::BracketRight | Cat::SquareRight, Cat::Operand) => {
                    math_err!(
                        MissingDelimiter,
                        "missing operator or delimiter before '{}'",
                        token.text
                    )
                }
                _ => math_err!(InvalidSyntax, "unexpected '{}'", token.text),
            };
        }
        match &token.data {
            TokenData::Operator(op) => {
                if *op == '=' {
                    if !contexts.is_empty() {
                        return math_err!(ImproperAssignment, "'=' inside a bracket");
                    }
                    if operator_count > 0 {
                        return math_err!(AssignmentNotFirst, "'=' must be the first operator");
                    }
                    if !assignable_prefix(&tokens[..i]) {
                        return math_err!(
                            ImproperAssignment,
                            "the left side of '=' must be a variable or an element"
                        );
                    }
                }
                operator_count += 1;
            }
            TokenData::Negate => {}
            TokenData::BracketLeft => {
                let ctx = match pending_call.take() {
                    Some(expected) => Context::Call { expected, seen: 1 },
                    None => Context::Plain,
                };
                contexts.push(ctx);
            }
            TokenData::BracketRight => match contexts.pop() {
                Some(Context::Call { expected, seen }) => {
                    if let Some(expected) = expected {
                        if seen != expected {
                            return math_err!(
                                ArgumentCount,
                                "expected {expected} argument(s), got {seen}"
                            );
                        }
                    }
                }
                Some(Context::Plain) => {}
                _ => return math_err!(MissingLeftBracket, "')' without a matching '('"),
            },
            TokenData::SquareBracketLeft => contexts.push(Context::Literal),
            TokenData::Index { rank: 0 } => contexts.push(Context::Index),
            TokenData::SquareBracketRight => {
                // the original peeks the call stack here even when only
                // a subscript context is open
                let _ = contexts.iter().rev().find(|c| matches!(c, Context::Call { .. }));
                match contexts.pop() {
                    Some(Context::Literal) | Some(Context::Index) => {}
                    _ => {
                        return math_err!(MissingSquareBracket, "']' without a matching '['")
                    }
                }
            }
            TokenData::Divisor | TokenData::RowDivisor => match contexts.last_mut() {
                Some(Context::Call { seen, .. }) => {
                    if matches!(token.data, TokenData::RowDivisor) {
                        return math_err!(UnexpectedDelimiter, "'|' inside a function call");
                    }
                    *seen += 1;
                }
                Some(Context::Literal) | Some(Context::Index) => {
                    if matches!(token.data, TokenData::RowDivisor)
                        && matches!(contexts.last(), Some(Context::Index))
                    {
                        return math_err!(UnexpectedDelimiter, "'|' inside a subscript");
                    }
                }
                _ => {
                    return math_err!(
                        UnexpectedDelimiter,
                        "'{}' outside a function call or literal",
                        token.text
                    )
                }
            },
            data if token.is_function() => {
                pending_call = Some(call_arity(data, custom_arity));
            }
            _ => {}
        }
        prev = cat;
    }
    if !can_end(prev) {
        return math_err!(
            IncompleteExpression,
            "the expression ends after '{}'",
            tokens.last().unwrap().text
        );
    }
    if !contexts.is_empty() {
        return match contexts.last().unwrap() {
            Context::Literal | Context::Index => {
                math_err!(MissingSquareBracket, "missing ']'")
            }
            _ => math_err!(MissingRightBracket, "missing ')'"),
        };
    }
    Ok(())
}

/// The tokens before `=` must name an assignable place: a bare
/// variable, or a variable with one complete subscript.
fn assignable_prefix(prefix: &[Token]) -> bool {
    match prefix {
        [v] => v.kind() == TokenKind::Variable,
        [v, open, .., close] => {
            v.kind() == TokenKind::Variable
                && matches!(open.data, TokenData::Index { rank: 0 })
                && matches!(close.data, TokenData::SquareBracketRight)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorCode;
    use crate::lexer::testenv::StaticEnv;
    use crate::lexer::tokenize;

    fn check(text: &str, env: &mut StaticEnv) -> Result<()> {
        let out = tokenize(text, env)?;
        validate(&out.tokens, &|_| Some(1))
    }

    #[test]
    fn accepts_well_formed_statements() {
        let mut env = StaticEnv::with_vars(&["a", "b", "v"]);
        for text in [
            "a + b * 2",
            "x = 2 ^ 3 - 1",
            "3m + 2cm",
            "-a * (-2)",
            "sin(1) + min(1; 2; 3)",
            "[1; 2 | 3; 4]",
            "v[2] + 1",
            "v[1] = 5",
            "5! + 2",
        ] {
            assert!(check(text, &mut env).is_ok(), "rejected: {text}");
        }
    }

    #[test]
    fn trailing_operator_is_incomplete() {
        let mut env = StaticEnv::default();
        let err = check("2 +", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::IncompleteExpression);
    }

    #[test]
    fn adjacent_operators_and_operands() {
        let mut env = StaticEnv::with_vars(&["a", "b"]);
        let err = check("a + * b", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingOperand);
        let err = check("a b", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingDelimiter);
        let err = check("2 (3)", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSyntax);
    }

    #[test]
    fn assignment_rules() {
        let mut env = StaticEnv::with_vars(&["a", "b"]);
        let err = check("a + b = 2", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::AssignmentNotFirst);
        let err = check("(a = 2)", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::ImproperAssignment);
        let err = check("2 = a", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::ImproperAssignment);
        let err = check("x = y = 2", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::AssignmentNotFirst);
    }

    #[test]
    fn argument_counts() {
        let mut env = StaticEnv::default();
        let err = check("sin(1; 2)", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::ArgumentCount);
        let err = check("atan2(1)", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::ArgumentCount);
        assert!(check("min(1)", &mut env).is_ok());
        assert!(check("range(1; 10; 2)", &mut env).is_ok());
        let err = check("range(1; 10)", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::ArgumentCount);
    }

    #[test]
    fn custom_function_arity_comes_from_the_session() {
        let mut env = StaticEnv::default();
        env.funcs.push("f".to_string());
        let out = tokenize("f(1; 2)", &mut env).unwrap();
        let err = validate(&out.tokens, &|_| Some(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ArgumentCount);
        assert!(validate(&out.tokens, &|_| Some(2)).is_ok());
    }

    #[test]
    fn bracket_mismatches() {
        let mut env = StaticEnv::default();
        let err = check("(1 + 2", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingRightBracket);
        let err = check("1 + 2)", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingLeftBracket);
        let err = check("[1; 2", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingSquareBracket);
    }

    #[test]
    fn misplaced_delimiters() {
        let mut env = StaticEnv::default();
        let err = check("(1; 2)", &mut env).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnexpectedDelimiter);
    }
}
