// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Infix to RPN.  A shunting-yard pass over the token list with three
//! kinds of open contexts on the side stack: plain/function brackets,
//! vector-matrix literals (element and row counters), and subscript
//! contexts.  Literal closes emit synthetic count-carrying tokens;
//! function closes write the argument count back into the call token.
//! `^` and unary negation associate to the right, everything else to
//! the left.

use smallvec::SmallVec;

use crate::common::Result;
use crate::math_err;
use crate::token::{Token, TokenData};

/// Soft cap on open contexts; worksheets never nest this deep.
const MAX_DEPTH: usize = 100;

enum StackItem {
    Op(Token),
    Bracket {
        func: Option<Token>,
        argc: usize,
    },
    VectorOpen {
        elems: usize,
        rows: usize,
        max_cols: usize,
    },
    IndexOpen {
        count: usize,
    },
}

fn right_associative(t: &Token) -> bool {
    matches!(t.data, TokenData::Negate | TokenData::Operator('^'))
}

fn is_open(item: &StackItem) -> bool {
    matches!(
        item,
        StackItem::Bracket { .. } | StackItem::VectorOpen { .. } | StackItem::IndexOpen { .. }
    )
}

/// Convert a lexed token list into RPN.
pub fn build(tokens: Vec<Token>) -> Result<Vec<Token>> {
    let mut output: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut stack: SmallVec<[StackItem; 16]> = SmallVec::new();
    let mut pending_func: Option<Token> = None;

    for token in tokens {
        if stack.len() > MAX_DEPTH {
            return math_err!(TooDeeplyNested, "expression is too deeply nested");
        }
        if let Some(func) = pending_func.take() {
            // a function name must be followed by its bracket
            if !matches!(token.data, TokenData::BracketLeft) {
                return math_err!(MissingLeftBracket, "missing '(' after '{}'", func.text);
            }
            stack.push(StackItem::Bracket {
                func: Some(func),
                argc: 1,
            });
            continue;
        }
        if token.is_function() {
            pending_func = Some(token);
            continue;
        }
        match token.data {
            TokenData::Constant(_)
            | TokenData::Unit(_)
            | TokenData::Variable
            | TokenData::Input { .. }
            | TokenData::Solver { .. } => output.push(token),
            TokenData::Factorial => output.push(token),
            TokenData::Operator(_) | TokenData::Negate => {
                while let Some(StackItem::Op(top)) = stack.last() {
                    let pop = if right_associative(&token) {
                        top.order < token.order
                    } else {
                        top.order <= token.order
                    };
                    if !pop {
                        break;
                    }
                    let Some(StackItem::Op(top)) = stack.pop() else {
                        unreachable!()
                    };
                    output.push(top);
                }
                stack.push(StackItem::Op(token));
            }
            TokenData::BracketLeft => stack.push(StackItem::Bracket {
                func: None,
                argc: 1,
            }),
            TokenData::BracketRight => {
                pop_until_open(&mut stack, &mut output)?;
                match stack.pop() {
                    Some(StackItem::Bracket { func, argc }) => {
                        if let Some(mut func) = func {
                            set_argc(&mut func, argc);
                            output.push(func);
                        }
                    }
                    _ => return math_err!(MissingLeftBracket, "')' without a matching '('"),
                }
            }
            TokenData::SquareBracketLeft => stack.push(StackItem::VectorOpen {
                elems: 1,
                rows: 0,
                max_cols: 0,
            }),
            TokenData::Index { rank: 0 } => stack.push(StackItem::IndexOpen { count: 1 }),
            TokenData::Index { .. } => {
                return math_err!(InvalidSyntax, "unexpected subscript token")
            }
            TokenData::SquareBracketRight => {
                pop_until_open(&mut stack, &mut output)?;
                match stack.pop() {
                    Some(StackItem::VectorOpen {
                        elems,
                        rows,
                        max_cols,
                    }) => {
                        output.push(Token::new("[]", TokenData::VectorLit { len: elems }));
                        if rows > 0 {
                            output.push(Token::new(
                                "[]",
                                TokenData::MatrixLit {
                                    rows: rows + 1,
                                    cols: max_cols.max(elems),
                                },
                            ));
                        }
                    }
                    Some(StackItem::IndexOpen { count }) => {
                        output.push(Token::new("[]", TokenData::Index { rank: count }));
                    }
                    _ => return math_err!(MissingSquareBracket, "']' without a matching '['"),
                }
            }
            TokenData::Divisor => {
                pop_until_open(&mut stack, &mut output)?;
                match stack.last_mut() {
                    Some(StackItem::Bracket {
                        func: Some(_),
                        argc,
                    }) => *argc += 1,
                    Some(StackItem::VectorOpen { elems, .. }) => *elems += 1,
                    Some(StackItem::IndexOpen { count }) => *count += 1,
                    _ => {
                        return math_err!(
                            UnexpectedDelimiter,
                            "';' outside a function call or literal"
                        )
                    }
                }
            }
            TokenData::RowDivisor => {
                pop_until_open(&mut stack, &mut output)?;
                match stack.last_mut() {
                    Some(StackItem::VectorOpen {
                        elems,
                        rows,
                        max_cols,
                    }) => {
                        output.push(Token::new("[]", TokenData::VectorLit { len: *elems }));
                        *max_cols = (*max_cols).max(*elems);
                        *elems = 1;
                        *rows += 1;
                    }
                    _ => {
                        return math_err!(UnexpectedDelimiter, "'|' outside a matrix literal")
                    }
                }
            }
            TokenData::VectorLit { .. } | TokenData::MatrixLit { .. } => {
                return math_err!(InvalidSyntax, "unexpected literal token")
            }
            _ => unreachable!("functions handled above"),
        }
    }
    if let Some(func) = pending_func {
        return math_err!(MissingLeftBracket, "missing '(' after '{}'", func.text);
    }
    while let Some(item) = stack.pop() {
        match item {
            StackItem::Op(t) => output.push(t),
            StackItem::Bracket { .. } => {
                return math_err!(MissingRightBracket, "missing ')'")
            }
            StackItem::VectorOpen { .. } | StackItem::IndexOpen { .. } => {
                return math_err!(MissingSquareBracket, "missing ']'")
            }
        }
    }
    Ok(output)
}

fn pop_until_open(stack: &mut SmallVec<[StackItem; 16]>, output: &mut Vec<Token>) -> Result<()> {
    while let Some(top) = stack.last() {
        if is_open(top) {
            return Ok(());
        }
        let Some(StackItem::Op(t)) = stack.pop() else {
            unreachable!()
        };
        output.push(t);
    }
    Ok(())
}

fn set_argc(token: &mut Token, n: usize) {
    match &mut token.data {
        TokenData::MultiFunction { argc, .. }
        | TokenData::Interpolation { argc, .. }
        | TokenData::VectorFunction { argc, .. }
        | TokenData::MatrixFunction { argc, .. }
        | TokenData::CustomFunction { argc, .. } => *argc = n,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::testenv::StaticEnv;
    use crate::lexer::tokenize;

    fn rpn_texts(text: &str, env: &mut StaticEnv) -> Vec<String> {
        let out = tokenize(text, env).unwrap();
        build(out.tokens)
            .unwrap()
            .into_iter()
            .map(|t| t.text)
            .collect()
    }

    #[test]
    fn precedence_and_associativity() {
        let mut env = StaticEnv::default();
        assert_eq!(rpn_texts("1 + 2 * 3", &mut env), ["1", "2", "3", "*", "+"]);
        // right-associative power
        assert_eq!(rpn_texts("2 ^ 3 ^ 2", &mut env), ["2", "3", "2", "^", "^"]);
        // negation looser than power
        assert_eq!(rpn_texts("-2 ^ 2", &mut env), ["2", "2", "^", "-"]);
        // left-associative subtraction
        assert_eq!(rpn_texts("5 - 2 - 1", &mut env), ["5", "2", "-", "1", "-"]);
    }

    #[test]
    fn implicit_mul_binds_tighter_than_division() {
        let mut env = StaticEnv::with_vars(&["a"]);
        // 3m/2 must compute (3*m)/2, not 3*(m/2): the synthetic *
        // pops before '/'
        assert_eq!(
            rpn_texts("3m / 2", &mut env),
            ["3", "m", "*", "2", "/"]
        );
        assert_eq!(
            rpn_texts("a/3m", &mut env),
            ["a", "3", "m", "*", "/"]
        );
    }

    #[test]
    fn function_argc_is_written_back() {
        let mut env = StaticEnv::default();
        let out = tokenize("min(3; 1; 2)", &mut env).unwrap();
        let rpn = build(out.tokens).unwrap();
        let call = rpn.last().unwrap();
        assert!(matches!(
            call.data,
            TokenData::MultiFunction { argc: 3, .. }
        ));
    }

    #[test]
    fn vector_and_matrix_literals() {
        let mut env = StaticEnv::default();
        let out = tokenize("[1; 2; 3]", &mut env).unwrap();
        let rpn = build(out.tokens).unwrap();
        assert!(matches!(
            rpn.last().unwrap().data,
            TokenData::VectorLit { len: 3 }
        ));

        let out = tokenize("[1; 2 | 3; 4 | 5; 6]", &mut env).unwrap();
        let rpn = build(out.tokens).unwrap();
        assert!(matches!(
            rpn.last().unwrap().data,
            TokenData::MatrixLit { rows: 3, cols: 2 }
        ));
        let vector_rows = rpn
            .iter()
            .filter(|t| matches!(t.data, TokenData::VectorLit { .. }))
            .count();
        assert_eq!(vector_rows, 3);
    }

    #[test]
    fn subscripts_emit_index_tokens() {
        let mut env = StaticEnv::with_vars(&["v", "M"]);
        let out = tokenize("v[2]", &mut env).unwrap();
        let rpn = build(out.tokens).unwrap();
        assert!(matches!(
            rpn.last().unwrap().data,
            TokenData::Index { rank: 1 }
        ));

        let out = tokenize("M[1; 2]", &mut env).unwrap();
        let rpn = build(out.tokens).unwrap();
        assert!(matches!(
            rpn.last().unwrap().data,
            TokenData::Index { rank: 2 }
        ));

        // literal followed by a subscript
        let out = tokenize("[1; 2; 3][2]", &mut env).unwrap();
        let rpn = build(out.tokens).unwrap();
        assert!(matches!(
            rpn.last().unwrap().data,
            TokenData::Index { rank: 1 }
        ));
    }

    #[test]
    fn bracket_mismatches() {
        let mut env = StaticEnv::default();
        let out = tokenize("(1 + 2", &mut env).unwrap();
        let err = build(out.tokens).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::MissingRightBracket);

        let out = tokenize("1 + 2)", &mut env).unwrap();
        let err = build(out.tokens).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::MissingLeftBracket);

        let out = tokenize("[1; 2", &mut env).unwrap();
        let err = build(out.tokens).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::MissingSquareBracket);
    }

    #[test]
    fn assignment_is_loosest() {
        let mut env = StaticEnv::default();
        assert_eq!(
            rpn_texts("x = 1 + 2", &mut env),
            ["x", "1", "2", "+", "="]
        );
    }
}
