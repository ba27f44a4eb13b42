// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The tokenizer.  A single pass over one statement, context-sensitive
//! in three places: an identifier is a unit or a variable depending on
//! the live session tables, `name(` resolves through the function
//! namespaces, and `$keyword{...}` spans are handed back to the session
//! to be parsed as solver blocks.  Numbers adjacent to unit literals
//! get a synthetic tighter `*`, and a unit right after a division
//! operator is wrapped in synthetic brackets so the whole divisor
//! groups together.

use unicode_xid::UnicodeXID;

use crate::calculator;
use crate::common::Result;
use crate::math_err;
use crate::token::{Token, TokenData};
use crate::units::Unit;
use crate::value::Scalar;

/// What the tokenizer needs from the session: live name tables and a
/// hook that parses a solver span into a registered block.
pub trait LexEnv {
    fn is_variable(&self, name: &str) -> bool;
    fn custom_function(&self, name: &str) -> Option<usize>;
    fn allocate_solver(&mut self, keyword: &str, script: &str) -> Result<usize>;
    fn input_value(&self, slot: usize) -> Option<f64>;
}

#[derive(Debug)]
pub struct LexOutput {
    pub tokens: Vec<Token>,
    pub target_unit: Option<Unit>,
}

pub(crate) fn is_letter(c: char) -> bool {
    c.is_ascii_alphabetic()
        || ('Α'..='Ω').contains(&c)
        || ('α'..='ω').contains(&c)
        || matches!(c, 'ϕ' | 'ϑ' | '℧' | '°' | 'ø' | 'Ø' | '∡' | 'µ' | 'μ')
        || (!c.is_ascii() && UnicodeXID::is_xid_start(c))
}

pub(crate) fn is_id_continue(c: char) -> bool {
    is_letter(c) || c.is_ascii_digit() || matches!(c, '_' | '′' | '″')
}

fn is_operator_char(c: char) -> bool {
    matches!(
        c,
        '=' | '+'
            | '-'
            | '*'
            | '/'
            | '÷'
            | '\\'
            | '⦼'
            | '^'
            | '<'
            | '>'
            | '≤'
            | '≥'
            | '≡'
            | '≠'
            | '∧'
            | '∨'
            | '⊕'
    )
}

fn strip_comment(text: &str) -> &str {
    match text.find('\'') {
        Some(i) => &text[..i],
        None => text,
    }
}

/// Split a trailing `|units` target off the expression.  Only a `|` at
/// bracket depth zero counts; a suffix containing a stray `]` is
/// dropped without complaint.
fn split_target_unit(text: &str) -> Result<(&str, Option<Unit>)> {
    let mut depth = 0i32;
    let mut split = None;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            '|' if depth == 0 => split = Some(i),
            _ => {}
        }
    }
    let Some(i) = split else {
        return Ok((text, None));
    };
    let expr = &text[..i];
    let suffix = text[i + 1..].trim();
    if suffix.contains(']') {
        return Ok((expr, None));
    }
    if suffix.is_empty() {
        return math_err!(InvalidUnits, "missing target units after '|'");
    }
    Ok((expr, Some(Unit::parse(suffix)?)))
}

/// True when a `-` in this left context is unary negation.
fn negate_position(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(t) => matches!(
            t.data,
            TokenData::Operator(_)
                | TokenData::Negate
                | TokenData::BracketLeft
                | TokenData::SquareBracketLeft
                | TokenData::Divisor
                | TokenData::RowDivisor
        ) || matches!(t.data, TokenData::Index { rank: 0 }),
    }
}

fn value_position(prev: Option<&Token>) -> bool {
    match prev {
        None => false,
        Some(t) => {
            t.is_operand()
                || matches!(
                    t.data,
                    TokenData::BracketRight
                        | TokenData::SquareBracketRight
                        | TokenData::Factorial
                )
        }
    }
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    tokens: Vec<Token>,
    input_slots: usize,
    /// Set to the position of a constant that directly follows a
    /// division operator; if its unit literal comes next, the pair is
    /// bracketed.
    div_constant_at: Option<usize>,
}

pub fn tokenize(text: &str, env: &mut dyn LexEnv) -> Result<LexOutput> {
    let text = strip_comment(text);
    let (expr, target_unit) = split_target_unit(text)?;
    if expr.trim().is_empty() {
        return math_err!(EmptyExpression, "empty expression");
    }
    let mut lx = Lexer {
        text: expr,
        pos: 0,
        tokens: Vec::new(),
        input_slots: 0,
        div_constant_at: None,
    };
    lx.run(env)?;
    Ok(LexOutput {
        tokens: lx.tokens,
        target_unit,
    })
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn peek_after_space(&self) -> Option<char> {
        self.rest().chars().find(|c| !c.is_whitespace())
    }

    fn prev(&self) -> Option<&Token> {
        self.tokens.last()
    }

    fn run(&mut self, env: &mut dyn LexEnv) -> Result<()> {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            if c.is_ascii_digit() || c == '.' {
                self.lex_number()?;
                continue;
            }
            if c == '%' || c == '‰' {
                self.bump();
                self.push_unit_literal(&c.to_string())?;
                continue;
            }
            if is_letter(c) {
                self.lex_identifier(env)?;
                continue;
            }
            match c {
                '-' if negate_position(self.prev()) => {
                    self.bump();
                    self.push(Token::negate());
                }
                '!' => {
                    self.bump();
                    if !value_position(self.prev()) {
                        return math_err!(MissingOperand, "'!' needs a value to its left");
                    }
                    self.push(Token {
                        text: "!".to_string(),
                        order: crate::token::NOT_AN_OPERATOR,
                        data: TokenData::Factorial,
                    });
                }
                _ if is_operator_char(c) => {
                    self.bump();
                    self.push(Token::operator(c));
                }
                '(' => {
                    self.bump();
                    self.push(Token::new("(", TokenData::BracketLeft));
                }
                ')' => {
                    self.bump();
                    self.push(Token::new(")", TokenData::BracketRight));
                }
                '[' => {
                    self.bump();
                    if value_position(self.prev()) {
                        // subscript context, closed by the matching ']'
                        self.push(Token::new("[", TokenData::Index { rank: 0 }));
                    } else {
                        self.push(Token::new("[", TokenData::SquareBracketLeft));
                    }
                }
                ']' => {
                    self.bump();
                    self.push(Token::new("]", TokenData::SquareBracketRight));
                }
                ';' => {
                    self.bump();
                    self.push(Token::new(";", TokenData::Divisor));
                }
                '|' => {
                    self.bump();
                    self.push(Token::new("|", TokenData::RowDivisor));
                }
                '?' => self.lex_input(env)?,
                '$' => self.lex_solver(env)?,
                '{' | '}' => {
                    return math_err!(InvalidSymbol, "'{c}' is only valid inside a solver block")
                }
                _ => return math_err!(InvalidSymbol, "invalid symbol '{c}'"),
            }
        }
        if self.tokens.is_empty() {
            return math_err!(EmptyExpression, "empty expression");
        }
        Ok(())
    }

    fn push(&mut self, token: Token) {
        // anything between a division-trailing constant and its unit
        // cancels the bracketing
        if !matches!(token.data, TokenData::Unit(_)) {
            self.div_constant_at = None;
        }
        self.tokens.push(token);
    }

    fn lex_number(&mut self) -> Result<()> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' {
                if seen_dot {
                    return math_err!(
                        InvalidNumber,
                        "invalid number: '{}.'",
                        &self.text[start..self.pos]
                    );
                }
                seen_dot = true;
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.text[start..self.pos];
        let value: f64 = literal
            .parse()
            .map_err(|_| crate::math_error!(InvalidNumber, "invalid number: '{literal}'"))?;
        let after_division = matches!(
            self.prev().map(|t| &t.data),
            Some(TokenData::Operator('/' | '÷' | '\\' | '⦼'))
        );
        self.push(Token::constant(literal, Scalar::real(value)));
        if after_division {
            self.div_constant_at = Some(self.tokens.len() - 1);
        }
        Ok(())
    }

    /// Emit a unit token, with the implicit `*` after a constant and
    /// the synthetic brackets that keep `a/3m` grouped as `a/(3*m)`.
    fn push_unit_literal(&mut self, name: &str) -> Result<()> {
        let unit = Unit::find(name)
            .ok_or_else(|| crate::math_error!(InvalidUnits, "undefined units '{name}'"))?;
        let wrap = self.div_constant_at.take();
        let adjacent = matches!(
            self.prev().map(|t| &t.data),
            Some(TokenData::Constant(_) | TokenData::Unit(_))
        );
        if adjacent {
            self.tokens.push(Token::implicit_mul());
        }
        self.tokens.push(Token::new(name, TokenData::Unit(unit)));
        if let Some(at) = wrap {
            if adjacent {
                self.tokens.insert(at, Token::new("(", TokenData::BracketLeft));
                self.tokens.push(Token::new(")", TokenData::BracketRight));
            }
        }
        Ok(())
    }

    fn lex_identifier(&mut self, env: &mut dyn LexEnv) -> Result<()> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_id_continue(c) {
                self.bump();
            } else {
                break;
            }
        }
        let name = &self.text[start..self.pos];
        if self.peek_after_space() == Some('(') {
            let token = if let Some((ns, index)) = calculator::resolve(name) {
                use crate::calculator::Namespace;
                match ns {
                    Namespace::Function => Token::new(name, TokenData::Function(index)),
                    Namespace::Function2 => Token::new(name, TokenData::Function2(index)),
                    Namespace::Function3 => Token::new(name, TokenData::Function3(index)),
                    Namespace::MultiFunction => {
                        Token::new(name, TokenData::MultiFunction { index, argc: 0 })
                    }
                    Namespace::Interpolation => {
                        Token::new(name, TokenData::Interpolation { index, argc: 0 })
                    }
                    Namespace::VectorFunction => {
                        Token::new(name, TokenData::VectorFunction { index, argc: 0 })
                    }
                    Namespace::MatrixFunction => {
                        Token::new(name, TokenData::MatrixFunction { index, argc: 0 })
                    }
                }
            } else if let Some(index) = env.custom_function(name) {
                Token::new(name, TokenData::CustomFunction { index, argc: 0 })
            } else {
                return math_err!(InvalidFunction, "undefined function: '{name}'");
            };
            self.push(token);
            return Ok(());
        }
        if env.is_variable(name) {
            self.push(Token::new(name, TokenData::Variable));
        } else if name == "π" || name == "pi" {
            self.push(Token::constant(name, Scalar::real(std::f64::consts::PI)));
        } else if Unit::exists(name) {
            self.push_unit_literal(name)?;
        } else {
            self.push(Token::new(name, TokenData::Variable));
        }
        Ok(())
    }

    fn lex_input(&mut self, env: &mut dyn LexEnv) -> Result<()> {
        self.bump(); // '?'
        let slot = self.input_slots;
        self.input_slots += 1;
        let mut value = None;
        if self.peek() == Some('{') {
            self.bump();
            let start = self.pos;
            loop {
                match self.peek() {
                    Some('}') => break,
                    Some(_) => {
                        self.bump();
                    }
                    None => {
                        return math_err!(UnterminatedInput, "missing '}}' after '?{{'");
                    }
                }
            }
            let literal = self.text[start..self.pos].trim();
            self.bump(); // '}'
            let parsed: f64 = literal.parse().map_err(|_| {
                crate::math_error!(InvalidNumber, "invalid input value: '{literal}'")
            })?;
            value = Some(parsed);
        } else if let Some(v) = env.input_value(slot) {
            value = Some(v);
        }
        self.push(Token::new("?", TokenData::Input { value, slot }));
        Ok(())
    }

    fn lex_solver(&mut self, env: &mut dyn LexEnv) -> Result<()> {
        self.bump(); // '$'
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                self.bump();
            } else {
                break;
            }
        }
        let keyword = self.text[start..self.pos].to_lowercase();
        if keyword.is_empty() || self.peek() != Some('{') {
            return math_err!(InvalidSolver, "expected '$keyword{{...}}'");
        }
        self.bump(); // '{'
        let body_start = self.pos;
        let mut depth = 1;
        loop {
            match self.bump() {
                Some('{') => depth += 1,
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    return math_err!(UnterminatedSolver, "missing '}}' after '${keyword}{{'");
                }
            }
        }
        let body = &self.text[body_start..self.pos - 1];
        let id = env.allocate_solver(&keyword, body)?;
        let text = format!("${keyword}");
        self.push(Token::new(text, TokenData::Solver { id }));
        Ok(())
    }
}
