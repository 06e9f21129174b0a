use std::collections::HashMap;

use super::ast::{Expr, Function, Prototype};
use super::error::{syntax_error, Error};
use super::token::{Token, TokenSource};
use log::warn;

/// Top-level expressions are wrapped in functions named with this prefix.
/// Identifiers cannot start with `_`, so user code can never collide with it.
pub(crate) const ANON_FN_PREFIX: &str = "__anon_expr";

/// Binary operator precedences. Higher binds tighter.
#[derive(Debug, Clone)]
pub(crate) struct OperatorTable {
    precedence: HashMap<char, i32>,
}

impl OperatorTable {
    pub(crate) fn empty() -> Self {
        OperatorTable {
            precedence: HashMap::new(),
        }
    }

    /// Registers `op` as a binary operator. Precedences must be positive.
    pub(crate) fn insert(&mut self, op: char, precedence: i32) {
        if precedence <= 0 {
            warn!(
                "ignoring operator '{}' with non-positive precedence {}",
                op, precedence
            );
            return;
        }
        self.precedence.insert(op, precedence);
    }

    pub(crate) fn get(&self, op: char) -> Option<i32> {
        self.precedence.get(&op).copied()
    }
}

impl Default for OperatorTable {
    fn default() -> Self {
        let mut table = OperatorTable::empty();
        table.insert('<', 10);
        table.insert('+', 20);
        table.insert('-', 20);
        table.insert('*', 40);
        table
    }
}

pub(crate) struct Parser<S> {
    source: S,
    current: Token,
    operators: OperatorTable,
    anon_count: usize,
}

impl<S: TokenSource> Parser<S> {
    pub(crate) fn new(source: S) -> Self {
        Self::with_operators(source, OperatorTable::default())
    }

    pub(crate) fn with_operators(mut source: S, operators: OperatorTable) -> Self {
        let current = source.next_token();
        Parser {
            source,
            current,
            operators,
            anon_count: 0,
        }
    }

    pub(crate) fn current(&self) -> &Token {
        &self.current
    }

    pub(crate) fn advance(&mut self) -> &Token {
        self.current = self.source.next_token();
        &self.current
    }

    /// -1 when the current token is not a known binary operator.
    fn token_precedence(&self) -> i32 {
        match self.current {
            Token::Kwd(c) => self.operators.get(c).unwrap_or(-1),
            _ => -1,
        }
    }

    fn expect_kwd(&mut self, c: char, context: &str) -> Result<(), Error> {
        if self.current != Token::Kwd(c) {
            return syntax_error(format!(
                "expected '{}' {}, found {}",
                c, context, self.current
            ));
        }
        self.advance();
        Ok(())
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, Error> {
        let name = match &self.current {
            Token::Ident(name) => name.clone(),
            other => {
                return syntax_error(format!("expected {}, found {}", context, other));
            }
        };
        self.advance();
        Ok(name)
    }

    fn parse_number_expr(&mut self, n: f64) -> Result<Expr, Error> {
        self.advance();
        Ok(Expr::Number(n))
    }

    fn parse_paren_expr(&mut self) -> Result<Expr, Error> {
        self.advance();
        let expr = self.parse_expression()?;
        self.expect_kwd(')', "to close parenthesized expression")?;
        Ok(expr)
    }

    /// identifier | identifier '(' [expr (',' expr)*] ')'
    fn parse_identifier_expr(&mut self) -> Result<Expr, Error> {
        let name = self.expect_ident("identifier")?;
        if self.current != Token::Kwd('(') {
            return Ok(Expr::Variable(name));
        }
        self.advance();

        let mut args = Vec::new();
        if self.current != Token::Kwd(')') {
            loop {
                args.push(self.parse_expression()?);
                if self.current == Token::Kwd(')') {
                    break;
                }
                self.expect_kwd(',', "or ')' in argument list")?;
            }
        }
        self.advance();

        Ok(Expr::Call(name, args))
    }

    pub(crate) fn parse_primary(&mut self) -> Result<Expr, Error> {
        match self.current {
            Token::Ident(_) => self.parse_identifier_expr(),
            Token::Number(n) => self.parse_number_expr(n),
            Token::Kwd('(') => self.parse_paren_expr(),
            Token::If => self.parse_if_expr(),
            Token::For => self.parse_for_expr(),
            _ => syntax_error(format!(
                "unexpected token {} when expecting an expression",
                self.current
            )),
        }
    }

    /// Folds `(op primary)*` onto `lhs` for every operator binding tighter
    /// than `min_prec`.
    fn parse_bin_op_rhs(&mut self, min_prec: i32, mut lhs: Expr) -> Result<Expr, Error> {
        loop {
            let tok_prec = self.token_precedence();
            if tok_prec <= min_prec {
                return Ok(lhs);
            }

            let op = match self.current {
                Token::Kwd(c) => c,
                _ => return Ok(lhs),
            };
            self.advance();

            let mut rhs = self.parse_primary()?;

            if tok_prec < self.token_precedence() {
                rhs = self.parse_bin_op_rhs(tok_prec, rhs)?;
            }

            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    pub(crate) fn parse_expression(&mut self) -> Result<Expr, Error> {
        let lhs = self.parse_primary()?;
        self.parse_bin_op_rhs(0, lhs)
    }

    /// 'if' expr 'then' expr 'else' expr
    pub(crate) fn parse_if_expr(&mut self) -> Result<Expr, Error> {
        self.advance();
        let cond = self.parse_expression()?;

        if self.current != Token::Then {
            return syntax_error(format!("expected 'then', found {}", self.current));
        }
        self.advance();
        let then = self.parse_expression()?;

        if self.current != Token::Else {
            return syntax_error(format!("expected 'else', found {}", self.current));
        }
        self.advance();
        let otherwise = self.parse_expression()?;

        Ok(Expr::If {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    /// 'for' identifier '=' expr ',' expr (',' expr)? 'in' expr
    pub(crate) fn parse_for_expr(&mut self) -> Result<Expr, Error> {
        self.advance();
        let var = self.expect_ident("identifier after 'for'")?;
        self.expect_kwd('=', "after for-loop variable")?;

        let start = self.parse_expression()?;
        self.expect_kwd(',', "after for-loop start value")?;
        let end = self.parse_expression()?;

        let step = if self.current == Token::Kwd(',') {
            self.advance();
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };

        if self.current != Token::In {
            return syntax_error(format!(
                "expected 'in' after for-loop header, found {}",
                self.current
            ));
        }
        self.advance();
        let body = self.parse_expression()?;

        Ok(Expr::For {
            var,
            start: Box::new(start),
            end: Box::new(end),
            step,
            body: Box::new(body),
        })
    }

    /// identifier '(' identifier* ')'
    pub(crate) fn parse_prototype(&mut self) -> Result<Prototype, Error> {
        let name = self.expect_ident("function name in prototype")?;
        if self.current != Token::Kwd('(') {
            return syntax_error(format!(
                "expected '(' in prototype of '{}', found {}",
                name, self.current
            ));
        }

        let mut params: Vec<String> = Vec::new();
        while let Token::Ident(param) = self.advance() {
            if params.contains(param) {
                return syntax_error(format!(
                    "duplicate parameter '{}' in prototype of '{}'",
                    param, name
                ));
            }
            params.push(param.clone());
        }
        self.expect_kwd(')', "to close prototype parameters")?;

        Ok(Prototype { name, params })
    }

    /// 'def' prototype expr
    pub(crate) fn parse_definition(&mut self) -> Result<Function, Error> {
        self.advance();
        let proto = self.parse_prototype()?;
        let body = self.parse_expression()?;
        Ok(Function { proto, body })
    }

    /// 'extern' prototype
    pub(crate) fn parse_extern(&mut self) -> Result<Prototype, Error> {
        self.advance();
        self.parse_prototype()
    }

    /// Wraps a bare expression in a fresh, zero-parameter anonymous function.
    pub(crate) fn parse_top_level_expression(&mut self) -> Result<Function, Error> {
        let body = self.parse_expression()?;
        let name = format!("{}{}", ANON_FN_PREFIX, self.anon_count);
        self.anon_count += 1;
        Ok(Function {
            proto: Prototype {
                name,
                params: Vec::new(),
            },
            body,
        })
    }
}
