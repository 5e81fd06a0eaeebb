//! Recursive-descent parser.
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparison / membership,
//! additive, multiplicative, unary minus.

use super::lexer::{Spanned, Token};
use super::{BinaryOp, Expr, ExprError, Func, UnaryOp};

pub fn parse(tokens: &[Spanned], text_len: usize) -> Result<Expr, ExprError> {
    let mut parser = Parser { tokens, index: 0, text_len };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ExprError::Parse {
            pos: extra.pos,
            message: format!("unexpected trailing {:?}", extra.token),
        });
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    index: usize,
    text_len: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Spanned> {
        self.tokens.get(self.index)
    }

    fn advance(&mut self) -> Option<&'a Spanned> {
        let token = self.tokens.get(self.index);
        self.index += 1;
        token
    }

    fn pos(&self) -> usize {
        self.peek().map(|s| s.pos).unwrap_or(self.text_len)
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(spanned) if &spanned.token == expected => Ok(()),
            Some(spanned) => Err(ExprError::Parse {
                pos: spanned.pos,
                message: format!("expected {what}, got {:?}", spanned.token),
            }),
            None => Err(ExprError::Parse {
                pos: self.text_len,
                message: format!("expected {what}, got end of expression"),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(s) if s.token == Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary { op: BinaryOp::Or, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(s) if s.token == Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::Binary { op: BinaryOp::And, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        // `not in` belongs to the comparison level; only treat `not` as a
        // prefix when it does not immediately precede `in`.
        if matches!(self.peek(), Some(s) if s.token == Token::Not) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(inner) });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_additive()?;

        let op = match self.peek().map(|s| &s.token) {
            Some(Token::Eq) => Some(BinaryOp::Eq),
            Some(Token::Ne) => Some(BinaryOp::Ne),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::Le) => Some(BinaryOp::Le),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive()?;
            return Ok(Expr::Binary { op, left: Box::new(left), right: Box::new(right) });
        }

        if matches!(self.peek(), Some(s) if s.token == Token::In) {
            self.advance();
            return self.parse_in_rhs(left, false);
        }
        if matches!(self.peek(), Some(s) if s.token == Token::Not) {
            // Lookahead for `not in`.
            if matches!(self.tokens.get(self.index + 1), Some(s) if s.token == Token::In) {
                self.advance();
                self.advance();
                return self.parse_in_rhs(left, true);
            }
        }

        Ok(left)
    }

    fn parse_in_rhs(&mut self, needle: Expr, negated: bool) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(s) if s.token == Token::LParen) {
            self.advance();
            let mut list = vec![self.parse_or()?];
            while matches!(self.peek(), Some(s) if s.token == Token::Comma) {
                self.advance();
                list.push(self.parse_or()?);
            }
            self.expect(&Token::RParen, ")")?;
            return Ok(Expr::InList { needle: Box::new(needle), list, negated });
        }
        // `x in tags` - membership in an array-valued expression.
        let haystack = self.parse_additive()?;
        Ok(Expr::InValue { needle: Box::new(needle), haystack: Box::new(haystack), negated })
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(s) if s.token == Token::Minus) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Neg, expr: Box::new(inner) });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let pos = self.pos();
        let spanned = self.advance().ok_or_else(|| ExprError::Parse {
            pos,
            message: "expected expression, got end of input".to_string(),
        })?;

        match &spanned.token {
            Token::Int(v) => Ok(Expr::Int(*v)),
            Token::Float(v) => Ok(Expr::Float(*v)),
            Token::Str(v) => Ok(Expr::Str(v.clone())),
            Token::Bool(v) => Ok(Expr::Bool(*v)),
            Token::Null => Ok(Expr::Null),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, ")")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if matches!(self.peek(), Some(s) if s.token == Token::LParen) {
                    return self.parse_call(name, spanned.pos);
                }
                Ok(Expr::Field(name.clone()))
            }
            other => Err(ExprError::Parse {
                pos: spanned.pos,
                message: format!("unexpected {other:?}"),
            }),
        }
    }

    fn parse_call(&mut self, name: &str, pos: usize) -> Result<Expr, ExprError> {
        self.expect(&Token::LParen, "(")?;

        // Presence check takes a field name, not a value.
        if name == "has" {
            let field = match self.advance() {
                Some(Spanned { token: Token::Ident(field), .. }) => field.clone(),
                other => {
                    return Err(ExprError::Parse {
                        pos: other.map(|s| s.pos).unwrap_or(self.text_len),
                        message: "has() takes a field name".to_string(),
                    })
                }
            };
            self.expect(&Token::RParen, ")")?;
            return Ok(Expr::Has(field));
        }

        let func = Func::by_name(name).ok_or_else(|| ExprError::Parse {
            pos,
            message: format!("unknown function {name:?}"),
        })?;

        let mut args = Vec::new();
        if !matches!(self.peek(), Some(s) if s.token == Token::RParen) {
            args.push(self.parse_or()?);
            while matches!(self.peek(), Some(s) if s.token == Token::Comma) {
                self.advance();
                args.push(self.parse_or()?);
            }
        }
        self.expect(&Token::RParen, ")")?;

        let (min_args, max_args) = func.arity();
        if args.len() < min_args || max_args.is_some_and(|max| args.len() > max) {
            return Err(ExprError::Parse {
                pos,
                message: format!("{name} takes {} argument(s), got {}", func.arity_text(), args.len()),
            });
        }

        Ok(Expr::Call { func, args })
    }
}
