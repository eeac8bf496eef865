//! Recursive-descent parser for the contract dialect.
//!
//! The grammar is a strict subset of JavaScript: statements end with `;`
//! (omission is tolerated only before `}` or end of input), `{` in
//! expression position is an object literal, and assignment is a statement
//! rather than an expression.

use super::ast::*;
use super::errors::VmError;
use super::lexer::{lex, Tok, Token, TplPiece};

pub fn parse(source: &str) -> Result<Vec<Stmt>, VmError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let body = parser.parse_statements(Tok::Eof)?;
    Ok(body)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let i = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[i].tok
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> VmError {
        VmError::Parse { line: self.line(), message: message.into() }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), VmError> {
        if *self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Statement terminator: `;`, or implicitly before `}` / end of input.
    fn end_statement(&mut self) -> Result<(), VmError> {
        if self.eat(&Tok::Semi) {
            return Ok(());
        }
        match self.peek() {
            Tok::RBrace | Tok::Eof => Ok(()),
            other => Err(self.error(format!("expected ';', found {other:?}"))),
        }
    }

    fn parse_statements(&mut self, until: Tok) -> Result<Vec<Stmt>, VmError> {
        let mut body = Vec::new();
        while *self.peek() != until {
            if *self.peek() == Tok::Eof {
                return Err(self.error("unexpected end of input"));
            }
            body.push(self.parse_statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn parse_block_or_single(&mut self) -> Result<Vec<Stmt>, VmError> {
        if self.eat(&Tok::LBrace) {
            self.parse_statements(Tok::RBrace)
        } else {
            Ok(vec![self.parse_statement()?])
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, VmError> {
        match self.peek().clone() {
            Tok::Let | Tok::Const => {
                let constant = matches!(self.advance(), Tok::Const);
                let Tok::Ident(name) = self.advance() else {
                    return Err(self.error("expected identifier after let/const"));
                };
                self.expect(Tok::Assign, "'='")?;
                let init = self.parse_expr()?;
                self.end_statement()?;
                Ok(Stmt::Let { name, constant, init })
            }
            Tok::If => {
                self.advance();
                self.expect(Tok::LParen, "'('")?;
                let cond = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                let then_branch = self.parse_block_or_single()?;
                let else_branch = if self.eat(&Tok::Else) {
                    Some(self.parse_block_or_single()?)
                } else {
                    None
                };
                Ok(Stmt::If { cond, then_branch, else_branch })
            }
            Tok::While => {
                self.advance();
                self.expect(Tok::LParen, "'('")?;
                let cond = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                let body = self.parse_block_or_single()?;
                Ok(Stmt::While { cond, body })
            }
            Tok::For => {
                self.advance();
                self.expect(Tok::LParen, "'('")?;
                let init = if self.eat(&Tok::Semi) {
                    None
                } else {
                    // Consumes its own `;` like any simple statement.
                    Some(Box::new(self.parse_statement()?))
                };
                let cond = if *self.peek() == Tok::Semi {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(Tok::Semi, "';'")?;
                let update = if *self.peek() == Tok::RParen {
                    None
                } else {
                    Some(Box::new(self.parse_simple_statement()?))
                };
                self.expect(Tok::RParen, "')'")?;
                let body = self.parse_block_or_single()?;
                Ok(Stmt::For { init, cond, update, body })
            }
            Tok::Break => {
                self.advance();
                self.end_statement()?;
                Ok(Stmt::Break)
            }
            Tok::Continue => {
                self.advance();
                self.end_statement()?;
                Ok(Stmt::Continue)
            }
            Tok::Return => {
                self.advance();
                if self.eat(&Tok::Semi) {
                    return Ok(Stmt::Return(None));
                }
                if matches!(self.peek(), Tok::RBrace | Tok::Eof) {
                    return Ok(Stmt::Return(None));
                }
                let value = self.parse_expr()?;
                self.end_statement()?;
                Ok(Stmt::Return(Some(value)))
            }
            Tok::LBrace => {
                self.advance();
                Ok(Stmt::Block(self.parse_statements(Tok::RBrace)?))
            }
            _ => {
                let stmt = self.parse_simple_statement()?;
                self.end_statement()?;
                Ok(stmt)
            }
        }
    }

    /// Assignment or expression statement without a terminator (also used
    /// in for-loop update position).
    fn parse_simple_statement(&mut self) -> Result<Stmt, VmError> {
        let expr = self.parse_expr()?;
        let op = match self.peek() {
            Tok::Assign => Some(AssignOp::Set),
            Tok::PlusAssign => Some(AssignOp::Add),
            Tok::MinusAssign => Some(AssignOp::Sub),
            _ => None,
        };
        if let Some(op) = op {
            if !matches!(expr, Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }) {
                return Err(self.error("invalid assignment target"));
            }
            self.advance();
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign { target: expr, op, value });
        }
        Ok(Stmt::Expr(expr))
    }

    // ── Expressions, lowest precedence first ─────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, VmError> {
        let cond = self.parse_or()?;
        if self.eat(&Tok::Question) {
            let then_value = self.parse_expr()?;
            self.expect(Tok::Colon, "':'")?;
            let else_value = self.parse_expr()?;
            return Ok(Expr::Conditional {
                cond: Box::new(cond),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
            });
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_and()?;
        while self.eat(&Tok::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_equality()?;
        while self.eat(&Tok::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Tok::EqEq => BinaryOp::Eq,
                Tok::EqEqEq => BinaryOp::StrictEq,
                Tok::NotEq => BinaryOp::Ne,
                Tok::NotEqEq => BinaryOp::StrictNe,
                _ => break,
            };
            self.advance();
            let right = self.parse_relational()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Tok::Lt => BinaryOp::Lt,
                Tok::Le => BinaryOp::Le,
                Tok::Gt => BinaryOp::Gt,
                Tok::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, VmError> {
        match self.peek() {
            Tok::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Neg, operand: Box::new(operand) })
            }
            Tok::Not => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand) })
            }
            Tok::TypeOf => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::TypeOf, operand: Box::new(operand) })
            }
            Tok::Await => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Await(Box::new(operand)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, VmError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let property = match self.advance() {
                        Tok::Ident(name) => name,
                        // Property names may collide with keywords.
                        Tok::Let => "let".to_string(),
                        Tok::TypeOf => "typeof".to_string(),
                        other => {
                            return Err(
                                self.error(format!("expected property name, found {other:?}"))
                            )
                        }
                    };
                    expr = Expr::Member { object: Box::new(expr), property };
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Tok::RBracket, "']'")?;
                    expr = Expr::Index { object: Box::new(expr), index: Box::new(index) };
                }
                Tok::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.eat(&Tok::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.eat(&Tok::Comma) {
                                continue;
                            }
                            self.expect(Tok::RParen, "')'")?;
                            break;
                        }
                    }
                    expr = Expr::Call { callee: Box::new(expr), args };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, VmError> {
        // Arrow functions need lookahead: `x => …` or `(a, b) => …`.
        if let Tok::Ident(name) = self.peek() {
            if *self.peek_at(1) == Tok::FatArrow {
                let name = name.clone();
                self.advance();
                self.advance();
                let body = self.parse_arrow_body()?;
                return Ok(Expr::Arrow { params: vec![name], body });
            }
        }
        if *self.peek() == Tok::LParen {
            if let Some(params) = self.try_arrow_params() {
                let body = self.parse_arrow_body()?;
                return Ok(Expr::Arrow { params, body });
            }
        }

        match self.advance() {
            Tok::Number(n) => Ok(Expr::Number(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Template(pieces) => self.desugar_template(pieces),
            Tok::True => Ok(Expr::Bool(true)),
            Tok::False => Ok(Expr::Bool(false)),
            Tok::Null => Ok(Expr::Null),
            Tok::Undefined => Ok(Expr::Undefined),
            Tok::Ident(name) => Ok(Expr::Ident(name)),
            Tok::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat(&Tok::Comma) {
                            if self.eat(&Tok::RBracket) {
                                break;
                            }
                            continue;
                        }
                        self.expect(Tok::RBracket, "']'")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Tok::LBrace => {
                let mut fields = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Tok::Ident(name) => name,
                            Tok::Str(text) => text,
                            other => {
                                return Err(
                                    self.error(format!("expected object key, found {other:?}"))
                                )
                            }
                        };
                        self.expect(Tok::Colon, "':'")?;
                        let value = self.parse_expr()?;
                        fields.push((key, value));
                        if self.eat(&Tok::Comma) {
                            if self.eat(&Tok::RBrace) {
                                break;
                            }
                            continue;
                        }
                        self.expect(Tok::RBrace, "'}'")?;
                        break;
                    }
                }
                Ok(Expr::Object(fields))
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    /// If the upcoming `( … )` is an arrow parameter list, consume it and
    /// return the names; otherwise leave the position untouched.
    fn try_arrow_params(&mut self) -> Option<Vec<String>> {
        let start = self.pos;
        let mut params = Vec::new();
        // `(` already peeked by the caller.
        self.advance();
        if self.eat(&Tok::RParen) {
            if self.eat(&Tok::FatArrow) {
                return Some(params);
            }
            self.pos = start;
            return None;
        }
        loop {
            let Tok::Ident(name) = self.peek().clone() else {
                self.pos = start;
                return None;
            };
            self.advance();
            params.push(name);
            if self.eat(&Tok::Comma) {
                continue;
            }
            if self.eat(&Tok::RParen) && self.eat(&Tok::FatArrow) {
                return Some(params);
            }
            self.pos = start;
            return None;
        }
    }

    /// A template literal is string concatenation: every interpolation is
    /// appended to a leading empty string, so values stringify exactly as
    /// `"" + value` would.
    fn desugar_template(&mut self, pieces: Vec<TplPiece>) -> Result<Expr, VmError> {
        let line = self.line();
        let mut expr = Expr::Str(String::new());
        for piece in pieces {
            let rhs = match piece {
                TplPiece::Str(text) => Expr::Str(text),
                TplPiece::Expr(source) => {
                    let tokens = lex(&source)?;
                    let mut sub = Parser { tokens, pos: 0 };
                    let inner = sub.parse_expr()?;
                    if *sub.peek() != Tok::Eof {
                        return Err(VmError::Parse {
                            line,
                            message: "bad template interpolation".into(),
                        });
                    }
                    inner
                }
            };
            expr = Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(expr),
                right: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_arrow_body(&mut self) -> Result<ArrowBody, VmError> {
        if self.eat(&Tok::LBrace) {
            Ok(ArrowBody::Block(self.parse_statements(Tok::RBrace)?))
        } else {
            Ok(ArrowBody::Expr(Box::new(self.parse_expr()?)))
        }
    }
}
