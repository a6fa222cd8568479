//! Recursive-descent parser producing the statement tree.

use serde_json::Value;

use super::lexer::{tokenize, Tok, Token};
use super::ScriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Call { name: String, args: Vec<Expr> },
    Field { target: Box<Expr>, name: String },
    Index { target: Box<Expr>, index: Box<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StmtKind {
    Let { name: String, value: Expr },
    Assign { name: String, value: Expr },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

/// Deepest tree the parser builds. Brackets, blocks, prefix operators and
/// every link of an operator or postfix chain each count one level.
const MAX_NESTING: usize = 128;

pub(crate) fn parse(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let program = parser.block_body(false)?;
    parser.expect(Tok::Eof)?;
    Ok(program)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), ScriptError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    /// Run `f` one nesting level deeper, refusing past `MAX_NESTING`.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ScriptError>,
    ) -> Result<T, ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// Count one more link of a left-leaning chain; the caller resets
    /// `depth` once the chain ends.
    fn chain_link(&mut self) -> Result<(), ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        Ok(())
    }

    fn skip_separators(&mut self) {
        while self.eat(&Tok::Sep) {}
    }

    /// Statements up to `}` (when `braced`) or end of input.
    fn block_body(&mut self, braced: bool) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                Tok::Eof => break,
                Tok::RBrace if braced => break,
                _ => {}
            }
            stmts.push(self.statement()?);
            match self.peek() {
                Tok::Sep | Tok::Eof => {}
                Tok::RBrace if braced => {}
                other => {
                    return Err(self.error(format!("expected end of statement, found {other:?}")))
                }
            }
        }
        Ok(stmts)
    }

    fn braced_block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(Tok::LBrace)?;
        let body = self.nested(|p| p.block_body(true))?;
        self.expect(Tok::RBrace)?;
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Tok::Let => {
                self.bump();
                let Tok::Ident(name) = self.bump() else {
                    return Err(self.error("expected variable name after let"));
                };
                self.expect(Tok::Assign)?;
                StmtKind::Let {
                    name,
                    value: self.expression()?,
                }
            }
            Tok::If => self.if_statement()?,
            Tok::Ident(name)
                if matches!(self.tokens.get(self.pos + 1).map(|t| &t.tok), Some(Tok::Assign)) =>
            {
                self.bump();
                self.bump();
                StmtKind::Assign {
                    name,
                    value: self.expression()?,
                }
            }
            _ => StmtKind::Expr(self.expression()?),
        };
        Ok(Stmt { kind, line })
    }

    fn if_statement(&mut self) -> Result<StmtKind, ScriptError> {
        self.nested(Self::if_chain)
    }

    fn if_chain(&mut self) -> Result<StmtKind, ScriptError> {
        self.expect(Tok::If)?;
        let cond = self.expression()?;
        let then = self.braced_block()?;

        // `else` may sit on the line after the closing brace.
        let save = self.pos;
        self.skip_separators();
        let otherwise = if self.eat(&Tok::Else) {
            if *self.peek() == Tok::If {
                let line = self.line();
                vec![Stmt {
                    kind: self.if_statement()?,
                    line,
                }]
            } else {
                self.braced_block()?
            }
        } else {
            self.pos = save;
            Vec::new()
        };

        Ok(StmtKind::If {
            cond,
            then,
            otherwise,
        })
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.nested(|p| p.binary(0))
    }

    fn binary(&mut self, level: usize) -> Result<Expr, ScriptError> {
        const LEVELS: [&[(Tok, BinOp)]; 5] = [
            &[(Tok::OrOr, BinOp::Or)],
            &[(Tok::AndAnd, BinOp::And)],
            &[(Tok::EqEq, BinOp::Eq), (Tok::NotEq, BinOp::NotEq)],
            &[
                (Tok::Lt, BinOp::Lt),
                (Tok::Le, BinOp::Le),
                (Tok::Gt, BinOp::Gt),
                (Tok::Ge, BinOp::Ge),
            ],
            &[(Tok::Plus, BinOp::Add), (Tok::Minus, BinOp::Sub)],
        ];

        if level == LEVELS.len() {
            return self.term();
        }

        let base = self.depth;
        let mut lhs = self.binary(level + 1)?;
        'outer: loop {
            for (tok, op) in LEVELS[level] {
                if self.eat(tok) {
                    self.chain_link()?;
                    let rhs = self.binary(level + 1)?;
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue 'outer;
                }
            }
            self.depth = base;
            return Ok(lhs);
        }
    }

    fn term(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.bump();
            self.chain_link()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek() {
            Tok::Bang => UnaryOp::Not,
            Tok::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.bump();
        let expr = self.nested(Self::unary)?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut expr = self.primary()?;
        loop {
            if matches!(self.peek(), Tok::Dot | Tok::LBracket) {
                self.chain_link()?;
            }
            if self.eat(&Tok::Dot) {
                let Tok::Ident(name) = self.bump() else {
                    return Err(self.error("expected field name after '.'"));
                };
                expr = Expr::Field {
                    target: Box::new(expr),
                    name,
                };
            } else if self.eat(&Tok::LBracket) {
                self.skip_separators();
                let index = self.expression()?;
                self.skip_separators();
                self.expect(Tok::RBracket)?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                self.depth = base;
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to `close`; newlines are insignificant.
    fn list_of<T>(
        &mut self,
        close: Tok,
        mut item: impl FnMut(&mut Self) -> Result<T, ScriptError>,
    ) -> Result<Vec<T>, ScriptError> {
        let mut items = Vec::new();
        self.skip_separators();
        while *self.peek() != close {
            items.push(item(self)?);
            self.skip_separators();
            if !self.eat(&Tok::Comma) {
                break;
            }
            self.skip_separators();
        }
        self.expect(close)?;
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let start = self.pos;
        match self.bump() {
            Tok::Num(n) => Ok(Expr::Literal(number(n))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Value::Null)),
            Tok::LParen => {
                self.skip_separators();
                let inner = self.expression()?;
                self.skip_separators();
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Tok::LBracket => Ok(Expr::List(self.list_of(Tok::RBracket, Self::expression)?)),
            Tok::LBrace => {
                let entries = self.list_of(Tok::RBrace, |p| {
                    let key = match p.bump() {
                        Tok::Str(s) | Tok::Ident(s) => s,
                        other => return Err(p.error(format!("invalid map key {other:?}"))),
                    };
                    p.expect(Tok::Colon)?;
                    Ok((key, p.expression()?))
                })?;
                Ok(Expr::Map(entries))
            }
            Tok::Ident(name) => {
                if self.eat(&Tok::LParen) {
                    let args = self.list_of(Tok::RParen, Self::expression)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => {
                self.pos = start;
                Err(self.error(format!("unexpected {other:?}")))
            }
        }
    }
}

/// Integral numbers become JSON integers so `str(2)` prints `2`.
pub(crate) fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
