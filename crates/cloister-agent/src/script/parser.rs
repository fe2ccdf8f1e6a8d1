//! Recursive-descent parser producing the snippet AST.

use super::lexer::{tokenize, Tok, Token};
use super::{Pos, MAX_NESTING_DEPTH};
use crate::fault::Fault;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Let { name: String, value: Expr },
    Throw { value: Expr, pos: Pos },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Path {
        path: Vec<String>,
        pos: Pos,
    },
    Call {
        callee: Vec<String>,
        args: Vec<Arg>,
        pos: Pos,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Arg {
    pub spread: bool,
    pub value: Expr,
}

const RESERVED: &[&str] = &["let", "throw", "true", "false", "null"];

pub(crate) fn parse(src: &str) -> Result<Vec<Stmt>, Fault> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        at: 0,
        depth: 0,
    };
    parser.script()
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token list always ends with Eof and the cursor never passes it.
        &self.tokens[self.at.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.tok != Tok::Eof {
            self.at += 1;
        }
        token
    }

    fn is_punct(&self, c: char) -> bool {
        self.peek().tok == Tok::Punct(c)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.is_punct(c) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), Fault> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> Fault {
        let token = self.peek();
        let message = match &token.tok {
            Tok::Eof => "Unexpected end of input".to_string(),
            Tok::Ident(name) => format!("Unexpected identifier '{name}'"),
            Tok::Str(_) => "Unexpected string".to_string(),
            Tok::Num(n) => format!("Unexpected number {n}"),
            Tok::Punct(c) => format!("Unexpected token '{c}'"),
            Tok::Spread => "Unexpected token '...'".to_string(),
        };
        Fault::syntax_error(message).with_stack(token.pos.frame())
    }

    fn ident(&mut self) -> Result<String, Fault> {
        match &self.peek().tok {
            Tok::Ident(name) if !RESERVED.contains(&name.as_str()) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn script(&mut self) -> Result<Vec<Stmt>, Fault> {
        let mut body = Vec::new();
        while self.eat_punct(';') {}
        while self.peek().tok != Tok::Eof {
            body.push(self.stmt()?);
            if self.eat_punct(';') {
                while self.eat_punct(';') {}
            } else if self.peek().tok != Tok::Eof && !self.peek().newline_before {
                return Err(self.unexpected());
            }
        }
        Ok(body)
    }

    fn stmt(&mut self) -> Result<Stmt, Fault> {
        match &self.peek().tok {
            Tok::Ident(kw) if kw == "let" => {
                self.advance();
                let name = self.ident()?;
                self.expect_punct('=')?;
                let value = self.expr()?;
                Ok(Stmt::Let { name, value })
            }
            Tok::Ident(kw) if kw == "throw" => {
                let pos = self.advance().pos;
                if self.peek().newline_before || self.peek().tok == Tok::Eof {
                    return Err(Fault::syntax_error("Illegal newline after throw")
                        .with_stack(pos.frame()));
                }
                let value = self.expr()?;
                Ok(Stmt::Throw { value, pos })
            }
            _ => Ok(Stmt::Expr(self.expr()?)),
        }
    }

    fn expr(&mut self) -> Result<Expr, Fault> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(Fault::syntax_error(format!(
                "Maximum nesting depth ({MAX_NESTING_DEPTH}) exceeded"
            ))
            .with_stack(self.peek().pos.frame()));
        }
        self.depth += 1;
        let expr = self.term();
        self.depth -= 1;
        expr
    }

    fn term(&mut self) -> Result<Expr, Fault> {
        let token = self.peek().clone();
        match token.tok {
            Tok::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::String(s)))
            }
            Tok::Num(n) => {
                self.advance();
                Ok(Expr::Literal(n))
            }
            Tok::Punct('[') => {
                self.advance();
                self.array()
            }
            Tok::Punct('{') => {
                self.advance();
                self.object()
            }
            Tok::Punct('(') => {
                self.advance();
                let inner = self.expr()?;
                self.expect_punct(')')?;
                Ok(inner)
            }
            Tok::Ident(name) => match name.as_str() {
                "null" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Null))
                }
                "true" | "false" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Bool(name == "true")))
                }
                _ => self.path_or_call(token.pos),
            },
            _ => Err(self.unexpected()),
        }
    }

    fn path_or_call(&mut self, pos: Pos) -> Result<Expr, Fault> {
        let mut path = vec![self.ident()?];
        while self.eat_punct('.') {
            path.push(self.ident()?);
        }
        if !self.eat_punct('(') {
            return Ok(Expr::Path { path, pos });
        }

        let mut args = Vec::new();
        while !self.is_punct(')') {
            let spread = self.peek().tok == Tok::Spread;
            if spread {
                self.advance();
            }
            args.push(Arg {
                spread,
                value: self.expr()?,
            });
            if !self.eat_punct(',') {
                break;
            }
        }
        self.expect_punct(')')?;
        Ok(Expr::Call {
            callee: path,
            args,
            pos,
        })
    }

    fn array(&mut self) -> Result<Expr, Fault> {
        let mut items = Vec::new();
        while !self.is_punct(']') {
            items.push(self.expr()?);
            if !self.eat_punct(',') {
                break;
            }
        }
        self.expect_punct(']')?;
        Ok(Expr::Array(items))
    }

    fn object(&mut self) -> Result<Expr, Fault> {
        let mut fields = Vec::new();
        while !self.is_punct('}') {
            let key = match self.peek().tok.clone() {
                Tok::Str(s) => {
                    self.advance();
                    s
                }
                Tok::Ident(name) => {
                    self.advance();
                    name
                }
                _ => return Err(self.unexpected()),
            };
            self.expect_punct(':')?;
            fields.push((key, self.expr()?));
            if !self.eat_punct(',') {
                break;
            }
        }
        self.expect_punct('}')?;
        Ok(Expr::Object(fields))
    }
}
