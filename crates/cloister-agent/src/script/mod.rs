//! The snippet language.
//!
//! Snippets are a closed expression language, not code: `let` bindings,
//! `throw`, calls on loaded modules and a handful of built-ins, with JSON
//! literals as the only data syntax. Nothing in a snippet can reach a
//! capability that was not put in its scope.

mod interpreter;
mod lexer;
mod parser;

pub use interpreter::{Eval, Interpreter};

use crate::fault::Fault;
use parser::Stmt;
use std::fmt;

/// Deepest nesting of arrays, objects, calls and parentheses a snippet may use.
pub(crate) const MAX_NESTING_DEPTH: usize = 256;

/// Source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

impl Pos {
    /// Stack line reported with faults raised at this position.
    pub fn frame(&self) -> String {
        format!("    at <snippet>:{}:{}", self.line, self.column)
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A parsed snippet.
#[derive(Debug, Clone)]
pub struct Script {
    body: Vec<Stmt>,
}

impl Script {
    /// Parse snippet source. Failures are `SyntaxError` faults.
    pub fn parse(source: &str) -> Result<Self, Fault> {
        Ok(Self {
            body: parser::parse(source)?,
        })
    }

    /// Number of statements.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
