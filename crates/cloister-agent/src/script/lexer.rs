//! Tokenizer for snippet source.

use super::Pos;
use crate::fault::Fault;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Str(String),
    Num(Value),
    Punct(char),
    Spread,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub pos: Pos,
    /// A newline separates this token from the previous one.
    pub newline_before: bool,
}

const PUNCT: &[char] = &['(', ')', '[', ']', '{', '}', ',', ';', '.', ':', '='];

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    at: usize,
    line: usize,
    column: usize,
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, Fault> {
    let mut lexer = Lexer {
        src,
        chars: src.char_indices().collect(),
        at: 0,
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();
    loop {
        let newline_before = lexer.skip_trivia()?;
        let pos = lexer.pos();
        let tok = lexer.next_tok()?;
        let done = tok == Tok::Eof;
        tokens.push(Token {
            tok,
            pos,
            newline_before,
        });
        if done {
            return Ok(tokens);
        }
    }
}

impl Lexer<'_> {
    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.at).map(|&(_, c)| c)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.at + offset).map(|&(_, c)| c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.at)
            .map(|&(i, _)| i)
            .unwrap_or(self.src.len())
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.at += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, pos: Pos, message: impl Into<String>) -> Fault {
        Fault::syntax_error(message).with_stack(pos.frame())
    }

    /// Skip whitespace and comments. Returns whether a newline was crossed.
    fn skip_trivia(&mut self) -> Result<bool, Fault> {
        let mut newline = false;
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some('\n'), _) => {
                    newline = true;
                    self.bump();
                }
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.bump();
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.pos();
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(c), _) => {
                                newline |= c == '\n';
                                self.bump();
                            }
                            (None, _) => return Err(self.error(start, "Unterminated comment")),
                        }
                    }
                }
                _ => return Ok(newline),
            }
        }
    }

    fn next_tok(&mut self) -> Result<Tok, Fault> {
        let pos = self.pos();
        let Some(c) = self.peek() else {
            return Ok(Tok::Eof);
        };

        if c == '.' && self.peek_at(1) == Some('.') && self.peek_at(2) == Some('.') {
            self.bump();
            self.bump();
            self.bump();
            return Ok(Tok::Spread);
        }
        if PUNCT.contains(&c) {
            self.bump();
            return Ok(Tok::Punct(c));
        }
        if c == '"' {
            return self.string(pos);
        }
        if c.is_ascii_digit() || (c == '-' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
            return self.number(pos);
        }
        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let mut ident = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                    ident.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            return Ok(Tok::Ident(ident));
        }

        Err(self.error(pos, format!("Invalid or unexpected token '{c}'")))
    }

    fn string(&mut self, pos: Pos) -> Result<Tok, Fault> {
        let start = self.offset();
        self.bump();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => {
                    if self.bump().is_none() {
                        return Err(self.error(pos, "Invalid or unexpected token"));
                    }
                }
                Some('\n') | None => return Err(self.error(pos, "Invalid or unexpected token")),
                Some(_) => {}
            }
        }
        let literal = &self.src[start..self.offset()];
        serde_json::from_str::<String>(literal)
            .map(Tok::Str)
            .map_err(|e| self.error(pos, format!("Invalid string literal: {e}")))
    }

    fn number(&mut self, pos: Pos) -> Result<Tok, Fault> {
        let start = self.offset();
        if self.peek() == Some('-') {
            self.bump();
        }
        let mut prev = ' ';
        while let Some(c) = self.peek() {
            let exponent_sign = (c == '+' || c == '-') && (prev == 'e' || prev == 'E');
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                // `1...` is not a number followed by a spread
                if c == '.' && self.peek_at(1) == Some('.') {
                    break;
                }
                prev = c;
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.src[start..self.offset()];
        serde_json::from_str::<Value>(literal)
            .map(Tok::Num)
            .map_err(|_| self.error(pos, format!("Invalid number '{literal}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_call_with_spread() {
        assert_eq!(
            toks("echo.say(...args)"),
            vec![
                Tok::Ident("echo".into()),
                Tok::Punct('.'),
                Tok::Ident("say".into()),
                Tok::Punct('('),
                Tok::Spread,
                Tok::Ident("args".into()),
                Tok::Punct(')'),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_json_literals() {
        assert_eq!(
            toks(r#""a\"bé" -1.5e3 0"#),
            vec![
                Tok::Str("a\"bé".into()),
                Tok::Num(json!(-1500.0)),
                Tok::Num(json!(0)),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_newlines() {
        let tokens = tokenize("a // one\n/* two\n */ b").unwrap();
        assert_eq!(tokens[0].tok, Tok::Ident("a".into()));
        assert!(!tokens[0].newline_before);
        assert_eq!(tokens[1].tok, Tok::Ident("b".into()));
        assert!(tokens[1].newline_before);
        assert_eq!(tokens[1].pos, Pos { line: 3, column: 5 });
    }

    #[test]
    fn test_unterminated_string_position() {
        let err = tokenize("let x = 1;\n  \"open").unwrap_err();
        assert_eq!(err.name, "SyntaxError");
        assert_eq!(err.stack.as_deref(), Some("    at <snippet>:2:3"));
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("a + b").unwrap_err();
        assert!(err.message.contains("'+'"));
    }
}
