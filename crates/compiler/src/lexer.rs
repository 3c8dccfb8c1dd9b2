//! Hand-written lexer.
//!
//! Runs eagerly over the whole source up front into a `Vec<Token>` — the
//! compiler is single-pass over *parsing*, not over *lexing*; nothing in
//! the contract requires streaming tokenization and a materialized token
//! vector makes lookahead in the Pratt parser trivial.

use crate::token::{Token, TokenKind};

pub fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    tokens: Vec<Token>,
    /// Whether the newline we're about to cross should be emitted as a
    /// statement terminator — true once the last real token could end a
    /// statement (an expression, a closing bracket, `end`, etc).
    pending_terminator: bool,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
            pending_terminator: false,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, String> {
        loop {
            self.skip_inline_whitespace_and_comments();
            match self.peek() {
                None => break,
                Some(b'\n') => {
                    self.pos += 1;
                    if self.pending_terminator {
                        self.tokens.push(Token::new(TokenKind::Newline, self.line));
                        self.pending_terminator = false;
                    }
                    self.line += 1;
                }
                Some(c) if c.is_ascii_digit() => self.lex_number()?,
                Some(b'"') | Some(b'\'') => self.lex_string()?,
                Some(c) if is_ident_start(c) => self.lex_identifier(),
                Some(_) => self.lex_operator()?,
            }
        }
        self.tokens.push(Token::new(TokenKind::Eof, self.line));
        Ok(self.tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn skip_inline_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.pos += 1,
                Some(b'#') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn push(&mut self, kind: TokenKind) {
        let terminates = Token::new(kind.clone(), self.line).can_end_statement();
        self.pending_terminator = terminates;
        self.tokens.push(Token::new(kind, self.line));
    }

    fn lex_identifier(&mut self) {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_continue(c)) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        let kind = match text {
            "def" => TokenKind::Def,
            "end" => TokenKind::End,
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "then" => TokenKind::Then,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "do" => TokenKind::Do,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "return" => TokenKind::Return,
            "import" => TokenKind::Import,
            "class" => TokenKind::Class,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "is" => TokenKind::Is,
            "null" => TokenKind::Null,
            "undefined" => TokenKind::Undefined,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "self" => TokenKind::SelfKw,
            _ => TokenKind::Identifier(text.to_string()),
        };
        self.push(kind);
    }

    fn lex_number(&mut self) -> Result<(), String> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.bytes[digits_start..self.pos]).unwrap();
            let value = i32::from_str_radix(text, 16)
                .map_err(|_| format!("line {}: invalid hex literal", self.line))?;
            self.push(TokenKind::Int(value));
            return Ok(());
        }
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'b') | Some(b'B')) {
            self.pos += 2;
            let digits_start = self.pos;
            while matches!(self.peek(), Some(b'0') | Some(b'1')) {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.bytes[digits_start..self.pos]).unwrap();
            let value = i32::from_str_radix(text, 2)
                .map_err(|_| format!("line {}: invalid binary literal", self.line))?;
            self.push(TokenKind::Int(value));
            return Ok(());
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| format!("line {}: invalid numeric literal", self.line))?;
            self.push(TokenKind::Float(value));
        } else {
            let value = text
                .parse::<i32>()
                .map_err(|_| format!("line {}: invalid numeric literal", self.line))?;
            self.push(TokenKind::Int(value));
        }
        Ok(())
    }

    fn lex_string(&mut self) -> Result<(), String> {
        let quote = self.peek().unwrap();
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    return Err(format!("line {}: unterminated string literal", self.line));
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'n') => {
                            out.push(b'\n');
                            self.pos += 1;
                        }
                        Some(b'r') => {
                            out.push(b'\r');
                            self.pos += 1;
                        }
                        Some(b't') => {
                            out.push(b'\t');
                            self.pos += 1;
                        }
                        Some(b'"') => {
                            out.push(b'"');
                            self.pos += 1;
                        }
                        Some(b'\'') => {
                            out.push(b'\'');
                            self.pos += 1;
                        }
                        Some(b'\\') => {
                            out.push(b'\\');
                            self.pos += 1;
                        }
                        Some(b'0') => {
                            out.push(0);
                            self.pos += 1;
                        }
                        Some(b'x') => {
                            self.pos += 1;
                            let hi = self.hex_digit()?;
                            let lo = self.hex_digit()?;
                            out.push((hi << 4) | lo);
                        }
                        Some(other) => {
                            return Err(format!(
                                "line {}: unknown escape sequence '\\{}'",
                                self.line, other as char
                            ));
                        }
                        None => return Err(format!("line {}: unterminated escape", self.line)),
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        self.push(TokenKind::Str(out));
        Ok(())
    }

    fn hex_digit(&mut self) -> Result<u8, String> {
        let c = self
            .peek()
            .ok_or_else(|| format!("line {}: unterminated \\x escape", self.line))?;
        let digit = (c as char)
            .to_digit(16)
            .ok_or_else(|| format!("line {}: invalid hex digit in \\x escape", self.line))?;
        self.pos += 1;
        Ok(digit as u8)
    }

    fn lex_operator(&mut self) -> Result<(), String> {
        macro_rules! two {
            ($second:expr, $two_kind:expr, $one_kind:expr) => {{
                self.pos += 1;
                if self.peek() == Some($second) {
                    self.pos += 1;
                    self.push($two_kind);
                } else {
                    self.push($one_kind);
                }
            }};
        }
        match self.peek().unwrap() {
            b'+' => {
                self.pos += 1;
                self.push(TokenKind::Plus);
            }
            b'-' => {
                self.pos += 1;
                self.push(TokenKind::Minus);
            }
            b'*' => {
                self.pos += 1;
                self.push(TokenKind::Star);
            }
            b'/' => {
                self.pos += 1;
                self.push(TokenKind::Slash);
            }
            b'%' => {
                self.pos += 1;
                self.push(TokenKind::Percent);
            }
            b'&' => {
                self.pos += 1;
                self.push(TokenKind::Amp);
            }
            b'|' => {
                self.pos += 1;
                self.push(TokenKind::Pipe);
            }
            b'^' => {
                self.pos += 1;
                self.push(TokenKind::Caret);
            }
            b'~' => {
                self.pos += 1;
                self.push(TokenKind::Tilde);
            }
            b'<' => {
                if self.peek_at(1) == Some(b'<') {
                    self.pos += 2;
                    self.push(TokenKind::LShift);
                } else {
                    two!(b'=', TokenKind::LtEq, TokenKind::Lt)
                }
            }
            b'>' => {
                if self.peek_at(1) == Some(b'>') {
                    self.pos += 2;
                    self.push(TokenKind::RShift);
                } else {
                    two!(b'=', TokenKind::GtEq, TokenKind::Gt)
                }
            }
            b'=' => two!(b'=', TokenKind::EqEq, TokenKind::Eq),
            b'!' => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    self.push(TokenKind::NotEq);
                } else {
                    return Err(format!("line {}: unexpected character '!'", self.line));
                }
            }
            b'.' => {
                if self.peek_at(1) == Some(b'.') && self.peek_at(2) == Some(b'.') {
                    self.pos += 3;
                    self.push(TokenKind::DotDotDot);
                } else if self.peek_at(1) == Some(b'.') {
                    self.pos += 2;
                    self.push(TokenKind::DotDot);
                } else {
                    self.pos += 1;
                    self.push(TokenKind::Dot);
                }
            }
            b',' => {
                self.pos += 1;
                self.push(TokenKind::Comma);
            }
            b':' => {
                self.pos += 1;
                self.push(TokenKind::Colon);
            }
            b'(' => {
                self.pos += 1;
                self.push(TokenKind::LParen);
            }
            b')' => {
                self.pos += 1;
                self.push(TokenKind::RParen);
            }
            b'[' => {
                self.pos += 1;
                self.push(TokenKind::LBracket);
            }
            b']' => {
                self.pos += 1;
                self.push(TokenKind::RBracket);
            }
            b'{' => {
                self.pos += 1;
                self.push(TokenKind::LBrace);
            }
            b'}' => {
                self.pos += 1;
                self.push(TokenKind::RBrace);
            }
            other => {
                return Err(format!(
                    "line {}: unexpected character '{}'",
                    self.line, other as char
                ));
            }
        }
        Ok(())
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_keywords_and_identifiers() {
        assert_eq!(
            kinds("def foo end"),
            vec![
                TokenKind::Def,
                TokenKind::Identifier("foo".into()),
                TokenKind::End,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_hex_and_binary_literals() {
        assert_eq!(kinds("0xFF"), vec![TokenKind::Int(255), TokenKind::Eof]);
        assert_eq!(kinds("0b101"), vec![TokenKind::Int(5), TokenKind::Eof]);
    }

    #[test]
    fn lexes_string_escapes() {
        let toks = kinds(r#""a\nb\x41""#);
        assert_eq!(toks, vec![TokenKind::Str(b"a\nbA".to_vec()), TokenKind::Eof]);
    }

    #[test]
    fn newline_after_expression_is_a_terminator() {
        let toks = kinds("x = 1\ny = 2");
        assert!(toks.contains(&TokenKind::Newline));
    }

    #[test]
    fn newline_after_binary_operator_is_swallowed() {
        let toks = kinds("x = 1 +\n2");
        assert_eq!(toks.iter().filter(|k| **k == TokenKind::Newline).count(), 0);
    }

    #[test]
    fn distinguishes_exclusive_and_inclusive_range() {
        assert_eq!(kinds("0..3"), vec![TokenKind::Int(0), TokenKind::DotDot, TokenKind::Int(3), TokenKind::Eof]);
        assert_eq!(
            kinds("0...3"),
            vec![TokenKind::Int(0), TokenKind::DotDotDot, TokenKind::Int(3), TokenKind::Eof]
        );
    }
}
