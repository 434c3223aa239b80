//! Indentation-aware tokenizer.

use super::error::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string with escapes already processed
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

const OPS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "+",
    "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: u32,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            text,
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
        }
    }

    fn push(&mut self, tok: Tok, line: u32) {
        self.tokens.push(Token { tok, line });
    }

    fn peek(&self, offset: usize) -> u8 {
        self.src.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut at_line_start = true;

        while self.pos < self.src.len() {
            if at_line_start && self.depth == 0 {
                at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }

            let c = self.peek(0);
            match c {
                b'\n' => {
                    if self.depth == 0 && self.last_is_content() {
                        self.push(Tok::Newline, self.line);
                    }
                    self.pos += 1;
                    self.line += 1;
                    at_line_start = true;
                }
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'#' => {
                    while self.pos < self.src.len() && self.peek(0) != b'\n' {
                        self.pos += 1;
                    }
                }
                b'\\' if self.peek(1) == b'\n' => {
                    self.pos += 2;
                    self.line += 1;
                }
                b'0'..=b'9' => self.number()?,
                b'.' if self.peek(1).is_ascii_digit() => self.number()?,
                b'"' | b'\'' => self.string(false, false)?,
                c if c == b'_' || c.is_ascii_alphabetic() || c >= 0x80 => self.name_or_prefixed()?,
                _ => self.op()?,
            }
        }

        if self.last_is_content() {
            self.push(Tok::Newline, self.line);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, self.line);
        }
        self.push(Tok::Eof, self.line);
        Ok(self.tokens)
    }

    fn last_is_content(&self) -> bool {
        !matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    /// Measure indentation at the start of a line. Returns true when the line
    /// is blank or comment-only and was skipped entirely.
    fn handle_indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0;
        let mut p = self.pos;
        while p < self.src.len() {
            match self.src[p] {
                b' ' => width += 1,
                b'\t' => width += 8 - (width % 8),
                b'\r' => {}
                _ => break,
            }
            p += 1;
        }

        let next = self.src.get(p).copied().unwrap_or(b'\n');
        if next == b'\n' || next == b'#' {
            while p < self.src.len() && self.src[p] != b'\n' {
                p += 1;
            }
            self.pos = (p + 1).min(self.src.len());
            if p < self.src.len() {
                self.line += 1;
            }
            return Ok(true);
        }

        self.pos = p;
        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent, self.line);
        } else if width < current {
            while width < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(Tok::Dedent, self.line);
            }
            if width != *self.indents.last().unwrap_or(&0) {
                return Err(SyntaxError::new(
                    "IndentationError",
                    "unindent does not match any outer indentation level",
                    self.line,
                ));
            }
        }
        Ok(false)
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        let mut is_float = false;
        while self.peek(0).is_ascii_digit() || self.peek(0) == b'_' {
            self.pos += 1;
        }
        if self.peek(0) == b'.' && self.peek(1) != b'.' {
            is_float = true;
            self.pos += 1;
            while self.peek(0).is_ascii_digit() || self.peek(0) == b'_' {
                self.pos += 1;
            }
        }
        if matches!(self.peek(0), b'e' | b'E') {
            let sign = usize::from(matches!(self.peek(1), b'+' | b'-'));
            if self.peek(1 + sign).is_ascii_digit() {
                is_float = true;
                self.pos += 1 + sign;
                while self.peek(0).is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }

        let raw: String = self.text[start..self.pos].chars().filter(|c| *c != '_').collect();
        let tok = if is_float {
            raw.parse::<f64>().map(Tok::Float).ok()
        } else {
            raw.parse::<i64>().map(Tok::Int).ok()
        };
        match tok {
            Some(tok) => {
                self.push(tok, self.line);
                Ok(())
            }
            None => Err(SyntaxError::new(
                "SyntaxError",
                format!("invalid number literal {raw:?}"),
                self.line,
            )),
        }
    }

    fn name_or_prefixed(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.peek(0);
            if c == b'_' || c.is_ascii_alphanumeric() || c >= 0x80 {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word = &self.text[start..self.pos];
        let quote = self.peek(0);
        if (quote == b'"' || quote == b'\'') && word.len() <= 2 {
            let lower = word.to_ascii_lowercase();
            let fmt = lower.contains('f');
            let raw = lower.contains('r');
            if lower.chars().all(|c| c == 'f' || c == 'r' || c == 'b' || c == 'u') {
                return self.string(fmt, raw);
            }
        }
        self.push(Tok::Name(word.to_string()), self.line);
        Ok(())
    }

    fn string(&mut self, fmt: bool, raw: bool) -> Result<(), SyntaxError> {
        let start_line = self.line;
        let quote = self.peek(0);
        let triple = self.peek(1) == quote && self.peek(2) == quote;
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            if self.pos >= self.src.len() {
                return Err(SyntaxError::new(
                    "SyntaxError",
                    "unterminated string literal",
                    start_line,
                ));
            }
            let c = self.peek(0);
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == quote && self.peek(2) == quote {
                    self.pos += 3;
                    break;
                }
            }
            if c == b'\n' {
                if !triple {
                    return Err(SyntaxError::new(
                        "SyntaxError",
                        "unterminated string literal",
                        start_line,
                    ));
                }
                self.line += 1;
            }
            if c == b'\\' && !raw {
                let escaped = self.peek(1);
                self.pos += 2;
                match escaped {
                    b'n' => out.push('\n'),
                    b't' => out.push('\t'),
                    b'r' => out.push('\r'),
                    b'0' => out.push('\0'),
                    b'\\' => out.push('\\'),
                    b'\'' => out.push('\''),
                    b'"' => out.push('"'),
                    b'\n' => self.line += 1,
                    other => {
                        out.push('\\');
                        out.push(other as char);
                    }
                }
                continue;
            }

            let ch_len = utf8_len(c);
            out.push_str(&self.text[self.pos..self.pos + ch_len]);
            self.pos += ch_len;
        }

        let tok = if fmt { Tok::FStr(out) } else { Tok::Str(out) };
        self.push(tok, start_line);
        Ok(())
    }

    fn op(&mut self) -> Result<(), SyntaxError> {
        let rest = &self.text[self.pos..];
        let Some(op) = OPS.iter().find(|op| rest.starts_with(**op)) else {
            let ch = rest.chars().next().unwrap_or('?');
            return Err(SyntaxError::new(
                "SyntaxError",
                format!("invalid character {ch:?}"),
                self.line,
            ));
        };
        match *op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.pos += op.len();
        self.push(Tok::Op(op), self.line);
        Ok(())
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}
