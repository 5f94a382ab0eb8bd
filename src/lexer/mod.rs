//! C4: lexer — UTF-8 source to token stream (spec §4.4).

mod token;

use std::{error, fmt};

pub use token::{Keyword, Token};

pub const KP_MAX_LINE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct Error {
    pub chunkname: String,
    pub line: u32,
    pub message: String,
    pub near: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.chunkname, self.line, self.message)?;
        if let Some(near) = &self.near {
            write!(f, " near '{near}'")?;
        }
        Ok(())
    }
}

impl error::Error for Error {}

/// One-character-lookahead lexer over a byte slice (treated as UTF-8 text
/// for identifiers/strings, but scanned byte-wise like the original).
pub struct Lexer<'a> {
    chunkname: String,
    src: &'a [u8],
    pos: usize,
    line: u32,
    lookahead: Option<(Token, u32)>,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(chunkname: impl Into<String>, src: &'a [u8]) -> Self {
        Lexer {
            chunkname: chunkname.into(),
            src,
            pos: 0,
            line: 1,
            lookahead: None,
        }
    }

    #[must_use]
    pub fn chunkname(&self) -> &str {
        &self.chunkname
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    fn err(&self, line: u32, message: impl Into<String>) -> Error {
        Error {
            chunkname: self.chunkname.clone(),
            line,
            message: message.into(),
            near: None,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_byte_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        Some(b)
    }

    /// Count `\n`, `\r`, `\n\r`, `\r\n` all as one line break (spec §4.4).
    fn newline(&mut self) -> Result<(), Error> {
        let first = self.bump().unwrap();
        debug_assert!(first == b'\n' || first == b'\r');
        if let Some(second) = self.peek_byte() {
            if (second == b'\n' || second == b'\r') && second != first {
                self.bump();
            }
        }
        self.line += 1;
        if self.line > KP_MAX_LINE {
            return Err(self.err(self.line, "line count overflow"));
        }
        Ok(())
    }

    fn skip_trivia(&mut self) -> Result<(), Error> {
        loop {
            match self.peek_byte() {
                Some(b' ' | b'\t' | 0x0c | 0x0b) => {
                    self.pos += 1;
                }
                Some(b'\n' | b'\r') => {
                    self.newline()?;
                }
                Some(b'#') if self.pos == 0 => {
                    // shebang-style comment to end of line
                    while !matches!(self.peek_byte(), None | Some(b'\n' | b'\r')) {
                        self.pos += 1;
                    }
                }
                Some(b'-') if self.peek_byte_at(1) == Some(b'-') => {
                    self.pos += 2;
                    if self.peek_byte() == Some(b'[') {
                        if let Some(level) = self.long_bracket_level() {
                            self.skip_long_bracket(level)?;
                            continue;
                        }
                    }
                    while !matches!(self.peek_byte(), None | Some(b'\n' | b'\r')) {
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// If positioned at `[=*[`, returns the equal-sign level and consumes the
    /// opening bracket; otherwise leaves position unchanged.
    fn long_bracket_level(&mut self) -> Option<usize> {
        let start = self.pos;
        debug_assert_eq!(self.peek_byte(), Some(b'['));
        let mut p = self.pos + 1;
        let mut level = 0;
        while self.src.get(p) == Some(&b'=') {
            level += 1;
            p += 1;
        }
        if self.src.get(p) == Some(&b'[') {
            self.pos = p + 1;
            Some(level)
        } else {
            self.pos = start;
            None
        }
    }

    fn skip_long_bracket(&mut self, level: usize) -> Result<(), Error> {
        self.read_long_bracket_body(level).map(|_| ())
    }

    fn read_long_bracket_body(&mut self, level: usize) -> Result<Vec<u8>, Error> {
        // strip a single leading newline right after the opening bracket
        if matches!(self.peek_byte(), Some(b'\n' | b'\r')) {
            self.newline()?;
        }
        let mut out = Vec::new();
        loop {
            match self.peek_byte() {
                None => return Err(self.err(self.line, "unterminated long string/comment")),
                Some(b'\n' | b'\r') => {
                    self.newline()?;
                    out.push(b'\n');
                }
                Some(b']') => {
                    let save = self.pos;
                    self.pos += 1;
                    let mut count = 0;
                    while self.peek_byte() == Some(b'=') {
                        count += 1;
                        self.pos += 1;
                    }
                    if count == level && self.peek_byte() == Some(b']') {
                        self.pos += 1;
                        return Ok(out);
                    }
                    self.pos = save;
                    out.push(b']');
                    self.pos += 1;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn is_name_start(b: u8) -> bool {
        b.is_ascii_alphabetic() || b == b'_'
    }

    fn is_name_cont(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_'
    }

    fn scan_name(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek_byte(), Some(b) if Self::is_name_cont(b)) {
            self.pos += 1;
        }
        let bytes = &self.src[start..self.pos];
        match Keyword::from_bytes(bytes) {
            Some(kw) => Token::Keyword(kw),
            None => Token::Name(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    fn scan_number(&mut self) -> Result<Token, Error> {
        let start = self.pos;
        let mut is_hex = false;
        if self.peek_byte() == Some(b'0')
            && matches!(self.peek_byte_at(1), Some(b'x' | b'X'))
        {
            is_hex = true;
            self.pos += 2;
            while matches!(self.peek_byte(), Some(b) if b.is_ascii_hexdigit()) {
                self.pos += 1;
            }
        } else {
            while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.peek_byte() == Some(b'.') {
                self.pos += 1;
                while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
            if matches!(self.peek_byte(), Some(b'e' | b'E')) {
                self.pos += 1;
                if matches!(self.peek_byte(), Some(b'+' | b'-')) {
                    self.pos += 1;
                }
                while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let digits_end = self.pos;
        // u/U/l/L suffixes accepted and discarded
        while matches!(self.peek_byte(), Some(b'u' | b'U' | b'l' | b'L')) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..digits_end]).unwrap();
        let value = if is_hex {
            u64::from_str_radix(&text[2..], 16)
                .map(|v| v as f64)
                .map_err(|_| self.err(self.line, "malformed number"))?
        } else {
            text.parse::<f64>()
                .map_err(|_| self.err(self.line, "malformed number"))?
        };
        Ok(Token::Number(value))
    }

    fn scan_escape(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        self.pos += 1; // consume backslash
        match self.peek_byte() {
            Some(b'a') => {
                out.push(0x07);
                self.pos += 1;
            }
            Some(b'b') => {
                out.push(0x08);
                self.pos += 1;
            }
            Some(b'f') => {
                out.push(0x0c);
                self.pos += 1;
            }
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
            Some(b'v') => {
                out.push(0x0b);
                self.pos += 1;
            }
            Some(b'\\') => {
                out.push(b'\\');
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
            Some(b'\n' | b'\r') => {
                self.newline()?;
                out.push(b'\n');
            }
            Some(b'x') => {
                self.pos += 1;
                let mut v: u32 = 0;
                for _ in 0..2 {
                    let b = self.peek_byte().ok_or_else(|| self.err(self.line, "bad escape"))?;
                    let d = (b as char)
                        .to_digit(16)
                        .ok_or_else(|| self.err(self.line, "bad hex escape"))?;
                    v = v * 16 + d;
                    self.pos += 1;
                }
                out.push(v as u8);
            }
            Some(b'z') => {
                self.pos += 1;
                loop {
                    match self.peek_byte() {
                        Some(b' ' | b'\t' | 0x0c | 0x0b) => self.pos += 1,
                        Some(b'\n' | b'\r') => self.newline()?,
                        _ => break,
                    }
                }
            }
            Some(b) if b.is_ascii_digit() => {
                let mut v: u32 = 0;
                for _ in 0..3 {
                    match self.peek_byte() {
                        Some(b) if b.is_ascii_digit() => {
                            v = v * 10 + u32::from(b - b'0');
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                out.push(v as u8);
            }
            _ => return Err(self.err(self.line, "invalid escape sequence")),
        }
        Ok(())
    }

    fn scan_string(&mut self, quote: u8) -> Result<Token, Error> {
        self.pos += 1; // opening quote
        let mut out = Vec::new();
        loop {
            match self.peek_byte() {
                None => return Err(self.err(self.line, "unterminated string")),
                Some(b'\n' | b'\r') => return Err(self.err(self.line, "unterminated string")),
                Some(b) if b == quote => {
                    self.pos += 1;
                    return Ok(Token::Str(out));
                }
                Some(b'\\') => self.scan_escape(&mut out)?,
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn scan_punct(&mut self) -> Result<Token, Error> {
        let b = self.bump().unwrap();
        Ok(match b {
            b'<' => {
                if self.peek_byte() == Some(b'<') {
                    self.pos += 1;
                    Token::Shl
                } else if self.peek_byte() == Some(b'=') {
                    self.pos += 1;
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            b'>' => {
                if self.peek_byte() == Some(b'>') {
                    self.pos += 1;
                    Token::Shr
                } else if self.peek_byte() == Some(b'=') {
                    self.pos += 1;
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            b'&' if self.peek_byte() == Some(b'&') => {
                self.pos += 1;
                Token::AndAnd
            }
            b'|' if self.peek_byte() == Some(b'|') => {
                self.pos += 1;
                Token::OrOr
            }
            b'=' if self.peek_byte() == Some(b'=') => {
                self.pos += 1;
                Token::EqEq
            }
            b'!' if self.peek_byte() == Some(b'=') => {
                self.pos += 1;
                Token::NotEq
            }
            b':' if self.peek_byte() == Some(b':') => {
                self.pos += 1;
                Token::DColon
            }
            b'+' if self.peek_byte() == Some(b'=') => {
                self.pos += 1;
                Token::PlusEq
            }
            b'.' if self.peek_byte() == Some(b'.') && self.peek_byte_at(1) == Some(b'.') => {
                self.pos += 2;
                Token::Dots
            }
            b'=' => Token::Assign,
            b'!' => Token::Not,
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'{' => Token::LBrace,
            b'}' => Token::RBrace,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b',' => Token::Comma,
            b';' => Token::Semi,
            b':' => Token::Colon,
            b'.' => Token::Dot,
            other => {
                return Err(self.err(self.line, format!("unexpected character '{}'", other as char)))
            }
        })
    }

    fn scan(&mut self) -> Result<(Token, u32), Error> {
        self.skip_trivia()?;
        let line = self.line;
        let tok = match self.peek_byte() {
            None => Token::Eof,
            Some(b'"') => self.scan_string(b'"')?,
            Some(b'\'') => self.scan_string(b'\'')?,
            Some(b'[') if matches!(self.peek_byte_at(1), Some(b'[' | b'=')) => {
                match self.long_bracket_level() {
                    Some(level) => Token::Str(self.read_long_bracket_body(level)?),
                    None => self.scan_punct()?,
                }
            }
            Some(b) if b.is_ascii_digit() => self.scan_number()?,
            Some(b) if Self::is_name_start(b) => self.scan_name(),
            Some(_) => self.scan_punct()?,
        };
        Ok((tok, line))
    }

    /// Returns the next token, consuming the lookahead if one was buffered.
    pub fn next(&mut self) -> Result<(Token, u32), Error> {
        if let Some(tok) = self.lookahead.take() {
            return Ok(tok);
        }
        self.scan()
    }

    /// One-token lookahead (spec §4.4 `ls->lookahead`).
    pub fn peek(&mut self) -> Result<&Token, Error> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.scan()?);
        }
        Ok(&self.lookahead.as_ref().unwrap().0)
    }

    /// Scan verbatim up to (not including) `stop`, trimming surrounding
    /// whitespace; used by `trace`/`profile`/`tick` to capture event-spec
    /// text without quoting (spec §4.4 `read_string_until`).
    pub fn read_raw_until(&mut self, stop: u8) -> String {
        debug_assert!(self.lookahead.is_none(), "read_raw_until bypasses lookahead");
        let start = self.pos;
        while matches!(self.peek_byte(), Some(b) if b != stop) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos])
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new("test", src.as_bytes());
        let mut out = Vec::new();
        loop {
            let (tok, _) = lx.next().unwrap();
            if tok == Token::Eof {
                break;
            }
            out.push(tok);
        }
        out
    }

    #[test]
    fn lexes_keywords_and_identifiers() {
        assert_eq!(
            tokens("var x = 1"),
            vec![
                Token::Keyword(Keyword::Var),
                Token::Name("x".into()),
                Token::Assign,
                Token::Number(1.0),
            ]
        );
    }

    #[test]
    fn skips_comments() {
        assert_eq!(tokens("-- hi\nvar x -- trailing\n"), vec![
            Token::Keyword(Keyword::Var),
            Token::Name("x".into())
        ]);
        assert_eq!(tokens("--[[ long\ncomment ]]var y"), vec![
            Token::Keyword(Keyword::Var),
            Token::Name("y".into())
        ]);
    }

    #[test]
    fn parses_escapes() {
        let toks = tokens(r#" "a\tb\n\x41" "#);
        assert_eq!(toks, vec![Token::Str(b"a\tb\nA".to_vec())]);
    }

    #[test]
    fn long_strings_strip_leading_newline() {
        let toks = tokens("[[\nhello]]");
        assert_eq!(toks, vec![Token::Str(b"hello".to_vec())]);
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            tokens("a << b >> c && d || e <= f >= g == h != i"),
            vec![
                Token::Name("a".into()),
                Token::Shl,
                Token::Name("b".into()),
                Token::Shr,
                Token::Name("c".into()),
                Token::AndAnd,
                Token::Name("d".into()),
                Token::OrOr,
                Token::Name("e".into()),
                Token::Le,
                Token::Name("f".into()),
                Token::Ge,
                Token::Name("g".into()),
                Token::EqEq,
                Token::Name("h".into()),
                Token::NotEq,
                Token::Name("i".into()),
            ]
        );
    }

    #[test]
    fn hex_numbers() {
        assert_eq!(tokens("0xFFu"), vec![Token::Number(255.0)]);
    }
}
