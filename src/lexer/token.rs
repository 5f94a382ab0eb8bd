//! Token vocabulary and the reserved-word table (spec §4.4).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Var,
    If,
    Elseif,
    Else,
    While,
    Repeat,
    Until,
    For,
    In,
    Function,
    Return,
    Break,
    True,
    False,
    Nil,
    Trace,
    TraceEnd,
    Profile,
    Tick,
}

impl Keyword {
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Keyword> {
        Some(match bytes {
            b"var" => Keyword::Var,
            b"if" => Keyword::If,
            b"elseif" => Keyword::Elseif,
            b"else" => Keyword::Else,
            b"while" => Keyword::While,
            b"repeat" => Keyword::Repeat,
            b"until" => Keyword::Until,
            b"for" => Keyword::For,
            b"in" => Keyword::In,
            b"function" => Keyword::Function,
            b"return" => Keyword::Return,
            b"break" => Keyword::Break,
            b"true" => Keyword::True,
            b"false" => Keyword::False,
            b"nil" => Keyword::Nil,
            b"trace" => Keyword::Trace,
            b"trace_end" => Keyword::TraceEnd,
            b"profile" => Keyword::Profile,
            b"tick" => Keyword::Tick,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Eof,
    Name(String),
    Number(f64),
    Str(Vec<u8>),
    /// Verbatim event-spec / interval text captured by
    /// `read_string_until` for `trace`/`profile`/`tick` (spec §4.4).
    RawUntil(String),
    Keyword(Keyword),

    // two-character tokens
    Shl,    // <<
    Shr,    // >>
    AndAnd, // &&
    OrOr,   // ||
    Le,     // <=
    Ge,     // >=
    EqEq,   // ==
    NotEq,  // !=
    DColon, // ::
    Dots,   // ...
    PlusEq, // +=

    // single-character punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    Lt,
    Gt,
    Not,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    Dot,
}

impl Token {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Token::Eof => "<eof>".to_string(),
            Token::Name(n) => n.clone(),
            Token::Number(n) => n.to_string(),
            Token::Str(_) => "<string>".to_string(),
            Token::RawUntil(s) => s.clone(),
            Token::Keyword(k) => format!("{k:?}").to_lowercase(),
            other => format!("{other:?}"),
        }
    }
}
