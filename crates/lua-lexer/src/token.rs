use std::fmt;

use lua_core::LuaStr;

/// A token and the line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

impl Token {
    pub fn new(kind: TokenKind, line: u32) -> Self {
        Self { kind, line }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Integer(i64),
    Float(f64),
    /// Contents after escape processing; may hold arbitrary bytes.
    LuaString(LuaStr),
    Name(String),

    // reserved words
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Caret,
    Ampersand,
    Tilde,
    Pipe,
    ShiftLeft,
    ShiftRight,
    Hash,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    ColonColon,
    Semicolon,
    Colon,
    Comma,
    Dot,
    DotDot,
    DotDotDot,

    Eof,
}

const RESERVED: [(&str, TokenKind); 22] = [
    ("and", TokenKind::And),
    ("break", TokenKind::Break),
    ("do", TokenKind::Do),
    ("else", TokenKind::Else),
    ("elseif", TokenKind::Elseif),
    ("end", TokenKind::End),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("function", TokenKind::Function),
    ("goto", TokenKind::Goto),
    ("if", TokenKind::If),
    ("in", TokenKind::In),
    ("local", TokenKind::Local),
    ("nil", TokenKind::Nil),
    ("not", TokenKind::Not),
    ("or", TokenKind::Or),
    ("repeat", TokenKind::Repeat),
    ("return", TokenKind::Return),
    ("then", TokenKind::Then),
    ("true", TokenKind::True),
    ("until", TokenKind::Until),
    ("while", TokenKind::While),
];

impl TokenKind {
    /// The reserved word spelled `s`, if any.
    pub fn keyword(s: &str) -> Option<TokenKind> {
        RESERVED.iter().find(|(word, _)| *word == s).map(|(_, kind)| kind.clone())
    }

    /// Fixed spelling of reserved words and operators; `None` for tokens
    /// that carry a value.
    pub fn symbol(&self) -> Option<&'static str> {
        use TokenKind::*;
        let op = match self {
            Integer(_) | Float(_) | LuaString(_) | Name(_) => return None,
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            SlashSlash => "//",
            Percent => "%",
            Caret => "^",
            Ampersand => "&",
            Tilde => "~",
            Pipe => "|",
            ShiftLeft => "<<",
            ShiftRight => ">>",
            Hash => "#",
            Eq => "==",
            NotEq => "~=",
            Lt => "<",
            LtEq => "<=",
            Gt => ">",
            GtEq => ">=",
            Assign => "=",
            LParen => "(",
            RParen => ")",
            LBrace => "{",
            RBrace => "}",
            LBracket => "[",
            RBracket => "]",
            ColonColon => "::",
            Semicolon => ";",
            Colon => ":",
            Comma => ",",
            Dot => ".",
            DotDot => "..",
            DotDotDot => "...",
            Eof => "<eof>",
            reserved => {
                return RESERVED.iter().find(|(_, kind)| kind == reserved).map(|(word, _)| *word)
            }
        };
        Some(op)
    }
}

/// Renders the token the way error messages quote it after `near`.
impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Eof => f.write_str("<eof>"),
            TokenKind::Integer(i) => write!(f, "'{i}'"),
            TokenKind::Float(x) => write!(f, "'{}'", lua_core::number::fmt_float(*x)),
            TokenKind::LuaString(s) => write!(f, "'{s}'"),
            TokenKind::Name(n) => write!(f, "'{n}'"),
            other => write!(f, "'{}'", other.symbol().unwrap_or("?")),
        }
    }
}
