use crate::token::{Token, TokenKind};
use lua_core::{chunk_id, number, LexError, LuaStr};

/// Tokenises Lua 5.3 source bytes, one [`Token`] at a time.
pub struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    /// Display name used in error messages.
    chunk: String,
    /// Start of the token being scanned, for `near` context.
    tok_start: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src [u8], chunk_name: &str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            chunk: chunk_id(chunk_name),
            tok_start: 0,
        }
    }

    /// Current source line.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Display name of the chunk being scanned.
    pub fn chunk(&self) -> &str {
        &self.chunk
    }

    /// Consume the entire source and return all tokens, including a final `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    // ── internal helpers ────────────────────────────────────────────────────

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.src.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn eat_if(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Error quoting the token scanned so far.
    fn error_near_token(&self, message: &str) -> LexError {
        let text = String::from_utf8_lossy(&self.src[self.tok_start..self.pos]);
        self.error(format!("{message} near '{text}'"))
    }

    fn error_near_eof(&self, message: &str) -> LexError {
        self.error(format!("{message} near <eof>"))
    }

    fn error(&self, message: String) -> LexError {
        LexError {
            chunk: self.chunk.clone(),
            line: self.line,
            message,
        }
    }

    // ── whitespace & comments ───────────────────────────────────────────────

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)) {
                self.advance();
            }

            if self.peek() == Some(b'-') && self.peek2() == Some(b'-') {
                self.tok_start = self.pos;
                self.advance();
                self.advance();

                if self.peek() == Some(b'[') {
                    let save = self.pos;
                    self.advance();
                    if let Some(level) = self.long_bracket_level() {
                        self.read_long_body(level, true)?;
                        continue;
                    }
                    self.pos = save;
                }

                while !matches!(self.peek(), Some(b'\n') | None) {
                    self.advance();
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    /// With the first `[` consumed, consume `=`*N `[` and return N. Leaves the
    /// cursor untouched when the opening is not a long bracket.
    fn long_bracket_level(&mut self) -> Option<usize> {
        let mut i = self.pos;
        while self.src.get(i) == Some(&b'=') {
            i += 1;
        }
        if self.src.get(i) == Some(&b'[') {
            let level = i - self.pos;
            self.pos = i + 1;
            Some(level)
        } else {
            None
        }
    }

    /// Read the body of a long string or comment after its opening bracket.
    fn read_long_body(&mut self, level: usize, comment: bool) -> Result<Vec<u8>, LexError> {
        // A newline right after the opening bracket is not part of the body.
        if self.peek() == Some(b'\r') {
            self.advance();
            self.eat_if(b'\n');
        } else if self.peek() == Some(b'\n') {
            self.advance();
            self.eat_if(b'\r');
        }

        let mut buf = Vec::new();
        loop {
            match self.advance() {
                None => {
                    let what = if comment { "unfinished long comment" } else { "unfinished long string" };
                    return Err(self.error_near_eof(what));
                }
                Some(b']') => {
                    let mut eq = 0usize;
                    while self.src.get(self.pos + eq) == Some(&b'=') {
                        eq += 1;
                    }
                    if eq == level && self.src.get(self.pos + eq) == Some(&b']') {
                        self.pos += eq + 1;
                        return Ok(buf);
                    }
                    buf.push(b']');
                }
                Some(b'\r') => {
                    self.eat_if(b'\n');
                    buf.push(b'\n');
                }
                Some(ch) => {
                    if !comment {
                        buf.push(ch);
                    }
                }
            }
        }
    }

    // ── string literals ─────────────────────────────────────────────────────

    fn read_short_string(&mut self, delim: u8) -> Result<Vec<u8>, LexError> {
        let mut buf = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error_near_eof("unfinished string")),
                Some(b'\n' | b'\r') => return Err(self.error_near_token("unfinished string")),
                Some(b'\\') => {
                    self.advance();
                    self.read_escape(&mut buf)?;
                }
                Some(ch) => {
                    self.advance();
                    if ch == delim {
                        break;
                    }
                    buf.push(ch);
                }
            }
        }
        Ok(buf)
    }

    fn read_escape(&mut self, buf: &mut Vec<u8>) -> Result<(), LexError> {
        let Some(ch) = self.peek() else {
            return Err(self.error_near_eof("unfinished string"));
        };
        let byte = match ch {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0b,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'\n' | b'\r' => {
                self.advance();
                // \r\n and \n\r count as one line break.
                let other = if ch == b'\n' { b'\r' } else { b'\n' };
                self.eat_if(other);
                buf.push(b'\n');
                return Ok(());
            }
            b'x' => {
                self.advance();
                let mut value = 0u8;
                for _ in 0..2 {
                    match self.peek().and_then(|c| (c as char).to_digit(16)) {
                        Some(d) => {
                            self.advance();
                            value = value * 16 + d as u8;
                        }
                        None => {
                            self.advance();
                            return Err(self.error_near_token("hexadecimal digit expected"));
                        }
                    }
                }
                buf.push(value);
                return Ok(());
            }
            b'u' => {
                self.advance();
                let code = self.read_utf8_escape()?;
                encode_utf8(code, buf);
                return Ok(());
            }
            b'z' => {
                self.advance();
                while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)) {
                    self.advance();
                }
                return Ok(());
            }
            d if d.is_ascii_digit() => {
                let mut value = 0u32;
                for _ in 0..3 {
                    match self.peek() {
                        Some(c) if c.is_ascii_digit() => {
                            self.advance();
                            value = value * 10 + (c - b'0') as u32;
                        }
                        _ => break,
                    }
                }
                if value > 255 {
                    return Err(self.error_near_token("decimal escape too large"));
                }
                buf.push(value as u8);
                return Ok(());
            }
            _ => {
                self.advance();
                return Err(self.error_near_token("invalid escape sequence"));
            }
        };
        self.advance();
        buf.push(byte);
        Ok(())
    }

    fn read_utf8_escape(&mut self) -> Result<u32, LexError> {
        if !self.eat_if(b'{') {
            self.advance();
            return Err(self.error_near_token("missing '{' in \\u{xxxx}"));
        }
        let mut code: u32 = 0;
        let mut digits = 0;
        while let Some(d) = self.peek().and_then(|c| (c as char).to_digit(16)) {
            self.advance();
            digits += 1;
            code = code.saturating_mul(16).saturating_add(d);
            if code > 0x7FFF_FFFF {
                return Err(self.error_near_token("UTF-8 value too large"));
            }
        }
        if digits == 0 {
            self.advance();
            return Err(self.error_near_token("hexadecimal digit expected"));
        }
        if !self.eat_if(b'}') {
            self.advance();
            return Err(self.error_near_token("missing '}' in \\u{xxxx}"));
        }
        Ok(code)
    }

    // ── number literals ─────────────────────────────────────────────────────

    /// Scan a numeral greedily (digits, `.`, exponent signs, and any trailing
    /// alphanumerics), then convert it as a whole.
    fn read_numeral(&mut self) -> Result<TokenKind, LexError> {
        let mut expo = [b'e', b'E'];
        if self.peek() == Some(b'0') && matches!(self.peek2(), Some(b'x' | b'X')) {
            self.advance();
            self.advance();
            expo = [b'p', b'P'];
        }
        loop {
            match self.peek() {
                Some(c) if c == expo[0] || c == expo[1] => {
                    self.advance();
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.advance();
                    }
                }
                Some(c) if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' => {
                    self.advance();
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.src[self.tok_start..self.pos]).unwrap_or("");
        match number::parse_number(text) {
            Some(number::Number::Int(i)) => Ok(TokenKind::Integer(i)),
            Some(number::Number::Float(f)) => Ok(TokenKind::Float(f)),
            None => Err(self.error_near_token("malformed number")),
        }
    }

    // ── main dispatch ────────────────────────────────────────────────────────

    /// Scan the next token; `Eof` repeats once the input is exhausted.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        self.tok_start = self.pos;

        let ch = match self.peek() {
            None => return Ok(Token::new(TokenKind::Eof, line)),
            Some(c) => c,
        };

        let kind = match ch {
            b'0'..=b'9' => self.read_numeral()?,
            b'.' if self.peek2().is_some_and(|c| c.is_ascii_digit()) => self.read_numeral()?,

            b'"' | b'\'' => {
                self.advance();
                TokenKind::LuaString(LuaStr::from(self.read_short_string(ch)?))
            }

            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
                {
                    self.advance();
                }
                // Identifier bytes are ASCII by construction.
                let s = std::str::from_utf8(&self.src[self.tok_start..self.pos]).unwrap_or("");
                TokenKind::keyword(s).unwrap_or_else(|| TokenKind::Name(s.to_owned()))
            }

            b'[' => {
                self.advance();
                if let Some(level) = self.long_bracket_level() {
                    TokenKind::LuaString(LuaStr::from(self.read_long_body(level, false)?))
                } else if self.peek() == Some(b'=') {
                    while self.peek() == Some(b'=') {
                        self.advance();
                    }
                    return Err(self.error_near_token("invalid long string delimiter"));
                } else {
                    TokenKind::LBracket
                }
            }

            _ => {
                self.advance();
                self.operator(ch)?
            }
        };

        Ok(Token::new(kind, line))
    }

    fn operator(&mut self, ch: u8) -> Result<TokenKind, LexError> {
        Ok(match ch {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'%' => TokenKind::Percent,
            b'^' => TokenKind::Caret,
            b'&' => TokenKind::Ampersand,
            b'|' => TokenKind::Pipe,
            b'#' => TokenKind::Hash,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b']' => TokenKind::RBracket,
            b';' => TokenKind::Semicolon,
            b',' => TokenKind::Comma,
            b'/' => {
                if self.eat_if(b'/') {
                    TokenKind::SlashSlash
                } else {
                    TokenKind::Slash
                }
            }
            b'~' => {
                if self.eat_if(b'=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Tilde
                }
            }
            b'<' => {
                if self.eat_if(b'<') {
                    TokenKind::ShiftLeft
                } else if self.eat_if(b'=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat_if(b'>') {
                    TokenKind::ShiftRight
                } else if self.eat_if(b'=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            b'=' => {
                if self.eat_if(b'=') {
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            b':' => {
                if self.eat_if(b':') {
                    TokenKind::ColonColon
                } else {
                    TokenKind::Colon
                }
            }
            b'.' => {
                if self.eat_if(b'.') {
                    if self.eat_if(b'.') {
                        TokenKind::DotDotDot
                    } else {
                        TokenKind::DotDot
                    }
                } else {
                    TokenKind::Dot
                }
            }
            _ => return Err(self.error_near_token("unexpected symbol")),
        })
    }
}

/// UTF-8 encoding extended to 31-bit values, surrogates included.
fn encode_utf8(code: u32, buf: &mut Vec<u8>) {
    if code < 0x80 {
        buf.push(code as u8);
        return;
    }
    let mut tail = Vec::with_capacity(6);
    let mut x = code;
    let mut first_max = 0x3fu32;
    while x > first_max {
        tail.push(0x80 | (x & 0x3f) as u8);
        x >>= 6;
        first_max >>= 1;
    }
    let lead_mask = (!first_max << 1) & 0xff;
    buf.push((lead_mask | x) as u8);
    buf.extend(tail.iter().rev());
}

// ── Tests ────────────────────────────────────────────────────────────────────
