use crate::token::Token;
use thiserror::Error;

/// Lexer error.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{line}: {message}")]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

/// Pull-based lexer for Lua 5.3 with one token of lookahead.
pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    current: Token,
    current_line: u32,
    ahead: Option<(Token, u32)>,
    /// Line of the last consumed token, for end-of-construct error messages.
    pub lastline: u32,
}

impl<'a> Lexer<'a> {
    /// Create a lexer and scan the first token.
    pub fn new(source: &'a [u8]) -> Result<Self, LexError> {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            current: Token::Eof,
            current_line: 1,
            ahead: None,
            lastline: 1,
        };
        let (tok, line) = lexer.scan_token()?;
        lexer.current = tok;
        lexer.current_line = line;
        Ok(lexer)
    }

    /// The current (unconsumed) token.
    pub fn current(&self) -> &Token {
        &self.current
    }

    /// Line of the current token.
    pub fn line(&self) -> u32 {
        self.current_line
    }

    /// Consume the current token and scan the next one.
    pub fn advance(&mut self) -> Result<Token, LexError> {
        self.lastline = self.current_line;
        let (tok, line) = match self.ahead.take() {
            Some(buffered) => buffered,
            None => self.scan_token()?,
        };
        self.current_line = line;
        Ok(std::mem::replace(&mut self.current, tok))
    }

    /// Peek one token past the current one.
    pub fn lookahead(&mut self) -> Result<&Token, LexError> {
        if self.ahead.is_none() {
            self.ahead = Some(self.scan_token()?);
        }
        Ok(&self.ahead.as_ref().unwrap().0)
    }

    // ---- Internal scanning ----

    fn error<T>(&self, message: impl Into<String>) -> Result<T, LexError> {
        Err(LexError {
            message: message.into(),
            line: self.line,
        })
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance_char(&mut self) -> Option<u8> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' {
            // \n\r counts as one newline
            if self.peek() == Some(b'\r') {
                self.pos += 1;
            }
            self.line += 1;
        } else if ch == b'\r' {
            // \r\n counts as one newline
            if self.peek() == Some(b'\n') {
                self.pos += 1;
            }
            self.line += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            while let Some(ch) = self.peek() {
                if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C') {
                    self.advance_char();
                } else {
                    break;
                }
            }

            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                self.advance_char();
                self.advance_char();
                if let Some(level) = self.check_long_bracket() {
                    // Long comment
                    self.scan_long_string_content(level)?;
                    continue;
                }
                // Short comment: skip to end of line
                while let Some(ch) = self.peek() {
                    if ch == b'\n' || ch == b'\r' {
                        break;
                    }
                    self.advance_char();
                }
                continue;
            }

            return Ok(());
        }
    }

    /// Check if current position starts a long bracket `[=*[`. Returns the level.
    fn check_long_bracket(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        let mut offset = 1;
        while self.peek_at(offset) == Some(b'=') {
            level += 1;
            offset += 1;
        }
        if self.peek_at(offset) == Some(b'[') {
            Some(level)
        } else {
            None
        }
    }

    fn scan_token(&mut self) -> Result<(Token, u32), LexError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        let tok = self.scan_token_inner()?;
        Ok((tok, line))
    }

    fn scan_token_inner(&mut self) -> Result<Token, LexError> {
        let ch = match self.peek() {
            Some(ch) => ch,
            None => return Ok(Token::Eof),
        };

        match ch {
            b'+' => self.single(Token::Plus),
            b'*' => self.single(Token::Star),
            b'^' => self.single(Token::Caret),
            b'%' => self.single(Token::Percent),
            b'&' => self.single(Token::Ampersand),
            b'|' => self.single(Token::Pipe),
            b'#' => self.single(Token::Hash),
            b'(' => self.single(Token::LParen),
            b')' => self.single(Token::RParen),
            b'{' => self.single(Token::LBrace),
            b'}' => self.single(Token::RBrace),
            b']' => self.single(Token::RBracket),
            b';' => self.single(Token::Semi),
            b',' => self.single(Token::Comma),
            b'-' => self.single(Token::Minus),
            b'/' => {
                self.advance_char();
                if self.peek() == Some(b'/') {
                    self.advance_char();
                    Ok(Token::FloorDiv)
                } else {
                    Ok(Token::Slash)
                }
            }
            b'~' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(Token::NotEqual)
                } else {
                    Ok(Token::Tilde)
                }
            }
            b'<' => {
                self.advance_char();
                match self.peek() {
                    Some(b'=') => {
                        self.advance_char();
                        Ok(Token::LessEq)
                    }
                    Some(b'<') => {
                        self.advance_char();
                        Ok(Token::ShiftLeft)
                    }
                    _ => Ok(Token::Less),
                }
            }
            b'>' => {
                self.advance_char();
                match self.peek() {
                    Some(b'=') => {
                        self.advance_char();
                        Ok(Token::GreaterEq)
                    }
                    Some(b'>') => {
                        self.advance_char();
                        Ok(Token::ShiftRight)
                    }
                    _ => Ok(Token::Greater),
                }
            }
            b'=' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(Token::Equal)
                } else {
                    Ok(Token::Assign)
                }
            }
            b':' => {
                self.advance_char();
                if self.peek() == Some(b':') {
                    self.advance_char();
                    Ok(Token::DoubleColon)
                } else {
                    Ok(Token::Colon)
                }
            }
            b'.' => {
                if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
                    return self.scan_number();
                }
                self.advance_char();
                if self.peek() == Some(b'.') {
                    self.advance_char();
                    if self.peek() == Some(b'.') {
                        self.advance_char();
                        Ok(Token::DotDotDot)
                    } else {
                        Ok(Token::DotDot)
                    }
                } else {
                    Ok(Token::Dot)
                }
            }
            b'[' => {
                if let Some(level) = self.check_long_bracket() {
                    let s = self.scan_long_string_content(level)?;
                    Ok(Token::Str(s))
                } else {
                    self.single(Token::LBracket)
                }
            }
            b'"' | b'\'' => self.scan_short_string(ch),
            b'0'..=b'9' => self.scan_number(),
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => Ok(self.scan_name()),
            _ => self.error(format!("unexpected symbol near '{}'", ch as char)),
        }
    }

    fn single(&mut self, tok: Token) -> Result<Token, LexError> {
        self.advance_char();
        Ok(tok)
    }

    fn scan_name(&mut self) -> Token {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch == b'_' || ch.is_ascii_alphanumeric() {
                self.advance_char();
            } else {
                break;
            }
        }
        // Identifier bytes are ASCII, checked above.
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        Token::keyword_from_str(text).unwrap_or_else(|| Token::Name(text.to_string()))
    }

    // ---- Numbers ----

    fn scan_number(&mut self) -> Result<Token, LexError> {
        if self.peek() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.advance_char();
            self.advance_char();
            return self.scan_hex_number();
        }

        let start = self.pos;
        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance_char();
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.advance_char();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance_char();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.advance_char();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.advance_char();
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return self.error("malformed number");
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance_char();
            }
        }
        if self.peek().is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric()) {
            return self.error("malformed number");
        }

        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        if !is_float {
            // Decimal integers that overflow become floats.
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Token::Integer(i));
            }
        }
        match text.parse::<f64>() {
            Ok(f) => Ok(Token::Float(f)),
            Err(_) => self.error("malformed number"),
        }
    }

    fn scan_hex_number(&mut self) -> Result<Token, LexError> {
        // Two accumulators: hex integers wrap modulo 2^64, while the float
        // mantissa must not — once it is full, further integral digits move
        // into the binary exponent (4 bits each) and further fractional
        // digits are below precision and dropped.
        let mut int_value: u64 = 0;
        let mut mantissa: u64 = 0;
        let mut digits = 0;
        // Fractional hex digits shift the binary exponent down 4 at a time.
        let mut exponent: i32 = 0;
        let mut is_float = false;

        while let Some(d) = self.peek().and_then(hex_digit) {
            self.advance_char();
            int_value = int_value.wrapping_mul(16).wrapping_add(d as u64);
            if mantissa < 1 << 60 {
                mantissa = mantissa * 16 + d as u64;
            } else {
                exponent += 4;
            }
            digits += 1;
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.advance_char();
            while let Some(d) = self.peek().and_then(hex_digit) {
                self.advance_char();
                if mantissa < 1 << 60 {
                    mantissa = mantissa * 16 + d as u64;
                    exponent -= 4;
                }
                digits += 1;
            }
        }
        if digits == 0 {
            return self.error("malformed number");
        }
        if matches!(self.peek(), Some(b'p') | Some(b'P')) {
            is_float = true;
            self.advance_char();
            let negative = match self.peek() {
                Some(b'-') => {
                    self.advance_char();
                    true
                }
                Some(b'+') => {
                    self.advance_char();
                    false
                }
                _ => false,
            };
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return self.error("malformed number");
            }
            let mut e: i32 = 0;
            while let Some(c) = self.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                self.advance_char();
                e = e.saturating_mul(10).saturating_add((c - b'0') as i32);
            }
            exponent += if negative { -e } else { e };
        }
        if self.peek().is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric()) {
            return self.error("malformed number");
        }

        if is_float {
            Ok(Token::Float(mantissa as f64 * (exponent as f64).exp2()))
        } else {
            // Hex integers wrap around like in Lua.
            Ok(Token::Integer(int_value as i64))
        }
    }

    // ---- Strings ----

    fn scan_short_string(&mut self, quote: u8) -> Result<Token, LexError> {
        self.advance_char();
        let mut bytes = Vec::new();
        loop {
            let ch = match self.peek() {
                None => return self.error("unfinished string"),
                Some(b'\n') | Some(b'\r') => return self.error("unfinished string"),
                Some(ch) => ch,
            };
            if ch == quote {
                self.advance_char();
                break;
            }
            if ch == b'\\' {
                self.advance_char();
                self.scan_escape(&mut bytes)?;
            } else {
                self.advance_char();
                bytes.push(ch);
            }
        }
        match String::from_utf8(bytes) {
            Ok(s) => Ok(Token::Str(s)),
            Err(_) => self.error("string literal is not valid UTF-8"),
        }
    }

    fn scan_escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), LexError> {
        let ch = match self.peek() {
            None => return self.error("unfinished string"),
            Some(ch) => ch,
        };
        match ch {
            b'a' => {
                self.advance_char();
                bytes.push(7);
            }
            b'b' => {
                self.advance_char();
                bytes.push(8);
            }
            b'f' => {
                self.advance_char();
                bytes.push(12);
            }
            b'n' => {
                self.advance_char();
                bytes.push(b'\n');
            }
            b'r' => {
                self.advance_char();
                bytes.push(b'\r');
            }
            b't' => {
                self.advance_char();
                bytes.push(b'\t');
            }
            b'v' => {
                self.advance_char();
                bytes.push(11);
            }
            b'\\' | b'"' | b'\'' => {
                self.advance_char();
                bytes.push(ch);
            }
            b'\n' | b'\r' => {
                self.advance_char();
                bytes.push(b'\n');
            }
            b'x' => {
                self.advance_char();
                let hi = self.expect_hex_digit()?;
                let lo = self.expect_hex_digit()?;
                bytes.push(hi * 16 + lo);
            }
            b'z' => {
                self.advance_char();
                while self
                    .peek()
                    .is_some_and(|c| matches!(c, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C'))
                {
                    self.advance_char();
                }
            }
            b'u' => {
                self.advance_char();
                if self.peek() != Some(b'{') {
                    return self.error("missing '{' in \\u{xxxx}");
                }
                self.advance_char();
                let mut cp: u32 = 0;
                let mut any = false;
                while let Some(d) = self.peek().and_then(hex_digit) {
                    self.advance_char();
                    any = true;
                    cp = cp.saturating_mul(16).saturating_add(d as u32);
                    if cp > 0x10FFFF {
                        return self.error("UTF-8 value too large");
                    }
                }
                if !any {
                    return self.error("hexadecimal digit expected");
                }
                if self.peek() != Some(b'}') {
                    return self.error("missing '}' in \\u{xxxx}");
                }
                self.advance_char();
                match char::from_u32(cp) {
                    Some(c) => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                    None => return self.error("UTF-8 value too large"),
                }
            }
            b'0'..=b'9' => {
                let mut value: u32 = 0;
                for _ in 0..3 {
                    match self.peek() {
                        Some(c) if c.is_ascii_digit() => {
                            self.advance_char();
                            value = value * 10 + (c - b'0') as u32;
                        }
                        _ => break,
                    }
                }
                if value > 255 {
                    return self.error("decimal escape too large");
                }
                bytes.push(value as u8);
            }
            _ => return self.error("invalid escape sequence"),
        }
        Ok(())
    }

    fn expect_hex_digit(&mut self) -> Result<u8, LexError> {
        match self.peek().and_then(hex_digit) {
            Some(d) => {
                self.advance_char();
                Ok(d)
            }
            None => self.error("hexadecimal digit expected"),
        }
    }

    /// Scan the body of a long string/comment after the opening `[=*[`.
    fn scan_long_string_content(&mut self, level: usize) -> Result<String, LexError> {
        // Skip past [=*[
        for _ in 0..level + 2 {
            self.advance_char();
        }
        // A newline immediately after the opening bracket is not part of the content.
        if matches!(self.peek(), Some(b'\n') | Some(b'\r')) {
            self.advance_char();
        }
        let mut bytes = Vec::new();
        loop {
            let ch = match self.peek() {
                None => return self.error("unfinished long string"),
                Some(ch) => ch,
            };
            if ch == b']' {
                let mut offset = 1;
                let mut eq = 0;
                while self.peek_at(offset) == Some(b'=') {
                    eq += 1;
                    offset += 1;
                }
                if eq == level && self.peek_at(offset) == Some(b']') {
                    for _ in 0..level + 2 {
                        self.advance_char();
                    }
                    break;
                }
            }
            // Normalize line endings inside long strings.
            if ch == b'\n' || ch == b'\r' {
                self.advance_char();
                bytes.push(b'\n');
            } else {
                self.advance_char();
                bytes.push(ch);
            }
        }
        match String::from_utf8(bytes) {
            Ok(s) => Ok(s),
            Err(_) => self.error("string literal is not valid UTF-8"),
        }
    }
}

fn hex_digit(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}
