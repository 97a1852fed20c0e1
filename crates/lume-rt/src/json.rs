use std::collections::BTreeMap;
use std::fmt;

const MAX_DEPTH: usize = 512;

#[derive(Clone, Debug, PartialEq)]
pub enum JsonValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<JsonValue>),
    Object(BTreeMap<String, JsonValue>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct EncodeError {
    pub message: String,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EncodeError {}

/// Parser diagnostic for malformed JSON text. `offset` is the byte position
/// where the parser gave up.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeError {
    pub message: String,
    pub offset: usize,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (offset {})", self.message, self.offset)
    }
}

impl std::error::Error for DecodeError {}

pub fn encode(value: &JsonValue) -> Result<String, EncodeError> {
    let mut out = String::new();
    encode_value(value, &mut out)?;
    Ok(out)
}

fn encode_value(value: &JsonValue, out: &mut String) -> Result<(), EncodeError> {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        JsonValue::Number(v) => encode_number(*v, out)?,
        JsonValue::String(v) => encode_string(v, out),
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                encode_value(item, out)?;
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            out.push('{');
            for (idx, (key, value)) in map.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                encode_string(key, out);
                out.push(':');
                encode_value(value, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn encode_number(value: f64, out: &mut String) -> Result<(), EncodeError> {
    if value.is_nan() {
        return Err(EncodeError {
            message: "unsupported value: NaN".to_string(),
        });
    }
    if value.is_infinite() {
        let sign = if value > 0.0 { "+" } else { "-" };
        return Err(EncodeError {
            message: format!("unsupported value: {sign}Inf"),
        });
    }
    // f64's Display is the shortest round-trip form and never uses an exponent.
    out.push_str(&value.to_string());
    Ok(())
}

fn encode_string(value: &str, out: &mut String) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            ch if (ch as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", ch as u32));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}

pub fn decode(input: &str) -> Result<JsonValue, DecodeError> {
    let mut parser = Parser::new(input);
    let value = parser.parse_value(0)?;
    parser.skip_ws();
    if parser.eof() {
        Ok(value)
    } else {
        Err(parser.error_here("invalid character after top-level value"))
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn error_at(&self, offset: usize, message: impl Into<String>) -> DecodeError {
        DecodeError {
            message: message.into(),
            offset,
        }
    }

    fn error_here(&self, message: impl Into<String>) -> DecodeError {
        self.error_at(self.pos, message)
    }

    fn unexpected(&self, context: &str) -> DecodeError {
        match self.peek() {
            Some(ch) => self.error_here(format!(
                "invalid character {} {context}",
                describe_byte(ch)
            )),
            None => self.error_here("unexpected end of JSON input"),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == b' ' || ch == b'\n' || ch == b'\t' || ch == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<JsonValue, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(self.error_here("exceeded max nesting depth"));
        }
        self.skip_ws();
        match self.peek() {
            Some(b'n') => self.parse_literal(b"null", JsonValue::Null),
            Some(b't') => self.parse_literal(b"true", JsonValue::Bool(true)),
            Some(b'f') => self.parse_literal(b"false", JsonValue::Bool(false)),
            Some(b'"') => self.parse_string().map(JsonValue::String),
            Some(b'[') => self.parse_array(depth),
            Some(b'{') => self.parse_object(depth),
            Some(b'-') | Some(b'0'..=b'9') => self.parse_number(),
            _ => Err(self.unexpected("looking for beginning of value")),
        }
    }

    fn parse_literal(
        &mut self,
        expected: &[u8],
        value: JsonValue,
    ) -> Result<JsonValue, DecodeError> {
        let start = self.pos;
        for &byte in expected {
            match self.peek() {
                Some(ch) if ch == byte => self.pos += 1,
                Some(_) => {
                    let literal = String::from_utf8_lossy(expected);
                    return Err(self.unexpected(&format!("in literal {literal}")));
                }
                None => return Err(self.error_at(start, "unexpected end of JSON input")),
            }
        }
        Ok(value)
    }

    fn eat_digits(&mut self) -> usize {
        let start = self.pos;
        while let Some(b'0'..=b'9') = self.peek() {
            self.pos += 1;
        }
        self.pos - start
    }

    fn parse_number(&mut self) -> Result<JsonValue, DecodeError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        match self.peek() {
            Some(b'0') => {
                self.pos += 1;
            }
            Some(b'1'..=b'9') => {
                self.eat_digits();
            }
            _ => return Err(self.unexpected("in numeric literal")),
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            if self.eat_digits() == 0 {
                return Err(self.unexpected("after decimal point in numeric literal"));
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            if self.eat_digits() == 0 {
                return Err(self.unexpected("in exponent of numeric literal"));
            }
        }
        let slice = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error_at(start, "invalid number"))?;
        let value = slice
            .parse::<f64>()
            .map_err(|_| self.error_at(start, format!("invalid number {slice}")))?;
        if !value.is_finite() {
            return Err(self.error_at(start, format!("number {slice} out of range")));
        }
        Ok(JsonValue::Number(value))
    }

    fn parse_string(&mut self) -> Result<String, DecodeError> {
        if self.peek() != Some(b'"') {
            return Err(self.unexpected("looking for beginning of string"));
        }
        let start = self.pos;
        self.pos += 1;
        let mut out: Vec<u8> = Vec::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(self.error_at(start, "unterminated string literal"));
            };
            match ch {
                b'"' => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    self.pos += 1;
                    self.parse_escape(&mut out)?;
                }
                0x00..=0x1F => {
                    return Err(self.unexpected("in string literal"));
                }
                _ => {
                    out.push(ch);
                    self.pos += 1;
                }
            }
        }
        // The input is a &str and escapes push whole UTF-8 sequences.
        String::from_utf8(out).map_err(|_| self.error_at(start, "invalid UTF-8 in string"))
    }

    fn parse_escape(&mut self, out: &mut Vec<u8>) -> Result<(), DecodeError> {
        let Some(esc) = self.bump() else {
            return Err(self.error_here("unexpected end of JSON input"));
        };
        let simple = match esc {
            b'"' => Some(b'"'),
            b'\\' => Some(b'\\'),
            b'/' => Some(b'/'),
            b'b' => Some(0x08),
            b'f' => Some(0x0C),
            b'n' => Some(b'\n'),
            b'r' => Some(b'\r'),
            b't' => Some(b'\t'),
            b'u' => None,
            other => {
                return Err(self.error_at(
                    self.pos - 1,
                    format!("invalid character {} in string escape code", describe_byte(other)),
                ));
            }
        };
        if let Some(byte) = simple {
            out.push(byte);
            return Ok(());
        }
        let first = self.parse_hex4()?;
        let code = if (0xD800..0xDC00).contains(&first) {
            // High surrogate: a low surrogate must follow, otherwise emit U+FFFD.
            let save = self.pos;
            if self.bytes.get(self.pos..self.pos + 2) == Some(b"\\u") {
                self.pos += 2;
                let second = self.parse_hex4()?;
                if (0xDC00..0xE000).contains(&second) {
                    0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00)
                } else {
                    self.pos = save;
                    0xFFFD
                }
            } else {
                0xFFFD
            }
        } else if (0xDC00..0xE000).contains(&first) {
            0xFFFD
        } else {
            first
        };
        let ch = char::from_u32(code).unwrap_or('\u{FFFD}');
        let mut buf = [0u8; 4];
        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }

    fn parse_hex4(&mut self) -> Result<u32, DecodeError> {
        let mut value: u32 = 0;
        for _ in 0..4 {
            let Some(ch) = self.peek() else {
                return Err(self.error_here("unexpected end of JSON input"));
            };
            let digit = match ch {
                b'0'..=b'9' => (ch - b'0') as u32,
                b'a'..=b'f' => (ch - b'a' + 10) as u32,
                b'A'..=b'F' => (ch - b'A' + 10) as u32,
                _ => return Err(self.unexpected("in \\u hexadecimal character escape")),
            };
            self.pos += 1;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn parse_array(&mut self, depth: usize) -> Result<JsonValue, DecodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(JsonValue::Array(items));
        }
        loop {
            items.push(self.parse_value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.unexpected("after array element")),
            }
        }
        Ok(JsonValue::Array(items))
    }

    fn parse_object(&mut self, depth: usize) -> Result<JsonValue, DecodeError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(JsonValue::Object(map));
        }
        loop {
            self.skip_ws();
            if self.peek() != Some(b'"') {
                return Err(self.unexpected("looking for beginning of object key string"));
            }
            let key = self.parse_string()?;
            self.skip_ws();
            if self.peek() != Some(b':') {
                return Err(self.unexpected("after object key"));
            }
            self.pos += 1;
            let value = self.parse_value(depth + 1)?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.unexpected("after object key:value pair")),
            }
        }
        Ok(JsonValue::Object(map))
    }
}

fn describe_byte(byte: u8) -> String {
    if byte.is_ascii_graphic() || byte == b' ' {
        format!("'{}'", byte as char)
    } else {
        format!("0x{byte:02x}")
    }
}
