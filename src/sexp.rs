//! S-expression parser for the libpurple OTR key store.
//!
//! Accepts the Rivest "basic transport" grammar extended with signed
//! integers and reals:
//!
//! ```text
//! sexp    := string | "(" (sexp | whitespace)* ")"
//! string  := ("[" simple "]")? simple
//! simple  := real | base64 | raw | decimal | token | hex | quoted
//! ```
//!
//! Alternatives of `simple` are tried in that order and the first one that
//! matches at the current position wins. Display hints (`[...]`) are parsed
//! and discarded. Nesting depth is bounded by memory only: lists are built
//! on an explicit stack, not by recursion.

use crate::KeyTrustError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use num_bigint::BigInt;
use std::fmt;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A parsed S-expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Bare identifier text.
    Token(String),
    /// Decimal integer literal.
    Integer(BigInt),
    /// Decimal literal with a fractional or exponent part.
    Real(f64),
    /// Raw, hex, base64 or quoted string contents.
    Bytes(Vec<u8>),
    /// Parenthesized group.
    List(Vec<Value>),
}

impl Value {
    /// The token text, if this is a bare token.
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Value::Token(t) => Some(t),
            _ => None,
        }
    }

    /// The payload of a raw, hex, base64 or quoted atom.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The elements of a list, in order.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }
}

/// Releases nested lists from a work stack so that dropping a deeply nested
/// value does not recurse.
impl Drop for Value {
    fn drop(&mut self) {
        let Value::List(items) = self else {
            return;
        };
        if !items.iter().any(Value::is_list) {
            return;
        }
        let mut pending = std::mem::take(items);
        while let Some(mut value) = pending.pop() {
            if let Value::List(children) = &mut value {
                pending.append(children);
            }
        }
    }
}

/// Renders the value back as S-expression text. Byte strings are written
/// as hex blobs, so the output re-parses to an equal value (reals aside,
/// which go through `f64` formatting).
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Iterators over the lists still being written, and whether each
        // has written its first element yet.
        let mut open: Vec<(std::slice::Iter<'_, Value>, bool)> = Vec::new();
        let mut current = self;
        loop {
            match current {
                Value::Token(t) => f.write_str(t)?,
                Value::Integer(n) => write!(f, "{}", n)?,
                Value::Real(r) => write!(f, "{:?}", r)?,
                Value::Bytes(b) => write!(f, "#{}#", hex::encode(b))?,
                Value::List(items) => {
                    f.write_str("(")?;
                    open.push((items.iter(), false));
                }
            }
            loop {
                let next = match open.last_mut() {
                    None => return Ok(()),
                    Some((items, started)) => items.next().map(|item| {
                        let separate = *started;
                        *started = true;
                        (item, separate)
                    }),
                };
                match next {
                    Some((item, separate)) => {
                        if separate {
                            f.write_str(" ")?;
                        }
                        current = item;
                        break;
                    }
                    None => {
                        f.write_str(")")?;
                        open.pop();
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Character classes
// ---------------------------------------------------------------------------

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'-' | b'.' | b'/' | b'_' | b':' | b'*' | b'+' | b'=' | b'!' | b'<' | b'>'
        )
}

fn is_base64_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'+' | b'/' | b'=')
}

/// Bytes that may legally follow a raw atom's payload.
fn is_delimiter(c: Option<u8>) -> bool {
    match c {
        None => true,
        Some(c) => c.is_ascii_whitespace() || c == b'(' || c == b')',
    }
}

// ---------------------------------------------------------------------------
// Atom grammar
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
    /// Last raw atom whose declared length ran across a `)`, as
    /// `(offset, declared, visible)`.
    overrun: Option<(usize, usize, usize)>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Cursor {
            input,
            pos: 0,
            overrun: None,
        }
    }

    fn byte(&self, at: usize) -> Option<u8> {
        self.input.get(at).copied()
    }

    fn peek(&self) -> Option<u8> {
        self.byte(self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn text(&self, start: usize, end: usize) -> String {
        String::from_utf8_lossy(&self.input[start..end]).into_owned()
    }

    fn count_digits(&self, at: usize) -> usize {
        self.input
            .get(at..)
            .map_or(0, |rest| rest.iter().take_while(|c| c.is_ascii_digit()).count())
    }

    /// End of a `0 | [1-9][0-9]*` run starting at `at`.
    fn decimal_end(&self, at: usize) -> Option<usize> {
        match self.byte(at) {
            Some(b'0') => Some(at + 1),
            Some(b'1'..=b'9') => Some(at + self.count_digits(at)),
            _ => None,
        }
    }

    fn parse_length(&self, start: usize, end: usize) -> Result<usize, KeyTrustError> {
        let text = self.text(start, end);
        text.parse()
            .map_err(|_| KeyTrustError::structural(start, format!("length '{}' is too large", text)))
    }

    /// Scan a `#hex#` blob starting at `at`; returns its end and bytes.
    fn scan_hex(&self, at: usize) -> Result<(usize, Vec<u8>), KeyTrustError> {
        let mut digits = String::new();
        let mut i = at + 1;
        loop {
            match self.byte(i) {
                None => return Err(KeyTrustError::structural(at, "unterminated hex atom")),
                Some(b'#') => break,
                Some(c) if c.is_ascii_hexdigit() => digits.push(c as char),
                Some(c) if c.is_ascii_whitespace() => {}
                Some(c) => {
                    return Err(KeyTrustError::structural(
                        i,
                        format!("invalid hex character '{}'", c.escape_ascii()),
                    ))
                }
            }
            i += 1;
        }
        if digits.len() % 2 == 1 {
            digits.insert(0, '0');
        }
        let bytes = hex::decode(&digits)
            .map_err(|e| KeyTrustError::structural(at, format!("malformed hex atom: {}", e)))?;
        Ok((i + 1, bytes))
    }

    fn check_length(
        &self,
        start: usize,
        declared: Option<usize>,
        actual: usize,
    ) -> Result<(), KeyTrustError> {
        match declared {
            Some(declared) if declared != actual => Err(KeyTrustError::LengthMismatch {
                offset: start,
                declared,
                actual,
            }),
            _ => Ok(()),
        }
    }

    fn real(&mut self) -> Result<Option<Value>, KeyTrustError> {
        let start = self.pos;
        let mut i = start;
        if matches!(self.byte(i), Some(b'+' | b'-')) {
            i += 1;
        }
        let int_digits = self.count_digits(i);
        if int_digits == 0 {
            return Ok(None);
        }
        i += int_digits;
        if self.byte(i) != Some(b'.') {
            return Ok(None);
        }
        i += 1;
        i += self.count_digits(i);
        if matches!(self.byte(i), Some(b'e' | b'E')) {
            let mut j = i + 1;
            if matches!(self.byte(j), Some(b'+' | b'-')) {
                j += 1;
            }
            let exp_digits = self.count_digits(j);
            if exp_digits > 0 {
                i = j + exp_digits;
            }
        }
        let text = self.text(start, i);
        let value: f64 = text
            .parse()
            .map_err(|_| KeyTrustError::structural(start, format!("invalid real '{}'", text)))?;
        self.pos = i;
        Ok(Some(Value::Real(value)))
    }

    fn base64(&mut self) -> Result<Option<Value>, KeyTrustError> {
        let start = self.pos;
        let mut i = start;
        let mut declared = None;
        if let Some(end) = self.decimal_end(i) {
            if self.byte(end) != Some(b'|') {
                return Ok(None);
            }
            declared = Some(self.parse_length(i, end)?);
            i = end;
        } else if self.byte(i) == Some(b'#') {
            match self.scan_hex(i) {
                Ok((end, bytes)) if self.byte(end) == Some(b'|') => {
                    declared = Some(bytes_to_length(start, &bytes)?);
                    i = end;
                }
                _ => return Ok(None),
            }
        }
        if self.byte(i) != Some(b'|') {
            return Ok(None);
        }

        let body = i + 1;
        let mut payload = Vec::new();
        let mut j = body;
        loop {
            match self.byte(j) {
                None => return Err(KeyTrustError::structural(start, "unterminated base64 atom")),
                Some(b'|') => break,
                Some(c) if c.is_ascii_whitespace() => {}
                Some(c) if is_base64_char(c) => payload.push(c),
                Some(c) => {
                    return Err(KeyTrustError::structural(
                        j,
                        format!("invalid base64 character '{}'", c.escape_ascii()),
                    ))
                }
            }
            j += 1;
        }
        let bytes = STANDARD
            .decode(&payload)
            .map_err(|e| KeyTrustError::structural(body, format!("malformed base64: {}", e)))?;
        self.check_length(start, declared, bytes.len())?;
        self.pos = j + 1;
        Ok(Some(Value::Bytes(bytes)))
    }

    fn raw(&mut self) -> Result<Option<Value>, KeyTrustError> {
        let start = self.pos;
        let Some(end) = self.decimal_end(start) else {
            return Ok(None);
        };
        if self.byte(end) != Some(b':') {
            return Ok(None);
        }
        let declared = self.parse_length(start, end)?;
        let body = end + 1;
        let stop = body
            .checked_add(declared)
            .filter(|stop| *stop <= self.input.len() && is_delimiter(self.byte(*stop)));
        let visible = self.input[body..]
            .iter()
            .take_while(|c| !is_delimiter(Some(**c)))
            .count();
        let Some(stop) = stop else {
            return Err(KeyTrustError::LengthMismatch {
                offset: start,
                declared,
                actual: visible,
            });
        };
        if visible < declared && self.byte(body + visible) == Some(b')') {
            self.overrun = Some((start, declared, visible));
        }
        self.pos = stop;
        Ok(Some(Value::Bytes(self.input[body..stop].to_vec())))
    }

    fn decimal(&mut self) -> Result<Option<Value>, KeyTrustError> {
        let start = self.pos;
        let digits = if self.byte(start) == Some(b'-') {
            start + 1
        } else {
            start
        };
        let Some(end) = self.decimal_end(digits) else {
            return Ok(None);
        };
        // An unsigned decimal directly before a quote is that string's length.
        if digits == start && self.byte(end) == Some(b'"') {
            return self.quoted();
        }
        let text = self.text(start, end);
        let value: BigInt = text
            .parse()
            .map_err(|_| KeyTrustError::structural(start, format!("invalid integer '{}'", text)))?;
        self.pos = end;
        Ok(Some(Value::Integer(value)))
    }

    fn token(&mut self) -> Option<Value> {
        let start = self.pos;
        let len = self.input[start..]
            .iter()
            .take_while(|c| is_token_char(**c))
            .count();
        if len == 0 {
            return None;
        }
        self.pos = start + len;
        Some(Value::Token(self.text(start, start + len)))
    }

    fn hex(&mut self) -> Result<Option<Value>, KeyTrustError> {
        if self.peek() != Some(b'#') {
            return Ok(None);
        }
        let (end, bytes) = self.scan_hex(self.pos)?;
        self.pos = end;
        Ok(Some(Value::Bytes(bytes)))
    }

    fn quoted(&mut self) -> Result<Option<Value>, KeyTrustError> {
        let start = self.pos;
        let mut i = start;
        let mut declared = None;
        if let Some(end) = self.decimal_end(i) {
            declared = Some(self.parse_length(i, end)?);
            i = end;
        }
        if self.byte(i) != Some(b'"') {
            return Ok(None);
        }
        i += 1;

        let mut out = Vec::new();
        loop {
            let Some(c) = self.byte(i) else {
                return Err(KeyTrustError::structural(start, "unterminated quoted string"));
            };
            i += 1;
            match c {
                b'"' => break,
                b'\\' => i = self.escape(i, &mut out)?,
                _ => out.push(c),
            }
        }
        self.check_length(start, declared, out.len())?;
        self.pos = i;
        Ok(Some(Value::Bytes(out)))
    }

    /// Decode the escape sequence following a backslash at `i - 1`.
    fn escape(&self, i: usize, out: &mut Vec<u8>) -> Result<usize, KeyTrustError> {
        let Some(c) = self.byte(i) else {
            return Err(KeyTrustError::structural(i - 1, "unterminated escape sequence"));
        };
        let simple = match c {
            b'b' => Some(0x08),
            b't' => Some(b'\t'),
            b'v' => Some(0x0b),
            b'n' => Some(b'\n'),
            b'f' => Some(0x0c),
            b'r' => Some(b'\r'),
            b'"' => Some(b'"'),
            b'\'' => Some(b'\''),
            b'\\' => Some(b'\\'),
            _ => None,
        };
        if let Some(byte) = simple {
            out.push(byte);
            return Ok(i + 1);
        }
        match c {
            // Line continuation: \<LF>, \<CR>, \<CR><LF>, \<LF><CR>.
            b'\n' | b'\r' => {
                let other = if c == b'\n' { b'\r' } else { b'\n' };
                if self.byte(i + 1) == Some(other) {
                    Ok(i + 2)
                } else {
                    Ok(i + 1)
                }
            }
            b'x' => {
                let digits = self.input.get(i + 1..i + 3).unwrap_or_default();
                if digits.len() != 2 || !digits.iter().all(u8::is_ascii_hexdigit) {
                    return Err(KeyTrustError::structural(i - 1, "invalid \\x escape"));
                }
                let text = String::from_utf8_lossy(digits);
                let byte = u8::from_str_radix(&text, 16)
                    .map_err(|_| KeyTrustError::structural(i - 1, "invalid \\x escape"))?;
                out.push(byte);
                Ok(i + 3)
            }
            b'0'..=b'7' => {
                let digits = self.input.get(i..i + 3).unwrap_or_default();
                if digits.len() != 3 || !digits.iter().all(|d| matches!(d, b'0'..=b'7')) {
                    return Err(KeyTrustError::structural(i - 1, "invalid octal escape"));
                }
                let text = String::from_utf8_lossy(digits);
                let byte = u8::from_str_radix(&text, 8)
                    .map_err(|_| KeyTrustError::structural(i - 1, "octal escape out of range"))?;
                out.push(byte);
                Ok(i + 3)
            }
            _ => Err(KeyTrustError::structural(
                i - 1,
                format!("unknown escape '\\{}'", c.escape_ascii()),
            )),
        }
    }

    fn simple_string(&mut self) -> Result<Value, KeyTrustError> {
        let start = self.pos;
        let value = if let Some(v) = self.real()? {
            v
        } else if let Some(v) = self.base64()? {
            v
        } else if let Some(v) = self.raw()? {
            v
        } else if let Some(v) = self.decimal()? {
            v
        } else if let Some(v) = self.token() {
            v
        } else if let Some(v) = self.hex()? {
            v
        } else if let Some(v) = self.quoted()? {
            v
        } else {
            let found = self.peek().map_or_else(
                || "end of input".to_string(),
                |c| format!("'{}'", c.escape_ascii()),
            );
            return Err(KeyTrustError::structural(
                start,
                format!("expected atom, found {}", found),
            ));
        };
        trace!(offset = start, "parsed atom");
        Ok(value)
    }

    /// An atom with its optional display hint.
    fn string(&mut self) -> Result<Value, KeyTrustError> {
        if self.peek() == Some(b'[') {
            let open = self.pos;
            self.pos += 1;
            self.skip_whitespace();
            let hint = self.simple_string()?;
            self.skip_whitespace();
            if self.peek() != Some(b']') {
                return Err(KeyTrustError::structural(
                    open,
                    "display hint is missing its closing ']'",
                ));
            }
            self.pos += 1;
            self.skip_whitespace();
            trace!(offset = open, hint = %hint, "discarding display hint");
        }
        self.simple_string()
    }

    // -----------------------------------------------------------------------
    // Parser
    // -----------------------------------------------------------------------

    fn sexp(&mut self) -> Result<Value, KeyTrustError> {
        // Offsets of open parentheses and the items collected so far.
        let mut open: Vec<(usize, Vec<Value>)> = Vec::new();
        loop {
            self.skip_whitespace();
            let start = self.pos;
            let value = match self.peek() {
                None => {
                    // A raw atom that swallowed a `)` explains the missing one.
                    if let (Some(_), Some((offset, declared, actual))) = (open.last(), self.overrun) {
                        return Err(KeyTrustError::LengthMismatch {
                            offset,
                            declared,
                            actual,
                        });
                    }
                    return Err(match open.last() {
                        Some((at, _)) => KeyTrustError::structural(
                            start,
                            format!("unbalanced '(' opened at offset {}", at),
                        ),
                        None => KeyTrustError::structural(start, "empty input"),
                    })
                }
                Some(b'(') => {
                    self.pos += 1;
                    open.push((start, Vec::new()));
                    continue;
                }
                Some(b')') => match open.pop() {
                    Some((_, items)) => {
                        self.pos += 1;
                        Value::List(items)
                    }
                    None => return Err(KeyTrustError::structural(start, "unexpected ')'")),
                },
                Some(_) => self.string()?,
            };
            match open.last_mut() {
                Some((_, items)) => items.push(value),
                None => return Ok(value),
            }
        }
    }
}

fn bytes_to_length(offset: usize, bytes: &[u8]) -> Result<usize, KeyTrustError> {
    bytes.iter().try_fold(0usize, |acc, b| {
        acc.checked_mul(256)
            .and_then(|acc| acc.checked_add(usize::from(*b)))
            .ok_or_else(|| KeyTrustError::structural(offset, "hex length is too large"))
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a complete S-expression from raw bytes.
///
/// Leading and trailing whitespace is ignored; anything else after the
/// first complete expression is an error.
///
/// # Errors
/// - `KeyTrustError::Structural` on any grammar violation
/// - `KeyTrustError::LengthMismatch` when a raw, quoted or base64 atom's
///   declared length disagrees with its payload
/// - `KeyTrustError::TrailingData` when input remains after the expression
pub fn parse_bytes(input: &[u8]) -> Result<Value, KeyTrustError> {
    let mut cursor = Cursor::new(input);
    let value = cursor.sexp()?;
    cursor.skip_whitespace();
    if !cursor.at_end() {
        return Err(KeyTrustError::TrailingData {
            offset: cursor.pos,
            remaining: input.len() - cursor.pos,
        });
    }
    debug!(len = input.len(), "parsed s-expression");
    Ok(value)
}

/// Parse a complete S-expression from text.
///
/// # Example
/// ```
/// use otr_keytrust::sexp::{parse, Value};
/// let value = parse("(a b)").unwrap();
/// assert_eq!(value.as_list().map(|l| l.len()), Some(2));
/// ```
pub fn parse(source: &str) -> Result<Value, KeyTrustError> {
    parse_bytes(source.as_bytes())
}
