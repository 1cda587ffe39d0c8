use std::ops::Range;

use crate::error::{CompileErrorKind, Position};

/// A cursor over a template source buffer.
///
/// All directive syntax is ASCII, so the scanner walks bytes: a UTF-8
/// continuation byte can never be mistaken for a sigil, brace or quote.
pub(crate) struct Scanner<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
}

#[inline]
const fn is_sigil(byte: u8) -> bool {
    byte == b'@' || byte == b'$'
}

#[inline]
const fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

const fn closer_for(open: u8) -> Option<u8> {
    match open {
        b'{' => Some(b'}'),
        b'[' => Some(b']'),
        b'(' => Some(b')'),
        _ => None,
    }
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Scanner {
            input,
            bytes: input.as_bytes(),
            pos: 0,
            line: 1,
            line_start_pos: 0,
        }
    }

    #[inline]
    pub(crate) fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    #[inline]
    pub(crate) const fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn position(&self) -> Position {
        let column = self
            .input
            .get(self.line_start_pos..self.pos)
            .map_or(0, |text| text.chars().count())
            .saturating_add(1);
        Position {
            offset: self.pos,
            line: self.line,
            column,
        }
    }

    #[inline]
    pub(crate) fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos.saturating_add(offset)).copied()
    }

    /// Consumes one byte, keeping the line counter in step.
    pub(crate) fn advance(&mut self) -> Option<u8> {
        let byte = self.peek(0)?;
        self.pos = self.pos.saturating_add(1);
        if byte == b'\n' {
            self.line = self.line.saturating_add(1);
            self.line_start_pos = self.pos;
        }
        Some(byte)
    }

    /// Returns the length of a directive head (`@name{`) starting `offset`
    /// bytes ahead, including the sigil and the opening brace.
    fn directive_head_len(&self, offset: usize) -> Option<usize> {
        if !is_sigil(self.peek(offset)?) {
            return None;
        }
        let mut len = 1usize;
        // Identifiers must not start with a digit, so `$5{` stays text.
        if self
            .peek(offset.saturating_add(len))
            .is_some_and(|b| b.is_ascii_digit())
        {
            return None;
        }
        while self
            .peek(offset.saturating_add(len))
            .is_some_and(is_identifier_byte)
        {
            len = len.saturating_add(1);
        }
        (self.peek(offset.saturating_add(len)) == Some(b'{')).then(|| len.saturating_add(1))
    }

    /// Whether the cursor sits on `@name{` / `${` (the name may be empty).
    pub(crate) fn at_directive_start(&self) -> bool {
        self.directive_head_len(0).is_some()
    }

    /// Whether the cursor sits on a doubled sigil that escapes a directive,
    /// e.g. `@@if{`. Checked before any identifier capture.
    pub(crate) fn at_escaped_sigil(&self) -> bool {
        match (self.peek(0), self.peek(1)) {
            (Some(first), Some(second)) if is_sigil(first) && first == second => {
                self.directive_head_len(1).is_some()
            }
            _ => false,
        }
    }

    /// Consumes the identifier following a sigil. May be empty.
    pub(crate) fn capture_identifier(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek(0).is_some_and(is_identifier_byte) {
            self.advance();
        }
        self.input.get(start..self.pos).unwrap_or_default()
    }

    /// Captures a balanced region. The cursor must sit just after `open`;
    /// on success it is left just after the matching closer and the span
    /// between the delimiters is returned.
    ///
    /// Nested `{`, `[` and `(` are tracked, and quoted strings are skipped
    /// so delimiters inside them do not count.
    pub(crate) fn capture_balanced(&mut self, open: u8) -> Result<Range<usize>, CompileErrorKind> {
        let close = closer_for(open).unwrap_or(open);
        let unterminated = CompileErrorKind::UnterminatedCapture {
            open: char::from(open),
            close: char::from(close),
        };
        let start = self.pos;
        let mut expected = vec![close];

        while let Some(byte) = self.advance() {
            match byte {
                b'"' | b'\'' => self.skip_string(byte).map_err(|()| unterminated.clone())?,
                b'{' | b'[' | b'(' => expected.extend(closer_for(byte)),
                b'}' | b']' | b')' if expected.last() == Some(&byte) => {
                    expected.pop();
                    if expected.is_empty() {
                        return Ok(start..self.pos.saturating_sub(1));
                    }
                }
                _ => {}
            }
        }

        Err(unterminated)
    }

    fn skip_string(&mut self, quote: u8) -> Result<(), ()> {
        while let Some(byte) = self.advance() {
            if byte == b'\\' {
                self.advance();
            } else if byte == quote {
                return Ok(());
            }
        }
        Err(())
    }
}

/// Splits `range` of `source` on `separator`, ignoring separators nested in
/// brackets or quoted strings. Returned ranges are absolute.
pub(crate) fn split_top_level(source: &str, range: Range<usize>, separator: u8) -> Vec<Range<usize>> {
    let bytes = source.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut part_start = range.start;
    let mut idx = range.start;

    while idx < range.end {
        let Some(&byte) = bytes.get(idx) else { break };
        match quote {
            Some(q) => {
                if byte == b'\\' {
                    idx = idx.saturating_add(1);
                } else if byte == q {
                    quote = None;
                }
            }
            None => match byte {
                b'"' | b'\'' => quote = Some(byte),
                b'{' | b'[' | b'(' => depth = depth.saturating_add(1),
                b'}' | b']' | b')' => depth = depth.saturating_sub(1),
                b if b == separator && depth == 0 => {
                    parts.push(part_start..idx);
                    part_start = idx.saturating_add(1);
                }
                _ => {}
            },
        }
        idx = idx.saturating_add(1);
    }

    parts.push(part_start..range.end);
    parts
}

/// Narrows `range` to exclude leading and trailing whitespace.
pub(crate) fn trim_range(source: &str, range: Range<usize>) -> Range<usize> {
    let text = source.get(range.clone()).unwrap_or_default();
    let leading = text.len().saturating_sub(text.trim_start().len());
    let trailing = text.len().saturating_sub(text.trim_end().len());
    if leading == text.len() {
        return range.start..range.start;
    }
    range.start.saturating_add(leading)..range.end.saturating_sub(trailing)
}
