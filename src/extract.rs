//! Position-based extraction of string values from raw file text.
//!
//! The host supplies a character range for every key, so a value can be read
//! straight out of the text without parsing the surrounding document.

use crate::model::{CharRange, FileString};
use std::collections::BTreeMap;
use std::str::Chars;

/// Line view over a raw file, built once and reused for every key of that file.
#[derive(Debug)]
pub struct LineIndex<'a> {
    lines: Vec<&'a str>,
}

impl<'a> LineIndex<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self {
            lines: raw.lines().collect(),
        }
    }

    /// Raw text covered by `range`, or `None` when the range does not fit the file.
    pub fn slice(&self, range: &CharRange) -> Option<String> {
        let (start_line, start_col) = range.start;
        let (end_line, end_col) = range.end;

        if start_line == 0 || end_line < start_line {
            return None;
        }

        let first = self.lines.get(start_line - 1)?;
        let last = self.lines.get(end_line - 1)?;

        if start_line == end_line {
            if end_col < start_col {
                return None;
            }
            return Some(char_slice(first, start_col, end_col));
        }

        let mut out = char_slice(first, start_col, usize::MAX);
        for line in self.lines.get(start_line..end_line - 1).unwrap_or_default() {
            out.push('\n');
            out.push_str(line);
        }
        out.push('\n');
        out.push_str(&char_slice(last, 0, end_col));
        Some(out)
    }

    /// Decoded value at `range`; empty when the range is malformed.
    pub fn extract(&self, range: &CharRange) -> String {
        self.slice(range).map(|s| unquote(&s)).unwrap_or_default()
    }
}

/// Decode the string value at `range` in `raw`.
///
/// Returns an empty string when the range references lines outside the text.
/// Callers must read that as "could not extract", not as an empty translation.
pub fn extract(raw: &str, range: &CharRange) -> String {
    LineIndex::new(raw).extract(range)
}

/// Extract every key of a file, ordered by position. Keys whose range does not
/// fit the text are dropped.
pub fn extract_all(raw: &str, ranges: &BTreeMap<String, CharRange>) -> Vec<FileString> {
    let index = LineIndex::new(raw);
    let mut strings: Vec<FileString> = ranges
        .iter()
        .filter_map(|(key, range)| {
            index.slice(range).map(|span| FileString {
                key: key.clone(),
                value: unquote(&span),
                char_range: *range,
            })
        })
        .collect();

    strings.sort_by(|a, b| a.char_range.start.cmp(&b.char_range.start));
    strings
}

fn char_slice(line: &str, from: usize, to: usize) -> String {
    line.chars().skip(from).take(to.saturating_sub(from)).collect()
}

/// Strip one layer of string quoting and resolve escapes left to right.
///
/// Unquoted spans are returned unchanged. Content after the closing quote
/// (a trailing comma, for instance) is ignored.
pub fn unquote(span: &str) -> String {
    let trimmed = span.trim();
    let mut chars = trimmed.chars();
    let quote = match chars.next() {
        Some(c @ ('"' | '\'')) => c,
        _ => return span.to_string(),
    };

    let mut out = String::with_capacity(trimmed.len());
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('"') => out.push('"'),
                Some('\'') => out.push('\''),
                Some('\\') => out.push('\\'),
                Some('/') => out.push('/'),
                Some('u') => push_unicode_escape(&mut chars, &mut out),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            c if c == quote => break,
            c => out.push(c),
        }
    }
    out
}

fn take_hex4(chars: &mut Chars<'_>) -> Option<u32> {
    let mut lookahead = chars.clone();
    let digits: String = lookahead.by_ref().take(4).collect();
    if digits.chars().count() != 4 {
        return None;
    }
    let code = u32::from_str_radix(&digits, 16).ok()?;
    *chars = lookahead;
    Some(code)
}

fn push_unicode_escape(chars: &mut Chars<'_>, out: &mut String) {
    let Some(high) = take_hex4(chars) else {
        out.push_str("\\u");
        return;
    };

    if (0xD800..=0xDBFF).contains(&high) {
        let mut lookahead = chars.clone();
        if lookahead.next() == Some('\\') && lookahead.next() == Some('u') {
            if let Some(low) = take_hex4(&mut lookahead) {
                if (0xDC00..=0xDFFF).contains(&low) {
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    out.push(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER));
                    *chars = lookahead;
                    return;
                }
            }
        }
        out.push(char::REPLACEMENT_CHARACTER);
        return;
    }

    out.push(char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER));
}
