//! Small lexical helpers shared by the partition and DDL code.
//!
//! These only understand what ClickHouse prints back in `system.*` columns
//! and `SHOW CREATE TABLE`: single-quoted strings with backslash escapes,
//! backquoted identifiers and balanced parentheses.

/// Quote a string as a ClickHouse string literal.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Identifier as it must appear in a statement: plain names unchanged,
/// anything else backquoted.
pub fn quote_identifier(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && ident.bytes().all(is_ident_byte);
    if plain {
        return ident.to_string();
    }

    let mut out = String::with_capacity(ident.len() + 2);
    out.push('`');
    for c in ident.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '`' => out.push_str("\\`"),
            _ => out.push(c),
        }
    }
    out.push('`');
    out
}

/// `database.table`, each part quoted when needed.
pub fn qualified(database: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(database), quote_identifier(table))
}

/// Remove backquotes or double quotes around an identifier.
pub fn unquote_identifier(ident: &str) -> &str {
    let ident = ident.trim();
    for q in ['`', '"', '\''] {
        if ident.len() >= 2 && ident.starts_with(q) && ident.ends_with(q) {
            return &ident[1..ident.len() - 1];
        }
    }
    ident
}

/// Tracks whether a byte offset is inside a quoted section or parentheses.
#[derive(Debug, Default)]
pub(crate) struct Scanner {
    depth: usize,
    quote: Option<char>,
    escaped: bool,
}

impl Scanner {
    /// Feed one character; returns true if it is at top level
    /// (outside quotes and parentheses) before being consumed.
    pub(crate) fn step(&mut self, c: char) -> bool {
        let top_level = self.quote.is_none() && self.depth == 0;
        if let Some(q) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == q {
                self.quote = None;
            }
            return false;
        }
        match c {
            '\'' | '`' | '"' => self.quote = Some(c),
            '(' => self.depth += 1,
            ')' => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        top_level
    }
}

/// Split on commas that are not inside quotes or parentheses.
pub fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut scanner = Scanner::default();
    let mut start = 0;

    for (idx, c) in input.char_indices() {
        if scanner.step(c) && c == ',' {
            parts.push(&input[start..idx]);
            start = idx + 1;
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Strip one pair of parentheses if they enclose the whole input.
pub fn strip_enclosing_parens(input: &str) -> &str {
    let trimmed = input.trim();
    if !trimmed.starts_with('(') || !trimmed.ends_with(')') {
        return trimmed;
    }
    match matching_paren(trimmed, 0) {
        Some(end) if end == trimmed.len() - 1 => trimmed[1..end].trim(),
        _ => trimmed,
    }
}

/// Byte offset of the parenthesis closing the one at `open`.
pub(crate) fn matching_paren(input: &str, open: usize) -> Option<usize> {
    let mut scanner = Scanner::default();
    for (idx, c) in input[open..].char_indices() {
        scanner.step(c);
        if c == ')' && scanner.depth == 0 && scanner.quote.is_none() {
            return Some(open + idx);
        }
    }
    None
}

/// Byte offset of the first top-level occurrence of `keyword` as a whole
/// word (case-insensitive) at or after `from`.
pub(crate) fn find_keyword(input: &str, keyword: &str, from: usize) -> Option<usize> {
    let mut scanner = Scanner::default();
    let bytes = input.as_bytes();
    let kw_len = keyword.len();

    for (idx, c) in input.char_indices() {
        let top_level = scanner.step(c);
        if idx < from || !top_level {
            continue;
        }
        let end = idx + kw_len;
        if end > input.len() || !input.is_char_boundary(end) {
            continue;
        }
        if !input[idx..end].eq_ignore_ascii_case(keyword) {
            continue;
        }
        let before_ok = idx == 0 || !is_ident_byte(bytes[idx - 1]);
        let after_ok = end == input.len() || !is_ident_byte(bytes[end]);
        if before_ok && after_ok {
            return Some(idx);
        }
    }
    None
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Collapse runs of whitespace outside string literals into single spaces.
pub fn normalize_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut scanner = Scanner::default();
    let mut pending_space = false;

    for c in input.trim().chars() {
        let in_quote = scanner.quote.is_some();
        scanner.step(c);
        if !in_quote && c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    out
}
