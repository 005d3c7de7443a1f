// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Codec for the control-socket wire format: one S-expression per frame,
//! `(verb payload…)` inbound and `(verb(body))` outbound.

/// Splits a frame into its top-level tokens.
///
/// The frame must be a single parenthesized list. Whitespace separates
/// tokens; a nested `( … )` group is returned as one token holding its inner
/// text with inner parentheses preserved; double quotes toggle a mode in
/// which whitespace and parentheses are literal. Any malformed frame (missing
/// outer parentheses, unbalanced nesting, unterminated quote) decodes to an
/// empty vector.
pub fn decode(input: &[u8]) -> Vec<String> {
    let Ok(text) = std::str::from_utf8(input) else {
        return Vec::new();
    };
    let text = text.trim_matches(|c: char| c.is_ascii_whitespace());
    let bytes = text.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'(' || bytes[bytes.len() - 1] != b')' {
        return Vec::new();
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quotes = false;

    for c in text[1..text.len() - 1].chars() {
        if in_quotes {
            if c == '"' {
                in_quotes = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '(' => {
                if depth == 0 {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push('(');
                }
                depth += 1;
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Vec::new();
                }
                if depth == 0 {
                    tokens.push(std::mem::take(&mut current));
                } else {
                    current.push(')');
                }
            }
            ' ' | '\t' | '\n' => {
                if depth == 0 {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push(c);
                }
            }
            c => current.push(c),
        }
    }

    if in_quotes || depth != 0 {
        return Vec::new();
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// `encode(verb, body)` → `(verb(body))`. No escaping is performed; callers
/// must not embed an unbalanced `)` in `body`.
pub fn encode(verb: &str, body: &str) -> String {
    format!("({verb}({body}))")
}
