//! Best-effort repair of almost-JSON text produced by language models.
//!
//! The repairer walks the input once and re-emits it as strict JSON. It
//! handles trailing or stray commas, missing commas, unquoted keys and
//! values, single or typographic quotes, unterminated strings, missing
//! closing brackets, comments, and Python-style constants. It never panics;
//! input it cannot make sense of yields a [`RepairError`].

use thiserror::Error;

const MAX_DEPTH: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepairError {
    #[error("unexpected end of input")]
    EmptyInput,
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
    #[error("unexpected character '{ch}' at position {pos}")]
    Unexpected { ch: char, pos: usize },
}

pub fn repair_json(input: &str) -> Result<String, RepairError> {
    let mut repairer = Repairer {
        chars: input.chars().collect(),
        pos: 0,
        out: String::with_capacity(input.len() + 16),
    };
    repairer.skip_whitespace();
    if repairer.at_end() {
        return Err(RepairError::EmptyInput);
    }
    repairer.value(0)?;
    Ok(repairer.out)
}

struct Repairer {
    chars: Vec<char>,
    pos: usize,
    out: String,
}

impl Repairer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_whitespace(&mut self) {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => self.pos += 1,
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                (Some('/'), Some('*')) => {
                    self.pos += 2;
                    while !self.at_end() {
                        if self.peek() == Some('*') && self.peek_at(1) == Some('/') {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn value(&mut self, depth: usize) -> Result<(), RepairError> {
        self.skip_whitespace();
        match self.peek() {
            None => {
                self.out.push_str("null");
                Ok(())
            }
            Some('{') => self.object(depth + 1),
            Some('[') => self.array(depth + 1),
            Some(c) if is_quote(c) => {
                let text = self.string();
                push_json_string(&mut self.out, &text);
                Ok(())
            }
            Some(c) if c == '-' || c == '.' || c.is_ascii_digit() => {
                self.number();
                Ok(())
            }
            Some(_) => self.literal(),
        }
    }

    fn object(&mut self, depth: usize) -> Result<(), RepairError> {
        if depth > MAX_DEPTH {
            return Err(RepairError::TooDeep(MAX_DEPTH));
        }
        self.pos += 1;
        self.out.push('{');
        let mut first = true;
        loop {
            self.skip_whitespace();
            let start = self.pos;
            match self.peek() {
                None => break,
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                // Mismatched closer: end this object and let the parent consume it.
                Some(']') => break,
                Some(',') => {
                    self.pos += 1;
                    continue;
                }
                Some(_) => {
                    if !first {
                        self.out.push(',');
                    }
                    first = false;
                    let key = self.key();
                    push_json_string(&mut self.out, &key);
                    self.skip_whitespace();
                    if self.peek() == Some(':') {
                        self.pos += 1;
                    }
                    self.out.push(':');
                    self.skip_whitespace();
                    match self.peek() {
                        None | Some('}') | Some(']') | Some(',') => self.out.push_str("null"),
                        Some(_) => self.value(depth)?,
                    }
                }
            }
            if self.pos == start {
                self.pos += 1;
            }
        }
        self.out.push('}');
        Ok(())
    }

    fn array(&mut self, depth: usize) -> Result<(), RepairError> {
        if depth > MAX_DEPTH {
            return Err(RepairError::TooDeep(MAX_DEPTH));
        }
        self.pos += 1;
        self.out.push('[');
        let mut first = true;
        loop {
            self.skip_whitespace();
            let start = self.pos;
            match self.peek() {
                None => break,
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some('}') => break,
                Some(',') => {
                    self.pos += 1;
                    continue;
                }
                Some(_) => {
                    if !first {
                        self.out.push(',');
                    }
                    first = false;
                    self.value(depth)?;
                }
            }
            if self.pos == start {
                self.pos += 1;
            }
        }
        self.out.push(']');
        Ok(())
    }

    fn key(&mut self) -> String {
        if self.peek().is_some_and(is_quote) {
            return self.string();
        }
        let mut key = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, ':' | ',' | '{' | '}' | '[' | ']') || c.is_whitespace() || is_quote(c) {
                break;
            }
            key.push(c);
            self.pos += 1;
        }
        key
    }

    /// Reads a quoted string and returns its decoded contents.
    fn string(&mut self) -> String {
        let open = self.chars[self.pos];
        let close = match open {
            '\u{201C}' | '\u{201D}' => '\u{201D}',
            other => other,
        };
        self.pos += 1;
        let content_start = self.pos;
        let mut text = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == close || (close == '\u{201D}' && c == '\u{201C}') {
                return text;
            }
            if c != '\\' {
                text.push(c);
                continue;
            }
            let Some(escaped) = self.peek() else {
                break;
            };
            self.pos += 1;
            match escaped {
                '"' | '\\' | '/' | '\'' => text.push(escaped),
                'b' => text.push('\u{8}'),
                'f' => text.push('\u{c}'),
                'n' => text.push('\n'),
                'r' => text.push('\r'),
                't' => text.push('\t'),
                'u' => text.push(self.unicode_escape()),
                other => {
                    text.push('\\');
                    text.push(other);
                }
            }
        }

        // Unterminated: give trailing closers back to the enclosing containers.
        let consumed = self.pos - content_start;
        let mut trailing = 0;
        for c in self.chars[content_start..self.pos].iter().rev() {
            if matches!(c, '}' | ']') || c.is_whitespace() {
                trailing += 1;
            } else {
                break;
            }
        }
        if trailing > 0 && trailing < consumed {
            self.pos -= trailing;
            let keep = text.chars().count().saturating_sub(trailing);
            text = text.chars().take(keep).collect();
        }
        text
    }

    fn unicode_escape(&mut self) -> char {
        let Some(high) = self.hex4() else {
            return '\u{FFFD}';
        };
        if (0xD800..0xDC00).contains(&high)
            && self.peek() == Some('\\')
            && self.peek_at(1) == Some('u')
        {
            let saved = self.pos;
            self.pos += 2;
            if let Some(low) = self.hex4().filter(|low| (0xDC00..0xE000).contains(low)) {
                let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                return char::from_u32(combined).unwrap_or('\u{FFFD}');
            }
            self.pos = saved;
        }
        char::from_u32(high).unwrap_or('\u{FFFD}')
    }

    fn hex4(&mut self) -> Option<u32> {
        let digits: String = self.chars.get(self.pos..self.pos + 4)?.iter().collect();
        let value = u32::from_str_radix(&digits, 16).ok()?;
        self.pos += 4;
        Some(value)
    }

    fn number(&mut self) {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let raw: String = self.chars[start..self.pos].iter().collect();
        let mut candidate = raw.trim_end_matches(['.', 'e', 'E', '-', '+']).to_string();
        if candidate.starts_with('.') {
            candidate.insert(0, '0');
        } else if candidate.starts_with("-.") {
            candidate.insert(1, '0');
        }
        if is_json_number(&candidate) {
            self.out.push_str(&candidate);
        } else {
            push_json_string(&mut self.out, &raw);
        }
    }

    fn literal(&mut self) -> Result<(), RepairError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let at_boundary = match self.peek() {
            None => true,
            Some(c) => c.is_whitespace() || matches!(c, ',' | '}' | ']'),
        };
        if at_boundary {
            let constant = match word.as_str() {
                "true" | "True" => Some("true"),
                "false" | "False" => Some("false"),
                "null" | "None" | "undefined" => Some("null"),
                _ => None,
            };
            if let Some(constant) = constant {
                self.out.push_str(constant);
                return Ok(());
            }
        }

        self.pos = start;
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, ',' | '}' | ']' | '\n' | '\r') {
                break;
            }
            text.push(c);
            self.pos += 1;
        }
        if self.pos == start {
            return Err(RepairError::Unexpected {
                ch: self.chars[start],
                pos: start,
            });
        }
        push_json_string(&mut self.out, text.trim_end());
        Ok(())
    }
}

fn is_quote(c: char) -> bool {
    matches!(c, '"' | '\'' | '\u{201C}' | '\u{201D}')
}

fn is_json_number(candidate: &str) -> bool {
    !candidate.is_empty()
        && serde_json::from_str::<serde_json::Value>(candidate)
            .map(|value| value.is_number())
            .unwrap_or(false)
}

fn push_json_string(out: &mut String, text: &str) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}
