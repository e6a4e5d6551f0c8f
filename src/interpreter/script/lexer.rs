//! Tokenizer with Python's indentation rules.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string, escapes already processed.
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Name(name) => write!(f, "'{name}'"),
            Tok::Int(i) => write!(f, "{i}"),
            Tok::Float(x) => write!(f, "{x}"),
            Tok::Str(_) | Tok::FStr(_) => f.write_str("string literal"),
            Tok::Op(op) => write!(f, "'{op}'"),
            Tok::Newline => f.write_str("newline"),
            Tok::Indent => f.write_str("indent"),
            Tok::Dedent => f.write_str("dedent"),
            Tok::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: u32,
}

/// A tokenizer or parser failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyntaxError {
    pub message: String,
    pub line: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

const OPS3: [&str; 3] = ["**=", "//=", "..."];
const OPS2: [&str; 14] = [
    "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "<<", ">>",
];
const OPS1: [&str; 17] = [
    "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".",
];
const OPS1_EXTRA: [&str; 6] = [";", "@", "&", "|", "^", "~"];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line)
    }

    fn run(&mut self) -> Result<(), SyntaxError> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    continue;
                }
                at_line_start = false;
            }
            let Some(c) = self.peek(0) else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push(Tok::Newline);
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                '"' | '\'' => {
                    let text = self.string(false)?;
                    self.push(Tok::Str(text));
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).is_some_and(|d| d.is_ascii_digit()) => self.number()?,
                c if c == '_' || c.is_alphabetic() => self.name_or_prefixed_string()?,
                _ => self.operator()?,
            }
        }
        if !matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Dedent)
        ) {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    /// Measure indentation at the start of a logical line. Returns `false`
    /// when the line is blank or a comment and was consumed.
    fn indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut col = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => col += 1,
                '\t' => col += 8 - col % 8,
                '\x0c' => col = 0,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek(0) {
            None => return Ok(false),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(false);
            }
            Some('\r') => {
                self.pos += 1;
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            _ => {}
        }
        let top = self.indents.last().copied().unwrap_or(0);
        if col > top {
            self.indents.push(col);
            self.push(Tok::Indent);
        } else {
            while col < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if col != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn name_or_prefixed_string(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c == '_' || c.is_alphanumeric())
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if matches!(self.peek(0), Some('"') | Some('\'')) {
            let lower = name.to_ascii_lowercase();
            let (raw, formatted) = match lower.as_str() {
                "r" => (true, false),
                "f" => (false, true),
                "fr" | "rf" => (true, true),
                "u" => (false, false),
                "b" | "br" | "rb" => return Err(self.error("bytes literals are not supported")),
                _ => {
                    self.push(Tok::Name(name));
                    return Ok(());
                }
            };
            let text = self.string(raw)?;
            self.push(if formatted { Tok::FStr(text) } else { Tok::Str(text) });
            return Ok(());
        }
        self.push(Tok::Name(name));
        Ok(())
    }

    fn string(&mut self, raw: bool) -> Result<String, SyntaxError> {
        let quote = self.peek(0).ok_or_else(|| self.error("expected string"))?;
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let start_line = self.line;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(SyntaxError::new("unterminated string literal", start_line));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(text);
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(text);
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(SyntaxError::new("unterminated string literal", start_line));
                }
                self.line += 1;
            }
            if c == '\\' {
                let next = self.peek(1);
                if raw {
                    text.push('\\');
                    if let Some(n) = next {
                        text.push(n);
                        if n == '\n' {
                            self.line += 1;
                        }
                        self.pos += 1;
                    }
                    self.pos += 1;
                    continue;
                }
                self.pos += 2;
                match next {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some('\\') => text.push('\\'),
                    Some('\'') => text.push('\''),
                    Some('"') => text.push('"'),
                    Some('\n') => self.line += 1,
                    Some('x') => text.push(self.hex_escape(2)?),
                    Some('u') => text.push(self.hex_escape(4)?),
                    Some('U') => text.push(self.hex_escape(8)?),
                    Some(other) => {
                        text.push('\\');
                        text.push(other);
                    }
                    None => return Err(SyntaxError::new("unterminated string literal", start_line)),
                }
                continue;
            }
            text.push(c);
            self.pos += 1;
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, SyntaxError> {
        let end = self.pos + digits;
        if end > self.chars.len() {
            return Err(self.error("truncated escape sequence"));
        }
        let hex: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error(format!("invalid escape sequence '{hex}'")))
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        if self.peek(0) == Some('0') && matches!(self.peek(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B')) {
            let radix = match self.peek(1) {
                Some('x' | 'X') => 16,
                Some('o' | 'O') => 8,
                _ => 2,
            };
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek(0).is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            let value = i64::from_str_radix(&digits, radix)
                .map_err(|_| self.error("invalid integer literal"))?;
            self.push(Tok::Int(value));
            return Ok(());
        }

        let mut is_float = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float && self.peek(1) != Some('.') {
                is_float = true;
                self.pos += 1;
            } else if matches!(c, 'e' | 'E')
                && (self.peek(1).is_some_and(|d| d.is_ascii_digit())
                    || (matches!(self.peek(1), Some('+' | '-'))
                        && self.peek(2).is_some_and(|d| d.is_ascii_digit())))
            {
                is_float = true;
                self.pos += 2;
                while self.peek(0).is_some_and(|d| d.is_ascii_digit()) {
                    self.pos += 1;
                }
                break;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error(format!("invalid float literal '{text}'")))?;
            self.push(Tok::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.error(format!("integer literal too large: {text}")))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn operator(&mut self) -> Result<(), SyntaxError> {
        let ahead = |n: usize| -> String { (0..n).filter_map(|i| self.peek(i)).collect() };
        let three = ahead(3);
        let two = ahead(2);
        let one = ahead(1);
        let op = OPS3
            .iter()
            .find(|op| **op == three)
            .or_else(|| OPS2.iter().find(|op| **op == two))
            .or_else(|| OPS1.iter().chain(OPS1_EXTRA.iter()).find(|op| **op == one))
            .copied();
        let Some(op) = op else {
            return Err(self.error(format!("invalid character '{one}'")));
        };
        self.pos += op.chars().count();
        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.push(Tok::Op(op));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            toks("x = 1\n"),
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let tokens = toks("if x:\n    y = 1\nz = 2");
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
        assert_eq!(tokens.last(), Some(&Tok::Eof));
    }

    #[test]
    fn test_brackets_join_lines() {
        let tokens = toks("x = [1,\n     2]\n");
        assert_eq!(tokens.iter().filter(|t| **t == Tok::Newline).count(), 1);
        assert!(!tokens.contains(&Tok::Indent));
    }

    #[test]
    fn test_strings_and_prefixes() {
        assert_eq!(toks("'a\\nb'")[0], Tok::Str("a\nb".into()));
        assert_eq!(toks("r'a\\nb'")[0], Tok::Str("a\\nb".into()));
        assert_eq!(toks("f'{x}!'")[0], Tok::FStr("{x}!".into()));
        assert_eq!(toks("\"\"\"one\ntwo\"\"\"")[0], Tok::Str("one\ntwo".into()));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(toks("1_000")[0], Tok::Int(1000));
        assert_eq!(toks("2.5")[0], Tok::Float(2.5));
        assert_eq!(toks("1e3")[0], Tok::Float(1000.0));
        assert_eq!(toks("0xff")[0], Tok::Int(255));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let tokens = toks("# header\n\nx = 1  # trailing\n\n");
        assert_eq!(
            tokens,
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_bad_dedent_is_an_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("x = 'abc").is_err());
    }
}
