// ABOUTME: Syntax highlighter for the REPL with ANSI color support
// Implements rustyline's Highlighter trait to colorize Lisp syntax
// elements while preserving display width

use rustyline::completion::Completer;
use rustyline::highlight::{CmdKind, Highlighter};
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::Helper;
use std::borrow::Cow;

// ANSI color codes (3-bit/4-bit colors for maximum terminal compatibility)
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_PARENS: &str = "\x1b[1;34m"; // Bold blue
const COLOR_SPECIAL_FORM: &str = "\x1b[1;35m"; // Bold magenta
const COLOR_NUMBER: &str = "\x1b[33m"; // Yellow
const COLOR_STRING: &str = "\x1b[32m"; // Green
const COLOR_COMMENT: &str = "\x1b[90m"; // Bright black (gray)
const COLOR_QUOTE: &str = "\x1b[1;33m"; // Bold yellow

const SPECIAL_FORMS: &[&str] = &[
    "quote", "lambda", "setq", "define", "defun", "defmacro", "if", "cond", "progn", "labels",
    "let", "let*", "letrec", "load", "require", "provide", "declaim", "dynamic",
];

/// rustyline helper providing syntax-aware highlighting for the REPL.
pub struct LispHelper;

impl LispHelper {
    pub fn new() -> Self {
        LispHelper
    }
}

impl Default for LispHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl Helper for LispHelper {}

impl Completer for LispHelper {
    type Candidate = String;
}

impl Hinter for LispHelper {
    type Hint = String;
}

impl Validator for LispHelper {}

impl Highlighter for LispHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        let highlighted = highlight_line(line);
        if highlighted == line {
            Cow::Borrowed(line)
        } else {
            Cow::Owned(highlighted)
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: CmdKind) -> bool {
        true
    }
}

fn is_token_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '\'' | '`' | ',' | ';' | '"')
}

fn highlight_line(line: &str) -> String {
    let mut result = String::new();
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ';' => {
                result.push_str(COLOR_COMMENT);
                while i < chars.len() {
                    result.push(chars[i]);
                    i += 1;
                }
                result.push_str(COLOR_RESET);
            }
            '"' => {
                result.push_str(COLOR_STRING);
                result.push('"');
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        result.push(chars[i]);
                        result.push(chars[i + 1]);
                        i += 2;
                    } else if chars[i] == '"' {
                        result.push('"');
                        i += 1;
                        break;
                    } else {
                        result.push(chars[i]);
                        i += 1;
                    }
                }
                result.push_str(COLOR_RESET);
            }
            '(' | ')' => {
                result.push_str(COLOR_PARENS);
                result.push(chars[i]);
                result.push_str(COLOR_RESET);
                i += 1;
            }
            '\'' | '`' | ',' => {
                result.push_str(COLOR_QUOTE);
                result.push(chars[i]);
                result.push_str(COLOR_RESET);
                i += 1;
            }
            c if is_token_char(c) => {
                let start = i;
                while i < chars.len() && is_token_char(chars[i]) {
                    i += 1;
                }
                let token: String = chars[start..i].iter().collect();
                if crate::reader::looks_like_number(&token) {
                    result.push_str(COLOR_NUMBER);
                    result.push_str(&token);
                    result.push_str(COLOR_RESET);
                } else if SPECIAL_FORMS.contains(&token.to_lowercase().as_str()) {
                    result.push_str(COLOR_SPECIAL_FORM);
                    result.push_str(&token);
                    result.push_str(COLOR_RESET);
                } else {
                    result.push_str(&token);
                }
            }
            other => {
                result.push(other);
                i += 1;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_symbols_unchanged() {
        assert_eq!(highlight_line("foo"), "foo");
    }

    #[test]
    fn test_special_forms_colored() {
        let out = highlight_line("(define x 1)");
        assert!(out.contains(COLOR_SPECIAL_FORM));
        assert!(out.contains(COLOR_NUMBER));
        assert!(out.contains(COLOR_PARENS));
    }

    #[test]
    fn test_comment_colored_to_end() {
        let out = highlight_line("1 ; rest");
        assert!(out.contains(COLOR_COMMENT));
    }

    #[test]
    fn test_string_with_escapes() {
        let out = highlight_line(r#"("a\"b")"#);
        assert!(out.contains(COLOR_STRING));
    }
}
