// ABOUTME: The S-expression reader: tokenization, reader macros, quote rewriting

mod quasiquote;

pub use quasiquote::qq_expand;

use crate::error::{LispError, LispResult};
use crate::symbol::SymbolTable;
use crate::value::{
    cons, cons_at, list_elements, list_from, SourcePos, Value, CONTROL_CHAR_NAMES,
};
use nom::bytes::complete::{escaped, tag, take_until};
use nom::character::complete::{char as nom_char, none_of, one_of};
use nom::IResult;
use regex::Regex;
use std::rc::Rc;
use std::sync::LazyLock;

static INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?[0-9]+\.?$").expect("integer pattern"));
static FLOAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?([0-9]+\.[0-9]*|\.[0-9]+|[0-9]+)([eE][+-]?[0-9]+)?$")
        .expect("float pattern")
});

/// Whether a token spells a number (used by the printer to decide when a
/// symbol needs `|...|` escapes).
pub fn looks_like_number(text: &str) -> bool {
    if INT_RE.is_match(text) {
        return true;
    }
    FLOAT_RE.is_match(text) && (text.contains('.') || text.contains('e') || text.contains('E'))
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '\'' | '`' | ',' | ';' | '"')
}

fn lookup_char_name(name: &str) -> Option<char> {
    for (code, candidate) in CONTROL_CHAR_NAMES.iter().enumerate() {
        if candidate.eq_ignore_ascii_case(name) {
            return char::from_u32(code as u32);
        }
    }
    if name.eq_ignore_ascii_case("Linefeed") {
        Some('\n')
    } else if name.eq_ignore_ascii_case("Rubout") {
        Some('\u{7f}')
    } else if name.eq_ignore_ascii_case("Escape") {
        Some('\u{1b}')
    } else {
        None
    }
}

// ============================================================================
// nom lexeme parsers
// ============================================================================

/// `#| ... |#` closed at the first `|#`.
fn block_comment(input: &str) -> IResult<&str, ()> {
    let (input, _) = tag("#|")(input)?;
    let (input, _) = take_until("|#")(input)?;
    let (input, _) = tag("|#")(input)?;
    Ok((input, ()))
}

/// A string literal with `\" \\ \n \t \r` escapes.
fn string_literal(input: &str) -> IResult<&str, String> {
    let (input, _) = nom_char('"')(input)?;

    if let Ok((input, _)) = nom_char::<_, nom::error::Error<_>>('"')(input) {
        return Ok((input, String::new()));
    }

    let (input, content) = escaped(none_of("\"\\"), '\\', one_of("\"\\ntr"))(input)?;
    let (input, _) = nom_char('"')(input)?;

    let mut result = String::new();
    let mut chars = content.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some(other) => result.push(other),
                None => {}
            }
        } else {
            result.push(c);
        }
    }
    Ok((input, result))
}

// ============================================================================
// Tokens
// ============================================================================

enum Token {
    LParen,
    RParen,
    Dot,
    Quote,
    Backquote,
    Comma,
    CommaAt,
    HashQuote,
    FeatureInclude,
    FeatureExclude,
    Atom(Value),
    Eof,
}

/// An S-expression reader over one source text.  Produces forms with quote
/// and backquote rewriting already applied, each cons annotated with its
/// source range.
pub struct Reader<'st> {
    symtab: &'st mut SymbolTable,
    src: String,
    idx: usize,
    line: u32,
    col: u32,
    file: Option<Rc<str>>,
    backquote_depth: usize,
}

impl<'st> Reader<'st> {
    pub fn new(symtab: &'st mut SymbolTable, source: &str, file: Option<&str>) -> Self {
        Reader {
            symtab,
            src: source.to_string(),
            idx: 0,
            line: 1,
            col: 1,
            file: file.map(Rc::from),
            backquote_depth: 0,
        }
    }

    /// The next top-level form, or `None` at end of input.  Forms excluded
    /// by a feature expression are read and dropped.
    pub fn next_form(&mut self) -> LispResult<Option<Value>> {
        loop {
            let (token, line, col) = self.next_token()?;
            match token {
                Token::Eof => return Ok(None),
                other => {
                    if let Some(form) = self.read_form(other, line, col)? {
                        return Ok(Some(form));
                    }
                }
            }
        }
    }

    /// Read every remaining form.
    pub fn read_all(&mut self) -> LispResult<Vec<Value>> {
        let mut forms = Vec::new();
        while let Some(form) = self.next_form()? {
            forms.push(form);
        }
        Ok(forms)
    }

    // ------------------------------------------------------------------
    // character-level plumbing
    // ------------------------------------------------------------------

    fn rest(&self) -> &str {
        &self.src[self.idx..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut chars = self.rest().chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.idx += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn advance_bytes(&mut self, n: usize) {
        let target = self.idx + n;
        while self.idx < target {
            if self.bump().is_none() {
                break;
            }
        }
    }

    fn location(&self) -> String {
        match &self.file {
            Some(f) => format!("{}:{}:{}", f, self.line, self.col),
            None => format!("{}:{}", self.line, self.col),
        }
    }

    fn err(&self, message: impl Into<String>) -> LispError {
        LispError::reader(message, Some(self.location()))
    }

    fn pos_from(&self, start_line: u32, start_col: u32) -> Rc<SourcePos> {
        Rc::new(SourcePos {
            file: self.file.clone(),
            start_line,
            start_col,
            end_line: self.line,
            end_col: self.col,
        })
    }

    // ------------------------------------------------------------------
    // tokenization
    // ------------------------------------------------------------------

    fn skip_ws_and_comments(&mut self) -> LispResult<()> {
        loop {
            match self.peek() {
                Some(c) if c == ' ' || c == '\t' || c == '\r' || c == '\n' => {
                    self.bump();
                }
                Some(';') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('#') if self.peek2() == Some('|') => {
                    let input = self.rest();
                    match block_comment(input) {
                        Ok((remaining, _)) => {
                            let consumed = input.len() - remaining.len();
                            self.advance_bytes(consumed);
                        }
                        Err(_) => return Err(self.err("unterminated multiline comment")),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> LispResult<(Token, u32, u32)> {
        self.skip_ws_and_comments()?;
        let line = self.line;
        let col = self.col;

        let c = match self.peek() {
            None => return Ok((Token::Eof, line, col)),
            Some(c) => c,
        };

        let token = match c {
            '(' => {
                self.bump();
                Token::LParen
            }
            ')' => {
                self.bump();
                Token::RParen
            }
            '\'' => {
                self.bump();
                Token::Quote
            }
            '`' => {
                self.bump();
                Token::Backquote
            }
            ',' => {
                self.bump();
                if self.peek() == Some('@') {
                    self.bump();
                    Token::CommaAt
                } else {
                    Token::Comma
                }
            }
            '"' => {
                let input = self.rest();
                match string_literal(input) {
                    Ok((remaining, text)) => {
                        let consumed = input.len() - remaining.len();
                        self.advance_bytes(consumed);
                        Token::Atom(Value::Str(self.symtab.intern_string(&text)))
                    }
                    Err(_) => return Err(self.err("unterminated string literal")),
                }
            }
            '#' => self.read_dispatch()?,
            _ => self.read_atom_token()?,
        };
        Ok((token, line, col))
    }

    fn read_dispatch(&mut self) -> LispResult<Token> {
        match self.peek2() {
            Some('\\') => {
                self.bump();
                self.bump();
                Ok(Token::Atom(self.read_char_literal()?))
            }
            Some('\'') => {
                self.bump();
                self.bump();
                Ok(Token::HashQuote)
            }
            Some('+') => {
                self.bump();
                self.bump();
                Ok(Token::FeatureInclude)
            }
            Some('-') => {
                self.bump();
                self.bump();
                Ok(Token::FeatureExclude)
            }
            Some(r @ ('b' | 'B' | 'o' | 'O' | 'x' | 'X')) => {
                self.bump();
                self.bump();
                let radix = match r.to_ascii_lowercase() {
                    'b' => 2,
                    'o' => 8,
                    _ => 16,
                };
                let text = self.collect_raw_token();
                match i64::from_str_radix(&text, radix) {
                    Ok(n) => Ok(Token::Atom(Value::Long(n))),
                    Err(_) => Err(self.err(format!("invalid number #{}{}", r, text))),
                }
            }
            Some(other) => Err(self.err(format!("unknown dispatch character #{}", other))),
            None => Err(self.err("premature end of input after #")),
        }
    }

    fn read_char_literal(&mut self) -> LispResult<Value> {
        let first = match self.bump() {
            Some(c) => c,
            None => return Err(self.err("premature end of character literal")),
        };
        let mut name = String::new();
        name.push(first);
        if first.is_alphanumeric() {
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() {
                    name.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if name.chars().count() == 1 {
            return Ok(Value::Char(first));
        }
        if name.chars().all(|c| c.is_ascii_digit()) {
            let code: u32 = name
                .parse()
                .map_err(|_| self.err(format!("invalid character code #\\{}", name)))?;
            return match char::from_u32(code) {
                Some(c) => Ok(Value::Char(c)),
                None => Err(self.err(format!("invalid character code #\\{}", name))),
            };
        }
        match lookup_char_name(&name) {
            Some(c) => Ok(Value::Char(c)),
            None => Err(self.err(format!("unknown character name #\\{}", name))),
        }
    }

    /// Raw token text with no escape processing (radix literals).
    fn collect_raw_token(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if is_delimiter(c) {
                break;
            }
            text.push(c);
            self.bump();
        }
        text
    }

    /// A symbol or number token.  `\` suppresses the syntactic meaning of
    /// the next character; `|...|` quotes a whole section.  Either marks the
    /// token as escaped, which prevents number interpretation.
    fn read_atom_token(&mut self) -> LispResult<Token> {
        let mut text = String::new();
        let mut escaped_token = false;
        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some(next) => {
                            text.push(next);
                            escaped_token = true;
                        }
                        None => return Err(self.err("premature end of input after \\")),
                    }
                }
                '|' => {
                    self.bump();
                    escaped_token = true;
                    loop {
                        match self.peek() {
                            None => return Err(self.err("unterminated |...| symbol")),
                            Some('|') => {
                                self.bump();
                                break;
                            }
                            Some('\\') => {
                                self.bump();
                                if let Some(next) = self.bump() {
                                    text.push(next);
                                }
                            }
                            Some(inner) => {
                                text.push(inner);
                                self.bump();
                            }
                        }
                    }
                }
                c if is_delimiter(c) => break,
                _ => {
                    text.push(c);
                    self.bump();
                }
            }
        }

        if !escaped_token {
            if text == "." {
                return Ok(Token::Dot);
            }
            if INT_RE.is_match(&text) {
                let digits = text.trim_end_matches('.');
                return match digits.parse::<i64>() {
                    Ok(n) => Ok(Token::Atom(Value::Long(n))),
                    Err(_) => Err(self.err(format!("invalid number {}", text))),
                };
            }
            if looks_like_number(&text) {
                return match text.parse::<f64>() {
                    Ok(d) => Ok(Token::Atom(Value::Double(d))),
                    Err(_) => Err(self.err(format!("invalid number {}", text))),
                };
            }
        }

        if text.eq_ignore_ascii_case("nil") {
            return Ok(Token::Atom(Value::Nil));
        }
        Ok(Token::Atom(Value::Sym(self.symtab.intern(&text))))
    }

    // ------------------------------------------------------------------
    // forms
    // ------------------------------------------------------------------

    /// Assemble one form from a leading token.  Returns `None` when the form
    /// was excluded by a feature expression.
    fn read_form(&mut self, token: Token, line: u32, col: u32) -> LispResult<Option<Value>> {
        match token {
            Token::Eof => Err(self.err("premature end of input")),
            Token::RParen => Err(self.err("unexpected ')'")),
            Token::Dot => Err(self.err("unexpected '.'")),
            Token::Atom(v) => Ok(Some(v)),
            Token::LParen => Ok(Some(self.read_list(line, col)?)),
            Token::HashQuote => Ok(Some(self.read_required_form()?)),
            Token::Quote => {
                let form = self.read_required_form()?;
                let quoted = cons_at(
                    Value::Sym(self.symtab.wk.quote.clone()),
                    cons(form, Value::Nil),
                    Some(self.pos_from(line, col)),
                );
                Ok(Some(quoted))
            }
            Token::Backquote => {
                self.backquote_depth += 1;
                let form = self.read_required_form();
                self.backquote_depth -= 1;
                let form = form?;
                if self.backquote_depth == 0 {
                    let wk = self.symtab.wk.clone();
                    Ok(Some(qq_expand(&wk, &form)?))
                } else {
                    Ok(Some(list_from(&[
                        Value::Sym(self.symtab.wk.quasiquote.clone()),
                        form,
                    ])))
                }
            }
            Token::Comma | Token::CommaAt => {
                if self.backquote_depth == 0 {
                    return Err(self.err("comma is not inside a backquote"));
                }
                let tag = if matches!(token, Token::CommaAt) {
                    self.symtab.wk.unquote_splice.clone()
                } else {
                    self.symtab.wk.unquote.clone()
                };
                self.backquote_depth -= 1;
                let form = self.read_required_form();
                self.backquote_depth += 1;
                Ok(Some(list_from(&[Value::Sym(tag), form?])))
            }
            Token::FeatureInclude | Token::FeatureExclude => {
                let exclude = matches!(token, Token::FeatureExclude);
                let expr = self.read_required_form()?;
                let holds = self.eval_feature(&expr)?;
                let form = self.read_required_form()?;
                if holds != exclude {
                    Ok(Some(form))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// A form that must be present: EOF or a bare `)` here is an error.
    fn read_required_form(&mut self) -> LispResult<Value> {
        loop {
            let (token, line, col) = self.next_token()?;
            if matches!(token, Token::Eof) {
                return Err(self.err("premature end of input"));
            }
            if let Some(form) = self.read_form(token, line, col)? {
                return Ok(form);
            }
        }
    }

    fn read_list(&mut self, open_line: u32, open_col: u32) -> LispResult<Value> {
        let mut items: Vec<Value> = Vec::new();
        let mut tail = Value::Nil;
        loop {
            let (token, line, col) = self.next_token()?;
            match token {
                Token::RParen => break,
                Token::Eof => return Err(self.err("unterminated list")),
                Token::Dot => {
                    if items.is_empty() {
                        return Err(self.err("nothing before '.' in list"));
                    }
                    tail = self.read_required_form()?;
                    let (next, _, _) = self.next_token()?;
                    match next {
                        Token::RParen => break,
                        _ => return Err(self.err("illegal end of dotted list")),
                    }
                }
                other => {
                    if let Some(form) = self.read_form(other, line, col)? {
                        items.push(form);
                    }
                }
            }
        }

        if items.is_empty() {
            return Ok(tail);
        }
        let mut acc = tail;
        for item in items.drain(..).rev().collect::<Vec<_>>() {
            acc = cons(item, acc);
        }
        // annotate the outermost cons with the list's source range
        if let Value::Cons(cell) = &acc {
            cell.borrow_mut().pos = Some(self.pos_from(open_line, open_col));
        }
        Ok(acc)
    }

    fn eval_feature(&self, expr: &Value) -> LispResult<bool> {
        match expr {
            Value::Sym(s) => Ok(self.symtab.has_feature(s)),
            Value::Cons(_) => {
                let (items, tail) = list_elements(expr)
                    .map_err(|_| self.err("invalid feature expression"))?;
                if !tail.is_nil() || items.is_empty() {
                    return Err(self.err("invalid feature expression"));
                }
                let head = match &items[0] {
                    Value::Sym(s) => s.clone(),
                    _ => return Err(self.err("invalid feature expression")),
                };
                let wk = &self.symtab.wk;
                if head == wk.and {
                    for sub in &items[1..] {
                        if !self.eval_feature(sub)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                } else if head == wk.or {
                    for sub in &items[1..] {
                        if self.eval_feature(sub)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                } else if head == wk.not {
                    if items.len() != 2 {
                        return Err(self.err("invalid feature expression"));
                    }
                    Ok(!self.eval_feature(&items[1])?)
                } else {
                    Err(self.err("invalid feature expression"))
                }
            }
            _ => Err(self.err("invalid feature expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{eq, print_value};

    fn read_one(src: &str) -> Value {
        let mut table = SymbolTable::new();
        let mut reader = Reader::new(&mut table, src, None);
        reader.next_form().unwrap().expect("a form")
    }

    fn read_err(src: &str) -> LispError {
        let mut table = SymbolTable::new();
        let mut reader = Reader::new(&mut table, src, None);
        loop {
            match reader.next_form() {
                Err(e) => return e,
                Ok(None) => panic!("expected a read error for {:?}", src),
                Ok(Some(_)) => {}
            }
        }
    }

    #[test]
    fn test_read_integers() {
        assert!(eq(&read_one("42"), &Value::Long(42)));
        assert!(eq(&read_one("-42"), &Value::Long(-42)));
        assert!(eq(&read_one("+7"), &Value::Long(7)));
        assert!(eq(&read_one("123."), &Value::Long(123)));
    }

    #[test]
    fn test_read_doubles() {
        assert!(eq(&read_one("2.5"), &Value::Double(2.5)));
        assert!(eq(&read_one(".5"), &Value::Double(0.5)));
        assert!(eq(&read_one("-1.5e2"), &Value::Double(-150.0)));
        assert!(eq(&read_one("1e3"), &Value::Double(1000.0)));
    }

    #[test]
    fn test_integer_overflow_fails() {
        let e = read_err("99999999999999999999");
        assert!(e.to_string().contains("invalid number"));
    }

    #[test]
    fn test_read_radix_integers() {
        assert!(eq(&read_one("#b101"), &Value::Long(5)));
        assert!(eq(&read_one("#o777"), &Value::Long(511)));
        assert!(eq(&read_one("#x1F"), &Value::Long(31)));
        assert!(eq(&read_one("#x-ff"), &Value::Long(-255)));
    }

    #[test]
    fn test_read_characters() {
        assert!(eq(&read_one("#\\a"), &Value::Char('a')));
        assert!(eq(&read_one("#\\("), &Value::Char('(')));
        assert!(eq(&read_one("#\\Newline"), &Value::Char('\n')));
        assert!(eq(&read_one("#\\space"), &Value::Char(' ')));
        assert!(eq(&read_one("#\\100"), &Value::Char('d')));
        assert!(eq(&read_one("#\\Nul"), &Value::Char('\0')));
    }

    #[test]
    fn test_unknown_char_name_fails() {
        let e = read_err("#\\Frobnitz");
        assert!(e.to_string().contains("unknown character name"));
    }

    #[test]
    fn test_read_strings() {
        match read_one(r#""hello\nworld""#) {
            Value::Str(s) => assert_eq!(&*s, "hello\nworld"),
            other => panic!("expected string, got {}", other),
        }
        match read_one(r#""""#) {
            Value::Str(s) => assert!(s.is_empty()),
            other => panic!("expected empty string, got {}", other),
        }
    }

    #[test]
    fn test_string_literals_are_interned() {
        let mut table = SymbolTable::new();
        let mut reader = Reader::new(&mut table, "\"dup\" \"dup\"", None);
        let a = reader.next_form().unwrap().unwrap();
        let b = reader.next_form().unwrap().unwrap();
        assert!(eq(&a, &b));
    }

    #[test]
    fn test_read_symbols_case_insensitive() {
        let mut table = SymbolTable::new();
        let mut reader = Reader::new(&mut table, "Foo foo", None);
        let a = reader.next_form().unwrap().unwrap();
        let b = reader.next_form().unwrap().unwrap();
        assert!(eq(&a, &b));
    }

    #[test]
    fn test_nil_token_reads_as_empty_list() {
        assert!(read_one("nil").is_nil());
        assert!(read_one("NIL").is_nil());
        assert!(read_one("()").is_nil());
    }

    #[test]
    fn test_read_list_and_dotted() {
        assert_eq!(print_value(&read_one("(1 2 3)"), true), "(1 2 3)");
        assert_eq!(print_value(&read_one("(1 . 2)"), true), "(1 . 2)");
        assert_eq!(print_value(&read_one("(1 2 . 3)"), true), "(1 2 . 3)");
    }

    #[test]
    fn test_dotted_errors() {
        assert!(read_err("(1 . 2 3)").to_string().contains("dotted"));
        assert!(read_err("(. 2)").to_string().contains("'.'"));
    }

    #[test]
    fn test_unexpected_close() {
        assert!(read_err(")").to_string().contains("unexpected ')'"));
    }

    #[test]
    fn test_comments() {
        assert!(eq(&read_one("; comment\n42"), &Value::Long(42)));
        assert!(eq(&read_one("#| multi\nline |# 42"), &Value::Long(42)));
        assert_eq!(print_value(&read_one("(1 ; mid\n 2)"), true), "(1 2)");
    }

    #[test]
    fn test_unterminated_block_comment() {
        let e = read_err("#| never closed");
        assert!(e.to_string().contains("unterminated multiline comment"));
    }

    #[test]
    fn test_quote_rewriting() {
        assert_eq!(print_value(&read_one("'x"), true), "(quote x)");
        assert_eq!(print_value(&read_one("'(1 2)"), true), "(quote (1 2))");
    }

    #[test]
    fn test_hash_quote_passthrough() {
        assert_eq!(print_value(&read_one("#'car"), true), "car");
    }

    #[test]
    fn test_bar_quoted_symbol() {
        match read_one("|two words|") {
            Value::Sym(s) => assert_eq!(s.name(), "two words"),
            other => panic!("expected symbol, got {}", other),
        }
        // escaped tokens never read as numbers
        match read_one("|123|") {
            Value::Sym(s) => assert_eq!(s.name(), "123"),
            other => panic!("expected symbol, got {}", other),
        }
    }

    #[test]
    fn test_backslash_escape() {
        match read_one("\\(foo") {
            Value::Sym(s) => assert_eq!(s.name(), "(foo"),
            other => panic!("expected symbol, got {}", other),
        }
    }

    #[test]
    fn test_unterminated_bar_symbol() {
        let e = read_err("|open");
        assert!(e.to_string().contains("unterminated |...| symbol"));
    }

    #[test]
    fn test_quasiquote_expansion_scenario() {
        let out = read_one("`(a ,@'(1 2) b)");
        assert_eq!(
            print_value(&out, true),
            "(cons (quote a) (append (quote (1 2)) (quote (b))))"
        );
    }

    #[test]
    fn test_comma_outside_backquote_fails() {
        assert!(read_err(",x").to_string().contains("backquote"));
        assert!(read_err(",@x").to_string().contains("backquote"));
    }

    #[test]
    fn test_expansion_has_no_backquote_markers() {
        let out = read_one("`(x ,y `(inner ,z))");
        let printed = print_value(&out, true);
        assert!(!printed.contains("quasiquote"), "got {}", printed);
    }

    #[test]
    fn test_feature_expressions() {
        // the language feature is always present
        assert!(eq(&read_one("#+lilt 1 2"), &Value::Long(1)));
        // an absent feature skips the guarded form
        assert!(eq(&read_one("#+no-such 1 2"), &Value::Long(2)));
        assert!(eq(&read_one("#-no-such 1 2"), &Value::Long(1)));
        assert!(eq(
            &read_one("#+(and lilt ieee-floating-point) 1 2"),
            &Value::Long(1)
        ));
        assert!(eq(&read_one("#+(not lilt) 1 2"), &Value::Long(2)));
        assert!(eq(&read_one("#+(or no-such lilt) 1 2"), &Value::Long(1)));
    }

    #[test]
    fn test_feature_filtering_inside_list() {
        assert_eq!(
            print_value(&read_one("(1 #+no-such 2 3)"), true),
            "(1 3)"
        );
    }

    #[test]
    fn test_invalid_feature_expression() {
        let e = read_err("#+(xor a b) 1");
        assert!(e.to_string().contains("invalid feature expression"));
    }

    #[test]
    fn test_unknown_dispatch_char() {
        let e = read_err("#z");
        assert!(e.to_string().contains("unknown dispatch character"));
    }

    #[test]
    fn test_source_positions_attached() {
        let mut table = SymbolTable::new();
        let mut reader = Reader::new(&mut table, "\n  (a b)", Some("demo.lisp"));
        let form = reader.next_form().unwrap().unwrap();
        let pos = form.pos().expect("position");
        assert_eq!(pos.start_line, 2);
        assert_eq!(pos.start_col, 3);
        assert_eq!(pos.file.as_deref(), Some("demo.lisp"));
    }

    #[test]
    fn test_positions_ignored_by_equality() {
        let mut table = SymbolTable::new();
        let a = Reader::new(&mut table, "(1 2)", Some("a.lisp"))
            .next_form()
            .unwrap()
            .unwrap();
        let b = Reader::new(&mut table, "  (1 2)", Some("b.lisp"))
            .next_form()
            .unwrap()
            .unwrap();
        assert!(crate::value::equal(&a, &b));
    }

    #[test]
    fn test_reader_roundtrip() {
        for src in [
            "(1 2.5 \"str\" #\\a sym (nested . pair))",
            "(quote (a b))",
            "(|odd name| plain)",
        ] {
            let v = read_one(src);
            let reprinted = print_value(&v, true);
            let again = read_one(&reprinted);
            assert!(
                crate::value::equal(&v, &again),
                "roundtrip failed for {}",
                src
            );
        }
    }
}
