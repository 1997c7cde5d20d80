// ABOUTME: Case-insensitively interned symbols and the symbol table that owns them

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Backing storage for one symbol.  The table hands out `Symbol` handles that
/// share this allocation, so two symbols spelled the same way (ignoring case)
/// are the same object.
#[derive(Debug)]
pub struct SymbolData {
    name: String,
    reserved: Cell<bool>,
}

#[derive(Debug, Clone)]
pub struct Symbol(Rc<SymbolData>);

impl Symbol {
    /// A symbol outside any table.  Used for `gensym` results and the
    /// "unassigned" sentinel; never equal to an interned symbol.
    pub fn uninterned(name: impl Into<String>) -> Self {
        Symbol(Rc::new(SymbolData {
            name: name.into(),
            reserved: Cell::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_reserved(&self) -> bool {
        self.0.reserved.get()
    }

    fn mark_reserved(&self) {
        self.0.reserved.set(true);
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// The reserved words: special-form heads that may never appear as a binding
/// target (lambda params, let bindings, define/setq targets).
const RESERVED: &[&str] = &[
    "quote",
    "lambda",
    "setq",
    "define",
    "defun",
    "defmacro",
    "if",
    "cond",
    "progn",
    "labels",
    "let",
    "let*",
    "letrec",
    "load",
    "require",
    "provide",
    "declaim",
    "dynamic",
    "nil",
    "t",
];

/// Symbols the reader and evaluator dispatch on by identity.  Interned once
/// at table construction so dispatch never compares strings.
#[derive(Debug, Clone)]
pub struct WellKnown {
    pub quote: Symbol,
    pub quasiquote: Symbol,
    pub unquote: Symbol,
    pub unquote_splice: Symbol,
    pub lambda: Symbol,
    pub setq: Symbol,
    pub define: Symbol,
    pub defun: Symbol,
    pub defmacro: Symbol,
    pub if_: Symbol,
    pub cond: Symbol,
    pub progn: Symbol,
    pub labels: Symbol,
    pub let_: Symbol,
    pub let_star: Symbol,
    pub letrec: Symbol,
    pub load: Symbol,
    pub require: Symbol,
    pub provide: Symbol,
    pub declaim: Symbol,
    pub dynamic: Symbol,
    pub t: Symbol,
    pub nil: Symbol,
    pub optimize: Symbol,
    pub speed: Symbol,
    pub and: Symbol,
    pub or: Symbol,
    pub not: Symbol,
    pub list: Symbol,
    pub list_star: Symbol,
    pub append: Symbol,
    pub cons: Symbol,
}

/// Case-insensitive interning plus the feature list consulted by `#+`/`#-`.
#[derive(Debug)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
    strings: HashMap<String, Rc<str>>,
    features: Vec<Symbol>,
    pub wk: WellKnown,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut symbols = HashMap::new();
        let mut intern = |name: &str| -> Symbol {
            let key = name.to_lowercase();
            symbols
                .entry(key)
                .or_insert_with(|| Symbol::uninterned(name))
                .clone()
        };

        let wk = WellKnown {
            quote: intern("quote"),
            quasiquote: intern("quasiquote"),
            unquote: intern("unquote"),
            unquote_splice: intern("unquote-splice"),
            lambda: intern("lambda"),
            setq: intern("setq"),
            define: intern("define"),
            defun: intern("defun"),
            defmacro: intern("defmacro"),
            if_: intern("if"),
            cond: intern("cond"),
            progn: intern("progn"),
            labels: intern("labels"),
            let_: intern("let"),
            let_star: intern("let*"),
            letrec: intern("letrec"),
            load: intern("load"),
            require: intern("require"),
            provide: intern("provide"),
            declaim: intern("declaim"),
            dynamic: intern("dynamic"),
            t: intern("t"),
            nil: intern("nil"),
            optimize: intern("optimize"),
            speed: intern("speed"),
            and: intern("and"),
            or: intern("or"),
            not: intern("not"),
            list: intern("list"),
            list_star: intern("list*"),
            append: intern("append"),
            cons: intern("cons"),
        };

        let features = vec![
            intern("lilt"),
            intern("lilt-1"),
            if cfg!(windows) {
                intern("windows")
            } else {
                intern("unix")
            },
            intern("ieee-floating-point"),
        ];

        let table = SymbolTable {
            symbols,
            strings: HashMap::new(),
            features,
            wk,
        };
        for word in RESERVED {
            table
                .symbols
                .get(&word.to_lowercase())
                .expect("reserved words are pre-interned")
                .mark_reserved();
        }
        table
    }

    /// Intern a symbol name, matching case-insensitively.  The first-seen
    /// spelling is kept for printing.
    pub fn intern(&mut self, name: &str) -> Symbol {
        let key = name.to_lowercase();
        self.symbols
            .entry(key)
            .or_insert_with(|| Symbol::uninterned(name))
            .clone()
    }

    /// Intern a string literal so that `eq` holds between identical reader
    /// literals.
    pub fn intern_string(&mut self, text: &str) -> Rc<str> {
        self.strings
            .entry(text.to_string())
            .or_insert_with(|| Rc::from(text))
            .clone()
    }

    pub fn has_feature(&self, sym: &Symbol) -> bool {
        self.features.iter().any(|f| f == sym)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_identity() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a, b);
    }

    #[test]
    fn test_intern_case_insensitive() {
        let mut table = SymbolTable::new();
        let lower = table.intern("foo");
        let upper = table.intern("FOO");
        let mixed = table.intern("Foo");
        assert_eq!(lower, upper);
        assert_eq!(lower, mixed);
        // first-seen spelling wins for printing
        assert_eq!(upper.name(), "foo");
    }

    #[test]
    fn test_distinct_names_distinct_symbols() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn test_uninterned_never_equal() {
        let mut table = SymbolTable::new();
        let interned = table.intern("g1");
        let fresh = Symbol::uninterned("g1");
        assert_ne!(interned, fresh);
        assert_ne!(Symbol::uninterned("g1"), Symbol::uninterned("g1"));
    }

    #[test]
    fn test_reserved_words_flagged() {
        let mut table = SymbolTable::new();
        assert!(table.intern("lambda").is_reserved());
        assert!(table.intern("LET*").is_reserved());
        assert!(table.intern("t").is_reserved());
        assert!(!table.intern("frob").is_reserved());
    }

    #[test]
    fn test_well_known_identity() {
        let mut table = SymbolTable::new();
        let q = table.intern("QUOTE");
        assert_eq!(q, table.wk.quote);
    }

    #[test]
    fn test_string_interning() {
        let mut table = SymbolTable::new();
        let a = table.intern_string("hello");
        let b = table.intern_string("hello");
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_features() {
        let mut table = SymbolTable::new();
        let lang = table.intern("lilt");
        let ieee = table.intern("ieee-floating-point");
        let absent = table.intern("no-such-feature");
        assert!(table.has_feature(&lang));
        assert!(table.has_feature(&ieee));
        assert!(!table.has_feature(&absent));
    }
}
