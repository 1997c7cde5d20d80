//! Ahead-of-time code generation.
//!
//! Lowers a whole compilation unit to the source of a host (Rust) program
//! whose runtime is this crate's `gen` module, so compiled and interpreted
//! code share one value model and one primitive registry.
//!
//! # Organization
//!
//! **Pass 1** walks the top-level forms: `define`/`defun` become global
//! slots with one-shot initializers, `defmacro` is evaluated right away so
//! later forms can expand, `load`/`require` inline the referenced file's
//! forms into the stream, `declaim (optimize (speed n))` adjusts inlining
//! aggressiveness, and `progn` flattens.  Everything else is buffered for
//! the unit's `body()`.
//!
//! **Pass 2** lowers the buffered forms to expressions, each preceded by a
//! source-location comment.  Quoted literals go through a constant pool
//! deduplicated by their printed text (`q0`, `q1`, ...).  Every call site is
//! emitted in one of two shapes: the funcall shape invokes synchronously,
//! while calls in tail position return a pending-call record that the
//! caller's trampoline drives.  References to globals read through the
//! runtime on every access, so redefinition stays observable.
//!
//! Symbols mangle to host identifiers by keeping letters, digits and `_`
//! and expanding everything else to `_<codepoint>_`; locals get a per-unit
//! counter suffix for uniqueness.

mod glue;

pub use glue::{build_executable, rustc_version, BuildOptions};

use crate::builtins;
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::reader::Reader;
use crate::symbol::Symbol;
use crate::value::{list_elements, list_parts, print_value, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

/// Mangle a symbol name to a host identifier: `foo-bar!` becomes
/// `_foo_45_bar_33_`.
pub fn mangle(name: &str) -> String {
    let mut out = String::from("_");
    for ch in name.chars() {
        if ch == '_' || ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else {
            out.push('_');
            let _ = write!(out, "{}", ch as u32);
            out.push('_');
        }
    }
    out
}

/// Generate a complete host source file for `source`.
pub fn generate_unit(
    interp: &mut Interp,
    source: &str,
    file: Option<&str>,
    unit: &str,
) -> LispResult<String> {
    let forms = {
        let mut reader = Reader::new(&mut interp.symtab, source, file);
        reader.read_all()?
    };
    Codegen::new(interp, unit).generate(&forms)
}

struct GlobalDef {
    name: Symbol,
    init: Value,
    loc: Option<String>,
    seq: usize,
}

pub struct Codegen<'i> {
    interp: &'i mut Interp,
    unit: String,
    speed: u8,
    globals: Vec<GlobalDef>,
    global_names: HashSet<Symbol>,
    body_forms: Vec<(Value, Option<String>, usize)>,
    /// pass-1 sequence number at which each macro was installed
    macro_seq: HashMap<Symbol, usize>,
    seq: usize,
    current_seq: usize,
    scopes: Vec<HashMap<Symbol, String>>,
    counter: usize,
    pool: Vec<(String, String)>,
    pool_index: HashMap<String, usize>,
    undefined: BTreeSet<String>,
    pub warnings: Vec<String>,
}

impl<'i> Codegen<'i> {
    pub fn new(interp: &'i mut Interp, unit: &str) -> Self {
        let speed = interp.speed;
        Codegen {
            interp,
            unit: unit.to_string(),
            speed,
            globals: Vec::new(),
            global_names: HashSet::new(),
            body_forms: Vec::new(),
            macro_seq: HashMap::new(),
            seq: 0,
            current_seq: usize::MAX,
            scopes: Vec::new(),
            counter: 0,
            pool: Vec::new(),
            pool_index: HashMap::new(),
            undefined: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    pub fn generate(&mut self, forms: &[Value]) -> LispResult<String> {
        tracing::debug!(unit = %self.unit, forms = forms.len(), "codegen pass 1");
        for form in forms {
            self.scan_top(form.clone())?;
        }

        tracing::debug!(
            globals = self.globals.len(),
            body = self.body_forms.len(),
            "codegen pass 2"
        );

        // lower global initializers in source order
        let mut global_inits: Vec<(String, String, Option<String>)> = Vec::new();
        let globals: Vec<(Symbol, Value, Option<String>, usize)> = self
            .globals
            .iter()
            .map(|g| (g.name.clone(), g.init.clone(), g.loc.clone(), g.seq))
            .collect();
        for (name, init, loc, seq) in globals {
            self.current_seq = seq;
            let expr = self.lower_value(&init)?;
            global_inits.push((name.name().to_string(), expr, loc));
        }

        // lower buffered body forms
        let body_forms = self.body_forms.clone();
        let mut body_stmts: Vec<(Option<String>, String)> = Vec::new();
        for (form, loc, seq) in body_forms {
            self.current_seq = seq;
            let expr = self.lower_value(&form)?;
            body_stmts.push((loc, expr));
        }

        if !self.undefined.is_empty() {
            let names: Vec<String> = self.undefined.iter().cloned().collect();
            return Err(LispError::Unbound(format!(
                "undefined symbols in compiled unit: {}",
                names.join(", ")
            )));
        }

        self.assemble(&global_inits, &body_stmts)
    }

    // ------------------------------------------------------------------
    // pass 1
    // ------------------------------------------------------------------

    fn scan_top(&mut self, mut form: Value) -> LispResult<()> {
        let wk = self.interp.symtab.wk.clone();

        // expand top-level macro calls before dispatching
        loop {
            let is_macro_call = match list_parts(&form) {
                Some((Value::Sym(s), _)) => self.interp.macros.contains_key(&s),
                _ => false,
            };
            if !is_macro_call {
                break;
            }
            form = self.interp.macroexpand_1(&form)?;
        }

        let (op, rest) = match list_parts(&form) {
            Some((Value::Sym(s), rest)) => (s, rest),
            _ => return self.buffer_body(form),
        };

        if op == wk.progn {
            let (items, _) = list_elements(&rest)
                .map_err(|_| LispError::malformed("progn", "circular form"))?;
            for sub in items {
                self.scan_top(sub)?;
            }
            return Ok(());
        }

        if op == wk.define {
            let (items, _) = list_elements(&rest)
                .map_err(|_| LispError::malformed("define", "circular form"))?;
            if items.len() != 2 {
                return Err(LispError::arity("define", crate::error::ARITY_TWO, items.len()));
            }
            let name = match &items[0] {
                Value::Sym(s) => s.clone(),
                other => {
                    return Err(LispError::malformed(
                        "define",
                        format!("cannot define {}", other),
                    ))
                }
            };
            if name.is_reserved() {
                return Err(LispError::malformed(
                    "define",
                    format!("cannot bind reserved word {}", name),
                ));
            }
            if !self.global_names.insert(name.clone()) {
                return Err(LispError::malformed(
                    "define",
                    format!("duplicate definition of {}", name),
                ));
            }
            self.globals.push(GlobalDef {
                name,
                init: items[1].clone(),
                loc: loc_comment(&form),
                seq: self.seq,
            });
            self.seq += 1;
            return Ok(());
        }

        if op == wk.defun {
            let rewritten = self.rewrite_defun(&rest)?;
            return self.scan_top(rewritten);
        }

        if op == wk.defmacro {
            // register with the in-process evaluator so pass 2 can expand
            let globals = self.interp.globals.clone();
            let name = self.interp.eval(form, &globals)?;
            if let Value::Sym(s) = name {
                self.macro_seq.insert(s, self.seq);
            }
            self.seq += 1;
            return Ok(());
        }

        if op == wk.load {
            let spec = self.literal_path(&rest, "load")?;
            return self.scan_file(&spec);
        }

        if op == wk.require {
            let (items, _) = list_elements(&rest)
                .map_err(|_| LispError::malformed("require", "circular form"))?;
            if items.is_empty() || items.len() > 2 {
                return Err(LispError::arity(
                    "require",
                    crate::error::ARITY_ONE_OR_TWO,
                    items.len(),
                ));
            }
            let name = designator(&items[0], "require")?;
            if self.interp.modules.contains(&name) {
                return Ok(());
            }
            let spec = match items.get(1) {
                Some(v) => designator(v, "require")?,
                None => name.clone(),
            };
            self.scan_file(&spec)?;
            if !self.interp.modules.contains(&name) {
                return Err(LispError::malformed(
                    "require",
                    format!("file did not (provide {})", name),
                ));
            }
            return Ok(());
        }

        if op == wk.provide {
            let (items, _) = list_elements(&rest)
                .map_err(|_| LispError::malformed("provide", "circular form"))?;
            if items.len() != 1 {
                return Err(LispError::arity("provide", crate::error::ARITY_ONE, items.len()));
            }
            let name = designator(&items[0], "provide")?;
            self.interp.modules.insert(name);
            return Ok(());
        }

        if op == wk.declaim {
            for clause in crate::value::iter_list(&rest) {
                if let Some((head, specs)) = list_parts(&clause) {
                    if matches!(&head, Value::Sym(s) if *s == wk.optimize) {
                        for spec in crate::value::iter_list(&specs) {
                            if let Some((what, val)) = list_parts(&spec) {
                                if matches!(&what, Value::Sym(s) if *s == wk.speed) {
                                    if let Some((Value::Long(n), _)) = list_parts(&val) {
                                        self.speed = n.clamp(0, 3) as u8;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            return Ok(());
        }

        self.buffer_body(form)
    }

    fn buffer_body(&mut self, form: Value) -> LispResult<()> {
        let loc = loc_comment(&form);
        self.body_forms.push((form, loc, self.seq));
        self.seq += 1;
        Ok(())
    }

    fn rewrite_defun(&mut self, rest: &Value) -> LispResult<Value> {
        let wk = self.interp.symtab.wk.clone();
        let (name, after) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("defun", "missing function name"))?;
        let (params, body) = list_parts(&after)
            .ok_or_else(|| LispError::malformed("defun", "missing parameter list"))?;
        let lambda_form = crate::value::cons(
            Value::Sym(wk.lambda.clone()),
            crate::value::cons(params, body),
        );
        Ok(crate::value::list_from(&[
            Value::Sym(wk.define.clone()),
            name,
            lambda_form,
        ]))
    }

    fn literal_path(&self, rest: &Value, what: &str) -> LispResult<String> {
        let (items, _) =
            list_elements(rest).map_err(|_| LispError::malformed(what, "circular form"))?;
        if items.len() != 1 {
            return Err(LispError::arity(what, crate::error::ARITY_ONE, items.len()));
        }
        designator(&items[0], what)
    }

    /// Inline the referenced file's forms into the current stream.
    fn scan_file(&mut self, spec: &str) -> LispResult<()> {
        let path = self.interp.resolve_load_path(spec)?;
        tracing::debug!(path = %path.display(), "inlining file");
        let source = std::fs::read_to_string(&path)
            .map_err(|e| LispError::Io(format!("cannot load {}: {}", path.display(), e)))?;
        let shown = path.display().to_string();
        let forms = {
            let mut reader = Reader::new(&mut self.interp.symtab, &source, Some(&shown));
            reader.read_all()?
        };
        self.interp.load_stack.push(path);
        let mut result = Ok(());
        for form in forms {
            result = self.scan_top(form);
            if result.is_err() {
                break;
            }
        }
        self.interp.load_stack.pop();
        result
    }

    // ------------------------------------------------------------------
    // pass 2: expression lowering
    // ------------------------------------------------------------------

    fn fresh(&mut self, sym: &Symbol) -> String {
        self.counter += 1;
        format!("{}_{}", mangle(sym.name()), self.counter)
    }

    fn lookup_local(&self, sym: &Symbol) -> Option<String> {
        for scope in self.scopes.iter().rev() {
            if let Some(var) = scope.get(sym) {
                return Some(var.clone());
            }
        }
        None
    }

    /// Lower a form to an expression of the host `Value` type.
    fn lower_value(&mut self, form: &Value) -> LispResult<String> {
        match form {
            Value::Nil => Ok("Value::Nil".to_string()),
            Value::Long(n) => Ok(format!("Value::Long({}i64)", n)),
            Value::Double(d) => Ok(format!("Value::Double({:?}f64)", d)),
            Value::Char(c) => Ok(format!("Value::Char({:?})", c)),
            Value::Str(s) => Ok(format!("string(rt, {:?})", s)),
            Value::Sym(s) => Ok(self.lower_symbol_ref(s)),
            Value::Cons(_) => self.lower_list(form, false),
            other => Err(LispError::Internal(format!(
                "cannot compile literal {}",
                print_value(other, true)
            ))),
        }
    }

    /// Lower a form in tail position to an expression producing a `Step`.
    fn lower_tail(&mut self, form: &Value) -> LispResult<String> {
        match form {
            Value::Cons(_) => self.lower_list(form, true),
            _ => Ok(format!("done({})", self.lower_value(form)?)),
        }
    }

    fn lower_symbol_ref(&mut self, sym: &Symbol) -> String {
        let wk = &self.interp.symtab.wk;
        if sym == &wk.t {
            return "boolean(rt, true)".to_string();
        }
        if sym == &wk.nil {
            return "Value::Nil".to_string();
        }
        if let Some(var) = self.lookup_local(sym) {
            return format!("{}.get()", var);
        }
        let known = self.global_names.contains(sym)
            || self.interp.registry.contains_key(sym)
            || self.interp.globals.lookup(sym).is_some();
        if known {
            format!("global(rt, {:?})?", sym.name())
        } else {
            self.undefined.insert(sym.name().to_string());
            "Value::Nil".to_string()
        }
    }

    fn lower_list(&mut self, form: &Value, tail: bool) -> LispResult<String> {
        let wk = self.interp.symtab.wk.clone();
        let (op, rest) = list_parts(form).expect("list form");

        if let Value::Sym(op_sym) = &op {
            if *op_sym == wk.quote {
                let args = proper_args(&rest, "quote")?;
                if args.len() != 1 {
                    return Err(LispError::arity("quote", crate::error::ARITY_ONE, args.len()));
                }
                let expr = self.lower_quote(&args[0])?;
                return Ok(wrap_tail(tail, expr));
            }

            if *op_sym == wk.if_ {
                return self.lower_if(&rest, tail);
            }
            if *op_sym == wk.cond {
                return self.lower_cond(&rest, tail);
            }
            if *op_sym == wk.progn {
                return self.lower_progn(&rest, tail);
            }
            if *op_sym == wk.lambda {
                let expr = self.lower_lambda_form(&rest, "lambda")?;
                return Ok(wrap_tail(tail, expr));
            }
            if *op_sym == wk.setq {
                let expr = self.lower_setq(&rest)?;
                return Ok(wrap_tail(tail, expr));
            }
            if *op_sym == wk.define {
                let expr = self.lower_nested_define(&rest)?;
                return Ok(wrap_tail(tail, expr));
            }
            if *op_sym == wk.defun {
                let rewritten = self.rewrite_defun(&rest)?;
                return self.lower_list(&rewritten, tail);
            }
            if *op_sym == wk.let_ || *op_sym == wk.let_star || *op_sym == wk.letrec {
                return self.lower_let(op_sym.clone(), &rest, tail);
            }
            if *op_sym == wk.labels {
                return self.lower_labels(&rest, tail);
            }
            if *op_sym == wk.load {
                let spec = self.literal_path(&rest, "load")?;
                let expr = self.lower_inline_load(&spec)?;
                return Ok(wrap_tail(tail, expr));
            }
            if *op_sym == wk.require || *op_sym == wk.provide {
                return Err(LispError::malformed(
                    op_sym.name(),
                    "only allowed as a top-level form",
                ));
            }
            if *op_sym == wk.defmacro {
                return Err(LispError::malformed(
                    "defmacro",
                    "only allowed as a top-level form",
                ));
            }
            if *op_sym == wk.declaim {
                return Ok(wrap_tail(tail, "Value::Nil".to_string()));
            }

            // macro call: expand and continue, refusing uses that precede
            // the definition in this unit
            if self.interp.macros.contains_key(op_sym) {
                if let Some(&defined_at) = self.macro_seq.get(op_sym) {
                    if defined_at > self.current_seq {
                        return Err(LispError::malformed(
                            "macro",
                            format!("{} used before its definition", op_sym),
                        ));
                    }
                }
                let expanded = self.interp.macroexpand_1(form)?;
                return if tail {
                    self.lower_tail(&expanded)
                } else {
                    self.lower_value(&expanded)
                };
            }

            // local bindings shadow primitives and globals
            if self.lookup_local(op_sym).is_none() {
                if let Some(def) = self.interp.registry.get(op_sym).copied() {
                    let args = proper_args(&rest, def.name)?;
                    builtins::check_arity(def, args.len())?;
                    if self.speed >= 1 {
                        if let Some(inline) = self.lower_open_coded(def.name, &args)? {
                            return Ok(wrap_tail(tail, inline));
                        }
                    }
                }
            }
        }

        self.lower_call(&op, &rest, tail)
    }

    /// Inline expansions for recognized primitive operators.  `None` falls
    /// through to the generic funcall lowering.
    fn lower_open_coded(&mut self, name: &str, args: &[Value]) -> LispResult<Option<String>> {
        const NUMERIC: &[&str] = &["+", "-", "*", "/", "=", "/=", "<", "<=", ">", ">=", "1+", "1-"];
        if NUMERIC.contains(&name) {
            for arg in args {
                if matches!(arg, Value::Str(_) | Value::Char(_)) {
                    return Err(LispError::type_error(name, "number", arg.type_name()));
                }
            }
        }

        let lowered: Vec<String> = {
            let mut v = Vec::with_capacity(args.len());
            for arg in args {
                v.push(self.lower_value(arg)?);
            }
            v
        };
        let binds: String = lowered
            .iter()
            .enumerate()
            .map(|(i, e)| format!("let __a{} = {}; ", i, e))
            .collect();
        let names: Vec<String> = (0..lowered.len()).map(|i| format!("__a{}", i)).collect();

        let body = match name {
            "+" | "-" | "*" | "/" => {
                let op = name;
                match names.len() {
                    0 => {
                        let identity = if op == "*" { "1.0" } else { "0.0" };
                        format!("Value::Double({})", identity)
                    }
                    1 => match op {
                        "-" => format!("Value::Double(-num(&{})?)", names[0]),
                        "/" => format!("Value::Double(1.0 / num(&{})?)", names[0]),
                        _ => format!("Value::Double(num(&{})?)", names[0]),
                    },
                    _ => {
                        let terms: Vec<String> =
                            names.iter().map(|n| format!("num(&{})?", n)).collect();
                        format!("Value::Double({})", terms.join(&format!(" {} ", op)))
                    }
                }
            }
            "=" | "/=" | "<" | "<=" | ">" | ">=" if names.len() == 2 => {
                let rust_op = match name {
                    "=" => "==",
                    "/=" => "!=",
                    other => other,
                };
                format!(
                    "boolean(rt, num(&{})? {} num(&{})?)",
                    names[0], rust_op, names[1]
                )
            }
            "car" => format!("car_of(&{})?", names[0]),
            "cdr" => format!("cdr_of(&{})?", names[0]),
            "cons" => format!("cons({}, {})", names[0], names[1]),
            "eq" => format!("boolean(rt, value_eq(&{}, &{}))", names[0], names[1]),
            "null" | "not" => format!("boolean(rt, !truthy(&{}))", names[0]),
            "1+" => format!("inc1(&{})?", names[0]),
            "1-" => format!("dec1(&{})?", names[0]),
            _ => return Ok(None),
        };
        Ok(Some(format!("{{ {}{} }}", binds, body)))
    }

    fn lower_call(&mut self, op: &Value, rest: &Value, tail: bool) -> LispResult<String> {
        let fexpr = match op {
            Value::Sym(s) => self.lower_symbol_ref(s),
            other => self.lower_value(other)?,
        };
        let args = proper_args(rest, "call")?;
        let mut out = String::new();
        let _ = write!(out, "{{ let __f = {}; ", fexpr);
        let mut names = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let expr = self.lower_value(arg)?;
            let _ = write!(out, "let __a{} = {}; ", i, expr);
            names.push(format!("__a{}", i));
        }
        if tail {
            let _ = write!(out, "tailcall(__f, vec![{}]) }}", names.join(", "));
        } else {
            let _ = write!(out, "funcall(rt, __f, &[{}])? }}", names.join(", "));
        }
        Ok(out)
    }

    fn lower_quote(&mut self, arg: &Value) -> LispResult<String> {
        let key = print_value(arg, true);
        if let Some(&index) = self.pool_index.get(&key) {
            return Ok(format!("qref(rt, {})", index));
        }
        let expr = self.constant_expr(arg)?;
        let index = self.pool.len();
        self.pool.push((key.clone(), expr));
        self.pool_index.insert(key, index);
        Ok(format!("qref(rt, {})", index))
    }

    /// A host expression that constructs a quoted literal.
    fn constant_expr(&mut self, v: &Value) -> LispResult<String> {
        match v {
            Value::Nil => Ok("Value::Nil".to_string()),
            Value::Long(n) => Ok(format!("Value::Long({}i64)", n)),
            Value::Double(d) => Ok(format!("Value::Double({:?}f64)", d)),
            Value::Char(c) => Ok(format!("Value::Char({:?})", c)),
            Value::Str(s) => Ok(format!("string(rt, {:?})", s)),
            Value::Sym(s) => Ok(format!("sym(rt, {:?})", s.name())),
            Value::Cons(_) | Value::Slice(_) => {
                let (items, tail_v) = list_elements(v)
                    .map_err(|_| LispError::malformed("quote", "circular literal"))?;
                let mut exprs = Vec::with_capacity(items.len());
                for item in &items {
                    exprs.push(self.constant_expr(item)?);
                }
                if tail_v.is_nil() {
                    Ok(format!("list(&[{}])", exprs.join(", ")))
                } else {
                    let mut acc = self.constant_expr(&tail_v)?;
                    for expr in exprs.into_iter().rev() {
                        acc = format!("cons({}, {})", expr, acc);
                    }
                    Ok(acc)
                }
            }
            other => Err(LispError::Internal(format!(
                "cannot compile literal {}",
                print_value(other, true)
            ))),
        }
    }

    fn lower_if(&mut self, rest: &Value, tail: bool) -> LispResult<String> {
        let args = proper_args(rest, "if")?;
        if args.len() < 2 || args.len() > 3 {
            return Err(LispError::arity(
                "if",
                crate::error::ARITY_TWO_OR_THREE,
                args.len(),
            ));
        }
        // unfold (if (null x) a b) to (if x b a) to avoid double negation
        let (cond, mut then_form, mut else_form) = (
            args[0].clone(),
            args[1].clone(),
            args.get(2).cloned().unwrap_or(Value::Nil),
        );
        let cond = match negated_condition(self.interp, &cond) {
            Some(inner) => {
                std::mem::swap(&mut then_form, &mut else_form);
                inner
            }
            None => cond,
        };

        let cond_expr = self.lower_value(&cond)?;
        let (then_expr, else_expr) = if tail {
            (self.lower_tail(&then_form)?, self.lower_tail(&else_form)?)
        } else {
            (self.lower_value(&then_form)?, self.lower_value(&else_form)?)
        };
        Ok(format!(
            "{{ let __c = {}; if truthy(&__c) {{ {} }} else {{ {} }} }}",
            cond_expr, then_expr, else_expr
        ))
    }

    fn lower_cond(&mut self, rest: &Value, tail: bool) -> LispResult<String> {
        let clauses = proper_args(rest, "cond")?;
        let wk_t = self.interp.symtab.wk.t.clone();
        let default = if tail {
            "done(Value::Nil)".to_string()
        } else {
            "Value::Nil".to_string()
        };
        let mut out = default;
        // build the chain right to left
        for (i, clause) in clauses.iter().enumerate().rev() {
            let (pred, body) = list_parts(clause)
                .ok_or_else(|| LispError::malformed("cond", "clause is not a list"))?;
            let is_default = matches!(&pred, Value::Sym(s) if *s == wk_t);
            if is_default {
                if i + 1 < clauses.len() {
                    let warning = "cond: clauses after a default clause are unreachable";
                    tracing::warn!("{}", warning);
                    self.warnings.push(warning.to_string());
                }
                out = self.lower_clause_body(&body, &pred, tail)?;
                continue;
            }
            let pred_expr = self.lower_value(&pred)?;
            let body_expr = self.lower_clause_body(&body, &pred, tail)?;
            out = format!(
                "{{ let __c = {}; if truthy(&__c) {{ {} }} else {{ {} }} }}",
                pred_expr, body_expr, out
            );
        }
        Ok(out)
    }

    fn lower_clause_body(&mut self, body: &Value, pred: &Value, tail: bool) -> LispResult<String> {
        let forms = proper_args(body, "cond")?;
        if forms.is_empty() {
            // a body-less clause yields the predicate's value
            let expr = self.lower_value(pred)?;
            return Ok(wrap_tail(tail, expr));
        }
        self.lower_sequence(&forms, tail)
    }

    fn lower_progn(&mut self, rest: &Value, tail: bool) -> LispResult<String> {
        let forms = proper_args(rest, "progn")?;
        if forms.is_empty() {
            return Ok(wrap_tail(tail, "Value::Nil".to_string()));
        }
        self.lower_sequence(&forms, tail)
    }

    /// A body: all but the last for effect, the last in the requested mode.
    fn lower_sequence(&mut self, forms: &[Value], tail: bool) -> LispResult<String> {
        let mut out = String::from("{ ");
        for form in &forms[..forms.len() - 1] {
            let expr = self.lower_value(form)?;
            let _ = write!(out, "let _ = {}; ", expr);
        }
        let last = &forms[forms.len() - 1];
        let last_expr = if tail {
            self.lower_tail(last)?
        } else {
            self.lower_value(last)?
        };
        let _ = write!(out, "{} }}", last_expr);
        Ok(out)
    }

    fn lower_setq(&mut self, rest: &Value) -> LispResult<String> {
        let args = proper_args(rest, "setq")?;
        if args.len() % 2 != 0 {
            return Err(LispError::malformed("setq", "odd number of arguments"));
        }
        if args.is_empty() {
            return Ok("Value::Nil".to_string());
        }
        let mut exprs = Vec::new();
        for pair in args.chunks(2) {
            let sym = match &pair[0] {
                Value::Sym(s) => s.clone(),
                other => {
                    return Err(LispError::malformed(
                        "setq",
                        format!("cannot assign to {}", other),
                    ))
                }
            };
            if sym.is_reserved() {
                return Err(LispError::malformed(
                    "setq",
                    format!("cannot bind reserved word {}", sym),
                ));
            }
            let value_expr = self.lower_value(&pair[1])?;
            let expr = match self.lookup_local(&sym) {
                Some(var) => format!(
                    "{{ let __v = {}; {}.set(__v.clone()); __v }}",
                    value_expr, var
                ),
                None => {
                    let known = self.global_names.contains(&sym)
                        || self.interp.globals.lookup(&sym).is_some();
                    if !known {
                        self.undefined.insert(sym.name().to_string());
                    }
                    format!("set_global(rt, {:?}, {})?", sym.name(), value_expr)
                }
            };
            exprs.push(expr);
        }
        let mut out = String::from("{ ");
        for expr in &exprs[..exprs.len() - 1] {
            let _ = write!(out, "let _ = {}; ", expr);
        }
        let _ = write!(out, "{} }}", exprs[exprs.len() - 1]);
        Ok(out)
    }

    fn lower_nested_define(&mut self, rest: &Value) -> LispResult<String> {
        let args = proper_args(rest, "define")?;
        if args.len() != 2 {
            return Err(LispError::arity("define", crate::error::ARITY_TWO, args.len()));
        }
        let sym = match &args[0] {
            Value::Sym(s) => s.clone(),
            other => {
                return Err(LispError::malformed(
                    "define",
                    format!("cannot define {}", other),
                ))
            }
        };
        if sym.is_reserved() {
            return Err(LispError::malformed(
                "define",
                format!("cannot bind reserved word {}", sym),
            ));
        }
        let value_expr = self.lower_value(&args[1])?;
        self.global_names.insert(sym.clone());
        self.undefined.remove(sym.name());
        Ok(format!(
            "define_global(rt, {:?}, {})?",
            sym.name(),
            value_expr
        ))
    }

    fn lower_inline_load(&mut self, spec: &str) -> LispResult<String> {
        let path = self.interp.resolve_load_path(spec)?;
        let source = std::fs::read_to_string(&path)
            .map_err(|e| LispError::Io(format!("cannot load {}: {}", path.display(), e)))?;
        let shown = path.display().to_string();
        let forms = {
            let mut reader = Reader::new(&mut self.interp.symtab, &source, Some(&shown));
            reader.read_all()?
        };
        if forms.is_empty() {
            return Ok("Value::Nil".to_string());
        }
        self.interp.load_stack.push(path);
        let result = self.lower_sequence(&forms, false);
        self.interp.load_stack.pop();
        result
    }

    // ------------------------------------------------------------------
    // lambda / let / labels
    // ------------------------------------------------------------------

    fn lower_lambda_form(&mut self, rest: &Value, hint: &str) -> LispResult<String> {
        let wk = self.interp.symtab.wk.clone();
        let (first, after) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("lambda", "missing parameter list"))?;
        if matches!(&first, Value::Sym(s) if *s == wk.dynamic) {
            return Err(LispError::NotImplemented(
                "dynamic lambdas in compiled units".to_string(),
            ));
        }
        self.lower_lambda(&first, &after, hint)
    }

    fn lower_lambda(&mut self, params: &Value, body: &Value, hint: &str) -> LispResult<String> {
        self.interp.validate_params(params)?;
        let (fixed, rest_param) = split_params(params)?;

        // clone every in-scope cell the body references, so the generated
        // closure can move its own copies
        let captured = self.locals_in(body);
        let mut out = String::from("{ ");
        for var in &captured {
            let _ = write!(out, "let {} = {}.clone(); ", var, var);
        }

        let mut scope: HashMap<Symbol, String> = HashMap::new();
        let mut binds = String::new();
        for (i, p) in fixed.iter().enumerate() {
            let var = self.fresh(p);
            let _ = write!(binds, "let {} = cell(args[{}].clone()); ", var, i);
            scope.insert(p.clone(), var);
        }
        if let Some(r) = &rest_param {
            let var = self.fresh(r);
            let _ = write!(binds, "let {} = cell(rest_slice(args, {})); ", var, fixed.len());
            scope.insert(r.clone(), var);
        }

        self.scopes.push(scope);
        let body_forms = proper_args(body, "lambda")?;
        let body_expr = if body_forms.is_empty() {
            "done(Value::Nil)".to_string()
        } else {
            self.lower_sequence(&body_forms, true)?
        };
        self.scopes.pop();

        let _ = write!(
            out,
            "make_fun(move |rt: &mut Rt, args: &[Value]| {{ expect_argc({:?}, args, {}, {})?; {}{} }}) }}",
            hint,
            fixed.len(),
            rest_param.is_some(),
            binds,
            body_expr
        );
        Ok(out)
    }

    fn lower_let(&mut self, kind: Symbol, rest: &Value, tail: bool) -> LispResult<String> {
        let wk = self.interp.symtab.wk.clone();
        let (first, mut body) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("let", "missing binding list"))?;

        let mut named: Option<Symbol> = None;
        let mut dynamic = false;
        let bindings_form;
        match &first {
            Value::Sym(s) if *s == wk.dynamic => {
                dynamic = true;
                let (b, after) = list_parts(&body)
                    .ok_or_else(|| LispError::malformed("let", "missing binding list"))?;
                bindings_form = b;
                body = after;
            }
            Value::Sym(s) => match list_parts(&body) {
                Some((maybe_bindings, after))
                    if matches!(maybe_bindings, Value::Nil | Value::Cons(_)) =>
                {
                    named = Some(s.clone());
                    bindings_form = maybe_bindings;
                    body = after;
                }
                _ => bindings_form = first.clone(),
            },
            _ => bindings_form = first.clone(),
        }

        let bindings = self.interp.parse_bindings(&bindings_form)?;
        let body_forms = proper_args(&body, "let")?;

        if dynamic {
            let expr = self.lower_dynamic_let(&kind, &wk, bindings, &body_forms)?;
            return Ok(wrap_tail(tail, expr));
        }

        if let Some(name) = named {
            return self.lower_named_let(name, bindings, &body_forms, tail);
        }

        let star = kind == wk.let_star;
        let rec = kind == wk.letrec;
        let mut out = String::from("{ ");

        if rec {
            // pre-allocate unassigned slots, then fill them in order
            let mut scope: HashMap<Symbol, String> = HashMap::new();
            let mut vars = Vec::new();
            for (sym, _) in &bindings {
                let var = self.fresh(sym);
                let _ = write!(out, "let {} = cell(unassigned(rt)); ", var);
                scope.insert(sym.clone(), var.clone());
                vars.push(var);
            }
            self.scopes.push(scope);
            let mut fill = Ok(());
            for ((_, rhs), var) in bindings.iter().zip(&vars) {
                match self.lower_value(rhs) {
                    Ok(expr) => {
                        let _ = write!(out, "{}.set({}); ", var, expr);
                    }
                    Err(e) => {
                        fill = Err(e);
                        break;
                    }
                }
            }
            if let Err(e) = fill {
                self.scopes.pop();
                return Err(e);
            }
        } else if star {
            let mut scope: HashMap<Symbol, String> = HashMap::new();
            self.scopes.push(scope.clone());
            for (sym, rhs) in &bindings {
                let expr = match self.lower_value(rhs) {
                    Ok(e) => e,
                    Err(e) => {
                        self.scopes.pop();
                        return Err(e);
                    }
                };
                let var = self.fresh(sym);
                let _ = write!(out, "let {} = cell({}); ", var, expr);
                scope.insert(sym.clone(), var);
                if let Some(top) = self.scopes.last_mut() {
                    *top = scope.clone();
                }
            }
        } else {
            // plain let: right-hand sides in the outer scope
            let mut exprs = Vec::with_capacity(bindings.len());
            for (_, rhs) in &bindings {
                exprs.push(self.lower_value(rhs)?);
            }
            let mut scope: HashMap<Symbol, String> = HashMap::new();
            for ((sym, _), expr) in bindings.iter().zip(exprs) {
                let var = self.fresh(sym);
                let _ = write!(out, "let {} = cell({}); ", var, expr);
                scope.insert(sym.clone(), var);
            }
            self.scopes.push(scope);
        }

        let body_expr = if body_forms.is_empty() {
            wrap_tail(tail, "Value::Nil".to_string())
        } else {
            match self.lower_sequence(&body_forms, tail) {
                Ok(e) => e,
                Err(e) => {
                    self.scopes.pop();
                    return Err(e);
                }
            }
        };
        self.scopes.pop();
        let _ = write!(out, "{} }}", body_expr);
        Ok(out)
    }

    fn lower_named_let(
        &mut self,
        name: Symbol,
        bindings: Vec<(Symbol, Value)>,
        body_forms: &[Value],
        tail: bool,
    ) -> LispResult<String> {
        // initial values in the outer scope
        let mut init_exprs = Vec::with_capacity(bindings.len());
        for (_, rhs) in &bindings {
            init_exprs.push(self.lower_value(rhs)?);
        }

        let fn_var = self.fresh(&name);
        let mut scope = HashMap::new();
        scope.insert(name.clone(), fn_var.clone());
        self.scopes.push(scope);

        let params = crate::value::list_from(
            &bindings
                .iter()
                .map(|(s, _)| Value::Sym(s.clone()))
                .collect::<Vec<_>>(),
        );
        let body_list = crate::value::list_from(body_forms);
        let lambda_expr = self.lower_lambda(&params, &body_list, name.name());
        self.scopes.pop();
        let lambda_expr = lambda_expr?;

        let mut out = String::from("{ ");
        let _ = write!(out, "let {} = cell(Value::Nil); ", fn_var);
        let _ = write!(out, "{}.set({}); ", fn_var, lambda_expr);
        let mut names = Vec::with_capacity(init_exprs.len());
        for (i, expr) in init_exprs.iter().enumerate() {
            let _ = write!(out, "let __a{} = {}; ", i, expr);
            names.push(format!("__a{}", i));
        }
        if tail {
            let _ = write!(out, "tailcall({}.get(), vec![{}]) }}", fn_var, names.join(", "));
        } else {
            let _ = write!(
                out,
                "funcall(rt, {}.get(), &[{}])? }}",
                fn_var,
                names.join(", ")
            );
        }
        Ok(out)
    }

    /// `let dynamic`: save global slots, run the body, restore on every
    /// path.
    fn lower_dynamic_let(
        &mut self,
        kind: &Symbol,
        wk: &crate::symbol::WellKnown,
        bindings: Vec<(Symbol, Value)>,
        body_forms: &[Value],
    ) -> LispResult<String> {
        if *kind == wk.letrec {
            return Err(LispError::NotImplemented(
                "letrec dynamic in compiled units".to_string(),
            ));
        }
        let mut out = String::from("{ ");
        // save old values
        for (i, (sym, _)) in bindings.iter().enumerate() {
            let known = self.global_names.contains(sym)
                || self.interp.globals.lookup(sym).is_some();
            if !known {
                self.undefined.insert(sym.name().to_string());
            }
            let _ = write!(out, "let __old{} = global(rt, {:?})?; ", i, sym.name());
        }
        // bind: plain let evaluates all first, let* interleaves
        if *kind == wk.let_ {
            for (i, (_, rhs)) in bindings.iter().enumerate() {
                let expr = self.lower_value(rhs)?;
                let _ = write!(out, "let __new{} = {}; ", i, expr);
            }
            for (i, (sym, _)) in bindings.iter().enumerate() {
                let _ = write!(out, "set_global(rt, {:?}, __new{})?; ", sym.name(), i);
            }
        } else {
            for (sym, rhs) in &bindings {
                let expr = self.lower_value(rhs)?;
                let _ = write!(out, "set_global(rt, {:?}, {})?; ", sym.name(), expr);
            }
        }
        // run the body with restoration on both paths
        let body_expr = if body_forms.is_empty() {
            "Value::Nil".to_string()
        } else {
            self.lower_sequence(body_forms, false)?
        };
        let _ = write!(
            out,
            "let __r = (|| -> LispResult<Value> {{ Ok({}) }})(); ",
            body_expr
        );
        for (i, (sym, _)) in bindings.iter().enumerate() {
            let _ = write!(out, "set_global(rt, {:?}, __old{})?; ", sym.name(), i);
        }
        let _ = write!(out, "__r? }}");
        Ok(out)
    }

    fn lower_labels(&mut self, rest: &Value, tail: bool) -> LispResult<String> {
        let (defs_form, body) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("labels", "missing definition list"))?;
        let defs = proper_args(&defs_form, "labels")?;
        let body_forms = proper_args(&body, "labels")?;

        // one shared scope so every local function sees all names
        let mut scope: HashMap<Symbol, String> = HashMap::new();
        let mut parsed = Vec::new();
        for def in &defs {
            let (name_v, after_name) = list_parts(def)
                .ok_or_else(|| LispError::malformed("labels", "definition is not a list"))?;
            let name = match name_v {
                Value::Sym(s) => s,
                other => {
                    return Err(LispError::malformed(
                        "labels",
                        format!("function name is not a symbol: {}", other),
                    ))
                }
            };
            let (params, fn_body) = list_parts(&after_name)
                .ok_or_else(|| LispError::malformed("labels", "missing parameter list"))?;
            let var = self.fresh(&name);
            scope.insert(name.clone(), var.clone());
            parsed.push((name, var, params, fn_body));
        }

        let mut out = String::from("{ ");
        for (_, var, _, _) in &parsed {
            let _ = write!(out, "let {} = cell(Value::Nil); ", var);
        }
        self.scopes.push(scope);
        let mut result = Ok(());
        for (name, var, params, fn_body) in &parsed {
            match self.lower_lambda(params, fn_body, name.name()) {
                Ok(lambda_expr) => {
                    let _ = write!(out, "{}.set({}); ", var, lambda_expr);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let body_expr = match (&result, body_forms.is_empty()) {
            (Err(_), _) => String::new(),
            (Ok(()), true) => wrap_tail(tail, "Value::Nil".to_string()),
            (Ok(()), false) => match self.lower_sequence(&body_forms, tail) {
                Ok(e) => e,
                Err(e) => {
                    result = Err(e);
                    String::new()
                }
            },
        };
        self.scopes.pop();
        result?;
        let _ = write!(out, "{} }}", body_expr);
        Ok(out)
    }

    /// The in-scope cell variables a form refers to (over-approximate:
    /// shadowing inside the form is ignored, extra clones are harmless).
    fn locals_in(&self, form: &Value) -> Vec<String> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut visited: HashSet<usize> = HashSet::new();
        self.collect_locals(form, &mut found, &mut visited);
        found.into_iter().collect()
    }

    fn collect_locals(
        &self,
        form: &Value,
        found: &mut BTreeSet<String>,
        visited: &mut HashSet<usize>,
    ) {
        match form {
            Value::Sym(s) => {
                if let Some(var) = self.lookup_local(s) {
                    found.insert(var);
                }
            }
            Value::Cons(c) => {
                let key = std::rc::Rc::as_ptr(c) as usize;
                if !visited.insert(key) {
                    return;
                }
                let (car, cdr) = {
                    let b = c.borrow();
                    (b.car.clone(), b.cdr.clone())
                };
                self.collect_locals(&car, found, visited);
                self.collect_locals(&cdr, found, visited);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // assembly
    // ------------------------------------------------------------------

    fn assemble(
        &self,
        global_inits: &[(String, String, Option<String>)],
        body_stmts: &[(Option<String>, String)],
    ) -> LispResult<String> {
        let unit = &self.unit;
        let mut out = String::new();
        writeln!(out, "// Generated by lilt {}; do not edit.", env!("CARGO_PKG_VERSION"))?;
        writeln!(
            out,
            "#![allow(non_snake_case, unused_variables, unused_mut, dead_code, unused_parens)]"
        )?;
        writeln!(out)?;
        writeln!(out, "use lilt::gen::prelude::*;")?;
        writeln!(out)?;
        writeln!(out, "pub struct {} {{", unit)?;
        writeln!(out, "    rt: Rt,")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        writeln!(out, "impl {} {{", unit)?;
        writeln!(out, "    pub fn new() -> LispResult<{}> {{", unit)?;
        writeln!(out, "        let mut unit = {} {{ rt: Rt::new() }};", unit)?;
        writeln!(out, "        unit.init_constants()?;")?;
        writeln!(out, "        unit.init_globals()?;")?;
        writeln!(out, "        Ok(unit)")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;
        writeln!(out, "    fn init_constants(&mut self) -> LispResult<()> {{")?;
        writeln!(out, "        let rt = &mut self.rt;")?;
        for (index, (key, expr)) in self.pool.iter().enumerate() {
            writeln!(out, "        // q{}: {}", index, key)?;
            writeln!(out, "        let q{} = {};", index, expr)?;
            writeln!(out, "        qpush(rt, q{});", index)?;
        }
        writeln!(out, "        Ok(())")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;
        writeln!(out, "    fn init_globals(&mut self) -> LispResult<()> {{")?;
        writeln!(out, "        let rt = &mut self.rt;")?;
        for (name, expr, loc) in global_inits {
            if let Some(loc) = loc {
                writeln!(out, "        // {}", loc)?;
            }
            writeln!(out, "        let __v = {};", expr)?;
            writeln!(out, "        define_global(rt, {:?}, __v)?;", name)?;
        }
        writeln!(out, "        Ok(())")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;
        writeln!(
            out,
            "    /// Run the top-level forms once; the value of the last one is returned."
        )?;
        writeln!(out, "    pub fn body(&mut self) -> LispResult<Value> {{")?;
        writeln!(out, "        let rt = &mut self.rt;")?;
        match body_stmts.split_last() {
            None => writeln!(out, "        Ok(Value::Nil)")?,
            Some(((last_loc, last_expr), head)) => {
                for (loc, expr) in head {
                    if let Some(loc) = loc {
                        writeln!(out, "        // {}", loc)?;
                    }
                    writeln!(out, "        let _ = {};", expr)?;
                }
                if let Some(loc) = last_loc {
                    writeln!(out, "        // {}", loc)?;
                }
                writeln!(out, "        Ok({})", last_expr)?;
            }
        }
        writeln!(out, "    }}")?;
        writeln!(out)?;
        writeln!(
            out,
            "    pub fn get_value(&mut self, name: &str) -> LispResult<Value> {{"
        )?;
        writeln!(out, "        self.rt.get_value(name)")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;
        writeln!(
            out,
            "    pub fn get_function(&mut self, name: &str) -> LispResult<Value> {{"
        )?;
        writeln!(out, "        self.rt.get_function(name)")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;
        writeln!(
            out,
            "    pub fn set_command_line_args(&mut self, args: &[String]) {{"
        )?;
        writeln!(out, "        self.rt.set_command_line_args(args);")?;
        writeln!(out, "    }}")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        writeln!(out, "fn main() {{")?;
        writeln!(
            out,
            "    let args: Vec<String> = std::env::args().skip(1).collect();"
        )?;
        writeln!(out, "    let code = match {}::new() {{", unit)?;
        writeln!(out, "        Ok(mut unit) => {{")?;
        writeln!(out, "            unit.set_command_line_args(&args);")?;
        writeln!(out, "            match unit.body() {{")?;
        writeln!(out, "                Ok(_) => 0,")?;
        writeln!(out, "                Err(e) => {{ eprintln!(\"{{}}\", e); 1 }}")?;
        writeln!(out, "            }}")?;
        writeln!(out, "        }}")?;
        writeln!(out, "        Err(e) => {{ eprintln!(\"{{}}\", e); 1 }}")?;
        writeln!(out, "    }};")?;
        writeln!(out, "    std::process::exit(code);")?;
        writeln!(out, "}}")?;
        Ok(out)
    }
}

fn wrap_tail(tail: bool, expr: String) -> String {
    if tail {
        format!("done({})", expr)
    } else {
        expr
    }
}

fn proper_args(rest: &Value, what: &str) -> LispResult<Vec<Value>> {
    let (items, tail) =
        list_elements(rest).map_err(|_| LispError::malformed(what, "circular form"))?;
    if !tail.is_nil() {
        return Err(LispError::malformed(what, "dotted form"));
    }
    Ok(items)
}

fn designator(v: &Value, what: &str) -> LispResult<String> {
    match v {
        Value::Str(s) => Ok(s.to_string()),
        Value::Sym(s) => Ok(s.name().to_string()),
        other => Err(LispError::type_error(
            what,
            "string or symbol",
            other.type_name(),
        )),
    }
}

/// `(null x)` or `(not x)` as a condition: hand back `x` so the branches
/// can swap instead of double-negating.
fn negated_condition(interp: &Interp, cond: &Value) -> Option<Value> {
    let (op, rest) = list_parts(cond)?;
    let sym = match op {
        Value::Sym(s) => s,
        _ => return None,
    };
    if sym.name() != "null" && sym != interp.symtab.wk.not {
        return None;
    }
    let (arg, tail) = list_parts(&rest)?;
    if tail.is_nil() {
        Some(arg)
    } else {
        None
    }
}

/// A `file:line:col` comment for a form that carries reader positions.
fn loc_comment(form: &Value) -> Option<String> {
    form.pos().map(|p| p.to_string())
}

pub(crate) fn split_params(params: &Value) -> LispResult<(Vec<Symbol>, Option<Symbol>)> {
    match params {
        Value::Nil => Ok((Vec::new(), None)),
        Value::Sym(s) => Ok((Vec::new(), Some(s.clone()))),
        Value::Cons(_) => {
            let mut fixed = Vec::new();
            let mut cur = params.clone();
            loop {
                match cur {
                    Value::Nil => return Ok((fixed, None)),
                    Value::Sym(s) => return Ok((fixed, Some(s))),
                    Value::Cons(ref c) => {
                        let (car, cdr) = {
                            let b = c.borrow();
                            (b.car.clone(), b.cdr.clone())
                        };
                        match car {
                            Value::Sym(s) => fixed.push(s),
                            other => {
                                return Err(LispError::malformed(
                                    "lambda",
                                    format!("parameter is not a symbol: {}", other),
                                ))
                            }
                        }
                        cur = cdr;
                    }
                    other => {
                        return Err(LispError::malformed(
                            "lambda",
                            format!("parameter list contains {}", other),
                        ))
                    }
                }
            }
        }
        other => Err(LispError::malformed(
            "lambda",
            format!("bad parameter list: {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen(src: &str) -> String {
        let mut interp = Interp::new();
        generate_unit(&mut interp, src, Some("test.lisp"), "Unit").unwrap()
    }

    fn gen_err(src: &str) -> LispError {
        let mut interp = Interp::new();
        generate_unit(&mut interp, src, Some("test.lisp"), "Unit").unwrap_err()
    }

    #[test]
    fn test_mangle() {
        assert_eq!(mangle("foo-bar!"), "_foo_45_bar_33_");
        assert_eq!(mangle("x_1"), "_x_1");
        assert_eq!(mangle("+"), "_43_");
    }

    #[test]
    fn test_empty_unit() {
        let out = gen("");
        assert!(out.contains("pub struct Unit"));
        assert!(out.contains("pub fn body(&mut self) -> LispResult<Value>"));
        assert!(out.contains("Ok(Value::Nil)"));
        assert!(out.contains("use lilt::gen::prelude::*;"));
    }

    #[test]
    fn test_define_emits_global_slot() {
        let out = gen("(define x 5)");
        assert!(out.contains("define_global(rt, \"x\""));
        assert!(out.contains("Value::Long(5i64)"));
    }

    #[test]
    fn test_duplicate_define_fails() {
        let e = gen_err("(define x 1) (define x 2)");
        assert!(e.to_string().contains("duplicate"));
    }

    #[test]
    fn test_constant_pool_dedup() {
        let out = gen("(write '(1 2)) (write '(1 2)) (write '(3))");
        assert_eq!(out.matches("qpush(rt, q0)").count(), 1);
        assert_eq!(out.matches("qref(rt, 0)").count(), 2);
        assert!(out.contains("// q0: (1 2)"));
        assert!(out.contains("// q1: (3)"));
    }

    #[test]
    fn test_tail_call_shapes() {
        // a self-recursive tail call becomes a pending-call record
        let out = gen("(defun f (x) (f x))");
        assert!(out.contains("tailcall(__f"), "expected tailcall shape:\n{}", out);

        // a call in argument position stays in funcall shape
        let out = gen("(defun g (x) (1+ (g x)))");
        assert!(out.contains("funcall(rt, __f"), "expected funcall shape:\n{}", out);
    }

    #[test]
    fn test_unknown_symbol_fails() {
        let e = gen_err("(frobnicate 1)");
        assert!(e.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_forward_reference_between_defines_is_fine() {
        let out = gen("(defun f (x) (g x)) (defun g (x) x) (write (f 1))");
        assert!(out.contains("global(rt, \"g\")?"));
    }

    #[test]
    fn test_require_only_top_level() {
        let e = gen_err("(defun f () (require \"x\"))");
        assert!(e.to_string().contains("top-level"));
        let e = gen_err("(defun f () (provide \"x\"))");
        assert!(e.to_string().contains("top-level"));
    }

    #[test]
    fn test_primitive_arity_checked_at_generation_time() {
        let e = gen_err("(write (cons 1))");
        assert!(matches!(e, LispError::Arity { .. }));
    }

    #[test]
    fn test_numeric_open_code_rejects_string_literal() {
        let e = gen_err("(write (+ 1 \"two\"))");
        assert!(matches!(e, LispError::Type { .. }));
    }

    #[test]
    fn test_macro_expands_at_generation_time() {
        let out = gen("(defmacro m (a) `(+ ,a 1)) (write (m 2))");
        assert!(out.contains("Value::Long(2i64)"));
        assert!(out.contains("num(&"));
    }

    #[test]
    fn test_macro_use_before_definition_fails() {
        let e = gen_err("(write (m 2)) (defmacro m (a) `(+ ,a 1))");
        assert!(e.to_string().contains("before its definition"));
    }

    #[test]
    fn test_if_null_unfolds_to_swapped_branches() {
        let out = gen("(define r (if (null 5) 1 2))");
        let then_pos = out.find("Value::Long(2i64)").expect("else branch");
        let else_pos = out.find("Value::Long(1i64)").expect("then branch");
        assert!(then_pos < else_pos, "branches were not swapped:\n{}", out);
        assert!(!out.contains("null"));
    }

    #[test]
    fn test_speed_zero_disables_open_coding() {
        let out = gen("(declaim (optimize (speed 0))) (define r (+ 1 2))");
        assert!(!out.contains("num(&"));
        assert!(out.contains("global(rt, \"+\")?"));
    }

    #[test]
    fn test_lambda_parameters_are_mangled_cells() {
        let out = gen("(defun f (a-b) a-b)");
        assert!(out.contains("_a_45_b_"));
        assert!(out.contains("cell(args[0].clone())"));
        assert!(out.contains("expect_argc(\"lambda\", args, 1, false)?"));
    }

    #[test]
    fn test_varargs_bind_rest_slice() {
        let out = gen("(defun f (a . rest) rest)");
        assert!(out.contains("rest_slice(args, 1)"));
        assert!(out.contains("expect_argc(\"lambda\", args, 1, true)?"));
    }

    #[test]
    fn test_source_location_comments() {
        let out = gen("(write 1)");
        assert!(out.contains("// test.lisp:1:1"));
    }

    #[test]
    fn test_dynamic_let_saves_and_restores() {
        let out = gen("(define g 1) (write (let dynamic ((g 2)) g))");
        assert!(out.contains("let __old0 = global(rt, \"g\")?"));
        assert!(out.contains("set_global(rt, \"g\", __old0)?"));
    }

    #[test]
    fn test_setq_on_global_goes_through_slot() {
        let out = gen("(define x 1) (setq x 2)");
        assert!(out.contains("set_global(rt, \"x\""));
    }

    #[test]
    fn test_letrec_slots_start_unassigned() {
        let out = gen("(write (letrec ((f (lambda (n) n))) (f 1)))");
        assert!(out.contains("cell(unassigned(rt))"));
    }

    #[test]
    fn test_labels_emits_shared_cells() {
        let out = gen(
            "(write (labels ((even? (n) (if (= n 0) t (odd? (1- n))))
                             (odd?  (n) (if (= n 0) nil (even? (1- n)))))
                      (even? 4)))",
        );
        assert!(out.contains("cell(Value::Nil)"));
        assert!(out.contains(".set({"));
    }

    #[test]
    fn test_cond_warns_after_default_clause() {
        let mut interp = Interp::new();
        let forms = {
            let mut reader = Reader::new(
                &mut interp.symtab,
                "(write (cond (t 1) (nil 2)))",
                None,
            );
            reader.read_all().unwrap()
        };
        let mut cg = Codegen::new(&mut interp, "Unit");
        cg.generate(&forms).unwrap();
        assert!(!cg.warnings.is_empty());
    }

    #[test]
    fn test_progn_flattens_at_top_level() {
        let out = gen("(progn (define a 1) (define b 2)) (write (list a b))");
        assert!(out.contains("define_global(rt, \"a\""));
        assert!(out.contains("define_global(rt, \"b\""));
    }

    #[test]
    fn test_nested_define_allowed_in_body() {
        let out = gen("(let ((x 1)) (define y 2) (write y))");
        assert!(out.contains("define_global(rt, \"y\""));
    }

    #[test]
    fn test_command_line_argument_list_is_known() {
        let out = gen("(write *command-line-argument-list*)");
        assert!(out.contains("global(rt, \"*command-line-argument-list*\")?"));
    }
}
