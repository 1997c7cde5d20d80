// ABOUTME: Process-wide interpreter state: symbol table, globals, macros, modules

use crate::builtins::PrimDef;
use crate::env::Env;
use crate::error::{LispError, LispResult};
use crate::reader::Reader;
use crate::symbol::{Symbol, SymbolTable};
use crate::value::{eq, list_from, ConsRef, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

/// Operator names the evaluator may open-code at `speed >= 1` instead of
/// taking the general application path.
const OPEN_CODED: &[&str] = &[
    "+", "-", "*", "/", "=", "/=", "<", "<=", ">", ">=", "car", "cdr", "cons", "eq", "eql",
    "null", "not", "1+", "1-", "append", "list", "list*", "mod", "rem",
];

/// One interpreter instance: everything the evaluator, the primitives and
/// the code generator share.  Strictly single-threaded.
pub struct Interp {
    pub symtab: SymbolTable,
    pub globals: Env,
    pub macros: HashMap<Symbol, Value>,
    pub modules: HashSet<String>,
    pub traced: HashSet<Symbol>,
    pub speed: u8,
    pub libdir: Option<PathBuf>,
    pub(crate) registry: HashMap<Symbol, &'static PrimDef>,
    pub(crate) open_coded: HashMap<Symbol, &'static PrimDef>,
    pub(crate) prim_eval: &'static PrimDef,
    pub(crate) prim_apply: &'static PrimDef,
    pub(crate) unassigned: Value,
    pub(crate) gensym_counter: u64,
    pub(crate) load_stack: Vec<PathBuf>,
    pub(crate) dynamic_unwind: Vec<(ConsRef, Value)>,
    pub(crate) tail_stack: VecDeque<Symbol>,
    pub(crate) constants: Vec<Value>,
    pub(crate) start: Instant,
}

impl Interp {
    pub fn new() -> Self {
        let mut symtab = SymbolTable::new();
        let globals = Env::new();

        let mut registry: HashMap<Symbol, &'static PrimDef> = HashMap::new();
        for def in inventory::iter::<PrimDef> {
            let sym = symtab.intern(def.name);
            globals.insert(&sym, Value::Prim(def));
            registry.insert(sym, def);
        }

        let mut open_coded = HashMap::new();
        for name in OPEN_CODED {
            let sym = symtab.intern(name);
            if let Some(def) = registry.get(&sym) {
                open_coded.insert(sym, *def);
            }
        }

        let prim_eval = *registry
            .get(&symtab.intern("eval"))
            .expect("eval primitive is registered");
        let prim_apply = *registry
            .get(&symtab.intern("apply"))
            .expect("apply primitive is registered");

        // constants visible to programs
        let itups = symtab.intern("internal-time-units-per-second");
        globals.insert(&itups, Value::Double(1e9));
        let argv_sym = symtab.intern("*command-line-argument-list*");
        globals.insert(&argv_sym, Value::Nil);

        Interp {
            symtab,
            globals,
            macros: HashMap::new(),
            modules: HashSet::new(),
            traced: HashSet::new(),
            speed: 1,
            libdir: None,
            registry,
            open_coded,
            prim_eval,
            prim_apply,
            unassigned: Value::Sym(Symbol::uninterned("#<unassigned>")),
            gensym_counter: 0,
            load_stack: Vec::new(),
            dynamic_unwind: Vec::new(),
            tail_stack: VecDeque::new(),
            constants: Vec::new(),
            start: Instant::now(),
        }
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.symtab.intern(name)
    }

    pub(crate) fn is_unassigned(&self, v: &Value) -> bool {
        eq(v, &self.unassigned)
    }

    /// The sentinel that marks a `letrec` slot before its value is assigned.
    pub fn unassigned_value(&self) -> Value {
        self.unassigned.clone()
    }

    pub(crate) fn gensym(&mut self, prefix: &str) -> Symbol {
        self.gensym_counter += 1;
        Symbol::uninterned(format!("{}{}", prefix, self.gensym_counter))
    }

    // ------------------------------------------------------------------
    // Embedder entry points
    // ------------------------------------------------------------------

    /// Read and evaluate every form in `source`; the value of the last form
    /// is returned.  Errors come back annotated with the failing form.
    pub fn interpret_expression(&mut self, source: &str) -> LispResult<Value> {
        self.interpret(source, None)
    }

    pub fn interpret(&mut self, source: &str, file: Option<&str>) -> LispResult<Value> {
        let mut reader = Reader::new(&mut self.symtab, source, file);
        let forms = reader.read_all()?;
        let mut result = Value::Nil;
        for form in forms {
            let globals = self.globals.clone();
            result = self.eval(form, &globals)?;
        }
        Ok(result)
    }

    /// The current value of a global, or an error when the name is not bound.
    pub fn get_value(&mut self, name: &str) -> LispResult<Value> {
        let sym = self.symtab.intern(name);
        self.globals
            .lookup(&sym)
            .ok_or_else(|| LispError::Unbound(format!("{} is not bound", name)))
    }

    /// A callable bound to a global.  The returned adapter stays valid until
    /// the environment is rebuilt.
    pub fn get_function(&mut self, name: &str) -> LispResult<Value> {
        let value = self.get_value(name)?;
        match &value {
            Value::Prim(_) | Value::Host(_) => Ok(value),
            Value::Cons(_) if value.closure_env().is_some() => Ok(value),
            other => Err(LispError::type_error(
                "getFunction",
                "function",
                other.type_name(),
            )),
        }
    }

    pub fn set_command_line_args(&mut self, args: &[String]) {
        let items: Vec<Value> = args
            .iter()
            .map(|a| Value::Str(Rc::from(a.as_str())))
            .collect();
        let sym = self.symtab.intern("*command-line-argument-list*");
        let list = list_from(&items);
        if !self.globals.set(&sym, list.clone()) {
            self.globals.insert(&sym, list);
        }
    }

    // ------------------------------------------------------------------
    // Constant pool for ahead-of-time compiled units
    // ------------------------------------------------------------------

    pub fn constant_push(&mut self, v: Value) -> usize {
        self.constants.push(v);
        self.constants.len() - 1
    }

    pub fn constant(&self, index: usize) -> Value {
        self.constants[index].clone()
    }
}

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::print_value;

    #[test]
    fn test_primitives_registered_in_globals() {
        let mut interp = Interp::new();
        let car = interp.intern("car");
        assert!(matches!(interp.globals.lookup(&car), Some(Value::Prim(_))));
    }

    #[test]
    fn test_time_units_constant() {
        let mut interp = Interp::new();
        let v = interp.get_value("internal-time-units-per-second").unwrap();
        assert!(eq(&v, &Value::Double(1e9)));
    }

    #[test]
    fn test_get_value_unbound() {
        let mut interp = Interp::new();
        assert!(interp.get_value("no-such-global").is_err());
    }

    #[test]
    fn test_get_function_rejects_non_callable() {
        let mut interp = Interp::new();
        interp.interpret_expression("(define x 5)").unwrap();
        assert!(interp.get_function("x").is_err());
        assert!(interp.get_function("car").is_ok());
    }

    #[test]
    fn test_gensym_unique() {
        let mut interp = Interp::new();
        let a = interp.gensym("g");
        let b = interp.gensym("g");
        assert_ne!(a, b);
    }

    #[test]
    fn test_command_line_args() {
        let mut interp = Interp::new();
        interp.set_command_line_args(&["one".to_string(), "two".to_string()]);
        let v = interp.get_value("*command-line-argument-list*").unwrap();
        assert_eq!(print_value(&v, false), "(one two)");
    }
}
