// ABOUTME: Runtime support for ahead-of-time generated units

//! The functions generated source leans on.  A compiled unit is a plain
//! Rust program built against this crate: its lambdas become [`Value::Host`]
//! callables returning [`Step`]s, its locals live in [`VarCell`]s, and its
//! globals and constant pool live in the embedded interpreter, so compiled
//! and interpreted code share one runtime and one primitive registry.

use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::value::{self, ArraySlice, Step, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// The runtime a generated unit drives.  One per unit.
pub type Rt = Interp;

pub mod prelude {
    pub use super::{
        boolean, car_of, cdr_of, cell, cons, dec1, define_global, done, expect_argc, funcall,
        global, inc1, list, make_fun, num, prim, qpush, qref, rest_slice, set_global, string, sym,
        tailcall, truthy, unassigned, Rt, VarCell,
    };
    pub use crate::error::{LispError, LispResult};
    pub use crate::value::{eq as value_eq, Step, Value};
}

/// A mutable variable slot.  Compiled locals are uniformly cells so that
/// closures capturing them observe `setq`.
#[derive(Clone)]
pub struct VarCell(Rc<RefCell<Value>>);

impl VarCell {
    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    pub fn set(&self, v: Value) {
        *self.0.borrow_mut() = v;
    }
}

pub fn cell(v: Value) -> VarCell {
    VarCell(Rc::new(RefCell::new(v)))
}

pub fn truthy(v: &Value) -> bool {
    v.truthy()
}

/// Wrap a compiled function body as a callable value.
pub fn make_fun<F>(f: F) -> Value
where
    F: Fn(&mut Rt, &[Value]) -> LispResult<Step> + 'static,
{
    Value::Host(Rc::new(f))
}

/// The funcall shape: invoke synchronously, driving any pending tail calls
/// (the trampoline) until a plain value is produced.
pub fn funcall(rt: &mut Rt, f: Value, args: &[Value]) -> LispResult<Value> {
    rt.apply(f, args)
}

/// The tailcall shape: a pending-call record for the caller's trampoline.
pub fn tailcall(f: Value, args: Vec<Value>) -> LispResult<Step> {
    Ok(Step::Tail(f, args))
}

pub fn done(v: Value) -> LispResult<Step> {
    Ok(Step::Done(v))
}

/// Arity guard at the top of a compiled function.
pub fn expect_argc(name: &str, args: &[Value], fixed: usize, varargs: bool) -> LispResult<()> {
    let bad = if varargs {
        args.len() < fixed
    } else {
        args.len() != fixed
    };
    if bad {
        let expected = if varargs {
            format!("at least {}", fixed)
        } else {
            fixed.to_string()
        };
        return Err(LispError::arity(name, expected, args.len()));
    }
    Ok(())
}

/// The rest-binding for a dotted parameter tail.
pub fn rest_slice(args: &[Value], from: usize) -> Value {
    let items: Rc<[Value]> = Rc::from(args[from.min(args.len())..].to_vec());
    ArraySlice::new(items, 0)
}

// ============================================================================
// Globals and the constant pool
// ============================================================================

/// Read a global through the runtime so redefinition stays observable.
pub fn global(rt: &mut Rt, name: &str) -> LispResult<Value> {
    rt.get_value(name)
}

pub fn set_global(rt: &mut Rt, name: &str, v: Value) -> LispResult<Value> {
    let sym = rt.intern(name);
    if rt.globals.set(&sym, v.clone()) {
        Ok(v)
    } else {
        Err(LispError::Unbound(name.to_string()))
    }
}

/// `define` semantics: mutate an existing global or prepend a new one;
/// yields the defined symbol.
pub fn define_global(rt: &mut Rt, name: &str, v: Value) -> LispResult<Value> {
    let sym = rt.intern(name);
    if !rt.globals.set(&sym, v.clone()) {
        rt.globals.insert(&sym, v);
    }
    Ok(Value::Sym(sym))
}

/// A primitive by name, from the shared registry.
pub fn prim(rt: &mut Rt, name: &str) -> LispResult<Value> {
    let sym = rt.intern(name);
    rt.registry
        .get(&sym)
        .copied()
        .map(Value::Prim)
        .ok_or_else(|| LispError::Unbound(format!("primitive {}", name)))
}

pub fn qpush(rt: &mut Rt, v: Value) -> usize {
    rt.constant_push(v)
}

pub fn qref(rt: &Rt, index: usize) -> Value {
    rt.constant(index)
}

pub fn unassigned(rt: &Rt) -> Value {
    rt.unassigned_value()
}

// ============================================================================
// Value construction and open-coded helpers
// ============================================================================

pub fn sym(rt: &mut Rt, name: &str) -> Value {
    if name.eq_ignore_ascii_case("nil") {
        Value::Nil
    } else {
        Value::Sym(rt.intern(name))
    }
}

pub fn string(rt: &mut Rt, text: &str) -> Value {
    Value::Str(rt.symtab.intern_string(text))
}

pub fn list(items: &[Value]) -> Value {
    value::list_from(items)
}

pub fn cons(car: Value, cdr: Value) -> Value {
    value::cons(car, cdr)
}

pub fn car_of(v: &Value) -> LispResult<Value> {
    value::car(v)
}

pub fn cdr_of(v: &Value) -> LispResult<Value> {
    value::cdr(v)
}

pub fn boolean(rt: &Rt, b: bool) -> Value {
    if b {
        Value::Sym(rt.symtab.wk.t.clone())
    } else {
        Value::Nil
    }
}

/// Numeric widening for inline arithmetic; matches the primitive library.
pub fn num(v: &Value) -> LispResult<f64> {
    crate::builtins::numbers::as_double("arithmetic", v)
}

pub fn inc1(v: &Value) -> LispResult<Value> {
    match v {
        Value::Long(n) => n
            .checked_add(1)
            .map(Value::Long)
            .ok_or_else(|| LispError::Arithmetic("1+: integer overflow".to_string())),
        Value::Double(d) => Ok(Value::Double(d + 1.0)),
        other => Err(LispError::type_error("1+", "number", other.type_name())),
    }
}

pub fn dec1(v: &Value) -> LispResult<Value> {
    match v {
        Value::Long(n) => n
            .checked_sub(1)
            .map(Value::Long)
            .ok_or_else(|| LispError::Arithmetic("1-: integer overflow".to_string())),
        Value::Double(d) => Ok(Value::Double(d - 1.0)),
        other => Err(LispError::type_error("1-", "number", other.type_name())),
    }
}
