//! List primitives: accessors, constructors, destructive update, search.

use super::{bool_value, primitive};
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::value::{
    self, cons, eq, eql, list_elements, list_from, list_parts, list_star_from, print_value, Value,
};

/// `(car '(1 2))` => 1; `(car nil)` => nil
pub fn car(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    value::car(&args[0])
}

/// `(cdr '(1 2))` => (2)
pub fn cdr(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    value::cdr(&args[0])
}

pub fn cons_(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(cons(args[0].clone(), args[1].clone()))
}

/// Destructively replace the car; returns the cons.
pub fn rplaca(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match &args[0] {
        Value::Cons(c) => {
            c.borrow_mut().car = args[1].clone();
            Ok(args[0].clone())
        }
        other => Err(LispError::type_error("rplaca", "cons", other.type_name())),
    }
}

/// Destructively replace the cdr; returns the cons.
pub fn rplacd(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match &args[0] {
        Value::Cons(c) => {
            c.borrow_mut().cdr = args[1].clone();
            Ok(args[0].clone())
        }
        other => Err(LispError::type_error("rplacd", "cons", other.type_name())),
    }
}

pub fn list(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(list_from(args))
}

/// `(list* 1 2 '(3))` => (1 2 3); the last argument becomes the tail.
pub fn list_star(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(list_star_from(args))
}

/// Concatenate lists; the last argument may be any value and becomes the
/// tail of the result.
pub fn append(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    if args.is_empty() {
        return Ok(Value::Nil);
    }
    let mut acc = args[args.len() - 1].clone();
    for arg in args[..args.len() - 1].iter().rev() {
        if arg.is_nil() {
            continue;
        }
        let (items, tail) = list_elements(arg)
            .map_err(|_| LispError::malformed("append", "circular list"))?;
        if !tail.is_nil() {
            return Err(LispError::type_error(
                "append",
                "proper list",
                print_value(arg, true),
            ));
        }
        for item in items.into_iter().rev() {
            acc = cons(item, acc);
        }
    }
    Ok(acc)
}

fn assoc_by(name: &str, key: &Value, alist: &Value, same: fn(&Value, &Value) -> bool) -> LispResult<Value> {
    let (entries, tail) =
        list_elements(alist).map_err(|_| LispError::malformed(name, "circular list"))?;
    if !tail.is_nil() {
        return Err(LispError::type_error(
            name,
            "proper list",
            print_value(alist, true),
        ));
    }
    for entry in entries {
        if entry.is_nil() {
            continue;
        }
        match list_parts(&entry) {
            Some((entry_key, _)) => {
                if same(&entry_key, key) {
                    return Ok(entry);
                }
            }
            None => {
                return Err(LispError::type_error(
                    name,
                    "list of conses",
                    print_value(&entry, true),
                ))
            }
        }
    }
    Ok(Value::Nil)
}

/// `(assoc key alist)` using `eql` on the keys.
pub fn assoc(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    assoc_by("assoc", &args[0], &args[1], eql)
}

/// `(assq key alist)` using `eq` on the keys.
pub fn assq(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    assoc_by("assq", &args[0], &args[1], eq)
}

pub fn null(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, args[0].is_nil()))
}

/// Logical negation; identical to `null`.
pub fn not(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, args[0].is_nil()))
}

pub fn consp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let is_cons = matches!(&args[0], Value::Cons(_) | Value::Slice(_));
    Ok(bool_value(interp, is_cons))
}

pub fn listp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let is_list = matches!(&args[0], Value::Nil | Value::Cons(_) | Value::Slice(_));
    Ok(bool_value(interp, is_list))
}

pub fn atom(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let is_atom = !matches!(&args[0], Value::Cons(_) | Value::Slice(_));
    Ok(bool_value(interp, is_atom))
}

primitive!("car", 1, Some(1), car);
primitive!("cdr", 1, Some(1), cdr);
primitive!("cons", 2, Some(2), cons_);
primitive!("rplaca", 2, Some(2), rplaca);
primitive!("rplacd", 2, Some(2), rplacd);
primitive!("list", 0, None, list);
primitive!("list*", 1, None, list_star);
primitive!("append", 0, None, append);
primitive!("assoc", 2, Some(2), assoc);
primitive!("assq", 2, Some(2), assq);
primitive!("null", 1, Some(1), null);
primitive!("not", 1, Some(1), not);
primitive!("consp", 1, Some(1), consp);
primitive!("listp", 1, Some(1), listp);
primitive!("atom", 1, Some(1), atom);
