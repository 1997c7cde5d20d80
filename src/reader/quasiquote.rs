// ABOUTME: Read-time backquote expansion into list-construction forms

use crate::error::{LispError, LispResult};
use crate::symbol::{Symbol, WellKnown};
use crate::value::{cons, iter_list, list_elements, list_from, list_parts, Value};

/// Expand a backquoted form into `quote`/`cons`/`list`/`list*`/`append`
/// calls.  Runs at read time, so evaluators and the code generator never see
/// a `quasiquote` form.
pub fn qq_expand(wk: &WellKnown, form: &Value) -> LispResult<Value> {
    match form {
        Value::Nil => Ok(Value::Nil),
        Value::Cons(_) => {
            if let Some(inner) = tagged(form, &wk.unquote) {
                return Ok(inner);
            }
            if tagged(form, &wk.unquote_splice).is_some() {
                return Err(LispError::reader("can't splice here", None));
            }
            if let Some(inner) = tagged(form, &wk.quasiquote) {
                let once = qq_expand(wk, &inner)?;
                return qq_expand(wk, &once);
            }
            let (head, tail) = list_parts(form).expect("cons has parts");
            let expanded_head = qq_expand_list(wk, &head)?;
            if tail.is_nil() {
                Ok(expanded_head)
            } else {
                let expanded_tail = qq_expand(wk, &tail)?;
                Ok(optimized_append(wk, expanded_head, expanded_tail))
            }
        }
        atom => Ok(quote(wk, atom.clone())),
    }
}

/// Expand one element of a backquoted list.  Non-spliced elements come back
/// wrapped so `optimized_append` can flatten them; a splice contributes its
/// form directly.
fn qq_expand_list(wk: &WellKnown, form: &Value) -> LispResult<Value> {
    match form {
        Value::Nil => Ok(quote(wk, list_from(&[Value::Nil]))),
        Value::Cons(_) => {
            if let Some(inner) = tagged(form, &wk.unquote) {
                return Ok(list_from(&[Value::Sym(wk.list.clone()), inner]));
            }
            if let Some(inner) = tagged(form, &wk.unquote_splice) {
                return Ok(inner);
            }
            if let Some(inner) = tagged(form, &wk.quasiquote) {
                let once = qq_expand(wk, &inner)?;
                let twice = qq_expand(wk, &once)?;
                return Ok(list_from(&[Value::Sym(wk.list.clone()), twice]));
            }
            let expanded = qq_expand(wk, form)?;
            Ok(list_from(&[Value::Sym(wk.list.clone()), expanded]))
        }
        atom => Ok(quote(wk, list_from(&[atom.clone()]))),
    }
}

/// Pattern-driven simplification of `(append lhs rhs)`.
fn optimized_append(wk: &WellKnown, lhs: Value, rhs: Value) -> Value {
    if lhs.is_nil() {
        return rhs;
    }
    if rhs.is_nil() {
        return lhs;
    }

    // (append (quote (x)) rhs) -> (cons (quote x) rhs)
    if let Some(single) = quoted_single(wk, &lhs) {
        return list_from(&[Value::Sym(wk.cons.clone()), quote(wk, single), rhs]);
    }

    if let Some(x) = call_single(&lhs, &wk.list) {
        // (append (list x) (list y...)) -> (list x y...)
        if let Some(ys) = call_args(&rhs, &wk.list) {
            let mut items = vec![Value::Sym(wk.list.clone()), x];
            items.extend(ys);
            return list_from(&items);
        }
        // (append (list x) (list* y...)) -> (list* x y...)
        if let Some(ys) = call_args(&rhs, &wk.list_star) {
            let mut items = vec![Value::Sym(wk.list_star.clone()), x];
            items.extend(ys);
            return list_from(&items);
        }
        if let Some(ys) = call_args(&rhs, &wk.cons) {
            let mut items = vec![Value::Sym(wk.list_star.clone()), x];
            items.extend(ys);
            return list_from(&items);
        }
        // (append (list x) rhs) -> (cons x rhs)
        return list_from(&[Value::Sym(wk.cons.clone()), x, rhs]);
    }

    // (append lhs (list x)) -> (append lhs (cons x nil))
    if let Some(x) = call_single(&rhs, &wk.list) {
        let consed = list_from(&[Value::Sym(wk.cons.clone()), x, Value::Nil]);
        return list_from(&[Value::Sym(wk.append.clone()), lhs, consed]);
    }

    list_from(&[Value::Sym(wk.append.clone()), lhs, rhs])
}

fn quote(wk: &WellKnown, v: Value) -> Value {
    cons(Value::Sym(wk.quote.clone()), cons(v, Value::Nil))
}

/// The single argument of a two-element form `(tag x)`.
fn tagged(form: &Value, tag: &Symbol) -> Option<Value> {
    let (head, tail) = list_parts(form)?;
    match head {
        Value::Sym(s) if &s == tag => {}
        _ => return None,
    }
    let (arg, rest) = list_parts(&tail)?;
    if rest.is_nil() {
        Some(arg)
    } else {
        None
    }
}

/// `(quote (x))` -> `x`
fn quoted_single(wk: &WellKnown, form: &Value) -> Option<Value> {
    let quoted = tagged(form, &wk.quote)?;
    let (items, tail) = list_elements(&quoted).ok()?;
    if items.len() == 1 && tail.is_nil() {
        Some(items[0].clone())
    } else {
        None
    }
}

/// Arguments of `(callee a...)`.
fn call_args(form: &Value, callee: &Symbol) -> Option<Vec<Value>> {
    let (head, tail) = list_parts(form)?;
    match head {
        Value::Sym(s) if &s == callee => Some(iter_list(&tail).collect()),
        _ => None,
    }
}

/// The single argument of `(callee a)`.
fn call_single(form: &Value, callee: &Symbol) -> Option<Value> {
    let args = call_args(form, callee)?;
    if args.len() == 1 {
        Some(args[0].clone())
    } else {
        None
    }
}
