//! # Primitive Library
//!
//! The built-in callables shared by the evaluator and generated code,
//! organized by category:
//!
//! - **[lists]**: car, cdr, cons, rplaca, rplacd, list, list*, append, assoc, assq, null, not, consp, listp, atom
//! - **[numbers]**: + - * /, numeric comparison chains, 1+ 1-, mod, rem, signum, sqrt/log/exp family, rounding families
//! - **[predicates]**: symbolp, numberp, integerp, floatp, stringp, characterp, eq, eql
//! - **[io]**: read, write, writeln, lnwrite
//! - **[strings]**: string=, string->list, list->string, char-code, code-char, format, format-locale
//! - **[time]**: internal time counters, sleep, universal/decoded time
//! - **[meta]**: apply, eval, trace, untrace, macroexpand-1, gensym, fatal
//!
//! Each submodule submits `PrimDef` records into the inventory; the
//! interpreter collects them into a dispatch table keyed by interned-symbol
//! identity, so the evaluator never compares strings.

use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::value::Value;

pub mod io;
pub mod lists;
pub mod meta;
pub mod numbers;
pub mod predicates;
pub mod strings;
pub mod time;

pub type PrimFn = fn(&mut Interp, &[Value]) -> LispResult<Value>;

/// One registry entry.  `min`/`max` document the arity; the interpreter
/// checks it centrally so a wrong argument count is always an arity error
/// and never a crash inside the primitive.
pub struct PrimDef {
    pub name: &'static str,
    pub min: usize,
    pub max: Option<usize>,
    pub func: PrimFn,
}

inventory::collect!(PrimDef);

/// Register one primitive with the inventory.
macro_rules! primitive {
    ($name:literal, $min:expr, $max:expr, $func:path) => {
        inventory::submit! {
            crate::builtins::PrimDef {
                name: $name,
                min: $min,
                max: $max,
                func: $func,
            }
        }
    };
}
pub(crate) use primitive;

pub fn expected_arity(def: &PrimDef) -> String {
    match (def.min, def.max) {
        (min, Some(max)) if min == max => min.to_string(),
        (min, Some(max)) => format!("{}-{}", min, max),
        (min, None) => format!("at least {}", min),
    }
}

pub fn check_arity(def: &PrimDef, actual: usize) -> LispResult<()> {
    let too_few = actual < def.min;
    let too_many = def.max.map(|m| actual > m).unwrap_or(false);
    if too_few || too_many {
        Err(LispError::arity(def.name, expected_arity(def), actual))
    } else {
        Ok(())
    }
}

/// The evaluator's fast path for a recognized operator on already-evaluated
/// arguments.  `None` means NOT_HANDLED: the evaluator falls through to the
/// general application path (which reports errors exactly as this path
/// would, and without re-evaluating the arguments).
pub fn open_code(
    interp: &mut Interp,
    def: &'static PrimDef,
    args: &[Value],
) -> Option<LispResult<Value>> {
    match def.name {
        "+" | "-" | "*" | "/" | "=" | "/=" | "<" | "<=" | ">" | ">=" | "1+" | "1-" | "mod"
        | "rem" => {
            if !args.iter().all(numbers::is_number) {
                return None;
            }
        }
        _ => {}
    }
    if let Err(e) = check_arity(def, args.len()) {
        return Some(Err(e));
    }
    Some((def.func)(interp, args))
}

/// The `t`/`nil` result of a predicate.
pub(crate) fn bool_value(interp: &Interp, b: bool) -> Value {
    if b {
        Value::Sym(interp.symtab.wk.t.clone())
    } else {
        Value::Nil
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(_: &mut Interp, _: &[Value]) -> LispResult<Value> {
        Ok(Value::Nil)
    }

    #[test]
    fn test_expected_arity_strings() {
        let exact = PrimDef { name: "f", min: 2, max: Some(2), func: dummy };
        assert_eq!(expected_arity(&exact), "2");
        let range = PrimDef { name: "f", min: 1, max: Some(2), func: dummy };
        assert_eq!(expected_arity(&range), "1-2");
        let open = PrimDef { name: "f", min: 1, max: None, func: dummy };
        assert_eq!(expected_arity(&open), "at least 1");
    }

    #[test]
    fn test_check_arity_bounds() {
        let def = PrimDef { name: "f", min: 1, max: Some(2), func: dummy };
        assert!(check_arity(&def, 0).is_err());
        assert!(check_arity(&def, 1).is_ok());
        assert!(check_arity(&def, 2).is_ok());
        assert!(check_arity(&def, 3).is_err());

        let variadic = PrimDef { name: "f", min: 0, max: None, func: dummy };
        assert!(check_arity(&variadic, 17).is_ok());
    }
}
