//! Control and meta primitives: apply, eval, tracing, macro expansion,
//! gensym, fatal.
//!
//! `apply` and `eval` are also recognized by the evaluator itself, which
//! rewrites calls to them into tail steps of its own loop; the functions
//! here are the values those names are bound to, used when they are passed
//! around first-class.

use super::primitive;
use crate::env::Env;
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::value::{list_elements, list_from, print_value, Value};

/// `(apply f arglist)`
pub fn apply(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let (items, tail) = list_elements(&args[1])
        .map_err(|_| LispError::malformed("apply", "circular argument list"))?;
    if !tail.is_nil() {
        return Err(LispError::type_error(
            "apply",
            "proper list",
            print_value(&args[1], true),
        ));
    }
    interp.apply(args[0].clone(), &items)
}

/// `(eval form [env])`: evaluates in the global environment, or in an
/// association list given as the second argument.
pub fn eval(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let env = if args.len() == 2 {
        Env::from_alist(args[1].clone())
    } else {
        interp.globals.clone()
    };
    interp.eval(args[0].clone(), &env)
}

/// `(trace sym...)` marks functions for call tracing; returns the traced
/// symbols.
pub fn trace(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    for arg in args {
        match arg {
            Value::Sym(s) => {
                interp.traced.insert(s.clone());
            }
            other => return Err(LispError::type_error("trace", "symbol", other.type_name())),
        }
    }
    let traced: Vec<Value> = interp.traced.iter().cloned().map(Value::Sym).collect();
    Ok(list_from(&traced))
}

/// `(untrace sym...)`; with no arguments everything is untraced.
pub fn untrace(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    if args.is_empty() {
        interp.traced.clear();
        return Ok(Value::Nil);
    }
    for arg in args {
        match arg {
            Value::Sym(s) => {
                interp.traced.remove(s);
            }
            other => {
                return Err(LispError::type_error(
                    "untrace",
                    "symbol",
                    other.type_name(),
                ))
            }
        }
    }
    let traced: Vec<Value> = interp.traced.iter().cloned().map(Value::Sym).collect();
    Ok(list_from(&traced))
}

/// `(macroexpand-1 'form)` expands one macro layer; non-macro forms come
/// back unchanged.
pub fn macroexpand_1(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    interp.macroexpand_1(&args[0])
}

/// `(gensym ["prefix"])` returns a fresh uninterned symbol.
pub fn gensym(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let prefix = match args.first() {
        Some(Value::Str(s)) => s.to_string(),
        Some(Value::Sym(s)) => s.name().to_string(),
        Some(other) => {
            return Err(LispError::type_error(
                "gensym",
                "string or symbol",
                other.type_name(),
            ))
        }
        None => "g".to_string(),
    };
    Ok(Value::Sym(interp.gensym(&prefix)))
}

/// `(fatal msg)` aborts evaluation with an error carrying the message.
pub fn fatal(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Err(LispError::Internal(format!(
        "fatal: {}",
        print_value(&args[0], false)
    )))
}

primitive!("apply", 2, Some(2), apply);
primitive!("eval", 1, Some(2), eval);
primitive!("trace", 0, None, trace);
primitive!("untrace", 0, None, untrace);
primitive!("macroexpand-1", 1, Some(1), macroexpand_1);
primitive!("gensym", 0, Some(1), gensym);
primitive!("fatal", 1, Some(1), fatal);

#[cfg(test)]
mod tests {
    use crate::interp::Interp;
    use crate::value::{print_value, Value};

    fn run(src: &str) -> Value {
        Interp::new().interpret_expression(src).unwrap()
    }

    #[test]
    fn test_apply_first_class() {
        // apply as a value, not just as an operator
        assert_eq!(
            print_value(&run("(define ap apply) (ap list '(1 2))"), true),
            "(1 2)"
        );
    }

    #[test]
    fn test_eval_with_alist_env() {
        assert!(matches!(
            run("(eval 'x (list (cons 'x 42)))"),
            Value::Long(42)
        ));
    }

    #[test]
    fn test_trace_untrace_bookkeeping() {
        let mut interp = Interp::new();
        interp.interpret_expression("(defun f (x) x)").unwrap();
        let traced = interp.interpret_expression("(trace 'f)").unwrap();
        assert_eq!(print_value(&traced, true), "(f)");
        // traced functions still compute normally
        assert!(matches!(
            interp.interpret_expression("(f 5)").unwrap(),
            Value::Long(5)
        ));
        assert!(interp.interpret_expression("(untrace)").unwrap().is_nil());
    }

    #[test]
    fn test_macroexpand_1() {
        let src = "(defmacro when2 (c b) `(if ,c ,b nil))
                   (macroexpand-1 '(when2 t 1))";
        assert_eq!(print_value(&run(src), true), "(if t 1 nil)");
        // not a macro call: unchanged
        assert_eq!(print_value(&run("(macroexpand-1 '(+ 1 2))"), true), "(+ 1 2)");
    }

    #[test]
    fn test_gensym_fresh() {
        assert!(run("(eq (gensym) (gensym))").is_nil());
        match run("(gensym \"tmp\")") {
            Value::Sym(s) => assert!(s.name().starts_with("tmp")),
            other => panic!("expected symbol, got {}", other),
        }
    }

    #[test]
    fn test_fatal() {
        let e = Interp::new()
            .interpret_expression("(fatal \"boom\")")
            .unwrap_err();
        assert!(e.to_string().contains("boom"));
    }
}
