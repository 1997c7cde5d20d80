//! Arithmetic and numeric comparison primitives.
//!
//! The numeric contract: variadic `+ - * /` and the comparison chains
//! compute in double, widening mixed arguments.  `1+`/`1-` keep integer
//! arguments integral with overflow checks.  The rounding family returns
//! integers and fails on overflow, NaN and infinity; the `f`-prefixed
//! variants return doubles.  `mod` is the floored remainder, `rem` the
//! truncating one.

use super::{bool_value, primitive};
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::value::Value;

pub(crate) fn is_number(v: &Value) -> bool {
    matches!(v, Value::Long(_) | Value::Double(_))
}

pub(crate) fn as_double(ctx: &str, v: &Value) -> LispResult<f64> {
    match v {
        Value::Long(n) => Ok(*n as f64),
        Value::Double(d) => Ok(*d),
        other => Err(LispError::type_error(ctx, "number", other.type_name())),
    }
}

/// Convert a double to a long, failing on NaN, infinity and overflow.
fn double_to_long(ctx: &str, d: f64) -> LispResult<i64> {
    if !d.is_finite() {
        return Err(LispError::Arithmetic(format!("{}: result is {}", ctx, d)));
    }
    if d < i64::MIN as f64 || d > i64::MAX as f64 {
        return Err(LispError::Arithmetic(format!(
            "{}: result {} overflows an integer",
            ctx, d
        )));
    }
    Ok(d as i64)
}

// ============================================================================
// Variadic arithmetic (always double)
// ============================================================================

/// `(+ 1 2 3)` => 6.0
pub fn add(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let mut sum = 0.0;
    for arg in args {
        sum += as_double("+", arg)?;
    }
    Ok(Value::Double(sum))
}

/// `(- 10 3 2)` => 5.0; `(- 5)` => -5.0
pub fn sub(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let first = as_double("-", &args[0])?;
    if args.len() == 1 {
        return Ok(Value::Double(-first));
    }
    let mut result = first;
    for arg in &args[1..] {
        result -= as_double("-", arg)?;
    }
    Ok(Value::Double(result))
}

/// `(* 2 3 4)` => 24.0
pub fn mul(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let mut product = 1.0;
    for arg in args {
        product *= as_double("*", arg)?;
    }
    Ok(Value::Double(product))
}

/// `(/ 20 4)` => 5.0; `(/ 4)` => 0.25
pub fn div(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let first = as_double("/", &args[0])?;
    if args.len() == 1 {
        return Ok(Value::Double(1.0 / first));
    }
    let mut result = first;
    for arg in &args[1..] {
        result /= as_double("/", arg)?;
    }
    Ok(Value::Double(result))
}

// ============================================================================
// Comparison chains (compared in double)
// ============================================================================

fn compare_chain(
    interp: &mut Interp,
    name: &str,
    args: &[Value],
    ok: fn(f64, f64) -> bool,
) -> LispResult<Value> {
    let mut prev = as_double(name, &args[0])?;
    for arg in &args[1..] {
        let next = as_double(name, arg)?;
        if !ok(prev, next) {
            return Ok(Value::Nil);
        }
        prev = next;
    }
    Ok(bool_value(interp, true))
}

pub fn num_eq(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    compare_chain(interp, "=", args, |a, b| a == b)
}

pub fn num_ne(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    compare_chain(interp, "/=", args, |a, b| a != b)
}

pub fn num_lt(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    compare_chain(interp, "<", args, |a, b| a < b)
}

pub fn num_le(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    compare_chain(interp, "<=", args, |a, b| a <= b)
}

pub fn num_gt(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    compare_chain(interp, ">", args, |a, b| a > b)
}

pub fn num_ge(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    compare_chain(interp, ">=", args, |a, b| a >= b)
}

// ============================================================================
// Type-preserving increment/decrement
// ============================================================================

/// `(1+ 5)` => 6; `(1+ 5.0)` => 6.0
pub fn inc(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match &args[0] {
        Value::Long(n) => n
            .checked_add(1)
            .map(Value::Long)
            .ok_or_else(|| LispError::Arithmetic("1+: integer overflow".to_string())),
        Value::Double(d) => Ok(Value::Double(d + 1.0)),
        other => Err(LispError::type_error("1+", "number", other.type_name())),
    }
}

/// `(1- 5)` => 4
pub fn dec(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match &args[0] {
        Value::Long(n) => n
            .checked_sub(1)
            .map(Value::Long)
            .ok_or_else(|| LispError::Arithmetic("1-: integer overflow".to_string())),
        Value::Double(d) => Ok(Value::Double(d - 1.0)),
        other => Err(LispError::type_error("1-", "number", other.type_name())),
    }
}

// ============================================================================
// mod / rem / signum
// ============================================================================

/// Floored remainder: `x - floor(x/y) * y`.
pub fn modulo(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let x = as_double("mod", &args[0])?;
    let y = as_double("mod", &args[1])?;
    Ok(Value::Double(x - (x / y).floor() * y))
}

/// Truncating remainder.
pub fn remainder(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let x = as_double("rem", &args[0])?;
    let y = as_double("rem", &args[1])?;
    Ok(Value::Double(x % y))
}

pub fn signum(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match &args[0] {
        Value::Long(n) => Ok(Value::Long(n.signum())),
        Value::Double(d) => {
            if *d == 0.0 || d.is_nan() {
                Ok(Value::Double(*d))
            } else {
                Ok(Value::Double(d.signum()))
            }
        }
        other => Err(LispError::type_error("signum", "number", other.type_name())),
    }
}

// ============================================================================
// Transcendental functions
// ============================================================================

pub fn sqrt(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(Value::Double(as_double("sqrt", &args[0])?.sqrt()))
}

pub fn log(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(Value::Double(as_double("log", &args[0])?.ln()))
}

pub fn log10(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(Value::Double(as_double("log10", &args[0])?.log10()))
}

pub fn exp(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(Value::Double(as_double("exp", &args[0])?.exp()))
}

pub fn expt(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let base = as_double("expt", &args[0])?;
    let power = as_double("expt", &args[1])?;
    Ok(Value::Double(base.powf(power)))
}

// ============================================================================
// Rounding families
// ============================================================================

/// The single-argument or two-argument (dividing) form shared by the whole
/// rounding family.
fn rounding_operand(name: &str, args: &[Value]) -> LispResult<f64> {
    let x = as_double(name, &args[0])?;
    if args.len() == 2 {
        Ok(x / as_double(name, &args[1])?)
    } else {
        Ok(x)
    }
}

fn rounding(name: &str, args: &[Value], f: fn(f64) -> f64) -> LispResult<Value> {
    let d = f(rounding_operand(name, args)?);
    Ok(Value::Long(double_to_long(name, d)?))
}

fn frounding(name: &str, args: &[Value], f: fn(f64) -> f64) -> LispResult<Value> {
    Ok(Value::Double(f(rounding_operand(name, args)?)))
}

pub fn round(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    rounding("round", args, f64::round_ties_even)
}

pub fn floor(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    rounding("floor", args, f64::floor)
}

pub fn ceiling(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    rounding("ceiling", args, f64::ceil)
}

pub fn truncate(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    rounding("truncate", args, f64::trunc)
}

pub fn fround(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    frounding("fround", args, f64::round_ties_even)
}

pub fn ffloor(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    frounding("ffloor", args, f64::floor)
}

pub fn fceiling(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    frounding("fceiling", args, f64::ceil)
}

pub fn ftruncate(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    frounding("ftruncate", args, f64::trunc)
}

primitive!("+", 0, None, add);
primitive!("-", 1, None, sub);
primitive!("*", 0, None, mul);
primitive!("/", 1, None, div);
primitive!("=", 1, None, num_eq);
primitive!("/=", 1, None, num_ne);
primitive!("<", 1, None, num_lt);
primitive!("<=", 1, None, num_le);
primitive!(">", 1, None, num_gt);
primitive!(">=", 1, None, num_ge);
primitive!("1+", 1, Some(1), inc);
primitive!("1-", 1, Some(1), dec);
primitive!("mod", 2, Some(2), modulo);
primitive!("rem", 2, Some(2), remainder);
primitive!("signum", 1, Some(1), signum);
primitive!("sqrt", 1, Some(1), sqrt);
primitive!("log", 1, Some(1), log);
primitive!("log10", 1, Some(1), log10);
primitive!("exp", 1, Some(1), exp);
primitive!("expt", 2, Some(2), expt);
primitive!("round", 1, Some(2), round);
primitive!("floor", 1, Some(2), floor);
primitive!("ceiling", 1, Some(2), ceiling);
primitive!("truncate", 1, Some(2), truncate);
primitive!("fround", 1, Some(2), fround);
primitive!("ffloor", 1, Some(2), ffloor);
primitive!("fceiling", 1, Some(2), fceiling);
primitive!("ftruncate", 1, Some(2), ftruncate);

#[cfg(test)]
mod tests {
    use crate::interp::Interp;
    use crate::value::{eq, Value};

    fn run(src: &str) -> Value {
        Interp::new().interpret_expression(src).unwrap()
    }

    #[test]
    fn test_arithmetic_widens_to_double() {
        assert!(eq(&run("(+ 1 2 3)"), &Value::Double(6.0)));
        assert!(eq(&run("(+ 1 2 3 (* 4 5 6))"), &Value::Double(126.0)));
        assert!(eq(&run("(- 5)"), &Value::Double(-5.0)));
        assert!(eq(&run("(/ 4)"), &Value::Double(0.25)));
        assert!(eq(&run("(+)"), &Value::Double(0.0)));
        assert!(eq(&run("(*)"), &Value::Double(1.0)));
    }

    #[test]
    fn test_comparison_chains() {
        assert_eq!(run("(< 1 2 3)").to_string(), "t");
        assert!(run("(< 1 3 2)").is_nil());
        assert_eq!(run("(<= 1 1 2)").to_string(), "t");
        assert_eq!(run("(= 1 1.0)").to_string(), "t");
        assert_eq!(run("(>= 3 2 2 1)").to_string(), "t");
        assert_eq!(run("(> 5)").to_string(), "t");
    }

    #[test]
    fn test_inc_dec_preserve_type() {
        assert!(eq(&run("(1+ 5)"), &Value::Long(6)));
        assert!(eq(&run("(1- 5)"), &Value::Long(4)));
        assert!(eq(&run("(1+ 5.0)"), &Value::Double(6.0)));
    }

    #[test]
    fn test_inc_overflow_fails() {
        let r = Interp::new().interpret_expression("(1+ 9223372036854775807)");
        assert!(r.is_err());
    }

    #[test]
    fn test_mod_is_floored_rem_truncates() {
        assert!(eq(&run("(mod -7 2)"), &Value::Double(1.0)));
        assert!(eq(&run("(rem -7 2)"), &Value::Double(-1.0)));
        assert!(eq(&run("(mod 7 2)"), &Value::Double(1.0)));
    }

    #[test]
    fn test_rounding_families() {
        assert!(eq(&run("(floor 2.7)"), &Value::Long(2)));
        assert!(eq(&run("(ceiling 2.1)"), &Value::Long(3)));
        assert!(eq(&run("(truncate -2.7)"), &Value::Long(-2)));
        assert!(eq(&run("(round 2.5)"), &Value::Long(2))); // ties to even
        assert!(eq(&run("(round 3.5)"), &Value::Long(4)));
        assert!(eq(&run("(floor 7 2)"), &Value::Long(3)));
        assert!(eq(&run("(ffloor 2.7)"), &Value::Double(2.0)));
        assert!(eq(&run("(ftruncate -2.7)"), &Value::Double(-2.0)));
    }

    #[test]
    fn test_rounding_rejects_nan_and_overflow() {
        assert!(Interp::new().interpret_expression("(floor (/ 0 0))").is_err());
        assert!(Interp::new().interpret_expression("(round 1e300)").is_err());
    }

    #[test]
    fn test_signum() {
        assert!(eq(&run("(signum -9)"), &Value::Long(-1)));
        assert!(eq(&run("(signum 0)"), &Value::Long(0)));
        assert!(eq(&run("(signum -2.5)"), &Value::Double(-1.0)));
        assert!(eq(&run("(signum 0.0)"), &Value::Double(0.0)));
    }

    #[test]
    fn test_transcendental() {
        assert!(eq(&run("(sqrt 9)"), &Value::Double(3.0)));
        assert!(eq(&run("(expt 2 10)"), &Value::Double(1024.0)));
        assert!(eq(&run("(log (exp 1))"), &Value::Double(1.0)));
        assert!(eq(&run("(log10 1000)"), &Value::Double(3.0)));
    }

    #[test]
    fn test_type_error_not_crash() {
        assert!(Interp::new().interpret_expression("(+ 1 \"x\")").is_err());
        assert!(Interp::new().interpret_expression("(< 1 'a)").is_err());
    }

    #[test]
    fn test_wrong_arity_is_arity_error() {
        use crate::error::LispError;
        let e = Interp::new().interpret_expression("(1+ 1 2)").unwrap_err();
        assert!(matches!(e, LispError::Arity { .. }));
        let e = Interp::new().interpret_expression("(mod 1)").unwrap_err();
        assert!(matches!(e, LispError::Arity { .. }));
    }
}
