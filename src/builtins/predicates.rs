//! Type predicates and the identity equality pair.

use super::{bool_value, primitive};
use crate::error::LispResult;
use crate::interp::Interp;
use crate::value::{self, Value};

/// `nil` counts as a symbol, like the symbol `nil` it prints as.
pub fn symbolp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let is_sym = matches!(&args[0], Value::Nil | Value::Sym(_));
    Ok(bool_value(interp, is_sym))
}

pub fn numberp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let is_num = matches!(&args[0], Value::Long(_) | Value::Double(_));
    Ok(bool_value(interp, is_num))
}

pub fn integerp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, matches!(&args[0], Value::Long(_))))
}

pub fn floatp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, matches!(&args[0], Value::Double(_))))
}

pub fn stringp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, matches!(&args[0], Value::Str(_))))
}

pub fn characterp(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, matches!(&args[0], Value::Char(_))))
}

/// Reference identity.
pub fn eq(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, value::eq(&args[0], &args[1])))
}

/// `eq`, or value equality for same-type numbers and characters.
pub fn eql(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    Ok(bool_value(interp, value::eql(&args[0], &args[1])))
}

primitive!("symbolp", 1, Some(1), symbolp);
primitive!("numberp", 1, Some(1), numberp);
primitive!("integerp", 1, Some(1), integerp);
primitive!("floatp", 1, Some(1), floatp);
primitive!("stringp", 1, Some(1), stringp);
primitive!("characterp", 1, Some(1), characterp);
primitive!("eq", 2, Some(2), eq);
primitive!("eql", 2, Some(2), eql);
