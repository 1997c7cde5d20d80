//! Console I/O primitives.
//!
//! `write`, `writeln` and `lnwrite` take an optional second "escape atoms"
//! argument defaulting to true: with escapes the output reads back `equal`,
//! without it strings and characters print bare.

use super::primitive;
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::reader::Reader;
use crate::value::{print_value, Value};
use std::io::{BufRead, Write};

fn escape_flag(args: &[Value], index: usize) -> bool {
    match args.get(index) {
        Some(v) => v.truthy(),
        None => true,
    }
}

fn emit(text: &str) -> LispResult<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(text.as_bytes())?;
    handle.flush()?;
    Ok(())
}

/// `(write obj [escape])` prints without a newline and returns the object.
pub fn write(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    emit(&print_value(&args[0], escape_flag(args, 1)))?;
    Ok(args[0].clone())
}

/// `(writeln [obj [escape]])` prints the object (if any) and a newline.
pub fn writeln(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match args.first() {
        Some(obj) => {
            emit(&print_value(obj, escape_flag(args, 1)))?;
            emit("\n")?;
            Ok(obj.clone())
        }
        None => {
            emit("\n")?;
            Ok(Value::Nil)
        }
    }
}

/// `(lnwrite [obj [escape]])` prints a newline first, then the object.
pub fn lnwrite(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    emit("\n")?;
    match args.first() {
        Some(obj) => {
            emit(&print_value(obj, escape_flag(args, 1)))?;
            emit(" ")?;
            Ok(obj.clone())
        }
        None => Ok(Value::Nil),
    }
}

/// Read the next form from standard input; end of input reads as nil.
pub fn read(interp: &mut Interp, _args: &[Value]) -> LispResult<Value> {
    let stdin = std::io::stdin();
    let mut line = String::new();
    let n = stdin
        .lock()
        .read_line(&mut line)
        .map_err(|e| LispError::Io(e.to_string()))?;
    if n == 0 {
        return Ok(Value::Nil);
    }
    let mut reader = Reader::new(&mut interp.symtab, &line, None);
    Ok(reader.next_form()?.unwrap_or(Value::Nil))
}

primitive!("write", 1, Some(2), write);
primitive!("writeln", 0, Some(2), writeln);
primitive!("lnwrite", 0, Some(2), lnwrite);
primitive!("read", 0, Some(0), read);
