//! String and character primitives, including the `format` directive subset.

use super::{bool_value, primitive};
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::value::{list_elements, list_from, print_value, Value};
use std::io::Write;
use std::rc::Rc;

fn as_string(name: &str, v: &Value) -> LispResult<Rc<str>> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(LispError::type_error(name, "string", other.type_name())),
    }
}

/// `(string= "a" "a")` compares string contents.
pub fn string_eq(interp: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let a = as_string("string=", &args[0])?;
    let b = as_string("string=", &args[1])?;
    Ok(bool_value(interp, a == b))
}

/// `(string->list "ab")` => (#\a #\b)
pub fn string_to_list(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let s = as_string("string->list", &args[0])?;
    let chars: Vec<Value> = s.chars().map(Value::Char).collect();
    Ok(list_from(&chars))
}

/// `(list->string '(#\a #\b))` => "ab"
pub fn list_to_string(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let (items, tail) = list_elements(&args[0])
        .map_err(|_| LispError::malformed("list->string", "circular list"))?;
    if !tail.is_nil() {
        return Err(LispError::type_error(
            "list->string",
            "proper list",
            print_value(&args[0], true),
        ));
    }
    let mut out = String::new();
    for item in items {
        match item {
            Value::Char(c) => out.push(c),
            other => {
                return Err(LispError::type_error(
                    "list->string",
                    "character",
                    other.type_name(),
                ))
            }
        }
    }
    Ok(Value::Str(Rc::from(out.as_str())))
}

pub fn char_code(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match &args[0] {
        Value::Char(c) => Ok(Value::Long(*c as i64)),
        other => Err(LispError::type_error(
            "char-code",
            "character",
            other.type_name(),
        )),
    }
}

pub fn code_char(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    match &args[0] {
        Value::Long(n) => {
            let code = u32::try_from(*n)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| {
                    LispError::Arithmetic(format!("code-char: invalid code point {}", n))
                })?;
            Ok(Value::Char(code))
        }
        other => Err(LispError::type_error(
            "code-char",
            "integer",
            other.type_name(),
        )),
    }
}

/// The directive subset shared by `format` and `format-locale`:
/// `~a` aesthetic, `~s` standard (escaped), `~d` decimal integer, `~%` and
/// `~&` newline, `~~` a literal tilde.
fn render_format(name: &str, control: &str, args: &[Value]) -> LispResult<String> {
    let mut out = String::new();
    let mut next = 0usize;
    let mut chars = control.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        let directive = chars
            .next()
            .ok_or_else(|| LispError::malformed(name, "control string ends in ~"))?;
        match directive.to_ascii_lowercase() {
            'a' | 's' | 'd' => {
                let arg = args.get(next).ok_or_else(|| {
                    LispError::malformed(name, "too few arguments for control string")
                })?;
                next += 1;
                match directive.to_ascii_lowercase() {
                    'a' => out.push_str(&print_value(arg, false)),
                    's' => out.push_str(&print_value(arg, true)),
                    _ => match arg {
                        Value::Long(n) => out.push_str(&n.to_string()),
                        Value::Double(d) if d.fract() == 0.0 && d.is_finite() => {
                            out.push_str(&format!("{}", *d as i64))
                        }
                        other => {
                            return Err(LispError::type_error(name, "integer", other.type_name()))
                        }
                    },
                }
            }
            '%' | '&' => out.push('\n'),
            '~' => out.push('~'),
            other => {
                return Err(LispError::NotImplemented(format!(
                    "{}: directive ~{}",
                    name, other
                )))
            }
        }
    }
    Ok(out)
}

fn format_common(name: &str, dest: &Value, control: &Value, args: &[Value]) -> LispResult<Value> {
    let control = as_string(name, control)?;
    let text = render_format(name, &control, args)?;
    if dest.truthy() {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(text.as_bytes())?;
        handle.flush()?;
        Ok(Value::Nil)
    } else {
        Ok(Value::Str(Rc::from(text.as_str())))
    }
}

/// `(format dest control args...)`: dest `t` prints, dest `nil` returns the
/// rendered string.
pub fn format(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    format_common("format", &args[0], &args[1], &args[2..])
}

/// `(format-locale dest locale control args...)`; the locale argument is
/// accepted and ignored.
pub fn format_locale(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    format_common("format-locale", &args[0], &args[2], &args[3..])
}

primitive!("string=", 2, Some(2), string_eq);
primitive!("string->list", 1, Some(1), string_to_list);
primitive!("list->string", 1, Some(1), list_to_string);
primitive!("char-code", 1, Some(1), char_code);
primitive!("code-char", 1, Some(1), code_char);
primitive!("format", 2, None, format);
primitive!("format-locale", 3, None, format_locale);

#[cfg(test)]
mod tests {
    use crate::interp::Interp;
    use crate::value::{print_value, Value};

    fn run(src: &str) -> Value {
        Interp::new().interpret_expression(src).unwrap()
    }

    #[test]
    fn test_string_eq() {
        assert_eq!(run("(string= \"ab\" \"ab\")").to_string(), "t");
        assert!(run("(string= \"ab\" \"ac\")").is_nil());
        assert!(Interp::new().interpret_expression("(string= 1 \"a\")").is_err());
    }

    #[test]
    fn test_string_list_conversions() {
        assert_eq!(
            print_value(&run("(string->list \"ab\")"), true),
            "(#\\a #\\b)"
        );
        assert_eq!(
            print_value(&run("(list->string '(#\\h #\\i))"), false),
            "hi"
        );
        assert!(Interp::new()
            .interpret_expression("(list->string '(1))")
            .is_err());
    }

    #[test]
    fn test_char_codes() {
        assert!(matches!(run("(char-code #\\A)"), Value::Long(65)));
        assert!(matches!(run("(code-char 97)"), Value::Char('a')));
        assert!(Interp::new().interpret_expression("(code-char -1)").is_err());
    }

    #[test]
    fn test_format_to_string() {
        assert_eq!(
            print_value(&run("(format nil \"x=~a y=~s\" \"s\" \"s\")"), false),
            "x=s y=\"s\""
        );
        assert_eq!(print_value(&run("(format nil \"~d\" 42)"), false), "42");
        assert_eq!(print_value(&run("(format nil \"~d\" 42.0)"), false), "42");
        assert_eq!(print_value(&run("(format nil \"a~%b\")"), false), "a\nb");
        assert_eq!(print_value(&run("(format nil \"~~\")"), false), "~");
    }

    #[test]
    fn test_format_locale_ignores_locale() {
        assert_eq!(
            print_value(&run("(format-locale nil nil \"n=~d\" 7)"), false),
            "n=7"
        );
    }

    #[test]
    fn test_format_errors() {
        assert!(Interp::new()
            .interpret_expression("(format nil \"~a\")")
            .is_err());
        assert!(Interp::new()
            .interpret_expression("(format nil \"~x\" 1)")
            .is_err());
    }
}
