//! Time primitives.
//!
//! Internal time is measured in nanoseconds from an arbitrary origin (the
//! interpreter's start); `internal-time-units-per-second` is 1e9.
//! Universal time counts seconds from 1900-01-01T00:00:00Z.

use super::primitive;
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::value::{list_from, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between 1900-01-01 and the Unix epoch.
const UNIVERSAL_TIME_OFFSET: i64 = 2_208_988_800;

fn elapsed_nanos(interp: &Interp) -> i64 {
    interp.start.elapsed().as_nanos() as i64
}

pub fn get_internal_real_time(interp: &mut Interp, _: &[Value]) -> LispResult<Value> {
    Ok(Value::Long(elapsed_nanos(interp)))
}

pub fn get_internal_run_time(interp: &mut Interp, _: &[Value]) -> LispResult<Value> {
    Ok(Value::Long(elapsed_nanos(interp)))
}

pub fn get_internal_cpu_time(interp: &mut Interp, _: &[Value]) -> LispResult<Value> {
    Ok(Value::Long(elapsed_nanos(interp)))
}

/// `(sleep seconds)` blocks the (single) thread.
pub fn sleep(_: &mut Interp, args: &[Value]) -> LispResult<Value> {
    let secs = match &args[0] {
        Value::Long(n) => *n as f64,
        Value::Double(d) => *d,
        other => return Err(LispError::type_error("sleep", "number", other.type_name())),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(LispError::Arithmetic(format!(
            "sleep: invalid duration {}",
            secs
        )));
    }
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(Value::Nil)
}

fn unix_now_secs() -> LispResult<i64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| LispError::Internal(format!("system clock before epoch: {}", e)))?;
    Ok(now.as_secs() as i64)
}

pub fn get_universal_time(_: &mut Interp, _: &[Value]) -> LispResult<Value> {
    Ok(Value::Long(unix_now_secs()? + UNIVERSAL_TIME_OFFSET))
}

/// Days-to-civil-date conversion (proleptic Gregorian calendar).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// `(get-decoded-time)` => (sec min hour date month year weekday dst-p zone)
/// in UTC; weekday 0 is Monday.
pub fn get_decoded_time(_: &mut Interp, _: &[Value]) -> LispResult<Value> {
    let secs = unix_now_secs()?;
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (year, month, date) = civil_from_days(days);
    let hour = rem / 3600;
    let minute = (rem % 3600) / 60;
    let second = rem % 60;
    // 1970-01-01 was a Thursday; weekday 0 = Monday
    let weekday = (days + 3).rem_euclid(7);
    Ok(list_from(&[
        Value::Long(second),
        Value::Long(minute),
        Value::Long(hour),
        Value::Long(date as i64),
        Value::Long(month as i64),
        Value::Long(year),
        Value::Long(weekday),
        Value::Nil,
        Value::Long(0),
    ]))
}

primitive!("get-internal-real-time", 0, Some(0), get_internal_real_time);
primitive!("get-internal-run-time", 0, Some(0), get_internal_run_time);
primitive!("get-internal-cpu-time", 0, Some(0), get_internal_cpu_time);
primitive!("sleep", 1, Some(1), sleep);
primitive!("get-universal-time", 0, Some(0), get_universal_time);
primitive!("get-decoded-time", 0, Some(0), get_decoded_time);

#[cfg(test)]
mod tests {
    use super::civil_from_days;
    use crate::interp::Interp;
    use crate::value::{iter_list, Value};

    #[test]
    fn test_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }

    #[test]
    fn test_internal_time_advances() {
        let mut interp = Interp::new();
        let a = interp.interpret_expression("(get-internal-real-time)").unwrap();
        let b = interp.interpret_expression("(get-internal-real-time)").unwrap();
        match (a, b) {
            (Value::Long(x), Value::Long(y)) => assert!(y >= x),
            _ => panic!("expected integers"),
        }
    }

    #[test]
    fn test_universal_time_after_2020() {
        let mut interp = Interp::new();
        match interp.interpret_expression("(get-universal-time)").unwrap() {
            // 2020-01-01 in universal time
            Value::Long(t) => assert!(t > 3_786_825_600),
            other => panic!("expected integer, got {}", other),
        }
    }

    #[test]
    fn test_decoded_time_shape() {
        let mut interp = Interp::new();
        let v = interp.interpret_expression("(get-decoded-time)").unwrap();
        let items: Vec<Value> = iter_list(&v).collect();
        assert_eq!(items.len(), 9);
        match &items[5] {
            Value::Long(year) => assert!(*year >= 2024),
            other => panic!("expected year, got {}", other),
        }
    }

    #[test]
    fn test_sleep_rejects_negative() {
        assert!(Interp::new().interpret_expression("(sleep -1)").is_err());
    }
}
