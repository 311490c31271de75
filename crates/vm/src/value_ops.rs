//! Arithmetic, bitwise, comparison and equality rules for [`Value`].
//! Reworked from the usual pop-pop-compute-push, raw-pointer stack
//! surgery into plain `Value -> Result<Value, String>` functions: there
//! is no stack here to corrupt, so the many "pop then check the rest
//! isn't empty" assertions a direct port would need disappear entirely.

use hymn_core::{InternedString, StringTable, Value};

fn type_name(v: &Value) -> &'static str {
    v.type_name()
}

fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Float(_))
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(n) => *n as f64,
        Value::Float(f) => *f,
        _ => unreachable!("caller already checked is_numeric"),
    }
}

/// `ADD`: numeric addition, with int/float promoting to float; if either
/// operand is a string, concatenate (stringifying the other).
pub fn add(strings: &mut StringTable, a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        (Value::String(_), _) | (_, Value::String(_)) => {
            let mut s = a.display_string();
            s.push_str(&b.display_string());
            Ok(Value::String(strings.intern(&s)))
        }
        _ if is_numeric(a) && is_numeric(b) => Ok(Value::Float(as_f64(a) + as_f64(b))),
        _ => Err(format!(
            "Expected two numbers or a string for `+`, got `{}` and `{}`",
            type_name(a),
            type_name(b)
        )),
    }
}

macro_rules! numeric_binop {
    ($name:ident, $op_name:literal, $int_op:expr, $float_op:expr) => {
        pub fn $name(a: &Value, b: &Value) -> Result<Value, String> {
            match (a, b) {
                (Value::Int(x), Value::Int(y)) => Ok(Value::Int($int_op(*x, *y))),
                _ if is_numeric(a) && is_numeric(b) => Ok(Value::Float($float_op(as_f64(a), as_f64(b)))),
                _ => Err(format!(
                    "Expected two numbers for `{}`, got `{}` and `{}`",
                    $op_name,
                    type_name(a),
                    type_name(b)
                )),
            }
        }
    };
}

numeric_binop!(subtract, "-", |x: i64, y: i64| x.wrapping_sub(y), |x: f64, y: f64| x - y);
numeric_binop!(multiply, "*", |x: i64, y: i64| x.wrapping_mul(y), |x: f64, y: f64| x * y);

/// `DIVIDE`: always produces a float result, even for int/int, by simply
/// always promoting. There is no separate integer-division opcode.
pub fn divide(a: &Value, b: &Value) -> Result<Value, String> {
    if !is_numeric(a) || !is_numeric(b) {
        return Err(format!(
            "Expected two numbers for `/`, got `{}` and `{}`",
            type_name(a),
            type_name(b)
        ));
    }
    let divisor = as_f64(b);
    if divisor == 0.0 {
        return Err("Division by zero".to_string());
    }
    Ok(Value::Float(as_f64(a) / divisor))
}

/// `MODULO`: integers only.
pub fn modulo(a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err("Modulo by zero".to_string()),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(*y))),
        _ => Err(format!(
            "Expected two integers for `%`, got `{}` and `{}`",
            type_name(a),
            type_name(b)
        )),
    }
}

pub fn negate(v: &Value) -> Result<Value, String> {
    match v {
        Value::Int(n) => Ok(Value::Int(-n)),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(format!("Expected a number to negate, got `{}`", type_name(v))),
    }
}

fn as_int(v: &Value, op: &str) -> Result<i64, String> {
    match v {
        Value::Int(n) => Ok(*n),
        _ => Err(format!("Expected `Integer` for `{op}`, got `{}`", type_name(v))),
    }
}

macro_rules! bitwise_binop {
    ($name:ident, $op_name:literal, $op:expr) => {
        pub fn $name(a: &Value, b: &Value) -> Result<Value, String> {
            let x = as_int(a, $op_name)?;
            let y = as_int(b, $op_name)?;
            Ok(Value::Int($op(x, y)))
        }
    };
}

bitwise_binop!(bit_and, "&", |x: i64, y: i64| x & y);
bitwise_binop!(bit_or, "|", |x: i64, y: i64| x | y);
bitwise_binop!(bit_xor, "^", |x: i64, y: i64| x ^ y);

pub fn bit_not(v: &Value) -> Result<Value, String> {
    Ok(Value::Int(!as_int(v, "~")?))
}

pub fn left_shift(a: &Value, b: &Value) -> Result<Value, String> {
    let x = as_int(a, "<<")?;
    let y = as_int(b, "<<")?;
    Ok(Value::Int(x.wrapping_shl(y as u32)))
}

pub fn right_shift(a: &Value, b: &Value) -> Result<Value, String> {
    let x = as_int(a, ">>")?;
    let y = as_int(b, ">>")?;
    Ok(Value::Int(x.wrapping_shr(y as u32)))
}

/// Structural/cross-numeric equality — this is exactly `Value`'s own
/// `PartialEq`, re-exported here so opcode handlers read "equals" rather
/// than reaching into `hymn_core` directly.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

/// Ordering compare: comparisons other than (not-)equal require both
/// operands numeric.
pub fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, String> {
    if !is_numeric(a) || !is_numeric(b) {
        return Err(format!(
            "Expected two numbers to compare, got `{}` and `{}`",
            type_name(a),
            type_name(b)
        ));
    }
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    as_f64(a)
        .partial_cmp(&as_f64(b))
        .ok_or_else(|| "Cannot compare NaN".to_string())
}

pub fn increment(v: &Value, by: u8) -> Result<Value, String> {
    match v {
        Value::Int(n) => Ok(Value::Int(n.wrapping_add(by as i64))),
        Value::Float(f) => Ok(Value::Float(f + by as f64)),
        _ => Err(format!("Expected a number to increment, got `{}`", type_name(v))),
    }
}

pub fn to_integer(v: &Value) -> Result<Value, String> {
    match v {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::String(s) => s
            .as_str()
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("Cannot cast `{}` to `Integer`", s.as_str())),
        Value::Bool(b) => Ok(Value::Int(if *b { 1 } else { 0 })),
        _ => Err(format!("Cannot cast `{}` to `Integer`", type_name(v))),
    }
}

pub fn to_float(v: &Value) -> Result<Value, String> {
    match v {
        Value::Int(n) => Ok(Value::Float(*n as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::String(s) => s
            .as_str()
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("Cannot cast `{}` to `Float`", s.as_str())),
        _ => Err(format!("Cannot cast `{}` to `Float`", type_name(v))),
    }
}

pub fn to_string_value(strings: &mut StringTable, v: &Value) -> Value {
    Value::String(strings.intern(&v.display_string()))
}

pub fn intern(strings: &mut StringTable, s: &str) -> InternedString {
    strings.intern(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_add_stays_int() {
        let mut strings = StringTable::new();
        assert_eq!(add(&mut strings, &Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
    }

    #[test]
    fn mixed_add_promotes_to_float() {
        let mut strings = StringTable::new();
        assert_eq!(
            add(&mut strings, &Value::Int(2), &Value::Float(0.5)).unwrap(),
            Value::Float(2.5)
        );
    }

    #[test]
    fn string_add_concatenates_and_stringifies_other_operand() {
        let mut strings = StringTable::new();
        let result = add(&mut strings, &Value::String(strings.intern("n=")), &Value::Int(7)).unwrap();
        match result {
            Value::String(s) => assert_eq!(s.as_str(), "n=7"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn division_by_zero_errs() {
        assert!(divide(&Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn modulo_requires_integers() {
        assert!(modulo(&Value::Float(1.0), &Value::Int(2)).is_err());
        assert_eq!(modulo(&Value::Int(7), &Value::Int(2)).unwrap(), Value::Int(1));
    }

    #[test]
    fn compare_rejects_non_numeric() {
        assert!(compare(&Value::String(StringTable::new().intern("a")), &Value::Int(1)).is_err());
    }

    #[test]
    fn bit_ops_reject_non_integer() {
        assert!(bit_and(&Value::Float(1.0), &Value::Int(2)).is_err());
        assert_eq!(bit_and(&Value::Int(0b110), &Value::Int(0b011)).unwrap(), Value::Int(0b010));
    }
}
