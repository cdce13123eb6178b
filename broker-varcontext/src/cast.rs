//! Casting evaluated values to declared variable types.

use crate::error::{Result, VarContextError};
use crate::variable::VarType;
use serde_json::{Number, Value};

/// Convert `value` to `target`, parsing strings where the target is structured.
pub fn cast(value: Value, target: VarType) -> Result<Value> {
    match target {
        VarType::Unset => Ok(value),
        VarType::String => Ok(Value::String(to_plain_string(&value))),
        VarType::Boolean => to_bool(value),
        VarType::Integer => to_integer(value),
        VarType::Number => to_number(value),
        VarType::Object => parse_structured(value, target, Value::is_object),
        VarType::Array => parse_structured(value, target, Value::is_array),
    }
}

/// Render a value the way a template would: strings unquoted, everything
/// else as JSON.
pub fn to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn fail(value: &Value, target: VarType, reason: impl Into<String>) -> VarContextError {
    VarContextError::TypeCast {
        value: to_plain_string(value),
        target: target.to_string(),
        reason: reason.into(),
    }
}

fn to_bool(value: Value) -> Result<Value> {
    match &value {
        Value::Bool(_) => Ok(value),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(fail(&value, VarType::Boolean, "not a boolean")),
        },
        Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
        _ => Err(fail(&value, VarType::Boolean, "not a boolean")),
    }
}

fn to_integer(value: Value) -> Result<Value> {
    match &value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
            _ => Err(fail(&value, VarType::Integer, "has a fractional part")),
        },
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| fail(&value, VarType::Integer, e.to_string())),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        _ => Err(fail(&value, VarType::Integer, "not a number")),
    }
}

fn to_number(value: Value) -> Result<Value> {
    match &value {
        Value::Number(_) => Ok(value),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::from(i));
            }
            let f = trimmed
                .parse::<f64>()
                .map_err(|e| fail(&value, VarType::Number, e.to_string()))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| fail(&value, VarType::Number, "not a finite number"))
        }
        _ => Err(fail(&value, VarType::Number, "not a number")),
    }
}

fn parse_structured(value: Value, target: VarType, accept: fn(&Value) -> bool) -> Result<Value> {
    if accept(&value) {
        return Ok(value);
    }
    let Value::String(raw) = &value else {
        return Err(fail(&value, target, format!("not an {target}")));
    };
    let parsed: Value =
        serde_json::from_str(raw).map_err(|e| fail(&value, target, e.to_string()))?;
    if accept(&parsed) {
        Ok(parsed)
    } else {
        Err(fail(&value, target, format!("JSON is not an {target}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_from_strings() {
        assert_eq!(
            cast(json!(r#"{"foo": "bar"}"#), VarType::Object).unwrap(),
            json!({"foo": "bar"})
        );
        assert_eq!(
            cast(json!(r#"["a","b"]"#), VarType::Array).unwrap(),
            json!(["a", "b"])
        );
        assert!(cast(json!("[1]"), VarType::Object).is_err());
    }

    #[test]
    fn test_scalars() {
        assert_eq!(cast(json!("true"), VarType::Boolean).unwrap(), json!(true));
        assert_eq!(cast(json!("1.234"), VarType::Number).unwrap(), json!(1.234));
        assert_eq!(cast(json!("1234"), VarType::Integer).unwrap(), json!(1234));
        assert_eq!(cast(json!(1234), VarType::String).unwrap(), json!("1234"));
        assert_eq!(cast(json!("1234"), VarType::Unset).unwrap(), json!("1234"));
        assert_eq!(cast(json!(42), VarType::Unset).unwrap(), json!(42));
    }

    #[test]
    fn test_impossible_casts() {
        let err = cast(json!("abc"), VarType::Integer).unwrap_err();
        assert!(matches!(err, VarContextError::TypeCast { .. }));
        assert!(err.to_string().starts_with("couldn't cast abc to integer"));

        assert!(cast(json!("maybe"), VarType::Boolean).is_err());
        assert!(cast(json!(1.5), VarType::Integer).is_err());
    }
}
