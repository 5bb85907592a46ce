use serde_json::Value;

/// Masks card data and credentials in a JSON payload before it is logged.
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let val = if is_sensitive_field(key) {
                        mask_value(val)
                    } else {
                        sanitize_json(val)
                    };
                    (key.clone(), val)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_json).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_field(key: &str) -> bool {
    matches!(
        key.to_lowercase().as_str(),
        "number" | "security_code" | "token" | "card" | "secret" | "password" | "authorization"
    )
}

fn mask_value(value: &Value) -> Value {
    match value {
        // Keep the last four, as on a receipt.
        Value::String(s) if s.chars().count() > 8 => {
            let tail: String = s.chars().skip(s.chars().count() - 4).collect();
            Value::String(format!("****{}", tail))
        }
        _ => Value::String("****".to_string()),
    }
}
