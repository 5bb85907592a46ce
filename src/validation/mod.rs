use std::fmt;

pub const CURRENCY_CODE_LEN: usize = 3;
pub const IDENTIFIER_MAX_LEN: usize = 255;
pub const NONCE_MAX_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

/// Ids, tokens and sources: non-empty, bounded, no whitespace or control characters.
pub fn validate_identifier(field: &'static str, value: &str) -> ValidationResult {
    validate_required(field, value)?;
    validate_max_len(field, value, IDENTIFIER_MAX_LEN)?;

    if value.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        return Err(ValidationError::new(
            field,
            "must not contain whitespace or control characters",
        ));
    }

    Ok(())
}

/// Amounts are integer minor units.
pub fn validate_positive_amount(amount: i64) -> ValidationResult {
    if amount <= 0 {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }

    Ok(())
}

/// Returns the normalised (lowercase) ISO 4217 code.
pub fn normalize_currency(currency: &str) -> Result<String, ValidationError> {
    let currency = sanitize_string(currency).to_lowercase();
    validate_required("currency", &currency)?;

    if currency.len() != CURRENCY_CODE_LEN || !currency.chars().all(|ch| ch.is_ascii_lowercase()) {
        return Err(ValidationError::new(
            "currency",
            format!("must be a {}-letter ISO currency code", CURRENCY_CODE_LEN),
        ));
    }

    Ok(currency)
}

pub fn validate_nonce(nonce: &str) -> ValidationResult {
    validate_required("idempotency_key", nonce)?;
    validate_max_len("idempotency_key", nonce, NONCE_MAX_LEN)
}
