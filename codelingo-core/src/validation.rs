//! Credential validation performed before any request is sent.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::auth::{LoginCredentials, RegisterCredentials};
use crate::error::ValidationError;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

static PASSWORD_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z\d@$!%*?&]+$").expect("valid password regex"));

pub const MIN_PASSWORD_LEN: usize = 8;

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email.trim())
}

/// Check password strength, returning every rule the password breaks.
pub fn password_violations(password: &str) -> Vec<&'static str> {
    let mut violations = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LEN {
        violations.push("must be at least 8 characters long");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        violations.push("must contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        violations.push("must contain at least one uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push("must contain at least one number");
    }
    if !PASSWORD_CHARSET.is_match(password) {
        violations.push("can only contain letters, numbers, and @$!%*?& symbols");
    }
    violations
}

pub fn passwords_match(password: &str, confirm: &str) -> bool {
    password == confirm
}

fn check_email(email: &str, errors: &mut Vec<ValidationError>) {
    if email.trim().is_empty() {
        errors.push(ValidationError::RequiredFieldMissing {
            field: "email".to_string(),
        });
    } else if !is_valid_email(email) {
        errors.push(ValidationError::InvalidValue {
            field: "email".to_string(),
            reason: "invalid email format".to_string(),
        });
    }
}

/// Login only checks presence and email shape; strength rules are the
/// server's business for existing accounts.
pub fn validate_login(credentials: &LoginCredentials) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_email(&credentials.email, &mut errors);
    if credentials.password.trim().is_empty() {
        errors.push(ValidationError::RequiredFieldMissing {
            field: "password".to_string(),
        });
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate_registration(
    credentials: &RegisterCredentials,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    if credentials.name.trim().is_empty() {
        errors.push(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
    }
    check_email(&credentials.email, &mut errors);
    for reason in password_violations(&credentials.password) {
        errors.push(ValidationError::InvalidValue {
            field: "password".to_string(),
            reason: reason.to_string(),
        });
    }
    if !passwords_match(&credentials.password, &credentials.confirm_password) {
        errors.push(ValidationError::PasswordMismatch);
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
