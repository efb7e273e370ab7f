//! Password hashing, verification and strength policy

use crate::error::AppError;
use bcrypt::{hash, verify, DEFAULT_COST};

/// Hash a password using bcrypt
pub fn hash_password(password: &str) -> Result<String, AppError> {
    hash(password, DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    verify(password, hash)
        .map_err(|e| AppError::Internal(format!("Failed to verify password: {}", e)))
}

/// Minimum length plus at least one letter and one digit
pub fn check_password_strength(password: &str, min_length: usize) -> Result<(), AppError> {
    if password.chars().count() < min_length {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            min_length
        )));
    }
    let has_letter = password.chars().any(|c| c.is_alphabetic());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Err(AppError::Validation(
            "Password must contain both letters and digits".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hashed = hash_password("correct horse 42").unwrap();
        assert!(verify_password("correct horse 42", &hashed).unwrap());
        assert!(!verify_password("wrong horse 42", &hashed).unwrap());
    }

    #[test]
    fn test_strength_policy() {
        assert!(check_password_strength("short1", 12).is_err());
        assert!(check_password_strength("onlylettersherexx", 12).is_err());
        assert!(check_password_strength("letters4andDigits", 12).is_ok());
    }
}
