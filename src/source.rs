use std::future::Future;

use crate::{error::LookupError, model::ApiCode};

/// Where the walker gets code records from: the live API, the lookup cache,
/// or a fixture in tests.
pub trait CodeSource: Sync {
    /// Descriptive record for a single code.
    fn details(&self, code: &str) -> impl Future<Output = Result<ApiCode, LookupError>> + Send;

    /// Immediate children of a code, in API order.
    fn children(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Vec<ApiCode>, LookupError>> + Send;
}

/// Codes end up as URL path segments; anything outside this alphabet is rejected
/// before a request is made.
pub fn validate_code(code: &str) -> Result<&str, LookupError> {
    let trimmed = code.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= 32
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(trimmed)
    } else {
        Err(LookupError::InvalidCode {
            code: code.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_icd_and_block_codes() {
        for code in ["V", "F32", "F32.1", "F30-F39", " F99 "] {
            assert!(validate_code(code).is_ok(), "{code} should be valid");
        }
        assert_eq!(validate_code(" F99 ").unwrap(), "F99");
    }

    #[test]
    fn rejects_codes_that_would_break_the_path() {
        for code in ["", "  ", "F32/../admin", "F32?x=1", "F 32", "http://evil"] {
            assert!(matches!(
                validate_code(code),
                Err(LookupError::InvalidCode { .. })
            ));
        }
    }
}
