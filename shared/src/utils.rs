//! Utility functions for the analysis service
//!
//! Validation helpers shared by the submission path and the API layer.

/// Validate a stock symbol.
///
/// Symbols are exchange codes like "000001", "600519", "AAPL" or "0700.HK":
/// alphanumeric with optional dots, between 1 and 16 characters, and at
/// least one alphanumeric character.
pub fn validate_stock_code(stock_code: &str) -> crate::Result<()> {
    if stock_code.is_empty() {
        return Err(
            crate::AnalysisError::Validation("Stock code cannot be empty".to_string()).into(),
        );
    }

    if stock_code.len() > 16 {
        return Err(crate::AnalysisError::Validation(
            "Stock code cannot be longer than 16 characters".to_string(),
        )
        .into());
    }

    if !stock_code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.')
    {
        return Err(crate::AnalysisError::Validation(
            "Stock code can only contain alphanumeric characters and dots".to_string(),
        )
        .into());
    }

    if !stock_code.chars().any(|c| c.is_ascii_alphanumeric()) {
        return Err(crate::AnalysisError::Validation(
            "Stock code must contain at least one alphanumeric character".to_string(),
        )
        .into());
    }

    Ok(())
}

/// Validate a user identifier.
///
/// User ids are opaque but bounded: non-empty, at most 64 characters,
/// alphanumeric plus hyphens and underscores.
pub fn validate_user_id(user_id: &str) -> crate::Result<()> {
    if user_id.is_empty() {
        return Err(
            crate::AnalysisError::Validation("User ID cannot be empty".to_string()).into(),
        );
    }

    if user_id.len() > 64 {
        return Err(crate::AnalysisError::Validation(
            "User ID cannot be longer than 64 characters".to_string(),
        )
        .into());
    }

    if !user_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::AnalysisError::Validation(
            "User ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }

    Ok(())
}
