//! Input validation for the Data Product Gateway
//!
//! Provides validation functions to prevent:
//! - SQL injection through filter column names or allow-list identifiers
//! - Malformed pagination and boolean flags
//! - Excessively long inputs

use crate::{GatewayError, Pagination, Result};

/// Maximum length for filter column names
pub const MAX_COLUMN_NAME_LEN: usize = 255;

/// Maximum length for filter values
pub const MAX_FILTER_VALUE_LEN: usize = 1024;

/// Maximum number of filter columns per request
pub const MAX_FILTERS: usize = 32;

/// Maximum length for warehouse identifiers in the allow-list
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Smallest page a client may request
pub const MIN_PAGE_LIMIT: u32 = 1;

/// Default page size when `limit` is omitted
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Largest page a client may request
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Pagination bounds applied to client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationBounds {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for PaginationBounds {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PAGE_LIMIT,
            max_limit: MAX_PAGE_LIMIT,
        }
    }
}

impl PaginationBounds {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_limit < MIN_PAGE_LIMIT {
            return Err("max_limit must be >= 1".to_string());
        }
        if self.default_limit < MIN_PAGE_LIMIT || self.default_limit > self.max_limit {
            return Err(format!(
                "default_limit must be between {} and {}",
                MIN_PAGE_LIMIT, self.max_limit
            ));
        }
        Ok(())
    }
}

/// Validate a filter column name
///
/// Requirements:
/// - Not empty
/// - <= 255 characters
/// - ASCII letters, digits and underscore only
/// - Does not start with a digit
pub fn validate_column_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GatewayError::validation("Filter column name cannot be empty"));
    }

    if name.len() > MAX_COLUMN_NAME_LEN {
        return Err(GatewayError::validation(format!(
            "Filter column name too long: {} > {} characters",
            name.len(),
            MAX_COLUMN_NAME_LEN
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(GatewayError::validation_with_details(
            "Filter column name contains invalid characters (allowed: A-Z, a-z, 0-9, _)",
            vec![format!("query.{}", name)],
        ));
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(GatewayError::validation_with_details(
            "Filter column name cannot start with a digit",
            vec![format!("query.{}", name)],
        ));
    }

    Ok(())
}

/// Validate a filter value
///
/// Values are opaque strings, but they are bounded in size and may not carry
/// control characters.
pub fn validate_filter_value(column: &str, value: &str) -> Result<()> {
    if value.len() > MAX_FILTER_VALUE_LEN {
        return Err(GatewayError::validation_with_details(
            format!(
                "Filter value too long: {} > {} characters",
                value.len(),
                MAX_FILTER_VALUE_LEN
            ),
            vec![format!("query.{}", column)],
        ));
    }

    if value.chars().any(char::is_control) {
        return Err(GatewayError::validation_with_details(
            "Filter value contains control characters",
            vec![format!("query.{}", column)],
        ));
    }

    Ok(())
}

/// Validate a warehouse identifier from the allow-list
///
/// Accepts optionally qualified names (`DB.SCHEMA.TABLE`); each part must be
/// a plain identifier (letters, digits, `_`, `$`, not starting with a digit).
pub fn validate_warehouse_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(GatewayError::validation(format!(
            "Warehouse identifier must be 1..={} characters",
            MAX_IDENTIFIER_LEN
        )));
    }

    for part in identifier.split('.') {
        let valid = !part.is_empty()
            && !part.starts_with(|c: char| c.is_ascii_digit())
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
        if !valid {
            return Err(GatewayError::validation(format!(
                "Invalid warehouse identifier: {}",
                identifier
            )));
        }
    }

    Ok(())
}

/// Parse `limit` and `offset` query values against the configured bounds.
pub fn parse_pagination(
    limit: Option<&str>,
    offset: Option<&str>,
    bounds: &PaginationBounds,
) -> Result<Pagination> {
    let limit = match limit {
        None => bounds.default_limit,
        Some(raw) => {
            let value: u32 = raw.trim().parse().map_err(|_| {
                GatewayError::validation_with_details(
                    "The request inputs were invalid.",
                    vec![format!("query.limit: '{}' is not a valid integer", raw)],
                )
            })?;
            if !(MIN_PAGE_LIMIT..=bounds.max_limit).contains(&value) {
                return Err(GatewayError::validation_with_details(
                    "The request inputs were invalid.",
                    vec![format!(
                        "query.limit: must be between {} and {}",
                        MIN_PAGE_LIMIT, bounds.max_limit
                    )],
                ));
            }
            value
        }
    };

    let offset = match offset {
        None => 0,
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
            GatewayError::validation_with_details(
                "The request inputs were invalid.",
                vec![format!(
                    "query.offset: '{}' is not a non-negative integer",
                    raw
                )],
            )
        })?,
    };

    Ok(Pagination { limit, offset })
}

/// Parse a boolean query flag (`true/false`, `1/0`, `yes/no`, `on/off`).
pub fn parse_flag(name: &str, raw: Option<&str>) -> Result<bool> {
    let Some(raw) = raw else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(GatewayError::validation_with_details(
            "The request inputs were invalid.",
            vec![format!("query.{}: '{}' is not a valid boolean", name, raw)],
        )),
    }
}
