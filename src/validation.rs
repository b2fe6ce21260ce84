//! Configuration and request validation utilities.

use std::time::Duration;

use crate::types::{Error, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that a value is positive.
pub fn validate_positive(n: u64, field: &str) -> Result<()> {
    if n == 0 {
        return Err(Error::validation(format!("{} must be positive", field)));
    }
    Ok(())
}

/// Validate that a duration is non-zero.
pub fn validate_non_zero(d: Duration, field: &str) -> Result<()> {
    if d.is_zero() {
        return Err(Error::validation(format!("{} must be non-zero", field)));
    }
    Ok(())
}

/// Validate a worker address of the form `host:port`.
///
/// The host is not resolved here; only the shape is checked.
pub fn validate_address(address: &str, field: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::validation(format!("{}: {} is missing a port", field, address)))?;
    validate_non_empty(host, field)?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::validation(format!("{}: {} has an invalid port", field, address)))?;
    validate_positive(u64::from(port), field)
}
