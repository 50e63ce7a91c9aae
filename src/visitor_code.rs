//! Visitor code validation and generation.
use rand::{thread_rng, RngCore};

use crate::{Error, Result};

/// Longest accepted visitor code, in characters.
pub const MAX_VISITOR_CODE_LENGTH: usize = 255;

/// Check that `visitor_code` is usable as a visitor identifier.
///
/// # Errors
///
/// [`Error::VisitorCodeEmpty`] or [`Error::VisitorCodeTooLong`].
pub fn validate_visitor_code(visitor_code: &str) -> Result<()> {
    if visitor_code.is_empty() {
        return Err(Error::VisitorCodeEmpty);
    }
    let length = visitor_code.chars().count();
    if length > MAX_VISITOR_CODE_LENGTH {
        return Err(Error::VisitorCodeTooLong(length));
    }
    Ok(())
}

/// Generate a random visitor code for a new visitor.
///
/// ```
/// let code = flagline::generate_visitor_code();
/// assert_eq!(code.len(), 16);
/// ```
pub fn generate_visitor_code() -> String {
    let mut bytes = [0u8; 8];
    thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
