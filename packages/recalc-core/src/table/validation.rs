//! Validation helpers for table and field definitions.

use crate::error::{RecalcError, Result};

const MAX_NAME_LEN: usize = 255;

/// Validates a table or field display name.
///
/// # Arguments
/// * `subject` - Identifier reported in the error
/// * `name` - Name to validate
///
/// # Returns
/// `Result<()>` indicating success or validation failure.
pub(crate) fn validate_name(subject: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RecalcError::InvalidFieldDefinition {
            field: subject.to_string(),
            reason: "name must not be empty".to_string(),
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RecalcError::InvalidFieldDefinition {
            field: subject.to_string(),
            reason: format!("name exceeds {} bytes", MAX_NAME_LEN),
        });
    }
    Ok(())
}

/// Validates an identifier: ASCII alphanumerics only, non-empty.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RecalcError::InvalidFieldDefinition {
            field: id.to_string(),
            reason: "identifiers must be non-empty ASCII alphanumerics".to_string(),
        });
    }
    Ok(())
}

/// Derives a physical name from a display name and an identifier.
///
/// Lowercases the name, replaces everything outside `[a-z0-9]` with `_`
/// and appends the identifier so two fields named alike never collide.
pub(crate) fn physical_name(name: &str, id: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        id.to_string()
    } else {
        format!("{}_{}", slug, id)
    }
}
