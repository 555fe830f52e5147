//! Extension identity parsing.
//!
//! A base-id is `"publisher.name"`; a versioned-id is
//! `"publisher.name@version"`. Installed rows are keyed by versioned-id and
//! `extract_base_id` must stay stable across upgrades.

use crate::StoreError;

/// The substring before the first `@`, or the whole string.
pub fn extract_base_id(id: &str) -> &str {
    id.split('@').next().unwrap_or(id)
}

/// The substring after the first `@`, or `None` for an unversioned id.
pub fn extract_version(id: &str) -> Option<&str> {
    id.splitn(2, '@').nth(1)
}

/// Join a base-id and version. Any version already attached to `base_id`
/// is stripped first.
pub fn to_versioned_id(base_id: &str, version: &str) -> String {
    format!("{}@{}", extract_base_id(base_id), version)
}

/// Accepts `"publisher.name"` and `"publisher.name@version"` forms.
pub fn validate(id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::InvalidId("empty extension id".to_owned()));
    }
    let base = extract_base_id(id);
    if !base.contains('.') {
        return Err(StoreError::InvalidId(format!(
            "extension id {id:?} is missing a publisher prefix"
        )));
    }
    if id.contains('@') && extract_version(id).is_none_or(str::is_empty) {
        return Err(StoreError::InvalidId(format!(
            "versioned extension id {id:?} has an empty version"
        )));
    }
    Ok(())
}
