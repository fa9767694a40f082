//! Storage key layout: `{role}/{upload_id}.{ext}`.
//!
//! The upload id is generated server-side, so keys never collide and the keys
//! of every size role can be rebuilt from any one of them.

use crate::models::variant::Role;
use std::collections::BTreeSet;
use uuid::Uuid;

const MAX_EXTENSION_LEN: usize = 10;

pub fn object_key(role: Role, upload_id: Uuid, extension: &str) -> String {
    format!("{}/{}.{}", role.as_str(), upload_id, extension)
}

/// Split a key into its role, upload id and extension.
pub fn parse_key(key: &str) -> Option<(Role, Uuid, &str)> {
    let (role, file) = key.split_once('/')?;
    let (id, ext) = file.split_once('.')?;
    Some((Role::parse(role)?, Uuid::parse_str(id).ok()?, ext))
}

/// The key itself plus the same upload under every other role.
///
/// Keys that do not follow the layout are returned unchanged.
pub fn sibling_keys(key: &str) -> Vec<String> {
    match parse_key(key) {
        Some((_, id, ext)) => Role::ALL
            .into_iter()
            .map(|role| object_key(role, id, ext))
            .collect(),
        None => vec![key.to_string()],
    }
}

/// Sibling expansion over several keys, deduplicated and sorted.
pub fn image_set_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    keys.into_iter()
        .flat_map(sibling_keys)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Extension for storing an upload's original bytes.
///
/// Prefers the client's filename extension when it is short and alphanumeric,
/// then the MIME subtype, then `bin`.
pub fn passthrough_extension(filename_ext: Option<&str>, content_type: &str) -> String {
    let clean = |candidate: &str| {
        let lower = candidate.to_ascii_lowercase();
        (!lower.is_empty()
            && lower.len() <= MAX_EXTENSION_LEN
            && lower.bytes().all(|b| b.is_ascii_alphanumeric()))
        .then_some(lower)
    };

    if let Some(ext) = filename_ext.and_then(clean) {
        return ext;
    }

    let subtype = content_type
        .split(';')
        .next()
        .and_then(|mime| mime.trim().split_once('/'))
        .map(|(_, sub)| sub.trim_start_matches("x-"))
        .unwrap_or_default();
    clean(subtype).unwrap_or_else(|| "bin".to_string())
}
