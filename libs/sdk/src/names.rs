//! Worker naming conventions.
//!
//! Drivers only report instance names, so the name carries everything the
//! pool view needs to classify an instance:
//!
//! ```text
//! register-<model>-<suffix>   register-only spawn
//! <model>-<suffix>            job spawn
//! ```

use rand::Rng;

/// Prefix marking register-only instances.
pub const REGISTER_PREFIX: &str = "register-";

/// Longest name accepted by every supported backend (DNS label).
pub const MAX_WORKER_NAME_LEN: usize = 63;

const SUFFIX_LEN: usize = 8;

/// Lower-cased model name with anything outside `[a-z0-9]` replaced by `-`.
pub fn model_slug(model_name: &str) -> String {
    let slug: String = model_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                c
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}

/// Generate a fresh worker name for the given model.
pub fn generate_worker_name(model_name: &str, register_only: bool) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.random_range(0..chars.len())] as char
        })
        .collect();
    worker_name_with_suffix(model_name, register_only, &suffix)
}

/// Deterministic part of [`generate_worker_name`].
pub fn worker_name_with_suffix(model_name: &str, register_only: bool, suffix: &str) -> String {
    let prefix = if register_only { REGISTER_PREFIX } else { "" };
    let slug = truncated_slug(model_name, register_only);
    format!("{prefix}{slug}-{suffix}")
}

/// Model slug cut so that the full worker name fits the length limit.
fn truncated_slug(model_name: &str, register_only: bool) -> String {
    let prefix_len = if register_only { REGISTER_PREFIX.len() } else { 0 };
    let budget = MAX_WORKER_NAME_LEN - prefix_len - SUFFIX_LEN - 1;

    let mut slug = model_slug(model_name);
    slug.truncate(budget);
    slug.trim_end_matches('-').to_string()
}

/// Split a driver-reported name into its logical name and register-only flag.
pub fn parse_instance_name(instance_name: &str) -> (&str, bool) {
    match instance_name.strip_prefix(REGISTER_PREFIX) {
        Some(logical) => (logical, true),
        None => (instance_name, false),
    }
}

/// Whether a logical worker name was generated for the given model.
pub fn belongs_to_model(logical_name: &str, model_name: &str) -> bool {
    [true, false].into_iter().any(|register_only| {
        let slug = truncated_slug(model_name, register_only);
        logical_name
            .strip_prefix(slug.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|suffix| suffix.len() == SUFFIX_LEN && !suffix.contains('-'))
    })
}
