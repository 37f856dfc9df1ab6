//! Source page address construction.

use stromdb_core::Target;

use crate::error::ScraperError;

/// Fills `{name}` and `{id}` in `template` from `target` and validates the result.
///
/// # Errors
///
/// Returns [`ScraperError::InvalidUrl`] if the filled template is not an
/// absolute `http(s)` URL.
pub fn source_url(template: &str, target: &Target) -> Result<String, ScraperError> {
    let filled = template
        .replace("{name}", &target.normalized_name)
        .replace("{id}", &target.location_id);

    let parsed = reqwest::Url::parse(&filled).map_err(|e| ScraperError::InvalidUrl {
        url: filled.clone(),
        reason: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ScraperError::InvalidUrl {
            url: filled,
            reason: format!("unsupported scheme \"{}\"", parsed.scheme()),
        });
    }

    Ok(parsed.to_string())
}
