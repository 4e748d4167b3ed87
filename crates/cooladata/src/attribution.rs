//! Campaign attribution (UTM) lookup.

use std::collections::HashMap;

/// Campaign name field.
pub const UTM_CAMPAIGN_KEY: &str = "utm_campaign";
/// Ad content field.
pub const UTM_CONTENT_KEY: &str = "utm_content";
/// Marketing medium field.
pub const UTM_MEDIUM_KEY: &str = "utm_medium";
/// Traffic source field.
pub const UTM_SOURCE_KEY: &str = "utm_source";
/// Paid search term field.
pub const UTM_TERM_KEY: &str = "utm_term";

/// Supplies attribution fields added to every event.
///
/// Called once per `setup`; the result is reused for all events until the
/// next setup.
pub trait AttributionSource: Send + Sync {
    /// Field name to value; empty when nothing is known.
    fn fetch(&self) -> HashMap<String, String>;
}

/// No attribution data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAttribution;

impl AttributionSource for NoAttribution {
    fn fetch(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Fixed attribution data, e.g. read from an install referrer at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticAttribution {
    fields: HashMap<String, String>,
}

impl StaticAttribution {
    /// Create a source with no fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the five standard UTM fields.
    pub fn utm(
        campaign: impl Into<String>,
        content: impl Into<String>,
        medium: impl Into<String>,
        source: impl Into<String>,
        term: impl Into<String>,
    ) -> Self {
        Self::new()
            .field(UTM_CAMPAIGN_KEY, campaign)
            .field(UTM_CONTENT_KEY, content)
            .field(UTM_MEDIUM_KEY, medium)
            .field(UTM_SOURCE_KEY, source)
            .field(UTM_TERM_KEY, term)
    }

    /// Add one field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

impl AttributionSource for StaticAttribution {
    fn fetch(&self) -> HashMap<String, String> {
        self.fields.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_utm_fields() {
        let fields = StaticAttribution::utm("spring", "banner", "email", "newsletter", "shoes")
            .fetch();

        assert_eq!(fields.len(), 5);
        assert_eq!(fields[UTM_CAMPAIGN_KEY], "spring");
        assert_eq!(fields[UTM_TERM_KEY], "shoes");
        assert!(NoAttribution.fetch().is_empty());
    }
}
