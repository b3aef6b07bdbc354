//! Exclusion filtering for entity and service class names.

use crate::models::{ExclusionPattern, PatternType};
use regex::Regex;
use tracing::warn;

/// Compiled, case-insensitive glob patterns for a single run.
///
/// Built from the active exclusion rows; pattern changes take effect on the
/// next construction. Invalid patterns are skipped, never fatal.
#[derive(Debug, Default)]
pub struct ExclusionFilter {
    entity_patterns: Vec<Regex>,
    service_class_patterns: Vec<Regex>,
}

impl ExclusionFilter {
    pub fn from_patterns(patterns: &[ExclusionPattern]) -> Self {
        let mut filter = ExclusionFilter::default();

        for pattern in patterns.iter().filter(|p| p.is_active) {
            let Some(regex) = compile_glob(&pattern.pattern) else {
                warn!(pattern = %pattern.pattern, "Invalid exclusion pattern, skipping");
                continue;
            };

            match PatternType::from_string(&pattern.pattern_type) {
                PatternType::Entity => filter.entity_patterns.push(regex),
                PatternType::ServiceClass => filter.service_class_patterns.push(regex),
            }
        }

        filter
    }

    /// True if any active pattern of the given type matches the name.
    pub fn is_excluded(&self, name: &str, pattern_type: PatternType) -> bool {
        let patterns = match pattern_type {
            PatternType::Entity => &self.entity_patterns,
            PatternType::ServiceClass => &self.service_class_patterns,
        };

        patterns.iter().any(|pattern| pattern.is_match(name))
    }

    /// A pair is billable unless either side matches an active pattern.
    pub fn is_billable(&self, entity_name: &str, service_class: &str) -> bool {
        !self.is_excluded(entity_name, PatternType::Entity)
            && !self.is_excluded(service_class, PatternType::ServiceClass)
    }

    pub fn is_empty(&self) -> bool {
        self.entity_patterns.is_empty() && self.service_class_patterns.is_empty()
    }
}

/// Translate a glob pattern (`*`, `?`) into an anchored case-insensitive regex.
fn compile_glob(pattern: &str) -> Option<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push_str("(?i)^");

    for ch in pattern.chars() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            _ => translated.push_str(&regex::escape(&ch.to_string())),
        }
    }

    translated.push('$');
    Regex::new(&translated).ok()
}
