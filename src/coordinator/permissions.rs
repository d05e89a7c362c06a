//! Keyword-to-resource permission inference.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::ResourceType;

/// Word stems that imply a resource. A stem matches at the start of a word,
/// case-insensitively, with any inflection after it and an optional `re`
/// prefix before it ("deployment", "refunded", "re-export").
#[derive(Debug)]
pub struct PermissionRule {
    pub resource: ResourceType,
    pub keywords: &'static [&'static str],
    pattern: Regex,
}

impl PermissionRule {
    fn new(resource: ResourceType, keywords: &'static [&'static str]) -> Option<Self> {
        let alternation = keywords
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"(?i)\b(?:re-?)?(?:{alternation})\w*")).ok()?;
        Some(Self {
            resource,
            keywords,
            pattern,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

const TABLE: &[(ResourceType, &[&str])] = &[
    (ResourceType::Database, &["deploy", "schema", "migrat", "database", "sql"]),
    (ResourceType::Payments, &["payment", "refund", "invoic", "charg"]),
    (ResourceType::Email, &["email", "e-mail", "notif", "newsletter"]),
    (ResourceType::FileExport, &["export", "download", "csv", "report"]),
    (ResourceType::ExternalApi, &["webhook", "integrat", "api"]),
    (ResourceType::Secrets, &["secret", "credential", "password"]),
];

static RULES: Lazy<Vec<PermissionRule>> = Lazy::new(|| {
    TABLE
        .iter()
        .filter_map(|(resource, keywords)| PermissionRule::new(*resource, *keywords))
        .collect()
});

pub fn rules() -> &'static [PermissionRule] {
    &RULES
}

/// Resources implied by `text`.
pub fn infer_permissions(text: &str) -> BTreeSet<ResourceType> {
    RULES
        .iter()
        .filter(|rule| rule.matches(text))
        .map(|rule| rule.resource)
        .collect()
}
