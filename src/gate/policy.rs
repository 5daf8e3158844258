use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::CountryCode;

/// Operator-managed blocking configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPolicyConfig {
    pub blocked_countries: BTreeSet<CountryCode>,
    /// Country of the first privileged visitor; never blocked
    pub admin_country: Option<CountryCode>,
}

impl BlockPolicyConfig {
    /// Blocked countries with the admin country removed
    pub fn effective_blocked(&self) -> BTreeSet<CountryCode> {
        self.blocked_countries
            .iter()
            .filter(|code| Some(*code) != self.admin_country.as_ref())
            .cloned()
            .collect()
    }
}

/// Whether visitors from `country` are denied. The admin country is exempt
/// even if the stored block list still contains it.
pub fn is_blocked(country: &CountryCode, config: &BlockPolicyConfig) -> bool {
    if config.admin_country.as_ref() == Some(country) {
        return false;
    }
    config.blocked_countries.contains(country)
}

/// Block list as submitted by an operator: either `"FR, DE"` or `["FR", "DE"]`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BlockListInput {
    Text(String),
    List(Vec<String>),
}

/// Trim each entry, then keep those that are exactly two letters, uppercased.
/// Everything else is dropped without error.
pub fn sanitize_blocked_countries(input: &BlockListInput) -> BTreeSet<CountryCode> {
    let entries: Vec<&str> = match input {
        BlockListInput::Text(text) => text.split(',').collect(),
        BlockListInput::List(items) => items.iter().map(String::as_str).collect(),
    };

    entries
        .into_iter()
        .filter_map(|entry| CountryCode::parse(entry).ok())
        .collect()
}
