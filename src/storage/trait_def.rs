use crate::gate::BlockPolicyConfig;
use crate::models::{CountryCode, CountryStat};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Settings row holding the JSON array of blocked country codes
pub const BLOCKED_COUNTRIES_SETTING: &str = "blocked_countries";
/// Settings row holding the protected admin country code
pub const ADMIN_COUNTRY_SETTING: &str = "admin_country";

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create tables, etc.)
    async fn init(&self) -> Result<()>;

    /// Count one visit for a country, creating its row on first sight.
    /// `at` is a Unix timestamp in seconds.
    async fn record_visit(&self, country: &CountryCode, at: i64) -> Result<()>;

    /// Count one blocked visit for an existing row.
    /// Returns false when the country has no row.
    async fn record_blocked(&self, country: &CountryCode) -> Result<bool>;

    /// All rows ordered by total visits, most visited first
    async fn list_stats(&self) -> Result<Vec<CountryStat>>;

    async fn get_stat(&self, country: &CountryCode) -> Result<Option<CountryStat>>;

    /// Insert zero-count rows for codes that have no row yet.
    /// Returns the number of rows inserted.
    async fn preload(&self, codes: &[&str]) -> Result<u64>;

    /// Read the block policy configuration
    async fn load_policy(&self) -> Result<BlockPolicyConfig>;

    /// Replace the blocked country set
    async fn save_blocked_countries(&self, countries: &BTreeSet<CountryCode>) -> Result<()>;

    /// Store the admin country unless a valid one is already set. A stored
    /// value that is not a country code is overwritten.
    /// Returns true when this call set it.
    async fn claim_admin_country(&self, country: &CountryCode) -> Result<bool>;

    /// Forget the admin country. Returns true when one was set.
    async fn clear_admin_country(&self) -> Result<bool>;
}

/// Decode the stored blocked-country JSON array, dropping entries that are not
/// valid codes
pub(crate) fn decode_blocked_countries(raw: &str) -> Result<BTreeSet<CountryCode>> {
    let entries: Vec<String> = serde_json::from_str(raw)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| match CountryCode::parse(&entry) {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring stored blocked country");
                None
            }
        })
        .collect())
}

pub(crate) fn encode_blocked_countries(countries: &BTreeSet<CountryCode>) -> Result<String> {
    Ok(serde_json::to_string(
        &countries.iter().map(CountryCode::as_str).collect::<Vec<_>>(),
    )?)
}

/// Build the policy from the two raw settings values. Unreadable values are
/// treated as unset.
pub(crate) fn policy_from_settings(
    blocked: Option<String>,
    admin: Option<String>,
) -> BlockPolicyConfig {
    let blocked_countries = match blocked {
        Some(raw) => decode_blocked_countries(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "blocked country setting is unreadable, treating as empty");
            BTreeSet::new()
        }),
        None => BTreeSet::new(),
    };

    let admin_country = admin.and_then(|raw| match CountryCode::parse(&raw) {
        Ok(code) => Some(code),
        Err(e) => {
            tracing::warn!(error = %e, "admin country setting is invalid, treating as unset");
            None
        }
    });

    BlockPolicyConfig {
        blocked_countries,
        admin_country,
    }
}
