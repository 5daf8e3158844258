//! Per-request gating decision
//!
//! classify → resolve → record visit → admin bootstrap → policy → allow/deny.
//! Every failure short of a positive block match allows the request.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::gate::classifier::{classify, IpClass};
use crate::gate::policy::{is_blocked, BlockPolicyConfig};
use crate::gate::resolver::GeoResolver;
use crate::models::CountryCode;
use crate::storage::Storage;

/// Addresses already evaluated during the current request
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    processed: HashSet<String>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `ip` as processed. Returns false if it already was.
    fn mark(&mut self, ip: &str) -> bool {
        self.processed.insert(ip.to_string())
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.processed.contains(ip)
    }
}

/// The caller being gated
#[derive(Debug, Clone)]
pub struct Visitor {
    /// Address literal as seen by the server
    pub ip: String,
    /// Caller holds administrative privilege
    pub privileged: bool,
    /// Used for log context only
    pub request_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    AlreadyProcessed,
    InternalAddress,
    GeolocationUnavailable,
    AdminCountryClaimed,
    NotBlocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow(AllowReason),
    Deny(CountryCode),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow(_))
    }
}

impl fmt::Display for AllowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AllowReason::AlreadyProcessed => "already processed",
            AllowReason::InternalAddress => "internal address",
            AllowReason::GeolocationUnavailable => "geolocation unavailable",
            AllowReason::AdminCountryClaimed => "admin country claimed",
            AllowReason::NotBlocked => "not blocked",
        };
        f.write_str(reason)
    }
}

pub struct GatePipeline {
    storage: Arc<dyn Storage>,
    resolver: Arc<dyn GeoResolver>,
}

impl GatePipeline {
    pub fn new(storage: Arc<dyn Storage>, resolver: Arc<dyn GeoResolver>) -> Self {
        Self { storage, resolver }
    }

    pub async fn evaluate(&self, scope: &mut RequestScope, visitor: &Visitor) -> GateDecision {
        if !scope.mark(&visitor.ip) {
            return GateDecision::Allow(AllowReason::AlreadyProcessed);
        }

        let ip = match classify(&visitor.ip) {
            IpClass::Internal => return GateDecision::Allow(AllowReason::InternalAddress),
            IpClass::Public(ip) => ip,
        };

        // Lookup failures are already logged by the resolver
        let Some(country) = self.resolver.resolve(ip, &visitor.request_uri).await else {
            return GateDecision::Allow(AllowReason::GeolocationUnavailable);
        };

        let now = chrono::Utc::now().timestamp();
        if let Err(err) = self.storage.record_visit(&country, now).await {
            warn!(country = %country, error = %err, "failed to record visit");
        }

        let mut config = self.load_policy().await;

        if visitor.privileged && config.admin_country.is_none() {
            match self.storage.claim_admin_country(&country).await {
                Ok(true) => {
                    info!(country = %country, "admin country set");
                    return GateDecision::Allow(AllowReason::AdminCountryClaimed);
                }
                Ok(false) => {
                    // Another request claimed it first; judge by the stored value
                    debug!(country = %country, "admin country already claimed");
                    config = self.load_policy().await;
                }
                Err(err) => {
                    warn!(country = %country, error = %err, "failed to set admin country");
                    return GateDecision::Allow(AllowReason::AdminCountryClaimed);
                }
            }
        }

        if !is_blocked(&country, &config) {
            return GateDecision::Allow(AllowReason::NotBlocked);
        }

        match self.storage.record_blocked(&country).await {
            Ok(true) => {}
            Ok(false) => warn!(country = %country, "blocked visit for country without statistics row"),
            Err(err) => warn!(country = %country, error = %err, "failed to record blocked visit"),
        }

        info!(ip = %ip, country = %country, uri = %visitor.request_uri, "access denied");
        GateDecision::Deny(country)
    }

    async fn load_policy(&self) -> BlockPolicyConfig {
        self.storage.load_policy().await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to read block policy, treating as empty");
            BlockPolicyConfig::default()
        })
    }
}
