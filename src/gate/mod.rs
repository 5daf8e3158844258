//! Country-based access gate
//!
//! Each request passes through [`middleware::gate_request`], which runs the
//! [`GatePipeline`]: classify the visitor address, resolve its country,
//! count the visit, then allow or deny by the block policy.

pub mod classifier;
pub mod ip_extractor;
pub mod middleware;
pub mod pipeline;
pub mod policy;
pub mod resolver;

pub use classifier::{classify, classify_addr, IpClass};
pub use ip_extractor::extract_client_ip;
pub use middleware::{gate_request, GateState, BLOCK_MESSAGE};
pub use pipeline::{AllowReason, GateDecision, GatePipeline, RequestScope, Visitor};
pub use policy::{is_blocked, sanitize_blocked_countries, BlockListInput, BlockPolicyConfig};
pub use resolver::{CountryApiResolver, GeoLookupError, GeoResolver};
