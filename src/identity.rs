//! Caller identity resolution (the `Identify` step).

use crate::config::AccessTier;
use crate::request::InboundRequest;
use std::fmt;
use std::net::IpAddr;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const ACCESS_TIER_HEADER: &str = "x-access-tier";
/// Stand-in for callers that present no API key.
pub const ANONYMOUS_API_KEY: &str = "anonymous";

/// Who is calling, as far as quota rules are concerned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub tier: AccessTier,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>, tier: AccessTier) -> Self {
        Self { user_id: Some(user_id.into()), tier, ..Self::default() }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Resolves identity and tier from request metadata. Authentication itself
/// happens upstream; resolvers only read what it established.
pub trait IdentityResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, request: &InboundRequest) -> Identity;
}

/// Reads `x-user-id` and `x-api-key`.
///
/// Callers with a user id are `authenticated` and everyone else is `public`.
/// The `x-access-tier` header is ignored unless enabled with
/// [`trust_tier_header`](Self::trust_tier_header); only do that when an upstream
/// auth layer sets the header and strips any client-supplied value.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderIdentityResolver {
    trust_tier_header: bool,
}

impl HeaderIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let a valid `x-access-tier` header override the implied tier. Unknown
    /// values still fall back to it.
    pub fn trust_tier_header(mut self) -> Self {
        self.trust_tier_header = true;
        self
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve(&self, request: &InboundRequest) -> Identity {
        let user_id = request.header(USER_ID_HEADER).map(str::to_string);
        let api_key = request.header(API_KEY_HEADER).map(str::to_string);
        let implied =
            if user_id.is_some() { AccessTier::Authenticated } else { AccessTier::Public };
        let claimed = request.header(ACCESS_TIER_HEADER).filter(|_| self.trust_tier_header);
        let tier = match claimed.map(str::parse::<AccessTier>) {
            Some(Ok(tier)) => tier,
            Some(Err(err)) => {
                tracing::debug!(target: "tollgate::identity", error = %err, "ignoring access tier header");
                implied
            }
            None => implied,
        };
        Identity { ip: request.client_ip, user_id, api_key, tier }
    }
}
