//! Tier resolution: which `(key, tier)` pairs gate a request.
//!
//! The pipeline hands over a [`RequestContext`]; route classification comes either from
//! the context itself or from an explicit [`RouteTable`] configured next to the routes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rate_limit::key::RateLimitKey;
use crate::rate_limit::tier::{TierConfig, TierName, TierTable};

/// Route classes that select stricter tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteClass {
    #[default]
    Normal,
    /// Credential checks.
    Login,
    /// Administrative endpoints.
    Admin,
}

/// Caller plan, as looked up by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Plan {
    #[default]
    Standard,
    Premium,
}

/// Network identity of the caller as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress {
    /// Address of the TCP peer.
    pub peer: IpAddr,
    /// Raw `X-Forwarded-For` header, if any.
    pub forwarded_for: Option<String>,
}

/// Read-only view of a request, provided by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub address: ClientAddress,
    /// Authenticated username, if any.
    pub username: Option<String>,
    /// Tenant discriminator, if the deployment is multi-tenant.
    pub tenant: Option<String>,
    /// Request path, classified through the route table.
    pub path: String,
    /// Classification already made by the pipeline; overrides the route table.
    pub route_class: Option<RouteClass>,
    /// Identity a login attempt is for (not the caller).
    pub login_target: Option<String>,
    pub plan: Plan,
}

impl RequestContext {
    /// Anonymous request from `peer` for `path`.
    pub fn new(peer: IpAddr, path: impl Into<String>) -> Self {
        Self {
            address: ClientAddress { peer, forwarded_for: None },
            username: None,
            tenant: None,
            path: path.into(),
            route_class: None,
            login_target: None,
            plan: Plan::Standard,
        }
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.address.forwarded_for = Some(header.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_route_class(mut self, class: RouteClass) -> Self {
        self.route_class = Some(class);
        self
    }

    pub fn with_login_target(mut self, identity: impl Into<String>) -> Self {
        self.login_target = Some(identity.into());
        self
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }
}

/// One route-table entry: paths under `prefix` belong to `class`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    pub class: RouteClass,
}

/// Ordered route classification table. First matching prefix wins; unmatched paths are
/// [`RouteClass::Normal`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: impl IntoIterator<Item = RouteRule>) -> Self {
        Self { rules: rules.into_iter().collect() }
    }

    /// Append a rule.
    pub fn route(mut self, prefix: impl Into<String>, class: RouteClass) -> Self {
        self.rules.push(RouteRule { prefix: prefix.into(), class });
        self
    }

    /// Classify `path`. Prefixes match whole segments: `/admin` covers `/admin` and
    /// `/admin/users` but not `/administrators`.
    pub fn classify(&self, path: &str) -> RouteClass {
        self.rules
            .iter()
            .find(|rule| segment_prefix(path, &rule.prefix))
            .map(|rule| rule.class)
            .unwrap_or_default()
    }
}

fn segment_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with(['/', '?']),
        None => false,
    }
}

/// Maps a request to the `(key, tier)` pairs that gate it.
#[derive(Debug, Clone)]
pub struct TierResolver {
    tiers: Arc<TierTable>,
    routes: RouteTable,
    trust_forwarded_for: bool,
}

impl TierResolver {
    pub fn new(tiers: Arc<TierTable>, routes: RouteTable) -> Self {
        Self { tiers, routes, trust_forwarded_for: false }
    }

    /// Take the caller address from `X-Forwarded-For` (only behind a trusted proxy).
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Resolve every limit that applies to `ctx`, in evaluation order:
    ///
    /// 1. the caller address under ANONYMOUS, always;
    /// 2. on admin routes, the caller under ADMIN; otherwise an authenticated caller under
    ///    USER, or PREMIUM for premium plans;
    /// 3. on login routes, the attempted identity under LOGIN.
    pub fn resolve(&self, ctx: &RequestContext) -> Vec<(RateLimitKey, &TierConfig)> {
        let ip = self.client_ip(&ctx.address);
        let tenant = ctx.tenant.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let user = ctx.username.as_deref().and_then(normalize_identity);
        let class = ctx.route_class.unwrap_or_else(|| self.routes.classify(&ctx.path));

        let mut limits = Vec::with_capacity(3);
        limits.push((RateLimitKey::ip(ip), self.tiers.get(TierName::Anonymous)));

        match (class, user.as_deref()) {
            (RouteClass::Admin, Some(user)) => {
                limits.push((RateLimitKey::admin(tenant, user), self.tiers.get(TierName::Admin)));
            }
            (RouteClass::Admin, None) => {
                let subject = ip.to_string();
                limits.push((RateLimitKey::admin(tenant, &subject), self.tiers.get(TierName::Admin)));
            }
            (_, Some(user)) => {
                let limit = match ctx.plan {
                    Plan::Premium => {
                        (RateLimitKey::premium(tenant, user), self.tiers.get(TierName::Premium))
                    }
                    Plan::Standard => (RateLimitKey::user(tenant, user), self.tiers.get(TierName::User)),
                };
                limits.push(limit);
            }
            (_, None) => {}
        }

        if class == RouteClass::Login {
            let key = match ctx.login_target.as_deref().and_then(normalize_identity) {
                Some(target) => RateLimitKey::login_target(tenant, &target),
                None => {
                    debug!(target: "tollgate::resolver", ip = %ip, "login attempt without target; limiting by address");
                    RateLimitKey::login_target(tenant, &ip.to_string())
                }
            };
            limits.push((key, self.tiers.get(TierName::Login)));
        }
        limits
    }

    /// Caller address. A malformed forwarded header falls back to the raw peer address
    /// rather than skipping the address limit.
    pub fn client_ip(&self, address: &ClientAddress) -> IpAddr {
        if !self.trust_forwarded_for {
            return address.peer;
        }
        let Some(header) = address.forwarded_for.as_deref() else {
            return address.peer;
        };
        let first = header.split(',').next().unwrap_or_default().trim();
        if first.is_empty() {
            return address.peer;
        }
        match parse_forwarded_ip(first) {
            Some(ip) => ip,
            None => {
                warn!(
                    target: "tollgate::resolver",
                    header = %header,
                    peer = %address.peer,
                    "malformed forwarded address; using peer address"
                );
                address.peer
            }
        }
    }
}

fn parse_forwarded_ip(raw: &str) -> Option<IpAddr> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(sock) = raw.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    raw.strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .and_then(|r| r.parse::<IpAddr>().ok())
}

fn normalize_identity(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
}
