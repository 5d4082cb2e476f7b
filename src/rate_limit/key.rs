//! Keys identifying what is being throttled.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Class of subject a key throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKind {
    /// Caller network address.
    Ip,
    /// Authenticated user.
    User,
    /// Authenticated user on a premium plan.
    Premium,
    /// Identity a login attempt targets (not the caller).
    LoginTarget,
    /// Caller of an administrative route.
    Admin,
    /// One bucket for everybody in the scope.
    Global,
}

impl SubjectKind {
    /// Stable lowercase label, used when rendering store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Ip => "ip",
            SubjectKind::User => "user",
            SubjectKind::Premium => "premium",
            SubjectKind::LoginTarget => "login",
            SubjectKind::Admin => "admin",
            SubjectKind::Global => "global",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable `(scope, subject kind, subject id)` triple. Hashes and compares by value,
/// so identical triples always address the same bucket.
///
/// Strings are reference counted; cloning a key is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey {
    scope: Option<Arc<str>>,
    kind: SubjectKind,
    subject: Arc<str>,
}

impl RateLimitKey {
    /// Build a key from its parts.
    pub fn new(scope: Option<&str>, kind: SubjectKind, subject: &str) -> Self {
        Self { scope: scope.map(Arc::from), kind, subject: Arc::from(subject) }
    }

    /// Key for a caller address. Addresses are global across scopes.
    pub fn ip(addr: IpAddr) -> Self {
        Self::new(None, SubjectKind::Ip, &addr.to_string())
    }

    /// Key for an authenticated user.
    pub fn user(scope: Option<&str>, username: &str) -> Self {
        Self::new(scope, SubjectKind::User, username)
    }

    /// Key for an authenticated user on a premium plan. Distinct from [`RateLimitKey::user`]
    /// so a plan change never reads a bucket sized for the other tier.
    pub fn premium(scope: Option<&str>, username: &str) -> Self {
        Self::new(scope, SubjectKind::Premium, username)
    }

    /// Key for the identity a login attempt targets.
    pub fn login_target(scope: Option<&str>, identity: &str) -> Self {
        Self::new(scope, SubjectKind::LoginTarget, identity)
    }

    /// Key for an administrative caller.
    pub fn admin(scope: Option<&str>, username: &str) -> Self {
        Self::new(scope, SubjectKind::Admin, username)
    }

    /// Single key shared by every request in `scope`.
    pub fn global(scope: Option<&str>) -> Self {
        Self::new(scope, SubjectKind::Global, "*")
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Renders `scope:kind:subject`, or `kind:subject` without a scope. Used as the store key.
impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}:{}", scope, self.kind, self.subject),
            None => write!(f, "{}:{}", self.kind, self.subject),
        }
    }
}
