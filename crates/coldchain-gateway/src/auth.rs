use thiserror::Error;

/// Reasons an agent handshake fails. Every variant is fatal to the connection;
/// `Display` is the `AUTH_ERROR` message sent to the agent.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("organization required")]
    OrganizationRequired,
    #[error("organization mismatch")]
    OrganizationMismatch,
    #[error("organization not found")]
    OrganizationNotFound,
    #[error("membership inactive")]
    MembershipInactive,
    #[error("agent already active")]
    AgentAlreadyActive,
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("invalid auth payload")]
    InvalidPayload,
    #[error("authentication timeout")]
    Timeout,
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl AuthError {
    /// Short tag for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidToken => "invalid_token",
            AuthError::OrganizationRequired => "organization_required",
            AuthError::OrganizationMismatch => "organization_mismatch",
            AuthError::OrganizationNotFound => "organization_not_found",
            AuthError::MembershipInactive => "membership_inactive",
            AuthError::AgentAlreadyActive => "agent_already_active",
            AuthError::AuthenticationRequired => "authentication_required",
            AuthError::InvalidPayload => "invalid_auth_payload",
            AuthError::Timeout => "auth_timeout",
            AuthError::ServiceUnavailable => "service_unavailable",
        }
    }
}

/// Picks the organization a session binds to: the explicit request id, else
/// the id embedded in the token. Both present and different is a mismatch.
pub fn resolve_organization(
    explicit: Option<&str>,
    embedded: Option<&str>,
) -> Result<String, AuthError> {
    let explicit = explicit.map(str::trim).filter(|id| !id.is_empty());
    let embedded = embedded.map(str::trim).filter(|id| !id.is_empty());
    match (explicit, embedded) {
        (Some(explicit), Some(embedded)) if explicit != embedded => {
            Err(AuthError::OrganizationMismatch)
        }
        (Some(id), _) | (None, Some(id)) => Ok(id.to_string()),
        (None, None) => Err(AuthError::OrganizationRequired),
    }
}
