use std::fmt;

/// The step a timeout fired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    Authenticate,
    JoinRoom,
    Negotiation,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Connect => "connect",
            Step::Authenticate => "authentication",
            Step::JoinRoom => "room join",
            Step::Negotiation => "negotiation",
        };
        f.write_str(name)
    }
}

/// Every failure a session can report.
///
/// Cloneable so one value can be stored in `SessionState::last_error` and
/// broadcast to all observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("camera/microphone unavailable: {0}")]
    MediaAccessDenied(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("signaling transport error: {0}")]
    TransportError(String),
    #[error("{0} timed out")]
    Timeout(Step),
    #[error("invalid negotiation state: {0}")]
    InvalidNegotiationState(String),
    #[error("no active peer connection")]
    NoActiveConnection,
    #[error("local media has not been acquired yet")]
    MediaNotReady,
    #[error("conference closed by server: {0}")]
    RemoteForceClosed(String),
    #[error("signaling server error: {0}")]
    Server(String),
    #[error("peer connection error: {0}")]
    Peer(String),
}

impl SessionError {
    /// Whether this error ends the session when it happens inside a
    /// transition. Guard failures and server notices are reported but the
    /// session carries on.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::MediaAccessDenied(_)
            | SessionError::AuthenticationFailed(_)
            | SessionError::TransportError(_)
            | SessionError::Timeout(_)
            | SessionError::RemoteForceClosed(_)
            | SessionError::Peer(_) => true,
            SessionError::InvalidNegotiationState(_)
            | SessionError::NoActiveConnection
            | SessionError::MediaNotReady
            | SessionError::Server(_) => false,
        }
    }

    pub(crate) fn peer(context: &str, err: impl fmt::Display) -> Self {
        SessionError::Peer(format!("{context}: {err}"))
    }

    pub(crate) fn transport(context: &str, err: impl fmt::Display) -> Self {
        SessionError::TransportError(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SessionError::MediaAccessDenied("no camera".into()).is_fatal());
        assert!(SessionError::AuthenticationFailed("bad token".into()).is_fatal());
        assert!(SessionError::Timeout(Step::Authenticate).is_fatal());
        assert!(!SessionError::NoActiveConnection.is_fatal());
        assert!(!SessionError::InvalidNegotiationState("late answer".into()).is_fatal());
        assert!(!SessionError::MediaNotReady.is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = SessionError::peer("Failed to set remote description", "bad sdp");
        assert_eq!(
            err.to_string(),
            "peer connection error: Failed to set remote description: bad sdp"
        );
        assert_eq!(
            SessionError::Timeout(Step::JoinRoom).to_string(),
            "room join timed out"
        );
    }
}
