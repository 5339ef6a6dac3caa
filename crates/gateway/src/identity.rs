//! Caller identity placed in request extensions by the verification layer
//! that runs in front of the gateway routes.

/// A verified caller identity (user id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Header used to pass the identity on to upstream services.
pub const USER_ID_HEADER: &str = "x-user-id";
