//! Caller identity and the authorization seam.
//!
//! Authentication happens outside this crate; the transport attaches an
//! already-authenticated [`Principal`] to each connection. Decisions are
//! delegated to an [`Authorizer`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::Topic;

/// Authenticated caller, opaque to the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn subject(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read/write capability checks for topics.
pub trait Authorizer: Send + Sync + 'static {
    fn can_read(&self, principal: &Principal, topic: &Topic) -> bool;

    fn can_write(&self, principal: &Principal, topic: &Topic) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_read(&self, _principal: &Principal, _topic: &Topic) -> bool {
        true
    }

    fn can_write(&self, _principal: &Principal, _topic: &Topic) -> bool {
        true
    }
}
