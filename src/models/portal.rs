//! Portal membership options.

use serde::{Deserialize, Serialize};

/// Options for [`Session::join_portal`](crate::session::Session::join_portal).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalOptions {
    /// PEM-encoded certificate to pin the portal's TLS identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// Authentication token presented to the portal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Access-control tags granted to this membership.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acl: Vec<String>,
}

impl PortalOptions {
    /// Options with no certificate, token or ACL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the authentication token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the pinned certificate.
    #[must_use]
    pub fn with_certificate(mut self, pem: impl Into<String>) -> Self {
        self.certificate = Some(pem.into());
        self
    }

    /// Grant an access-control tag.
    #[must_use]
    pub fn with_acl(mut self, tag: impl Into<String>) -> Self {
        self.acl.push(tag.into());
        self
    }
}
