//! Client descriptors and session policy.

use serde::{Deserialize, Serialize};

/// Coarse classification of a connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCategory {
    /// Long-lived interactive session (the default when no type is given).
    Browser,
    /// Headless participant: summarizers, bots, integration services.
    Agent,
}

/// Whether the delta pipeline should dial a new connection after losing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconnectPolicy {
    /// Reconnect with exponential backoff until closed.
    Automatic,
    /// Surface the disconnect and stop; the embedder decides what happens
    /// next.
    Never,
}

/// Identity and session policy a client presents when connecting.
///
/// `client_type` is the wire-visible type tag the ordering service records
/// for the session. The reconnect policy defaults from the client category:
/// interactive browser sessions reconnect automatically, everything else
/// stays down until told otherwise. Set `reconnect` explicitly to decouple
/// the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDescriptor {
    /// Wire-visible client type tag; `None` is treated as `"browser"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    /// Explicit reconnect policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectPolicy>,
}

impl ClientDescriptor {
    /// An interactive browser client.
    pub fn browser() -> Self {
        Self {
            client_type: None,
            reconnect: None,
        }
    }

    /// A headless client with the given type tag.
    pub fn agent(client_type: impl Into<String>) -> Self {
        Self {
            client_type: Some(client_type.into()),
            reconnect: None,
        }
    }

    /// Override the category-derived reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// The wire type tag, defaulting to `"browser"`.
    pub fn type_name(&self) -> &str {
        self.client_type.as_deref().unwrap_or("browser")
    }

    /// Category derived from the type tag.
    pub fn category(&self) -> ClientCategory {
        match self.client_type.as_deref() {
            None | Some("browser") => ClientCategory::Browser,
            Some(_) => ClientCategory::Agent,
        }
    }

    /// Effective reconnect decision: the explicit policy when set, otherwise
    /// derived from the category.
    pub fn should_reconnect(&self) -> bool {
        match self.reconnect {
            Some(ReconnectPolicy::Automatic) => true,
            Some(ReconnectPolicy::Never) => false,
            None => self.category() == ClientCategory::Browser,
        }
    }
}

impl Default for ClientDescriptor {
    fn default() -> Self {
        Self::browser()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_type_is_browser() {
        let client = ClientDescriptor::browser();
        assert_eq!(client.category(), ClientCategory::Browser);
        assert_eq!(client.type_name(), "browser");
        assert!(client.should_reconnect());
    }

    #[test]
    fn agent_does_not_reconnect_by_default() {
        let client = ClientDescriptor::agent("summarizer");
        assert_eq!(client.category(), ClientCategory::Agent);
        assert!(!client.should_reconnect());
    }

    #[test]
    fn explicit_policy_overrides_category() {
        let client = ClientDescriptor::agent("summarizer").with_reconnect(ReconnectPolicy::Automatic);
        assert!(client.should_reconnect());

        let client = ClientDescriptor::browser().with_reconnect(ReconnectPolicy::Never);
        assert!(!client.should_reconnect());
    }
}
