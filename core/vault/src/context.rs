//! Per-request caller context.

use chrono::Utc;
use serde_json::{Map, Value};

use dealvault_common::{Error, Result, UserId};

/// Who is calling, and from where.
///
/// The network fields are opaque pass-through data recorded in audit
/// metadata; they are never validated.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub actor: Option<UserId>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub client_context: Option<String>,
}

impl RequestContext {
    pub fn for_actor(actor: UserId) -> Self {
        Self {
            actor: Some(actor),
            ..Self::default()
        }
    }

    /// A context with no authenticated user.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn with_client_context(mut self, context: impl Into<String>) -> Self {
        self.client_context = Some(context.into());
        self
    }

    /// The acting user.
    ///
    /// # Errors
    /// - `Error::Unauthenticated` when no actor is attached
    pub fn actor(&self) -> Result<UserId> {
        self.actor.ok_or(Error::Unauthenticated)
    }

    /// Request fields merged into every audit record written for this request.
    pub(crate) fn audit_metadata(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        if let Some(ip) = &self.ip_address {
            meta.insert("ip_address".into(), Value::String(ip.clone()));
        }
        if let Some(agent) = &self.user_agent {
            meta.insert("user_agent".into(), Value::String(agent.clone()));
        }
        if let Some(client) = &self.client_context {
            meta.insert("client_context".into(), Value::String(client.clone()));
        }
        meta.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        meta
    }
}
