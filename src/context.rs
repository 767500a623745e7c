use axum::http::{HeaderMap, header};
use std::net::IpAddr;

use crate::security::client_ip::resolve_client_ip;

/// Per-request facts every guard component needs. Built once at ingress and
/// passed explicitly; nothing about the current request is held globally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
}

impl RequestContext {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: None,
            session_id: None,
            actor_id: None,
        }
    }

    /// Build a context from request headers and the socket peer address
    pub fn from_headers(
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        trust_proxy_headers: bool,
        identity: &dyn IdentityProvider,
    ) -> Self {
        let id = identity.identify(headers);
        Self {
            ip_address: resolve_client_ip(headers, peer, trust_proxy_headers),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            session_id: id.session_id,
            actor_id: id.actor_id,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// What the session layer knows about the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
}

/// Session/identity collaborator. The guard only needs the session id (to
/// scope CSRF tokens) and, for user-scoped actions, the authenticated actor.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, headers: &HeaderMap) -> Identity;
}

/// Reads the session id from a cookie. The actor is left unset; the
/// application's auth layer attaches it with [`RequestContext::with_actor`].
#[derive(Debug, Clone)]
pub struct CookieSessionIdentity {
    cookie_name: String,
}

impl CookieSessionIdentity {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }
}

impl IdentityProvider for CookieSessionIdentity {
    fn identify(&self, headers: &HeaderMap) -> Identity {
        let session_id = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|cookies| cookies.split(';'))
            .filter_map(|cookie| cookie.trim().split_once('='))
            .find(|(name, value)| *name == self.cookie_name && !value.is_empty())
            .map(|(_, value)| value.to_string());

        Identity {
            session_id,
            actor_id: None,
        }
    }
}
