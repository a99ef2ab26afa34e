use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::error::{Result, SyncError};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IdentityProvider {
    Facebook,
    Github,
}

impl IdentityProvider {
    /// Provider id as understood by the remote auth service.
    pub fn provider_id(self) -> &'static str {
        match self {
            IdentityProvider::Facebook => "facebook.com",
            IdentityProvider::Github => "github.com",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: String,
    pub provider: Option<IdentityProvider>,
    pub anonymous: bool,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(Identity),
    SignedOut,
    TokenRefreshed(Identity),
}

/// The current authenticated identity, passed explicitly to whatever needs it.
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct Session {
    current: Arc<watch::Sender<Option<Identity>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        let (events, _) = broadcast::channel(16);
        Self {
            current: Arc::new(current),
            events,
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    pub fn uid(&self) -> Result<String> {
        self.current
            .borrow()
            .as_ref()
            .map(|i| i.uid.clone())
            .ok_or(SyncError::NotAuthenticated)
    }

    /// Receiver that always holds the latest identity.
    pub fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Installs an identity handed over by an identity provider.
    ///
    /// Anonymous identities are never accepted: the session is signed out
    /// and the call fails with `NotAuthenticated`.
    pub fn establish(&self, identity: Identity) -> Result<()> {
        if identity.anonymous || identity.uid.trim().is_empty() {
            tracing::warn!(uid = %identity.uid, "rejecting anonymous identity, forcing sign-out");
            self.sign_out();
            return Err(SyncError::NotAuthenticated);
        }
        tracing::info!(uid = %identity.uid, provider = ?identity.provider, "signed in");
        self.current.send_replace(Some(identity.clone()));
        let _ = self.events.send(SessionEvent::SignedIn(identity));
        Ok(())
    }

    /// Replaces the current identity after a token refresh. The uid must not change.
    pub fn refresh(&self, identity: Identity) -> Result<()> {
        if self.uid()? != identity.uid {
            return Err(SyncError::Identity(format!(
                "refreshed token belongs to a different user: {}",
                identity.uid
            )));
        }
        tracing::debug!(uid = %identity.uid, "token refreshed");
        self.current.send_replace(Some(identity.clone()));
        let _ = self.events.send(SessionEvent::TokenRefreshed(identity));
        Ok(())
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.current.send_replace(None) {
            tracing::info!(uid = %previous.uid, "signed out");
            let _ = self.events.send(SessionEvent::SignedOut);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(uid: &str) -> Identity {
        Identity {
            uid: uid.into(),
            provider: Some(IdentityProvider::Github),
            anonymous: false,
            display_name: None,
            photo_url: None,
        }
    }

    #[test]
    fn no_identity_means_not_authenticated() {
        let session = Session::new();
        assert_eq!(session.current(), None);
        assert_eq!(session.uid(), Err(SyncError::NotAuthenticated));
    }

    #[test]
    fn sign_in_and_out_emit_events() {
        let session = Session::new();
        let mut events = session.events();

        session.establish(user("u1")).unwrap();
        assert_eq!(session.uid().unwrap(), "u1");
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn(user("u1")));

        session.sign_out();
        assert_eq!(session.current(), None);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedOut);

        // signing out twice is silent
        session.sign_out();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn anonymous_identity_forces_sign_out() {
        let session = Session::new();
        session.establish(user("u1")).unwrap();
        let mut events = session.events();

        let guest = Identity {
            anonymous: true,
            ..user("guest")
        };
        assert_eq!(session.establish(guest), Err(SyncError::NotAuthenticated));
        assert_eq!(session.current(), None);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedOut);
    }

    #[test]
    fn refresh_keeps_uid() {
        let session = Session::new();
        session.establish(user("u1")).unwrap();
        let mut watch = session.watch();

        let refreshed = Identity {
            photo_url: Some("https://example.com/a.png".into()),
            ..user("u1")
        };
        session.refresh(refreshed.clone()).unwrap();
        assert!(watch.has_changed().unwrap());
        assert_eq!(watch.borrow_and_update().clone(), Some(refreshed));

        assert!(matches!(session.refresh(user("u2")), Err(SyncError::Identity(_))));
    }

    #[test]
    fn refresh_requires_session() {
        let session = Session::new();
        assert_eq!(session.refresh(user("u1")), Err(SyncError::NotAuthenticated));
    }
}
