use crate::error::{UayError, UayResult};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
}

pub trait AuthProvider: Send + Sync {
    fn current_session(&self) -> Option<Session>;

    /// Yields the new session (or `None`) whenever the user signs in or out.
    fn subscribe(&self) -> watch::Receiver<Option<Session>>;

    fn require_session(&self) -> UayResult<Session> {
        self.current_session().ok_or(UayError::Unauthenticated)
    }
}

/// In-process provider; whoever holds it decides who is signed in.
#[derive(Debug, Clone)]
pub struct LocalAuth {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl Default for LocalAuth {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl LocalAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, session: Session) {
        tracing::info!(user_id = %session.user_id, "signed in");
        self.tx.send_replace(Some(session));
    }

    pub fn sign_out(&self) {
        if self.tx.send_replace(None).is_some() {
            tracing::info!("signed out");
        }
    }
}

impl AuthProvider for LocalAuth {
    fn current_session(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_sign_in_and_out() {
        let auth = LocalAuth::new();
        assert!(matches!(
            auth.require_session(),
            Err(UayError::Unauthenticated)
        ));

        let mut rx = auth.subscribe();
        let session = Session {
            user_id: "u1".into(),
            display_name: "@ana".into(),
        };
        auth.sign_in(session.clone());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().clone(), Some(session.clone()));
        assert_eq!(auth.require_session().unwrap(), session);

        auth.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
