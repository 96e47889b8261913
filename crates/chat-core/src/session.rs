use std::{fmt, sync::Arc};

use tracing::{debug, info};

use crate::{
    collaborators::PushChannel,
    error::ChatError,
    types::{ConnectivityState, LinkState},
};

/// Follow-up work requested by a session transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Bind the current connection to `user_id`.
    RegisterIdentity { user_id: String },
}

/// Connectivity state plus the user the connection should be bound to.
///
/// Server-side routing is connection-scoped, so every transition into
/// `Connected` asks for a fresh registration. Repeated connect notifications
/// for the same connection do not.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: ConnectivityState,
    user_id: Option<String>,
}

impl SessionStateMachine {
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Bind `user_id`. Registers immediately when a connection is up.
    pub fn bind(&mut self, user_id: impl Into<String>) -> Option<SessionAction> {
        let user_id = user_id.into();
        let rebinding = self.user_id.as_deref() != Some(user_id.as_str());
        self.user_id = Some(user_id.clone());

        match self.state {
            ConnectivityState::Connected => Some(SessionAction::RegisterIdentity { user_id }),
            ConnectivityState::Registered if rebinding => {
                self.state = ConnectivityState::Connected;
                Some(SessionAction::RegisterIdentity { user_id })
            }
            _ => None,
        }
    }

    /// Forget the bound user. The connection itself stays up.
    pub fn unbind(&mut self) {
        self.user_id = None;
        if self.state == ConnectivityState::Registered {
            self.state = ConnectivityState::Connected;
        }
    }

    /// Apply a transport lifecycle notification.
    pub fn on_link(&mut self, link: LinkState) -> Option<SessionAction> {
        match link {
            LinkState::Connecting => {
                if self.state == ConnectivityState::Disconnected {
                    self.state = ConnectivityState::Connecting;
                }
                None
            }
            LinkState::Connected => match self.state {
                ConnectivityState::Connected | ConnectivityState::Registered => None,
                ConnectivityState::Disconnected | ConnectivityState::Connecting => {
                    self.state = ConnectivityState::Connected;
                    self.user_id
                        .clone()
                        .map(|user_id| SessionAction::RegisterIdentity { user_id })
                }
            },
            LinkState::Disconnected => {
                self.state = ConnectivityState::Disconnected;
                None
            }
        }
    }

    /// Record a completed registration for `user_id`.
    pub fn on_registered(&mut self, user_id: &str) -> Result<(), ChatError> {
        if self.state != ConnectivityState::Connected {
            return Err(ChatError::invalid_state(self.state, "on_registered"));
        }
        if self.user_id.as_deref() != Some(user_id) {
            return Err(ChatError::invalid_state(
                self.state,
                format!("on_registered for unbound user '{user_id}'"),
            ));
        }
        self.state = ConnectivityState::Registered;
        Ok(())
    }
}

/// Callback invoked on every connectivity transition.
pub type ConnectivityHandler = Box<dyn Fn(ConnectivityState) + Send + Sync + 'static>;

/// Owns the push connection lifecycle and the user binding.
pub struct SessionManager {
    channel: Arc<dyn PushChannel>,
    machine: SessionStateMachine,
    handlers: Vec<ConnectivityHandler>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("machine", &self.machine)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self {
            channel,
            machine: SessionStateMachine::default(),
            handlers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.machine.state()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.machine.user_id()
    }

    /// Ask the transport to connect.
    pub fn connect(&self) {
        self.channel.connect();
    }

    pub fn on_connectivity_change(&mut self, handler: ConnectivityHandler) {
        self.handlers.push(handler);
    }

    /// Bind `user_id` and register it when a connection is already up.
    pub async fn register_identity(&mut self, user_id: &str) -> Result<(), ChatError> {
        let before = self.machine.state();
        let action = self.machine.bind(user_id);
        self.notify_if_changed(before);
        match action {
            Some(action) => self.perform(action).await,
            None => Ok(()),
        }
    }

    /// Drop the user binding.
    pub fn sign_out(&mut self) {
        let before = self.machine.state();
        self.machine.unbind();
        self.notify_if_changed(before);
    }

    /// Feed one transport lifecycle notification.
    pub async fn handle_link(&mut self, link: LinkState) -> Result<(), ChatError> {
        let before = self.machine.state();
        let action = self.machine.on_link(link);
        self.notify_if_changed(before);
        match action {
            Some(action) => self.perform(action).await,
            None => Ok(()),
        }
    }

    async fn perform(&mut self, action: SessionAction) -> Result<(), ChatError> {
        match action {
            SessionAction::RegisterIdentity { user_id } => {
                debug!(%user_id, "registering identity on push channel");
                self.channel.register_identity(&user_id).await?;
                let before = self.machine.state();
                self.machine.on_registered(&user_id)?;
                info!(%user_id, "push channel identity registered");
                self.notify_if_changed(before);
                Ok(())
            }
        }
    }

    fn notify_if_changed(&self, before: ConnectivityState) {
        let after = self.machine.state();
        if before == after {
            return;
        }
        debug!(?before, ?after, "session connectivity changed");
        for handler in &self.handlers {
            handler(after);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::types::{OutboundMessage, PushEvent};

    #[derive(Default)]
    struct RecordingChannel {
        registrations: Mutex<Vec<String>>,
        connects: Mutex<u32>,
        fail_register: bool,
    }

    #[async_trait]
    impl PushChannel for RecordingChannel {
        fn connect(&self) {
            *self.connects.lock().expect("connect lock") += 1;
        }

        fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
            broadcast::channel(1).1
        }

        async fn register_identity(&self, user_id: &str) -> Result<(), ChatError> {
            if self.fail_register {
                return Err(ChatError::network("channel_disconnected", "socket down"));
            }
            self.registrations
                .lock()
                .expect("registration lock")
                .push(user_id.to_owned());
            Ok(())
        }

        async fn send(&self, _message: OutboundMessage) -> Result<(), ChatError> {
            Ok(())
        }
    }

    fn registrations(channel: &RecordingChannel) -> Vec<String> {
        channel.registrations.lock().expect("registration lock").clone()
    }

    #[test]
    fn binding_before_connect_defers_registration() {
        let mut sm = SessionStateMachine::default();
        assert_eq!(sm.bind("me"), None);
        assert_eq!(sm.on_link(LinkState::Connecting), None);
        assert_eq!(sm.state(), ConnectivityState::Connecting);
        assert_eq!(
            sm.on_link(LinkState::Connected),
            Some(SessionAction::RegisterIdentity {
                user_id: "me".into()
            })
        );
        sm.on_registered("me").expect("registration should apply");
        assert_eq!(sm.state(), ConnectivityState::Registered);
    }

    #[test]
    fn duplicate_connect_notifications_register_once() {
        let mut sm = SessionStateMachine::default();
        sm.bind("me");
        for _ in 0..3 {
            assert_eq!(sm.on_link(LinkState::Disconnected), None);
        }
        let first = sm.on_link(LinkState::Connected);
        let second = sm.on_link(LinkState::Connected);
        assert!(first.is_some());
        assert_eq!(second, None);
    }

    #[test]
    fn connect_without_user_does_not_register() {
        let mut sm = SessionStateMachine::default();
        assert_eq!(sm.on_link(LinkState::Connected), None);
        assert_eq!(sm.state(), ConnectivityState::Connected);
        assert!(sm.bind("me").is_some());
    }

    #[test]
    fn rejects_registration_while_disconnected() {
        let mut sm = SessionStateMachine::default();
        sm.bind("me");
        let err = sm
            .on_registered("me")
            .expect_err("cannot register without a connection");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn unbind_downgrades_registered_session() {
        let mut sm = SessionStateMachine::default();
        sm.bind("me");
        sm.on_link(LinkState::Connected);
        sm.on_registered("me").expect("registration should apply");
        sm.unbind();
        assert_eq!(sm.state(), ConnectivityState::Connected);
        assert_eq!(sm.user_id(), None);
    }

    #[tokio::test]
    async fn reregisters_on_every_reconnect() {
        let channel = Arc::new(RecordingChannel::default());
        let mut session = SessionManager::new(channel.clone());
        session.connect();
        session
            .register_identity("me")
            .await
            .expect("binding while disconnected is fine");
        assert!(registrations(&channel).is_empty());

        for _ in 0..2 {
            session
                .handle_link(LinkState::Connected)
                .await
                .expect("connect should register");
            session
                .handle_link(LinkState::Connected)
                .await
                .expect("duplicate connect is ignored");
            session
                .handle_link(LinkState::Disconnected)
                .await
                .expect("disconnect is a transition");
            session
                .handle_link(LinkState::Disconnected)
                .await
                .expect("repeated disconnect is ignored");
        }

        assert_eq!(registrations(&channel), vec!["me", "me"]);
        assert_eq!(*channel.connects.lock().expect("connect lock"), 1);
    }

    #[tokio::test]
    async fn handlers_observe_each_transition() {
        let channel = Arc::new(RecordingChannel::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut session = SessionManager::new(channel);
        let sink = seen.clone();
        session.on_connectivity_change(Box::new(move |state| {
            sink.lock().expect("seen lock").push(state);
        }));

        session
            .register_identity("me")
            .await
            .expect("bind should work");
        session
            .handle_link(LinkState::Connecting)
            .await
            .expect("connecting");
        session
            .handle_link(LinkState::Connected)
            .await
            .expect("connected");

        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec![
                ConnectivityState::Connecting,
                ConnectivityState::Connected,
                ConnectivityState::Registered,
            ]
        );
    }

    #[tokio::test]
    async fn failed_registration_stays_connected_until_next_reconnect() {
        let channel = Arc::new(RecordingChannel {
            fail_register: true,
            ..RecordingChannel::default()
        });
        let mut session = SessionManager::new(channel);
        session.register_identity("me").await.expect("bind");

        let err = session
            .handle_link(LinkState::Connected)
            .await
            .expect_err("registration failure surfaces");
        assert_eq!(err.code, "channel_disconnected");
        assert_eq!(session.state(), ConnectivityState::Connected);
    }
}
