use std::{collections::HashMap, sync::Arc};

use futures_util::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use zbus::{
    fdo,
    names::{BusName, OwnedUniqueName},
    Message, MessageType,
};

use crate::{
    fdo::dispatch,
    match_rules,
    name_registry::{NameRegistry, OwnerChange},
    reply,
    session::{rewrite_sender, Session},
};

pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// Owns the shared session table and name registry, and fans every message out.
///
/// There is deliberately no literal "session" standing in for the bus itself; a message
/// originates from the bus exactly when it's routed with `sender: None`, which skips the hello
/// gate and never triggers bus dispatch recursively. This gets the same re-entrant routing the
/// broker's own replies and signals need without a second, unused transport connection.
#[derive(Debug, Default)]
pub struct Router {
    sessions: RwLock<HashMap<OwnedUniqueName, Arc<Session>>>,
    name_registry: NameRegistry,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn name_registry(&self) -> &NameRegistry {
        &self.name_registry
    }

    pub async fn session(&self, name: &OwnedUniqueName) -> Option<Arc<Session>> {
        self.sessions.read().await.get(name).cloned()
    }

    pub async fn unique_names(&self) -> Vec<OwnedUniqueName> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Register a freshly accepted session and start pumping its messages through the router.
    /// Returns once the session's connection is closed (by the peer, or by the hello gate).
    pub async fn serve(self: &Arc<Self>, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.unique_name().clone(), session.clone());

        let mut stream = session.stream();
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("connection error for {}: {}", session.unique_name(), e);
                    break;
                }
            };

            let msg = match rewrite_sender(&msg, session.unique_name()) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        "dropping malformed message from {}: {}",
                        session.unique_name(),
                        e
                    );
                    continue;
                }
            };

            if let Err(e) = self.route(msg, Some(&session)).await {
                warn!("error routing message from {}: {}", session.unique_name(), e);
            }

            if self.session(session.unique_name()).await.is_none() {
                // The hello gate closed this session.
                break;
            }
        }

        self.remove_session(&session).await;
    }

    /// Route one message, already sender-rewritten, through fan-out, the hello gate, and bus
    /// dispatch. `sender` is `None` for messages the broker originates itself, which always
    /// skips the hello gate and never re-enters bus dispatch.
    pub async fn route(&self, msg: Message, sender: Option<&Arc<Session>>) -> zbus::Result<()> {
        self.fan_out(&msg).await;

        if let Some(sender) = sender {
            if !sender.hello_received().await && !is_hello_call(&msg) {
                trace!("closing {} for a pre-Hello message", sender.unique_name());
                let denied = reply::error(
                    &msg,
                    fdo::Error::AccessDenied(
                        "Client tried to send a message other than Hello without being \
                         registered"
                            .to_string(),
                    ),
                )?;
                let result = Box::pin(self.route(denied, None)).await;
                self.remove_session(sender).await;

                return result;
            }
        }

        let hdr = msg.header();
        let destination_is_bus =
            matches!(hdr.destination(), Some(BusName::WellKnown(name)) if name.as_str() == BUS_NAME);

        let reply = if destination_is_bus && msg.message_type() == MessageType::MethodCall {
            let sender = sender.expect("bus dispatch only runs for client-originated calls");
            Some(dispatch(self, &msg, sender).await?)
        } else if let Some(destination) = hdr.destination() {
            if self.is_routable(destination).await {
                None
            } else {
                Some(reply::error(
                    &msg,
                    fdo::Error::ServiceUnknown(format!(
                        "The name {destination} is not registered"
                    )),
                )?)
            }
        } else {
            None
        };

        if let Some(reply) = reply {
            Box::pin(self.route(reply, None)).await?;
        }

        Ok(())
    }

    async fn fan_out(&self, msg: &Message) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if self.session_matches(session, msg).await {
                if let Err(e) = session.send(msg.clone()).await {
                    warn!("failed to deliver message to {}: {}", session.unique_name(), e);
                }
            }
        }
    }

    async fn session_matches(&self, session: &Session, msg: &Message) -> bool {
        let hdr = msg.header();
        if matches!(hdr.destination(), Some(dest) if dest.as_str() == session.unique_name().as_str())
        {
            return true;
        }

        for rule in session.match_rules().await {
            if match_rules::matches(&rule, msg, &self.name_registry).await {
                return true;
            }
        }

        false
    }

    /// Whether `destination` can currently receive a message: a live session, an owned
    /// well-known name, or the bus itself.
    async fn is_routable(&self, destination: &BusName<'_>) -> bool {
        match destination {
            BusName::Unique(name) => {
                name.as_str() == BUS_NAME || self.sessions.read().await.contains_key(name.as_str())
            }
            BusName::WellKnown(name) => {
                name.as_str() == BUS_NAME || self.name_registry.lookup(name.clone()).await.is_some()
            }
        }
    }

    /// Emit the three-signal sequence for an ownership transition: a broadcast
    /// `NameOwnerChanged`, then a unicast `NameLost` to the old owner, then a unicast
    /// `NameAcquired` to the new owner.
    pub async fn emit_owner_change(&self, change: OwnerChange) -> zbus::Result<()> {
        use zbus::MessageBuilder;

        let old = change.old_owner.clone();
        let new = change.new_owner.clone();
        let old_str = old.as_ref().map(|o| o.as_str()).unwrap_or_default();
        let new_str = new.as_ref().map(|o| o.as_str()).unwrap_or_default();

        let owner_changed = MessageBuilder::signal(
            "/org/freedesktop/DBus",
            BUS_NAME,
            "NameOwnerChanged",
        )?
        .sender(BUS_NAME)?
        .build(&(change.name.as_str(), old_str, new_str))?;
        Box::pin(self.route(owner_changed, None)).await?;

        if let Some(old) = old {
            let lost = MessageBuilder::signal("/org/freedesktop/DBus", BUS_NAME, "NameLost")?
                .sender(BUS_NAME)?
                .destination(old)?
                .build(&(change.name.as_str(),))?;
            Box::pin(self.route(lost, None)).await?;
        }

        if let Some(new) = new {
            let acquired =
                MessageBuilder::signal("/org/freedesktop/DBus", BUS_NAME, "NameAcquired")?
                    .sender(BUS_NAME)?
                    .destination(new)?
                    .build(&(change.name.as_str(),))?;
            Box::pin(self.route(acquired, None)).await?;
        }

        Ok(())
    }

    /// Remove a session: drop it from the table, purge its entries from every name queue, and
    /// emit the resulting ownership-change signals.
    pub async fn remove_session(&self, session: &Arc<Session>) {
        self.sessions.write().await.remove(session.unique_name());

        let changes = self.name_registry.remove_session(session.unique_name()).await;
        for change in changes {
            if let Err(e) = self.emit_owner_change(change).await {
                warn!("failed to emit ownership-change signal: {}", e);
            }
        }
    }
}

fn is_hello_call(msg: &Message) -> bool {
    if msg.message_type() != MessageType::MethodCall {
        return false;
    }

    let hdr = msg.header();
    matches!(hdr.destination(), Some(BusName::WellKnown(name)) if name.as_str() == BUS_NAME)
        && matches!(hdr.interface(), Some(iface) if iface.as_str() == BUS_NAME)
        && matches!(hdr.member(), Some(member) if member.as_str() == "Hello")
}
