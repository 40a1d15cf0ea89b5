#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::trace;
use zbus::{
    names::OwnedUniqueName, zvariant::Type, AuthMechanism, Connection, ConnectionBuilder, Guid,
    Message, MessageBuilder, MessageStream, OwnedMatchRule, Socket,
};

/// One accepted, authenticated connection.
///
/// A session owns the `zbus::Connection` that does all of the byte-level framing and SASL
/// negotiation for us (see [`crate::listener::Listener`] for how the raw socket gets here); by
/// the time a [`Session`] exists, the peer is already past `AUTH` and into `MSG`. What's left
/// for the broker to track per-connection is exactly what the spec's data model calls for:
/// the unique name, whether `Hello` has been received, and the ordered list of match rules.
#[derive(Debug)]
pub struct Session {
    conn: Connection,
    unique_name: OwnedUniqueName,
    listener_id: u32,
    listener_guid: Guid,
    hello_received: Mutex<bool>,
    match_rules: Mutex<Vec<OwnedMatchRule>>,
}

impl Session {
    pub async fn accept(
        listener_id: u32,
        listener_guid: &Guid,
        unique_name: OwnedUniqueName,
        socket: Box<dyn Socket + 'static>,
        auth_mechanism: AuthMechanism,
    ) -> Result<Arc<Self>> {
        let conn = ConnectionBuilder::socket(socket)
            .server(listener_guid)
            .p2p()
            .auth_mechanisms(&[auth_mechanism])
            .unique_name(unique_name.as_str())?
            .build()
            .await?;
        trace!("accepted session {}", unique_name);

        Ok(Arc::new(Self {
            conn,
            unique_name,
            listener_id,
            listener_guid: listener_guid.clone(),
            hello_received: Mutex::new(false),
            match_rules: Mutex::new(Vec::new()),
        }))
    }

    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    pub fn listener_id(&self) -> u32 {
        self.listener_id
    }

    pub fn listener_guid(&self) -> &Guid {
        &self.listener_guid
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn stream(self: &Arc<Self>) -> MessageStream {
        MessageStream::from(&self.conn)
    }

    pub async fn hello_received(&self) -> bool {
        *self.hello_received.lock().await
    }

    /// Mark `Hello` as handled. Returns `false` if it was already handled.
    pub async fn mark_hello_received(&self) -> bool {
        let mut received = self.hello_received.lock().await;
        if *received {
            return false;
        }
        *received = true;

        true
    }

    pub async fn add_match_rule(&self, rule: OwnedMatchRule) {
        self.match_rules.lock().await.push(rule);
    }

    /// Remove the first rule equal to `rule`. Returns whether one was found.
    pub async fn remove_match_rule(&self, rule: &OwnedMatchRule) -> bool {
        let mut rules = self.match_rules.lock().await;
        if let Some(pos) = rules.iter().position(|r| r == rule) {
            rules.remove(pos);
            true
        } else {
            false
        }
    }

    pub async fn match_rules(&self) -> Vec<OwnedMatchRule> {
        self.match_rules.lock().await.clone()
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.conn.send(&msg).await?;

        Ok(())
    }
}

/// Rebuild `msg` with its `sender` field forced to `unique_name`.
///
/// The broker never trusts a client-supplied sender; every message that makes it into the
/// router has already gone through this rewrite, whether or not the client bothered to set a
/// sender field of its own.
pub fn rewrite_sender(msg: &Message, unique_name: &OwnedUniqueName) -> Result<Message> {
    let header = msg.header();
    let signature = match header.signature() {
        Some(sig) => sig.clone(),
        None => <()>::signature(),
    };
    let body_bytes = msg.body_as_bytes()?;
    let builder = MessageBuilder::from(header.clone()).sender(unique_name.as_ref())?;

    // SAFETY: `body_bytes` and `signature` were just read off of `msg` itself, and any fds it
    // carries are carried along unchanged.
    let new_msg = unsafe {
        builder.build_raw_body(
            body_bytes,
            signature,
            #[cfg(unix)]
            msg.take_fds().iter().map(|fd| fd.as_raw_fd()).collect::<Vec<_>>(),
        )?
    };

    Ok(new_msg)
}
