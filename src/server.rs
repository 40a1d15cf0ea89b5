//! The top-level broker: a set of bound [`Listener`]s sharing one [`Router`].
use std::{
    env,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use anyhow::Result;
use event_listener::Event;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zbus::AuthMechanism;

use crate::{listener::Listener, router::Router, session::Session};

/// A shutdown signal shared between [`Server`] and its accept loops.
///
/// `notified` is checked before and after registering on `event`, closing the usual
/// `event-listener` race where a notification fired between a waiter's last check and its
/// call to `listen()` would otherwise be lost.
#[derive(Debug, Default)]
struct Shutdown {
    notified: AtomicBool,
    event: Event,
}

impl Shutdown {
    fn signal(&self) {
        self.notified.store(true, Ordering::Release);
        self.event.notify(usize::MAX);
    }

    async fn wait(&self) {
        loop {
            if self.notified.load(Ordering::Acquire) {
                return;
            }
            let listen = self.event.listen();
            if self.notified.load(Ordering::Acquire) {
                return;
            }
            listen.await;
        }
    }
}

/// Owns every bound [`Listener`] and the single [`Router`] they all feed into.
#[derive(Debug)]
pub struct Server {
    router: Arc<Router>,
    listeners: Vec<Arc<Listener>>,
    next_listener_id: AtomicU32,
    shutdown: Arc<Shutdown>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            listeners: Vec::new(),
            next_listener_id: AtomicU32::new(1),
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    /// Ask every accept loop spawned by [`Server::run`] to stop taking new connections.
    /// Sessions already accepted keep running until their own connection closes.
    pub fn shutdown(&self) {
        self.shutdown.signal();
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Bind a new listener at `address` and add it to the server.
    pub async fn bind(&mut self, address: &str, auth_mechanism: AuthMechanism) -> Result<()> {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener::bind(id, address, auth_mechanism).await?;
        info!("listening on {}", listener.address());
        self.listeners.push(Arc::new(listener));

        Ok(())
    }

    pub fn addresses(&self) -> Vec<String> {
        self.listeners
            .iter()
            .map(|l| l.address().to_string())
            .collect()
    }

    /// Accept connections on every bound listener until one of the accept loops gives up.
    pub async fn run(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<Result<()>>> = self
            .listeners
            .iter()
            .cloned()
            .map(|listener| {
                let router = self.router.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(accept_loop(listener, router, shutdown))
            })
            .collect();

        for result in join_all(tasks).await {
            result??;
        }

        Ok(())
    }

    /// Unlink the filesystem artifacts of every listener.
    pub async fn cleanup(&self) -> Result<()> {
        for listener in &self.listeners {
            listener.cleanup().await?;
        }

        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(listener: Arc<Listener>, router: Arc<Router>, shutdown: Arc<Shutdown>) -> Result<()> {
    loop {
        let socket = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("listener {} failed to accept a connection: {}", listener.id(), e);
                    continue;
                }
            },
            _ = shutdown.wait() => {
                info!("listener {} shutting down", listener.id());
                return Ok(());
            }
        };

        let unique_name = listener.next_unique_name();
        let listener = listener.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let session = match Session::accept(
                listener.id(),
                listener.guid(),
                unique_name,
                socket,
                listener.auth_mechanism(),
            )
            .await
            {
                Ok(session) => session,
                Err(e) => {
                    warn!("failed to establish session on listener {}: {}", listener.id(), e);
                    return;
                }
            };

            router.serve(session).await;
        });
    }
}

/// The convenience default address when none is given on the command line: a per-user
/// Unix-domain socket under `XDG_RUNTIME_DIR` (or `/tmp` if that's unset).
pub fn default_address() -> String {
    #[cfg(unix)]
    {
        let runtime_dir = env::var("XDG_RUNTIME_DIR")
            .map(|p| Path::new(&p).to_path_buf())
            .unwrap_or_else(|_| env::temp_dir());
        let path = runtime_dir.join("switchboard-bus");

        format!("unix:path={}", path.display())
    }
    #[cfg(not(unix))]
    {
        "tcp:host=127.0.0.1,port=0".to_string()
    }
}
