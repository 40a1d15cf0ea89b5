use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{anyhow, Result};
use tokio::net::{TcpListener, UnixListener};
use tracing::debug;
use zbus::{names::OwnedUniqueName, Address, AuthMechanism, Guid, Socket};

/// One bound transport address.
///
/// A `Listener` owns the raw socket it was bound with, a randomly generated GUID that
/// doubles as its SASL UUID and its `GetId` answer, and the per-listener sequence used to
/// mint unique names for the peers it accepts. The `connId` half of a unique name is the
/// listener's own id, assigned when the listener is created; the `.seq` half increments once
/// per accepted connection on *this* listener.
pub struct Listener {
    id: u32,
    guid: Guid,
    address: String,
    next_seq: AtomicU64,
    auth_mechanism: AuthMechanism,
    transport: Transport,
}

enum Transport {
    Unix {
        listener: UnixListener,
        socket_path: PathBuf,
    },
    Tcp {
        listener: TcpListener,
    },
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Bind a new listener at `address`, assigning it `id`.
    ///
    /// `address` follows the D-Bus address grammar (`unix:path=<abs-path>` or
    /// `tcp:host=<host>[,port=<port>][,family=ipv4|ipv6]`, `bind=` accepted as a synonym for
    /// `host=`), parsed by `zbus::Address` rather than by hand. `auth_mechanism` is the single
    /// SASL mechanism offered to peers accepted on this listener.
    pub async fn bind(id: u32, address: &str, auth_mechanism: AuthMechanism) -> Result<Self> {
        let guid = Guid::generate();
        let address = Address::from_str(address)?;

        match address {
            #[cfg(unix)]
            Address::Unix(path) => {
                let path = PathBuf::from(path);
                debug!("binding unix listener {} at {}", id, path.display());
                let listener = UnixListener::bind(&path)?;

                Ok(Self {
                    id,
                    guid,
                    address: format!("unix:path={}", path.display()),
                    next_seq: AtomicU64::new(0),
                    auth_mechanism,
                    transport: Transport::Unix {
                        listener,
                        socket_path: path,
                    },
                })
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(anyhow!("`unix` transport is not supported on this platform")),
            Address::Tcp(tcp) => {
                debug!("binding tcp listener {} at {}:{}", id, tcp.host(), tcp.port());
                let listener = TcpListener::bind((tcp.host(), tcp.port())).await?;
                let bound_port = listener.local_addr()?.port();

                Ok(Self {
                    id,
                    guid,
                    address: format!("tcp:host={},port={bound_port}", tcp.host()),
                    next_seq: AtomicU64::new(0),
                    auth_mechanism,
                    transport: Transport::Tcp { listener },
                })
            }
            other => Err(anyhow!("unsupported transport in address `{other}`")),
        }
    }

    pub fn auth_mechanism(&self) -> AuthMechanism {
        self.auth_mechanism
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Mint the next unique name for a peer accepted on this listener.
    pub fn next_unique_name(&self) -> OwnedUniqueName {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        OwnedUniqueName::try_from(format!(":{}.{}", self.id, seq))
            .expect("generated unique name is always well-formed")
    }

    /// Accept the next connection, returning the raw socket handle.
    pub async fn accept(&self) -> Result<Box<dyn Socket + 'static>> {
        match &self.transport {
            Transport::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Transport::Tcp { listener } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Remove the filesystem artifacts of this listener, if any.
    pub async fn cleanup(&self) -> Result<()> {
        if let Transport::Unix { socket_path, .. } = &self.transport {
            tokio::fs::remove_file(socket_path).await?;
        }

        Ok(())
    }
}
