use std::{env::temp_dir, iter::repeat_with, sync::Arc};

use switchboard::server::Server;
use tokio::task::JoinHandle;
use zbus::AuthMechanism;

/// Bind a fresh [`Server`] on a uniquely named Unix-domain socket and run it in the
/// background for the duration of the test. Returns the address to connect to and a guard
/// that shuts the server down and cleans up its socket when dropped or explicitly stopped.
pub async fn spawn_server() -> (String, ServerGuard) {
    let name: String = repeat_with(fastrand::alphanumeric).take(12).collect();
    let path = temp_dir().join(format!("switchboard-test-{name}"));
    let address = format!("unix:path={}", path.display());

    let mut server = Server::new();
    server
        .bind(&address, AuthMechanism::External)
        .await
        .expect("failed to bind test server");
    let server = Arc::new(server);

    let handle = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    (address, ServerGuard { server, handle })
}

pub struct ServerGuard {
    server: Arc<Server>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl ServerGuard {
    pub async fn shutdown(self) {
        self.server.shutdown();
        self.handle
            .await
            .expect("server task panicked")
            .expect("server exited with an error");
        self.server.cleanup().await.expect("failed to clean up test server");
    }
}
