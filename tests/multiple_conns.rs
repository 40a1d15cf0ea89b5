//! Many simultaneous connections on one listener each get a distinct, correctly-shaped
//! unique name; this holds for both transports the broker supports.
use std::{env::temp_dir, sync::Arc};

use futures_util::future::join_all;
use ntest::timeout;
use rand::{
    distr::{Alphanumeric, SampleString},
    rng,
};
use switchboard::server::Server;
use tracing::instrument;
use zbus::{connection, AuthMechanism};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[instrument]
#[timeout(15000)]
async fn multiple_connections() {
    switchboard::tracing_subscriber::init();

    #[cfg(unix)]
    {
        let s = Alphanumeric.sample_string(&mut rng(), 10);
        let path = temp_dir().join(format!("switchboard-multi-{s}"));
        let address = format!("unix:path={}", path.display());
        multiple_connections_(&address).await;
    }

    let address = "tcp:host=127.0.0.1,port=0".to_string();
    multiple_connections_(&address).await;
}

async fn multiple_connections_(address: &str) {
    let mut server = Server::new();
    server.bind(address, AuthMechanism::External).await.unwrap();
    let bound_address = server.addresses().into_iter().next().unwrap();
    let server = Arc::new(server);

    let handle = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    multi_clients_connect(&bound_address).await.unwrap();

    server.shutdown();
    handle.await.unwrap().unwrap();
    server.cleanup().await.unwrap();
}

#[instrument]
async fn multi_clients_connect(address: &str) -> anyhow::Result<()> {
    let conns: Vec<_> = (0..10)
        .map(|_| connection::Builder::address(address).unwrap().build())
        .collect();
    let conns: Vec<_> = join_all(conns)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    let mut seqs: Vec<u64> = conns
        .iter()
        .map(|conn| {
            let name = conn.unique_name().unwrap().to_string();
            let rest = name.strip_prefix(":1.").unwrap_or_else(|| panic!("unexpected unique name {name}"));
            rest.parse().unwrap_or_else(|_| panic!("unexpected unique name {name}"))
        })
        .collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), conns.len(), "every connection must get a distinct unique name");

    Ok(())
}
