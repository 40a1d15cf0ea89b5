//! An application-level service/client exchange routed end to end through the broker: the
//! service owns a well-known name, the client calls a method on it and receives a signal back.
mod common;

use anyhow::anyhow;
use common::spawn_server;
use futures_util::{pin_mut, stream::StreamExt};
use ntest::timeout;
use tokio::time::{timeout as recv_timeout, Duration};
use tracing::instrument;
use zbus::{
    dbus_interface, dbus_proxy, CacheProperties, Connection, ConnectionBuilder, MessageStream,
    SignalContext,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[instrument]
#[timeout(15000)]
async fn greet() {
    switchboard::tracing_subscriber::init();

    let (address, guard) = spawn_server().await;
    let ret = match greet_service(&address).await {
        Ok(service_conn) => greet_client(&address).await.map(|_| service_conn),
        Err(e) => Err(e),
    };
    guard.shutdown().await;
    ret.unwrap();
}

#[instrument]
async fn greet_service(address: &str) -> anyhow::Result<Connection> {
    struct Greeter {
        count: u64,
    }

    #[dbus_interface(name = "org.zbus.MyGreeter1")]
    impl Greeter {
        async fn say_hello(
            &mut self,
            name: &str,
            #[zbus(signal_context)] ctxt: SignalContext<'_>,
        ) -> zbus::fdo::Result<String> {
            self.count += 1;
            Self::greeted(&ctxt, name, self.count).await?;
            Ok(format!(
                "Hello {}! I have been called {} times.",
                name, self.count
            ))
        }

        #[dbus_interface(signal)]
        async fn greeted(ctxt: &SignalContext<'_>, name: &str, count: u64) -> zbus::Result<()>;
    }

    let greeter = Greeter { count: 0 };
    ConnectionBuilder::address(address)?
        .name("org.zbus.MyGreeter")?
        .serve_at("/org/zbus/MyGreeter", greeter)?
        .build()
        .await
        .map_err(Into::into)
}

#[instrument]
async fn greet_client(address: &str) -> anyhow::Result<()> {
    #[dbus_proxy(
        interface = "org.zbus.MyGreeter1",
        default_path = "/org/zbus/MyGreeter"
    )]
    trait MyGreeter {
        fn say_hello(&self, name: &str) -> zbus::Result<String>;

        #[dbus_proxy(signal)]
        async fn greeted(name: &str, count: u64);
    }

    let conn = ConnectionBuilder::address(address)?.build().await?;

    let proxy = MyGreeterProxy::builder(&conn)
        .destination("org.zbus.MyGreeter")?
        .cache_properties(CacheProperties::No)
        .build()
        .await?;
    let mut greeted_stream = proxy.receive_greeted().await?;
    let reply = proxy.say_hello("Maria").await?;
    assert_eq!(reply, "Hello Maria! I have been called 1 times.");
    let signal = greeted_stream
        .next()
        .await
        .ok_or_else(|| anyhow!("stream ended unexpectedly"))?;
    let args = signal.args()?;
    assert_eq!(args.name, "Maria");
    assert_eq!(args.count, 1);

    // Unsubscribing stops delivery: a message stream filtered on the signal sees nothing more.
    let msg_stream = MessageStream::from(&conn).filter_map(|msg| async {
        let msg = msg.ok()?;
        Greeted::from_message(msg)
    });
    pin_mut!(msg_stream);
    drop(greeted_stream);
    let _ = proxy.say_hello("Maria").await?;
    recv_timeout(Duration::from_millis(50), msg_stream.next())
        .await
        .unwrap_err();

    Ok(())
}
