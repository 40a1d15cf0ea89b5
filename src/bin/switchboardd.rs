extern crate switchboard;

#[cfg(unix)]
use std::{fs::File, io::Write, os::fd::FromRawFd};

use switchboard::server::{default_address, Server};

use anyhow::Result;
use clap::Parser;
#[cfg(unix)]
use tokio::{select, signal::unix::SignalKind};
use tracing::error;
#[cfg(unix)]
use tracing::{info, warn};
use zbus::AuthMechanism;

/// A D-Bus message broker.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The address to listen on.
    #[clap(short = 'a', long, value_parser)]
    address: Option<String>,

    /// Print the address of the message bus to standard output.
    #[clap(long)]
    print_address: bool,

    /// File descriptor to which readiness notifications are sent.
    ///
    /// Once the server is listening to connections on the specified socket, it will print
    /// `READY=1\n` into this file descriptor and close it.
    ///
    /// This readiness notification mechanism works on both systemd and s6.
    ///
    /// This feature is only available on unix-like platforms.
    #[cfg(unix)]
    #[clap(long)]
    ready_fd: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    switchboard::tracing_subscriber::init();

    let args = Args::parse();

    let mut server = Server::new();
    let address = args.address.unwrap_or_else(default_address);
    server.bind(&address, AuthMechanism::External).await?;

    #[cfg(unix)]
    if let Some(fd) = args.ready_fd {
        // SAFETY: the parent process is responsible for passing a valid, open fd.
        let mut ready_file = unsafe { File::from_raw_fd(fd) };
        ready_file.write_all(b"READY=1\n")?;
    }

    if args.print_address {
        for address in server.addresses() {
            println!("{address}");
        }
    }

    #[cfg(unix)]
    {
        let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt())?;

        select! {
            _ = sig_int.recv() => {
                info!("Received SIGINT, shutting down..");
                server.shutdown();
            }
            res = server.run() => match res {
                Ok(()) => warn!("Server stopped, shutting down.."),
                Err(e) => error!("Server stopped with an error: {}", e),
            }
        }
    }
    #[cfg(not(unix))]
    server.run().await?;

    if let Err(e) = server.cleanup().await {
        error!("Failed to clean up: {}", e);
    }

    Ok(())
}
