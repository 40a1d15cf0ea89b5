//! A D-Bus message broker: the pieces needed to accept peer connections, authenticate them,
//! and route messages between them and the built-in `org.freedesktop.DBus` bus driver.
//!
//! [`Server`] ties the pieces together; most programs only need it and
//! [`tracing_subscriber::init`].

pub mod fdo;
pub mod listener;
pub mod match_rules;
pub mod name_registry;
pub mod reply;
pub mod router;
pub mod server;
pub mod session;
pub mod tracing_subscriber;

pub use server::Server;
