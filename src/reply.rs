use zbus::{fdo, zvariant::Type, DBusError, Message, MessageBuilder};

use crate::router::BUS_NAME;

/// Build a `method_return` to `original`, stamped with `sender = "org.freedesktop.DBus"`.
///
/// Every bus-interface reply goes through here rather than through the destination session's
/// own connection, so that `sender` is always the bus itself regardless of which session ends
/// up delivering the message.
pub fn method_return<B>(original: &Message, body: &B) -> zbus::Result<Message>
where
    B: serde::Serialize + Type,
{
    MessageBuilder::method_return(&original.header())?
        .sender(BUS_NAME)?
        .build(body)
}

/// Build an `error` reply to `original` from an `fdo::Error`, sender-stamped as the bus.
pub fn error(original: &Message, err: fdo::Error) -> zbus::Result<Message> {
    let name = err.name();
    let description = err.description().unwrap_or_default().to_string();

    MessageBuilder::error(&original.header(), name)?
        .sender(BUS_NAME)?
        .build(&(description,))
}
