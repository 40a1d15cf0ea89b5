//! The server-side implementation of `org.freedesktop.DBus` and its three satellite
//! interfaces (`Peer`, `Introspectable`, `Properties`).
//!
//! Unlike a typical `zbus` service, these methods aren't registered with an `ObjectServer` —
//! the router dispatches to [`dispatch`] directly (see [`crate::router`]), because the wire
//! contract here is pinned to specific `org.freedesktop.DBus.Error.*` names rather than
//! whatever `zbus` would generate from a native error type.
use std::collections::HashMap;
use std::sync::Arc;

use enumflags2::BitFlags;
use quick_xml::{
    events::{BytesEnd, BytesStart, BytesText, Event},
    Writer,
};
#[cfg(unix)]
use tokio::fs;
use zbus::{
    fdo,
    names::{BusName, InterfaceName, OwnedUniqueName, OwnedWellKnownName, WellKnownName},
    zvariant::Value,
    Message,
};

use crate::{
    match_rules,
    reply,
    router::{Router, BUS_NAME},
    session::Session,
};

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

/// Handle a method call addressed to `org.freedesktop.DBus`, returning the reply to route
/// back (a `method_return` on success, an `error` otherwise). Never fails itself: any
/// failure along the way becomes an error reply rather than propagating.
pub async fn dispatch(router: &Router, msg: &Message, sender: &Arc<Session>) -> zbus::Result<Message> {
    let hdr = msg.header();
    let interface = hdr.interface().map(|i| i.as_str());
    let member = hdr.member().map(|m| m.as_str()).unwrap_or_default();

    let result = match interface {
        Some(BUS_NAME) => dbus_call(router, msg, sender, member).await,
        Some(PEER_INTERFACE) => peer_call(msg, member).await,
        Some(INTROSPECTABLE_INTERFACE) => introspectable_call(msg, member).await,
        Some(PROPERTIES_INTERFACE) => properties_call(msg, member).await,
        Some(other) => Err(fdo::Error::UnknownInterface(format!(
            "Unknown interface `{other}`"
        ))),
        None => Err(fdo::Error::UnknownInterface(
            "No interface specified".to_string(),
        )),
    };

    match result {
        Ok(reply) => Ok(reply),
        Err(e) => reply::error(msg, e),
    }
}

/// Deserialize the method call body, mapping any failure (including a wrong argument
/// signature) to `InvalidArgs` — the spec requires every method to reject a bad signature
/// this way rather than let the codec's own error leak through.
fn args<'m, T>(msg: &'m Message) -> fdo::Result<T>
where
    T: serde::Deserialize<'m> + zbus::zvariant::Type,
{
    msg.body::<T>()
        .map_err(|e| fdo::Error::InvalidArgs(format!("bad arguments: {e}")))
}

fn to_zbus_err(e: zbus::Error) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

async fn dbus_call(
    router: &Router,
    msg: &Message,
    sender: &Arc<Session>,
    member: &str,
) -> fdo::Result<Message> {
    match member {
        "Hello" => hello(msg, sender).await,
        "RequestName" => request_name(router, msg, sender).await,
        "ReleaseName" => release_name(router, msg, sender).await,
        "ListQueuedOwners" => list_queued_owners(router, msg).await,
        "ListNames" => list_names(router, msg).await,
        "ListActivatableNames" => list_activatable_names(msg),
        "NameHasOwner" => name_has_owner(router, msg).await,
        "StartServiceByName" => start_service_by_name(router, msg).await,
        "GetNameOwner" => get_name_owner(router, msg).await,
        "AddMatch" => add_match(sender, msg).await,
        "RemoveMatch" => remove_match(sender, msg).await,
        "GetId" => get_id(msg, sender).await,
        other => Err(fdo::Error::UnknownMethod(format!(
            "Unknown method `{other}` on interface `{BUS_NAME}`"
        ))),
    }
}

async fn hello(msg: &Message, sender: &Arc<Session>) -> fdo::Result<Message> {
    let (): () = args(msg)?;

    if !sender.mark_hello_received().await {
        return Err(fdo::Error::Failed(
            "Already handled an Hello message".to_string(),
        ));
    }

    reply::method_return(msg, &sender.unique_name().to_string()).map_err(to_zbus_err)
}

async fn request_name(router: &Router, msg: &Message, sender: &Arc<Session>) -> fdo::Result<Message> {
    let (name, flags): (WellKnownName<'_>, BitFlags<fdo::RequestNameFlags>) = args(msg)?;
    let (reply, change) = router
        .name_registry()
        .request_name(
            OwnedWellKnownName::from(name),
            sender.unique_name().clone(),
            flags,
        )
        .await;

    if let Some(change) = change {
        router.emit_owner_change(change).await.map_err(to_zbus_err)?;
    }

    reply::method_return(msg, &reply).map_err(to_zbus_err)
}

async fn release_name(router: &Router, msg: &Message, sender: &Arc<Session>) -> fdo::Result<Message> {
    let (name,): (WellKnownName<'_>,) = args(msg)?;
    let (reply, change) = router
        .name_registry()
        .release_name(name, sender.unique_name())
        .await;

    if let Some(change) = change {
        router.emit_owner_change(change).await.map_err(to_zbus_err)?;
    }

    reply::method_return(msg, &reply).map_err(to_zbus_err)
}

async fn list_queued_owners(router: &Router, msg: &Message) -> fdo::Result<Message> {
    let (name,): (WellKnownName<'_>,) = args(msg)?;
    let owners: Vec<String> = router
        .name_registry()
        .list_queued_owners(name)
        .await
        .iter()
        .map(|o| o.to_string())
        .collect();

    reply::method_return(msg, &owners).map_err(to_zbus_err)
}

async fn list_names(router: &Router, msg: &Message) -> fdo::Result<Message> {
    let (): () = args(msg)?;

    let mut names: Vec<String> = vec![BUS_NAME.to_string()];
    names.extend(router.unique_names().await.iter().map(|n| n.to_string()));
    names.extend(
        router
            .name_registry()
            .all_names()
            .await
            .iter()
            .map(|n| n.to_string()),
    );

    reply::method_return(msg, &names).map_err(to_zbus_err)
}

fn list_activatable_names(msg: &Message) -> fdo::Result<Message> {
    let (): () = args(msg)?;
    let names: Vec<String> = vec![];

    reply::method_return(msg, &names).map_err(to_zbus_err)
}

async fn name_has_owner(router: &Router, msg: &Message) -> fdo::Result<Message> {
    let (name,): (BusName<'_>,) = args(msg)?;
    let has_owner = match name {
        BusName::WellKnown(name) => {
            name.as_str() == BUS_NAME || router.name_registry().lookup(name).await.is_some()
        }
        BusName::Unique(name) => {
            name.as_str() == BUS_NAME
                || router
                    .session(&OwnedUniqueName::from(name))
                    .await
                    .is_some()
        }
    };

    reply::method_return(msg, &has_owner).map_err(to_zbus_err)
}

async fn start_service_by_name(router: &Router, msg: &Message) -> fdo::Result<Message> {
    let (name, _flags): (WellKnownName<'_>, u32) = args(msg)?;

    if name.as_str() == BUS_NAME || router.name_registry().lookup(name.clone()).await.is_some() {
        return reply::method_return(msg, &2u32).map_err(to_zbus_err);
    }

    Err(fdo::Error::ServiceNotFound(format!(
        "The name {name} was not provided by any .service files",
    )))
}

async fn get_name_owner(router: &Router, msg: &Message) -> fdo::Result<Message> {
    let (name,): (BusName<'_>,) = args(msg)?;

    let owner = match name {
        BusName::WellKnown(name) if name.as_str() == BUS_NAME => BUS_NAME.to_string(),
        BusName::WellKnown(name) => router
            .name_registry()
            .lookup(name)
            .await
            .ok_or_else(|| {
                fdo::Error::NameHasNoOwner("Name is not owned by anyone. Take it!".to_string())
            })?
            .to_string(),
        BusName::Unique(name) if name.as_str() == BUS_NAME => BUS_NAME.to_string(),
        BusName::Unique(name) => {
            let owned = OwnedUniqueName::from(name);
            if router.session(&owned).await.is_some() {
                owned.to_string()
            } else {
                return Err(fdo::Error::NameHasNoOwner(
                    "Name is not owned by anyone.".to_string(),
                ));
            }
        }
    };

    reply::method_return(msg, &owner).map_err(to_zbus_err)
}

async fn add_match(sender: &Arc<Session>, msg: &Message) -> fdo::Result<Message> {
    let (rule,): (String,) = args(msg)?;
    let rule = match_rules::parse(&rule)?;
    sender.add_match_rule(rule).await;

    reply::method_return(msg, &()).map_err(to_zbus_err)
}

async fn remove_match(sender: &Arc<Session>, msg: &Message) -> fdo::Result<Message> {
    let (rule,): (String,) = args(msg)?;
    let rule = match_rules::parse(&rule)?;

    if !sender.remove_match_rule(&rule).await {
        return Err(fdo::Error::MatchRuleNotFound(
            "The given rule wasn't found and can't be removed".to_string(),
        ));
    }

    reply::method_return(msg, &()).map_err(to_zbus_err)
}

async fn get_id(msg: &Message, sender: &Arc<Session>) -> fdo::Result<Message> {
    let (): () = args(msg)?;
    let id = sender.listener_guid().to_string();

    reply::method_return(msg, &id).map_err(to_zbus_err)
}

async fn peer_call(msg: &Message, member: &str) -> fdo::Result<Message> {
    match member {
        "Ping" => {
            let (): () = args(msg)?;
            reply::method_return(msg, &()).map_err(to_zbus_err)
        }
        "GetMachineId" => {
            let (): () = args(msg)?;
            let id = get_machine_id().await?;
            reply::method_return(msg, &id).map_err(to_zbus_err)
        }
        other => Err(fdo::Error::UnknownMethod(format!(
            "Unknown method `{other}` on interface `{PEER_INTERFACE}`"
        ))),
    }
}

/// Read the local machine id: try `/etc/machine-id` then `/var/lib/dbus/machine-id`,
/// surfacing any IO failure other than `NotFound` as `Failed`. Platforms with neither file
/// (anything non-unix) fall back to an id generated once and held for the process's lifetime,
/// so repeated calls from the same broker instance still agree with each other.
async fn get_machine_id() -> fdo::Result<String> {
    #[cfg(unix)]
    {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            match fs::read_to_string(path).await {
                Ok(contents) => return Ok(contents.trim().to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(fdo::Error::Failed(format!(
                        "failed to read machine id from `{path}`: {e}"
                    )))
                }
            }
        }
    }

    static FALLBACK_ID: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    Ok(FALLBACK_ID.get_or_init(|| zbus::Guid::generate().to_string()).clone())
}

async fn introspectable_call(msg: &Message, member: &str) -> fdo::Result<Message> {
    match member {
        "Introspect" => {
            let (): () = args(msg)?;
            let path = msg.header().path().map(|p| p.as_str()).unwrap_or("/");
            let xml = introspect_xml(path);
            reply::method_return(msg, &xml).map_err(to_zbus_err)
        }
        other => Err(fdo::Error::UnknownMethod(format!(
            "Unknown method `{other}` on interface `{INTROSPECTABLE_INTERFACE}`"
        ))),
    }
}

/// Build the introspection XML for `path`. Every served interface lives at
/// `/org/freedesktop/DBus`; any strict ancestor of that path (including `/`) gets just the
/// one child node, matching how the reference broker introspects its own root.
fn introspect_xml(path: &str) -> String {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    let doctype = BytesText::from_escaped(
        "DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\"",
    );
    let _ = writer.write_event(Event::DocType(doctype));

    let mut node = BytesStart::new("node");
    node.push_attribute(("name", path));
    let _ = writer.write_event(Event::Start(node));

    if path != DBUS_PATH && DBUS_PATH.starts_with(path) {
        let mut child = BytesStart::new("node");
        child.push_attribute(("name", "DBus"));
        let _ = writer.write_event(Event::Empty(child));
    } else {
        write_interface(&mut writer, BUS_NAME, &dbus_methods());
        write_interface(&mut writer, PEER_INTERFACE, &peer_methods());
        write_interface(&mut writer, INTROSPECTABLE_INTERFACE, &introspectable_methods());
        write_interface(&mut writer, PROPERTIES_INTERFACE, &properties_methods());
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("node")));

    String::from_utf8(writer.into_inner()).unwrap_or_default()
}

struct MethodSig {
    name: &'static str,
    args: &'static [(&'static str, &'static str, bool)],
}

fn write_interface(writer: &mut Writer<Vec<u8>>, name: &str, methods: &[MethodSig]) {
    let mut iface = BytesStart::new("interface");
    iface.push_attribute(("name", name));
    let _ = writer.write_event(Event::Start(iface));

    for method in methods {
        let mut m = BytesStart::new("method");
        m.push_attribute(("name", method.name));
        if method.args.is_empty() {
            let _ = writer.write_event(Event::Empty(m));
            continue;
        }
        let _ = writer.write_event(Event::Start(m));
        for (arg_name, signature, is_out) in method.args {
            let mut arg = BytesStart::new("arg");
            arg.push_attribute(("name", *arg_name));
            arg.push_attribute(("type", *signature));
            arg.push_attribute(("direction", if *is_out { "out" } else { "in" }));
            let _ = writer.write_event(Event::Empty(arg));
        }
        let _ = writer.write_event(Event::End(BytesEnd::new("method")));
    }

    if name == BUS_NAME {
        for property in ["Features", "Interfaces"] {
            let mut p = BytesStart::new("property");
            p.push_attribute(("name", property));
            p.push_attribute(("type", "as"));
            p.push_attribute(("access", "read"));
            let _ = writer.write_event(Event::Empty(p));
        }
        for signal in ["NameOwnerChanged", "NameLost", "NameAcquired"] {
            let mut s = BytesStart::new("signal");
            s.push_attribute(("name", signal));
            let _ = writer.write_event(Event::Empty(s));
        }
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("interface")));
}

fn dbus_methods() -> Vec<MethodSig> {
    vec![
        MethodSig { name: "Hello", args: &[("name", "s", true)] },
        MethodSig { name: "RequestName", args: &[("name", "s", false), ("flags", "u", false), ("result", "u", true)] },
        MethodSig { name: "ReleaseName", args: &[("name", "s", false), ("result", "u", true)] },
        MethodSig { name: "ListQueuedOwners", args: &[("name", "s", false), ("names", "as", true)] },
        MethodSig { name: "ListNames", args: &[("names", "as", true)] },
        MethodSig { name: "ListActivatableNames", args: &[("names", "as", true)] },
        MethodSig { name: "NameHasOwner", args: &[("name", "s", false), ("has_owner", "b", true)] },
        MethodSig { name: "StartServiceByName", args: &[("name", "s", false), ("flags", "u", false), ("result", "u", true)] },
        MethodSig { name: "GetNameOwner", args: &[("name", "s", false), ("owner", "s", true)] },
        MethodSig { name: "AddMatch", args: &[("rule", "s", false)] },
        MethodSig { name: "RemoveMatch", args: &[("rule", "s", false)] },
        MethodSig { name: "GetId", args: &[("id", "s", true)] },
    ]
}

fn peer_methods() -> Vec<MethodSig> {
    vec![
        MethodSig { name: "Ping", args: &[] },
        MethodSig { name: "GetMachineId", args: &[("machine_uuid", "s", true)] },
    ]
}

fn introspectable_methods() -> Vec<MethodSig> {
    vec![MethodSig { name: "Introspect", args: &[("xml_data", "s", true)] }]
}

fn properties_methods() -> Vec<MethodSig> {
    vec![
        MethodSig { name: "Get", args: &[("interface_name", "s", false), ("property_name", "s", false), ("value", "v", true)] },
        MethodSig { name: "Set", args: &[("interface_name", "s", false), ("property_name", "s", false), ("value", "v", false)] },
        MethodSig { name: "GetAll", args: &[("interface_name", "s", false), ("properties", "a{sv}", true)] },
    ]
}

async fn properties_call(msg: &Message, member: &str) -> fdo::Result<Message> {
    match member {
        "Get" => {
            let (interface, property): (InterfaceName<'_>, String) = args(msg)?;
            let value = property_value(&interface, &property)?;
            reply::method_return(msg, &value).map_err(to_zbus_err)
        }
        "Set" => {
            let (interface, property, _value): (InterfaceName<'_>, String, Value<'_>) = args(msg)?;
            // Validate first, so an unknown interface/name still reports `UnknownProperty`
            // rather than `PropertyReadOnly`.
            property_value(&interface, &property)?;

            Err(fdo::Error::PropertyReadOnly(format!(
                "Property `{property}` is read-only"
            )))
        }
        "GetAll" => {
            let (interface,): (InterfaceName<'_>,) = args(msg)?;
            if interface.as_str() != BUS_NAME {
                return Err(fdo::Error::UnknownProperty(format!(
                    "Unknown interface `{interface}`"
                )));
            }

            let mut properties: HashMap<String, Value<'_>> = HashMap::new();
            properties.insert("Features".to_string(), Value::new(Vec::<String>::new()));
            properties.insert("Interfaces".to_string(), Value::new(Vec::<String>::new()));

            reply::method_return(msg, &properties).map_err(to_zbus_err)
        }
        other => Err(fdo::Error::UnknownMethod(format!(
            "Unknown method `{other}` on interface `{PROPERTIES_INTERFACE}`"
        ))),
    }
}

fn property_value<'v>(interface: &InterfaceName<'_>, property: &str) -> fdo::Result<Value<'v>> {
    if interface.as_str() != BUS_NAME {
        return Err(fdo::Error::UnknownProperty(format!(
            "Unknown interface `{interface}`"
        )));
    }

    match property {
        "Features" | "Interfaces" => Ok(Value::new(Vec::<String>::new())),
        other => Err(fdo::Error::UnknownProperty(format!(
            "Unknown property `{other}`"
        ))),
    }
}
