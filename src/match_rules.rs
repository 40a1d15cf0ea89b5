use zbus::{fdo, names::BusName, Message, OwnedMatchRule};

use crate::name_registry::NameRegistry;

/// Parse a match rule string as used by `AddMatch`/`RemoveMatch`.
///
/// Any parse failure is reported as `MatchRuleInvalid`, per the wire contract in the error
/// taxonomy — callers should not see the underlying parser's own error type.
pub fn parse(rule: &str) -> fdo::Result<OwnedMatchRule> {
    rule.parse()
        .map_err(|e| fdo::Error::MatchRuleInvalid(format!("{e}")))
}

/// Whether `rule` matches `msg`.
///
/// Delegates the bulk of the comparison to `zbus`'s own rule matcher, then additionally
/// resolves a rule's well-known `destination` against the name registry on a best-effort
/// basis. A rule's well-known `sender` is *not* resolved the same way — this mirrors the
/// upstream broker, which has the same asymmetry (see the spec's open questions), and is kept
/// here as a documented limitation rather than "fixed" out from under it.
pub async fn matches(rule: &OwnedMatchRule, msg: &Message, name_registry: &NameRegistry) -> bool {
    match rule.matches(msg) {
        Ok(false) => return false,
        Ok(true) => (),
        Err(e) => {
            tracing::warn!("error matching rule: {}", e);

            return false;
        }
    }

    let Some(destination) = rule.destination() else {
        return true;
    };

    let hdr = msg.header();

    match hdr.destination() {
        Some(BusName::WellKnown(name)) => matches!(
            name_registry.lookup(name.clone()).await,
            Some(owner) if *owner == *destination
        ),
        // Unique names are already handled by `rule.matches()` above.
        _ => true,
    }
}
