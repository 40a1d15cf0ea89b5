use std::collections::HashMap;

use enumflags2::BitFlags;
use tokio::sync::RwLock;
use zbus::{
    fdo::{ReleaseNameReply, RequestNameFlags, RequestNameReply},
    names::{OwnedUniqueName, OwnedWellKnownName, WellKnownName},
};

/// A single well-known name's FIFO ownership queue.
///
/// Invariant: the owner is always `requests[0]` — ownership is a function of position, not a
/// separate field. The registry deletes a queue as soon as it becomes empty; a queue that
/// exists is guaranteed non-empty.
#[derive(Debug, Default)]
struct NameQueue {
    requests: Vec<(OwnedUniqueName, NameRequest)>,
}

#[derive(Debug, Clone, Copy)]
struct NameRequest {
    allow_replacement: bool,
    replace_existing: bool,
    do_not_queue: bool,
}

impl NameRequest {
    fn from_flags(flags: BitFlags<RequestNameFlags>) -> Self {
        Self {
            allow_replacement: flags.contains(RequestNameFlags::AllowReplacement),
            replace_existing: flags.contains(RequestNameFlags::ReplaceExisting),
            do_not_queue: flags.contains(RequestNameFlags::DoNotQueue),
        }
    }
}

impl NameQueue {
    fn owner(&self) -> Option<&OwnedUniqueName> {
        self.requests.first().map(|(name, _)| name)
    }
}

/// An ownership transition to report to the caller, so it can emit `NameOwnerChanged`,
/// `NameLost`, and `NameAcquired` in that order.
#[derive(Debug, Clone)]
pub struct OwnerChange {
    pub name: OwnedWellKnownName,
    pub old_owner: Option<OwnedUniqueName>,
    pub new_owner: Option<OwnedUniqueName>,
}

/// The bus-name ownership registry.
///
/// One [`NameQueue`] per requested well-known name, keyed by an insertion-ordered `Vec` so
/// that "owner is the front entry" and "promote to front on replacement" are both cheap and
/// exact — a plain hash map can't express the first without a side index.
#[derive(Debug, Default)]
pub struct NameRegistry {
    queues: RwLock<HashMap<OwnedWellKnownName, NameQueue>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Implements `RequestName`. See spec §4.3.
    pub async fn request_name(
        &self,
        name: OwnedWellKnownName,
        unique_name: OwnedUniqueName,
        flags: BitFlags<RequestNameFlags>,
    ) -> (RequestNameReply, Option<OwnerChange>) {
        let request = NameRequest::from_flags(flags);
        let mut queues = self.queues.write().await;
        let queue = queues.entry(name.clone()).or_default();
        let old_owner = queue.owner().cloned();

        let existing_pos = queue
            .requests
            .iter()
            .position(|(owner, _)| *owner == unique_name);
        match existing_pos {
            Some(pos) => queue.requests[pos].1 = request,
            None => queue.requests.push((unique_name.clone(), request)),
        }

        // Replacement: only the owner's allow_replacement and our replace_existing matter, and
        // only if someone *else* currently owns the name.
        let can_replace = match queue.owner() {
            Some(owner) if *owner != unique_name => {
                let owner_allows = queue
                    .requests
                    .iter()
                    .find(|(n, _)| n == owner)
                    .map(|(_, r)| r.allow_replacement)
                    .unwrap_or(false);

                owner_allows && request.replace_existing
            }
            _ => false,
        };

        if can_replace {
            let pos = queue
                .requests
                .iter()
                .position(|(owner, _)| *owner == unique_name)
                .expect("we just inserted or found this entry");
            let entry = queue.requests.remove(pos);
            queue.requests.insert(0, entry);
        }

        // Purge do-not-queue entries that aren't the (possibly just-replaced) owner.
        let keeper = queue
            .owner()
            .cloned()
            .expect("queue always has at least the just-inserted request");
        queue
            .requests
            .retain(|(owner, req)| *owner == keeper || !req.do_not_queue);

        let new_owner = queue.owner().cloned();
        let is_owner = new_owner.as_ref() == Some(&unique_name);
        let has_entry = queue
            .requests
            .iter()
            .any(|(owner, _)| *owner == unique_name);

        let reply = if is_owner && old_owner.as_ref() != Some(&unique_name) {
            RequestNameReply::PrimaryOwner
        } else if is_owner {
            RequestNameReply::AlreadyOwner
        } else if has_entry {
            RequestNameReply::InQueue
        } else {
            RequestNameReply::Exists
        };

        if queue.requests.is_empty() {
            queues.remove(&name);
        }

        let change = (old_owner != new_owner).then(|| OwnerChange {
            name,
            old_owner,
            new_owner,
        });

        (reply, change)
    }

    /// Implements `ReleaseName`. See spec §4.3.
    pub async fn release_name(
        &self,
        name: WellKnownName<'_>,
        unique_name: &OwnedUniqueName,
    ) -> (ReleaseNameReply, Option<OwnerChange>) {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(name.as_str()) else {
            return (ReleaseNameReply::NonExistent, None);
        };

        let old_owner = queue.owner().cloned();
        let pos = queue
            .requests
            .iter()
            .position(|(owner, _)| owner == unique_name);
        let Some(pos) = pos else {
            return (ReleaseNameReply::NotOwner, None);
        };
        queue.requests.remove(pos);

        let new_owner = queue.owner().cloned();
        let owned_name = OwnedWellKnownName::from(name.to_owned());
        if queue.requests.is_empty() {
            queues.remove(owned_name.as_str());
        }

        let change = (old_owner != new_owner).then(|| OwnerChange {
            name: owned_name,
            old_owner,
            new_owner,
        });

        (ReleaseNameReply::Released, change)
    }

    /// Remove every entry belonging to `unique_name` from every queue — called when a session
    /// disconnects. Returns the resulting ownership transitions, in queue-iteration order.
    pub async fn remove_session(&self, unique_name: &OwnedUniqueName) -> Vec<OwnerChange> {
        let mut queues = self.queues.write().await;
        let mut changes = Vec::new();
        let mut to_delete = Vec::new();

        for (name, queue) in queues.iter_mut() {
            let old_owner = queue.owner().cloned();
            queue.requests.retain(|(owner, _)| owner != unique_name);
            let new_owner = queue.owner().cloned();

            if old_owner != new_owner {
                changes.push(OwnerChange {
                    name: name.clone(),
                    old_owner,
                    new_owner,
                });
            }
            if queue.requests.is_empty() {
                to_delete.push(name.clone());
            }
        }

        for name in to_delete {
            queues.remove(&name);
        }

        changes
    }

    pub async fn lookup(&self, name: WellKnownName<'_>) -> Option<OwnedUniqueName> {
        self.queues
            .read()
            .await
            .get(name.as_str())
            .and_then(|q| q.owner().cloned())
    }

    pub async fn list_queued_owners(&self, name: WellKnownName<'_>) -> Vec<OwnedUniqueName> {
        self.queues
            .read()
            .await
            .get(name.as_str())
            .map(|q| q.requests.iter().map(|(owner, _)| owner.clone()).collect())
            .unwrap_or_default()
    }

    /// Every well-known name that currently has a queue (owned or merely requested).
    pub async fn all_names(&self) -> Vec<OwnedWellKnownName> {
        self.queues.read().await.keys().cloned().collect()
    }
}
