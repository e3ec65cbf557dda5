// Authoritative lock table and shared object store.
//
// The relay is the single arbiter of object ownership. Clients never talk to
// each other, so two of them racing for the same object are serialized here:
// the session handles one message at a time, and whichever `lock` reaches the
// table first wins. Every other requester is told who the owner is.
//
// Objects are created implicitly by the first `lock` or `object` update that
// names them, or explicitly by `spawn`. Each one holds its current owner (if
// any) and the last state a permitted writer stored.

use std::collections::BTreeMap;

use metaroom_protocol::{ConnectionId, ObjectId};
use serde_json::{Map, Value, json};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SharedObject {
    pub owner: Option<ConnectionId>,
    pub state: Option<Value>,
}

impl SharedObject {
    fn permits(&self, requester: ConnectionId) -> bool {
        self.owner.is_none_or(|owner| owner == requester)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Held { owner: ConnectionId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner { owner: Option<ConnectionId> },
}

#[derive(Debug, Default)]
pub struct LockTable {
    objects: BTreeMap<ObjectId, SharedObject>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `object` to `requester` iff it is unowned or already theirs.
    pub fn acquire(&mut self, object: &ObjectId, requester: ConnectionId) -> LockOutcome {
        let entry = self.objects.entry(object.clone()).or_default();
        match entry.owner {
            Some(owner) if owner != requester => LockOutcome::Held { owner },
            _ => {
                entry.owner = Some(requester);
                LockOutcome::Granted
            }
        }
    }

    /// Release `object` iff `requester` owns it.
    pub fn release(&mut self, object: &ObjectId, requester: ConnectionId) -> ReleaseOutcome {
        match self.objects.get_mut(object) {
            Some(entry) if entry.owner == Some(requester) => {
                entry.owner = None;
                ReleaseOutcome::Released
            }
            Some(entry) => ReleaseOutcome::NotOwner { owner: entry.owner },
            None => ReleaseOutcome::NotOwner { owner: None },
        }
    }

    /// Clear every lock held by `owner`, returning the affected objects.
    pub fn release_all(&mut self, owner: ConnectionId) -> Vec<ObjectId> {
        let mut released = Vec::new();
        for (id, entry) in &mut self.objects {
            if entry.owner == Some(owner) {
                entry.owner = None;
                released.push(id.clone());
            }
        }
        released
    }

    pub fn owner(&self, object: &ObjectId) -> Option<ConnectionId> {
        self.objects.get(object).and_then(|entry| entry.owner)
    }

    /// Store new state for `object` if `requester` may write it. A write does
    /// not take the lock.
    pub fn update(&mut self, object: &ObjectId, requester: ConnectionId, state: Value) -> bool {
        let entry = self.objects.entry(object.clone()).or_default();
        if !entry.permits(requester) {
            return false;
        }
        entry.state = Some(state);
        true
    }

    /// Create `object` owned by `owner`. Fails if it already exists.
    pub fn spawn(&mut self, object: &ObjectId, owner: ConnectionId, state: Value) -> bool {
        if self.objects.contains_key(object) {
            return false;
        }
        self.objects.insert(
            object.clone(),
            SharedObject {
                owner: Some(owner),
                state: Some(state),
            },
        );
        true
    }

    /// Remove `object` if it exists and `requester` may write it.
    pub fn delete(&mut self, object: &ObjectId, requester: ConnectionId) -> bool {
        match self.objects.get(object) {
            Some(entry) if entry.permits(requester) => {
                self.objects.remove(object);
                true
            }
            _ => false,
        }
    }

    /// JSON snapshot for the `initialize` greeting, keyed by object id.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.objects
            .iter()
            .map(|(id, entry)| {
                (
                    id.to_string(),
                    json!({ "lockid": entry.owner, "state": entry.state }),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = ConnectionId(0);
    const B: ConnectionId = ConnectionId(1);

    fn obj(n: i64) -> ObjectId {
        ObjectId::Number(n)
    }

    #[test]
    fn first_requester_wins() {
        let mut table = LockTable::new();
        assert_eq!(table.acquire(&obj(1), A), LockOutcome::Granted);
        assert_eq!(table.acquire(&obj(1), B), LockOutcome::Held { owner: A });
        assert_eq!(table.owner(&obj(1)), Some(A));
    }

    #[test]
    fn reacquire_by_owner_is_granted() {
        let mut table = LockTable::new();
        table.acquire(&obj(1), A);
        assert_eq!(table.acquire(&obj(1), A), LockOutcome::Granted);
    }

    #[test]
    fn only_owner_can_release() {
        let mut table = LockTable::new();
        table.acquire(&obj(1), A);
        assert_eq!(
            table.release(&obj(1), B),
            ReleaseOutcome::NotOwner { owner: Some(A) }
        );
        assert_eq!(table.release(&obj(1), A), ReleaseOutcome::Released);
        assert_eq!(table.owner(&obj(1)), None);
        assert_eq!(
            table.release(&obj(9), A),
            ReleaseOutcome::NotOwner { owner: None }
        );
    }

    #[test]
    fn release_all_frees_only_that_owner() {
        let mut table = LockTable::new();
        table.acquire(&obj(1), A);
        table.acquire(&obj(2), B);
        table.acquire(&obj(3), A);
        assert_eq!(table.release_all(A), vec![obj(1), obj(3)]);
        assert_eq!(table.owner(&obj(2)), Some(B));
        assert_eq!(table.acquire(&obj(1), B), LockOutcome::Granted);
    }

    #[test]
    fn updates_respect_ownership() {
        let mut table = LockTable::new();
        assert!(table.update(&obj(1), B, json!({"x": 1})));
        table.acquire(&obj(1), A);
        assert!(!table.update(&obj(1), B, json!({"x": 2})));
        assert!(table.update(&obj(1), A, json!({"x": 3})));
        assert_eq!(table.snapshot()["1"]["state"], json!({"x": 3}));
    }

    #[test]
    fn spawn_and_delete() {
        let mut table = LockTable::new();
        assert!(table.spawn(&obj(4), A, json!({})));
        assert!(!table.spawn(&obj(4), B, json!({})));
        assert!(!table.delete(&obj(4), B));
        assert!(table.delete(&obj(4), A));
        assert!(!table.delete(&obj(4), A));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn snapshot_keys_by_display_form() {
        let mut table = LockTable::new();
        table.spawn(&ObjectId::Name("lamp".into()), A, json!({"on": true}));
        table.update(&obj(2), B, json!(null));
        let snap = table.snapshot();
        assert_eq!(snap["lamp"], json!({"lockid": 0, "state": {"on": true}}));
        assert_eq!(snap["2"], json!({"lockid": null, "state": null}));
    }
}
