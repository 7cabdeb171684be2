//! Canonical notification store.
//!
//! The store is the single source of truth for what the user sees. It is a
//! plain value mutated through `&mut self`; the engine task owns it, so no
//! two mutations can interleave and listeners always observe a consistent
//! snapshot.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::model::{Notification, NotificationId};

/// A change delivered by either transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// One pushed notification.
    Single(Notification),
    /// A page of notifications, merged into the current list.
    Batch(Vec<Notification>),
    /// Server-side unread counter without items.
    CountOnly(u32),
    /// Authoritative list that replaces the current one.
    Refresh(Vec<Notification>),
}

impl Delta {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Batch(_) => "batch",
            Self::CountOnly(_) => "count_only",
            Self::Refresh(_) => "refresh",
        }
    }
}

/// Ordered view of the store, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub notifications: Vec<Notification>,
    /// Number of unread entries, or the server hint before any list arrived.
    pub unread_count: u32,
}

impl Snapshot {
    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.notifications.iter().find(|n| &n.id == id)
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.iter()
    }

    fn position(&self, id: &NotificationId) -> Option<usize> {
        self.notifications.iter().position(|n| &n.id == id)
    }

    fn recount(&mut self) {
        self.unread_count = self.notifications.iter().filter(|n| !n.read).count() as u32;
    }

    fn insert_sorted(&mut self, notification: Notification) {
        let at = self
            .notifications
            .partition_point(|n| n.created_at > notification.created_at);
        self.notifications.insert(at, notification);
    }
}

/// What a mutation did, passed to listeners with the resulting snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// A `Single` or `Batch` delta was merged.
    Merged {
        inserted: Vec<Notification>,
        updated: Vec<NotificationId>,
    },
    /// A `Refresh` delta replaced the list.
    Resynced { inserted: usize, removed: usize },
    /// The unread counter was set from a count-only hint.
    CountHint(u32),
    MarkedRead(Vec<NotificationId>),
    Removed(Vec<NotificationId>),
    Cleared,
}

/// Handle returned by [`Store::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Box<dyn FnMut(&StoreChange, &Snapshot) + Send>;

/// Outcome of merging one incoming version against the stored one.
enum Merge {
    Inserted,
    Updated,
    Unchanged,
    Stale,
}

#[derive(Default)]
pub struct Store {
    snapshot: Snapshot,
    /// Set once a delta carrying items has been applied.
    has_rich_data: bool,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.snapshot.len())
            .field("unread_count", &self.snapshot.unread_count)
            .field("has_rich_data", &self.has_rich_data)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn unread_count(&self) -> u32 {
        self.snapshot.unread_count
    }

    /// Whether any item-carrying delta has been applied.
    pub fn has_rich_data(&self) -> bool {
        self.has_rich_data
    }

    /// Register a listener invoked synchronously after every effective mutation.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&StoreChange, &Snapshot) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false when it was not registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Merge a delta. Returns the change when the snapshot changed.
    pub fn apply_delta(&mut self, delta: Delta) -> Option<StoreChange> {
        let change = match delta {
            Delta::Single(notification) => self.merge_items(vec![notification]),
            Delta::Batch(items) => self.merge_items(items),
            Delta::CountOnly(count) => self.apply_count(count),
            Delta::Refresh(items) => self.refresh(items),
        };
        if let Some(change) = &change {
            self.notify(change);
        }
        change
    }

    /// Flip one notification to read. Returns false when absent or already read.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        !self.mark_where(|n| &n.id == id).is_empty()
    }

    /// Flip several notifications to read; returns the ids that changed.
    pub fn mark_batch_read(&mut self, ids: &[NotificationId]) -> Vec<NotificationId> {
        let wanted: HashSet<&NotificationId> = ids.iter().collect();
        self.mark_where(|n| wanted.contains(&n.id))
    }

    /// Flip every notification to read; returns the ids that changed.
    pub fn mark_all_read(&mut self) -> Vec<NotificationId> {
        let changed = self.mark_where(|_| true);
        if changed.is_empty() && self.snapshot.unread_count != 0 {
            // Only a count hint was outstanding.
            self.snapshot.unread_count = 0;
            self.notify(&StoreChange::MarkedRead(Vec::new()));
        }
        changed
    }

    pub fn remove(&mut self, id: &NotificationId) -> Option<Notification> {
        let at = self.snapshot.position(id)?;
        let removed = self.snapshot.notifications.remove(at);
        self.snapshot.recount();
        self.notify(&StoreChange::Removed(vec![removed.id.clone()]));
        Some(removed)
    }

    /// Remove several notifications; returns the ids that were present.
    pub fn remove_batch(&mut self, ids: &[NotificationId]) -> Vec<NotificationId> {
        let wanted: HashSet<&NotificationId> = ids.iter().collect();
        let mut removed = Vec::new();
        self.snapshot.notifications.retain(|n| {
            if wanted.contains(&n.id) {
                removed.push(n.id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.snapshot.recount();
            self.notify(&StoreChange::Removed(removed.clone()));
        }
        removed
    }

    /// Drop everything. Returns false when the store was already empty.
    pub fn clear(&mut self) -> bool {
        if self.snapshot.is_empty() && self.snapshot.unread_count == 0 {
            return false;
        }
        self.snapshot = Snapshot::default();
        self.notify(&StoreChange::Cleared);
        true
    }

    fn mark_where(&mut self, mut predicate: impl FnMut(&Notification) -> bool) -> Vec<NotificationId> {
        let mut changed = Vec::new();
        for n in self.snapshot.notifications.iter_mut() {
            if !n.read && predicate(n) {
                n.read = true;
                changed.push(n.id.clone());
            }
        }
        if !changed.is_empty() {
            self.snapshot.recount();
            self.notify(&StoreChange::MarkedRead(changed.clone()));
        }
        changed
    }

    fn merge_items(&mut self, items: Vec<Notification>) -> Option<StoreChange> {
        self.has_rich_data = true;
        let before = self.snapshot.clone();

        let mut inserted = Vec::new();
        let mut updated = Vec::new();
        for item in items {
            match self.merge_one(&item) {
                Merge::Inserted => inserted.push(item.id),
                Merge::Updated => {
                    if !updated.contains(&item.id) {
                        updated.push(item.id)
                    }
                }
                Merge::Unchanged => trace!(id = %item.id, "Duplicate delivery ignored"),
                Merge::Stale => {
                    debug!(id = %item.id, "Dropped stale delivery")
                }
            }
        }
        self.snapshot.recount();
        if self.snapshot == before {
            return None;
        }

        // Report inserted items in their final merged form.
        updated.retain(|id| !inserted.contains(id));
        let inserted = inserted
            .iter()
            .filter_map(|id| self.snapshot.get(id).cloned())
            .collect();
        Some(StoreChange::Merged { inserted, updated })
    }

    fn merge_one(&mut self, incoming: &Notification) -> Merge {
        let Some(at) = self.snapshot.position(&incoming.id) else {
            self.snapshot.insert_sorted(incoming.clone());
            return Merge::Inserted;
        };
        let existing = &self.snapshot.notifications[at];
        if existing == incoming {
            return Merge::Unchanged;
        }
        if is_stale(existing, incoming) {
            return Merge::Stale;
        }
        if existing.created_at == incoming.created_at {
            self.snapshot.notifications[at] = incoming.clone();
        } else {
            self.snapshot.notifications.remove(at);
            self.snapshot.insert_sorted(incoming.clone());
        }
        Merge::Updated
    }

    fn apply_count(&mut self, count: u32) -> Option<StoreChange> {
        if self.has_rich_data {
            trace!(count, local = self.snapshot.unread_count, "Count hint ignored, list is authoritative");
            return None;
        }
        if self.snapshot.unread_count == count {
            return None;
        }
        self.snapshot.unread_count = count;
        Some(StoreChange::CountHint(count))
    }

    fn refresh(&mut self, items: Vec<Notification>) -> Option<StoreChange> {
        self.has_rich_data = true;

        let mut local: HashMap<NotificationId, Notification> = self
            .snapshot
            .notifications
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        let mut seen = HashSet::new();
        let mut next = Vec::with_capacity(items.len());
        let mut inserted = 0;
        for item in items {
            if !seen.insert(item.id.clone()) {
                continue;
            }
            match local.remove(&item.id) {
                Some(existing) if is_stale(&existing, &item) => {
                    debug!(id = %item.id, "Kept local copy over stale server copy");
                    next.push(existing);
                }
                Some(_) => next.push(item),
                None => {
                    inserted += 1;
                    next.push(item);
                }
            }
        }
        let removed = local.len();
        next.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut resynced = Snapshot {
            notifications: next,
            unread_count: 0,
        };
        resynced.recount();
        if resynced == self.snapshot {
            return None;
        }
        debug!(
            total = resynced.len(),
            unread = resynced.unread_count,
            inserted,
            removed,
            "Store resynchronized"
        );
        self.snapshot = resynced;
        Some(StoreChange::Resynced { inserted, removed })
    }

    fn notify(&mut self, change: &StoreChange) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(change, &self.snapshot);
        }
    }
}

/// Whether `incoming` must not replace `existing`: it is an older version, or
/// an unread copy of the version already held as read.
fn is_stale(existing: &Notification, incoming: &Notification) -> bool {
    match incoming.effective_timestamp().cmp(&existing.effective_timestamp()) {
        Ordering::Less => true,
        Ordering::Equal => existing.read && !incoming.read,
        Ordering::Greater => false,
    }
}
