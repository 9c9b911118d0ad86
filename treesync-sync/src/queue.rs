//! Per-path rate-limited sync queue.
//!
//! Each path holds at most one pending change intent. Bursts of events for
//! the same path collapse into that intent, and a path is handed out at most
//! once per `interval`: the first change after a quiet period drains on the
//! next tick, later ones wait until `interval` has passed since the last
//! sync.
//!
//! Rename halves are paired here by correlation id. The destination inherits
//! the source's pending intent and rate-limit history, so a rename never
//! buys a path an early sync.
//!
//! A deletion waits until nothing beneath its path is pending, in flight or
//! the source of a rename, so a directory is removed after its contents.
//!
//! Time is `tokio::time::Instant` so tests can drive it with paused time.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use treesync_core::{ChangeEvent, ChangeKind, RelPath};

/// Collapsed intent for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    Created,
    Modified,
    Deleted,
    /// Content moved here from `from`; may also carry content changes.
    Renamed { from: RelPath },
}

/// One path handed out by [`SyncQueue::drain_ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub path: RelPath,
    pub latest_kind: PendingKind,
    pub last_enqueued_at: Instant,
    pub last_synced_at: Option<Instant>,
}

/// How a drained entry ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// The sync failed; put `kind` back, older than anything enqueued since.
    Requeue(PendingKind),
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<PendingKind>,
    last_enqueued_at: Option<Instant>,
    last_synced_at: Option<Instant>,
    in_flight: bool,
    /// Source held while this slot's rename is in flight.
    holding: Option<RelPath>,
}

#[derive(Debug)]
struct AwaitingRename {
    source: RelPath,
    prior: Option<PendingKind>,
    since: Instant,
}

#[derive(Debug)]
pub struct SyncQueue {
    interval: Duration,
    slots: HashMap<RelPath, Slot>,
    awaiting: HashMap<u64, AwaitingRename>,
    held: HashSet<RelPath>,
}

impl SyncQueue {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slots: HashMap::new(),
            awaiting: HashMap::new(),
            held: HashSet::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fold `event` into its path's pending intent.
    pub fn enqueue(&mut self, event: &ChangeEvent, now: Instant) {
        let path = &event.path;
        if path.is_reserved() {
            return;
        }
        match event.kind {
            ChangeKind::Created => self.push(path, PendingKind::Created, now),
            ChangeKind::Modified => self.push(path, PendingKind::Modified, now),
            ChangeKind::Deleted => self.push(path, PendingKind::Deleted, now),
            ChangeKind::RenamedFrom { correlation } => {
                let slot = self.slots.entry(path.clone()).or_default();
                let prior = slot.pending.replace(PendingKind::Deleted);
                slot.last_enqueued_at = Some(now);
                self.awaiting.insert(
                    correlation,
                    AwaitingRename {
                        source: path.clone(),
                        prior,
                        since: now,
                    },
                );
            }
            ChangeKind::RenamedTo { correlation } => match self.awaiting.remove(&correlation) {
                Some(half) => self.pair_rename(half, path, now),
                None => self.push(path, PendingKind::Created, now),
            },
        }
    }

    /// Intent currently pending for `path`, if any.
    pub fn pending_kind(&self, path: &RelPath) -> Option<&PendingKind> {
        self.slots.get(path).and_then(|slot| slot.pending.as_ref())
    }

    pub fn pending_len(&self) -> usize {
        self.slots.values().filter(|slot| slot.pending.is_some()).count()
    }

    pub fn in_flight_len(&self) -> usize {
        self.slots.values().filter(|slot| slot.in_flight).count()
    }

    /// Hand out every path whose rate-limit window has elapsed, oldest
    /// enqueue first. Drained paths are in flight until [`Self::finish`].
    pub fn drain_ready(&mut self, now: Instant) -> Vec<QueueEntry> {
        self.expire_awaiting(now);

        let mut sources: HashSet<RelPath> = self
            .slots
            .values()
            .filter_map(|slot| match &slot.pending {
                Some(PendingKind::Renamed { from }) => Some(from.clone()),
                _ => None,
            })
            .collect();
        sources.extend(self.awaiting.values().map(|half| half.source.clone()));

        let busy: Vec<&RelPath> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.pending.is_some() || slot.in_flight)
            .map(|(path, _)| path)
            .chain(sources.iter())
            .chain(self.held.iter())
            .collect();
        let has_busy_children =
            |dir: &RelPath| busy.iter().any(|other| *other != dir && other.starts_with(dir));

        let mut candidates: Vec<(Instant, RelPath)> = self
            .slots
            .iter()
            .filter(|(path, slot)| {
                slot.pending.is_some()
                    && !slot.in_flight
                    && !self.held.contains(*path)
                    && !sources.contains(*path)
                    && !(slot.pending == Some(PendingKind::Deleted) && has_busy_children(*path))
                    && self.window_elapsed(slot, now)
            })
            .map(|(path, slot)| (slot.last_enqueued_at.unwrap_or(now), path.clone()))
            .collect();
        candidates.sort();

        let mut ready = Vec::with_capacity(candidates.len());
        for (enqueued_at, path) in candidates {
            let Some(kind) = self.slots.get(&path).and_then(|slot| slot.pending.clone()) else {
                continue;
            };
            if let PendingKind::Renamed { from } = &kind {
                let source_busy = self.held.contains(from)
                    || self.slots.get(from).is_some_and(|slot| slot.in_flight);
                if source_busy {
                    continue;
                }
                self.held.insert(from.clone());
            }

            let Some(slot) = self.slots.get_mut(&path) else {
                continue;
            };
            let previous_sync = slot.last_synced_at;
            slot.pending = None;
            slot.in_flight = true;
            slot.last_synced_at = Some(now);
            slot.holding = match &kind {
                PendingKind::Renamed { from } => Some(from.clone()),
                _ => None,
            };
            ready.push(QueueEntry {
                path,
                latest_kind: kind,
                last_enqueued_at: enqueued_at,
                last_synced_at: previous_sync,
            });
        }

        self.purge_idle(now);
        if !ready.is_empty() {
            tracing::debug!(count = ready.len(), pending = self.pending_len(), "drained sync queue");
        }
        ready
    }

    /// Mark a drained path as no longer in flight.
    pub fn finish(&mut self, path: &RelPath, completion: Completion, now: Instant) {
        let Some(slot) = self.slots.get_mut(path) else {
            return;
        };
        slot.in_flight = false;
        if let Some(source) = slot.holding.take() {
            self.held.remove(&source);
        }
        if let Completion::Requeue(kind) = completion {
            let newer = slot.pending.take();
            let merged = match newer {
                None => {
                    if slot.last_enqueued_at.is_none() {
                        slot.last_enqueued_at = Some(now);
                    }
                    (kind, None)
                }
                Some(newer) => merge(Some(kind), newer),
            };
            slot.pending = Some(merged.0);
            if let Some(displaced) = merged.1 {
                self.displace(&displaced, now);
            }
        }
    }

    fn window_elapsed(&self, slot: &Slot, now: Instant) -> bool {
        match slot.last_synced_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        }
    }

    fn push(&mut self, path: &RelPath, incoming: PendingKind, now: Instant) {
        let slot = self.slots.entry(path.clone()).or_default();
        let (kind, displaced) = merge(slot.pending.take(), incoming);
        slot.pending = Some(kind);
        slot.last_enqueued_at = Some(now);
        if let Some(displaced) = displaced {
            self.displace(&displaced, now);
        }
    }

    fn pair_rename(&mut self, half: AwaitingRename, dest: &RelPath, now: Instant) {
        let AwaitingRename { source, prior, .. } = half;
        if source == *dest {
            // Renamed onto itself: nothing moved.
            let slot = self.slots.entry(source).or_default();
            slot.pending = prior;
            return;
        }

        let (mut dest_kind, mut source_kind) = match prior {
            None | Some(PendingKind::Modified) => (
                PendingKind::Renamed {
                    from: source.clone(),
                },
                None,
            ),
            Some(PendingKind::Created) | Some(PendingKind::Deleted) => {
                (PendingKind::Created, Some(PendingKind::Deleted))
            }
            Some(PendingKind::Renamed { from }) if from == *dest => {
                (PendingKind::Modified, Some(PendingKind::Deleted))
            }
            Some(PendingKind::Renamed { from }) => {
                (PendingKind::Renamed { from }, Some(PendingKind::Deleted))
            }
        };

        // Another pending rename still reads from `dest`; moving content onto
        // it now would close a cycle, so fall back to a content sync.
        let mut orphaned = None;
        let dest_is_source = self.slots.iter().any(|(path, slot)| {
            path != dest && matches!(&slot.pending, Some(PendingKind::Renamed { from }) if from == dest)
        });
        if dest_is_source {
            if let PendingKind::Renamed { from } = &dest_kind {
                if *from == source {
                    source_kind = Some(PendingKind::Deleted);
                } else {
                    orphaned = Some(from.clone());
                }
            }
            dest_kind = PendingKind::Modified;
        }

        let source_synced = self.slots.get(&source).and_then(|slot| slot.last_synced_at);
        if let Some(slot) = self.slots.get_mut(&source) {
            slot.pending = source_kind;
        }

        let slot = self.slots.entry(dest.clone()).or_default();
        let (kind, displaced) = merge(slot.pending.take(), dest_kind);
        slot.pending = Some(kind);
        slot.last_enqueued_at = Some(now);
        slot.last_synced_at = slot.last_synced_at.max(source_synced);

        for path in displaced.into_iter().chain(orphaned) {
            self.displace(&path, now);
        }
    }

    /// `path`'s remote copy lost the rename that would have consumed it;
    /// make sure it gets deleted unless something else is already pending.
    fn displace(&mut self, path: &RelPath, now: Instant) {
        let slot = self.slots.entry(path.clone()).or_default();
        if slot.pending.is_none() {
            slot.pending = Some(PendingKind::Deleted);
            slot.last_enqueued_at = Some(now);
        }
    }

    /// Rename halves whose partner never arrived degrade to a plain delete.
    fn expire_awaiting(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .awaiting
            .iter()
            .filter(|(_, half)| now.saturating_duration_since(half.since) >= self.interval)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(half) = self.awaiting.remove(&id) {
                tracing::debug!(path = %half.source, "rename source never paired; deleting");
                if let Some(PendingKind::Renamed { from }) = half.prior {
                    self.displace(&from, now);
                }
            }
        }
    }

    fn purge_idle(&mut self, now: Instant) {
        let interval = self.interval;
        let held = &self.held;
        self.slots.retain(|path, slot| {
            slot.pending.is_some()
                || slot.in_flight
                || held.contains(path)
                || slot
                    .last_synced_at
                    .is_some_and(|at| now.saturating_duration_since(at) < interval)
        });
    }
}

/// Collapse `incoming` into `existing`. The second value is a rename source
/// whose pending move was dropped by the merge.
fn merge(existing: Option<PendingKind>, incoming: PendingKind) -> (PendingKind, Option<RelPath>) {
    use PendingKind::*;
    match (existing, incoming) {
        (Some(Renamed { from }), Deleted) => (Deleted, Some(from)),
        (_, Deleted) => (Deleted, None),
        (None, kind) => (kind, None),
        (Some(Created), Created | Modified) => (Created, None),
        (Some(Renamed { from }), Created | Modified) => (Renamed { from }, None),
        (Some(Modified | Deleted), Created | Modified) => (Modified, None),
        (Some(Renamed { from: old }), Renamed { from }) => {
            let displaced = (old != from).then_some(old);
            (Renamed { from }, displaced)
        }
        (Some(_), Renamed { from }) => (Renamed { from }, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn p(s: &str) -> RelPath {
        RelPath::new(s).expect("path")
    }

    fn event(path: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::new(p(path), kind)
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[rstest]
    #[case(None, PendingKind::Modified, PendingKind::Modified)]
    #[case(Some(PendingKind::Created), PendingKind::Modified, PendingKind::Created)]
    #[case(Some(PendingKind::Deleted), PendingKind::Created, PendingKind::Modified)]
    #[case(Some(PendingKind::Modified), PendingKind::Deleted, PendingKind::Deleted)]
    #[case(Some(PendingKind::Created), PendingKind::Deleted, PendingKind::Deleted)]
    fn merge_table(
        #[case] existing: Option<PendingKind>,
        #[case] incoming: PendingKind,
        #[case] expected: PendingKind,
    ) {
        assert_eq!(merge(existing, incoming), (expected, None));
    }

    #[test]
    fn deleting_a_rename_destination_displaces_its_source() {
        let (kind, displaced) = merge(Some(PendingKind::Renamed { from: p("a") }), PendingKind::Deleted);
        assert_eq!(kind, PendingKind::Deleted);
        assert_eq!(displaced, Some(p("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn first_change_drains_immediately_then_rate_limited() {
        let mut queue = SyncQueue::new(MINUTE);
        queue.enqueue(&event("f", ChangeKind::Modified), Instant::now());
        let first = queue.drain_ready(Instant::now());
        assert_eq!(first.len(), 1);
        queue.finish(&p("f"), Completion::Done, Instant::now());

        tokio::time::advance(Duration::from_secs(10)).await;
        queue.enqueue(&event("f", ChangeKind::Modified), Instant::now());
        queue.enqueue(&event("f", ChangeKind::Modified), Instant::now());
        assert!(queue.drain_ready(Instant::now()).is_empty());
        assert_eq!(queue.pending_kind(&p("f")), Some(&PendingKind::Modified));

        tokio::time::advance(Duration::from_secs(50)).await;
        let second = queue.drain_ready(Instant::now());
        assert_eq!(second.len(), 1);
        assert!(second[0].last_synced_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_path_is_not_drained_twice() {
        let mut queue = SyncQueue::new(Duration::ZERO);
        queue.enqueue(&event("f", ChangeKind::Created), Instant::now());
        assert_eq!(queue.drain_ready(Instant::now()).len(), 1);
        queue.enqueue(&event("f", ChangeKind::Modified), Instant::now());
        assert!(queue.drain_ready(Instant::now()).is_empty());
        queue.finish(&p("f"), Completion::Done, Instant::now());
        assert_eq!(queue.drain_ready(Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_is_older_than_newer_events() {
        let mut queue = SyncQueue::new(Duration::ZERO);
        queue.enqueue(&event("f", ChangeKind::Created), Instant::now());
        queue.drain_ready(Instant::now());
        queue.enqueue(&event("f", ChangeKind::Deleted), Instant::now());
        queue.finish(&p("f"), Completion::Requeue(PendingKind::Created), Instant::now());
        assert_eq!(queue.pending_kind(&p("f")), Some(&PendingKind::Deleted));
    }

    #[tokio::test(start_paused = true)]
    async fn paired_rename_inherits_history() {
        let mut queue = SyncQueue::new(MINUTE);
        queue.enqueue(&event("a", ChangeKind::Modified), Instant::now());
        queue.drain_ready(Instant::now());
        queue.finish(&p("a"), Completion::Done, Instant::now());

        tokio::time::advance(Duration::from_secs(5)).await;
        let now = Instant::now();
        queue.enqueue(&event("a", ChangeKind::RenamedFrom { correlation: 1 }), now);
        queue.enqueue(&event("b", ChangeKind::RenamedTo { correlation: 1 }), now);

        assert_eq!(queue.pending_kind(&p("a")), None);
        assert_eq!(
            queue.pending_kind(&p("b")),
            Some(&PendingKind::Renamed { from: p("a") })
        );
        assert!(queue.drain_ready(now).is_empty(), "rate limit carries over");

        tokio::time::advance(MINUTE).await;
        let ready = queue.drain_ready(Instant::now());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].path, p("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn rename_of_unsynced_file_becomes_create() {
        let mut queue = SyncQueue::new(MINUTE);
        let now = Instant::now();
        queue.enqueue(&event("a", ChangeKind::Created), now);
        queue.enqueue(&event("a", ChangeKind::RenamedFrom { correlation: 9 }), now);
        queue.enqueue(&event("b", ChangeKind::RenamedTo { correlation: 9 }), now);
        assert_eq!(queue.pending_kind(&p("b")), Some(&PendingKind::Created));
        assert_eq!(queue.pending_kind(&p("a")), Some(&PendingKind::Deleted));
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_rename_to_is_a_create() {
        let mut queue = SyncQueue::new(MINUTE);
        queue.enqueue(&event("b", ChangeKind::RenamedTo { correlation: 3 }), Instant::now());
        assert_eq!(queue.pending_kind(&p("b")), Some(&PendingKind::Created));
    }

    #[tokio::test(start_paused = true)]
    async fn rename_source_waits_for_its_rename() {
        let mut queue = SyncQueue::new(Duration::ZERO);
        let now = Instant::now();
        queue.enqueue(&event("a", ChangeKind::RenamedFrom { correlation: 1 }), now);
        queue.enqueue(&event("b", ChangeKind::RenamedTo { correlation: 1 }), now);
        queue.enqueue(&event("a", ChangeKind::Created), now);

        let ready = queue.drain_ready(now);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].path, p("b"));
        assert!(queue.drain_ready(now).is_empty(), "source held while rename in flight");

        queue.finish(&p("b"), Completion::Done, now);
        let ready = queue.drain_ready(now);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].path, p("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn swap_through_temp_does_not_deadlock() {
        let mut queue = SyncQueue::new(Duration::ZERO);
        let now = Instant::now();
        let renames = [("a", "t", 1), ("b", "a", 2), ("t", "b", 3)];
        for (from, to, id) in renames {
            queue.enqueue(&event(from, ChangeKind::RenamedFrom { correlation: id }), now);
            queue.enqueue(&event(to, ChangeKind::RenamedTo { correlation: id }), now);
        }

        let mut synced = Vec::new();
        for _ in 0..4 {
            for entry in queue.drain_ready(now) {
                queue.finish(&entry.path, Completion::Done, now);
                synced.push(entry.path.to_string());
            }
        }
        synced.sort();
        // `t` only carries a no-op delete; `a` falls back to a content sync.
        assert_eq!(synced, vec!["a", "b", "t"]);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_orders_by_enqueue_time() {
        let mut queue = SyncQueue::new(Duration::ZERO);
        queue.enqueue(&event("z", ChangeKind::Created), Instant::now());
        tokio::time::advance(Duration::from_millis(1)).await;
        queue.enqueue(&event("a", ChangeKind::Created), Instant::now());
        let order: Vec<String> = queue
            .drain_ready(Instant::now())
            .into_iter()
            .map(|e| e.path.to_string())
            .collect();
        assert_eq!(order, vec!["z", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn directory_delete_waits_for_its_contents() {
        let mut queue = SyncQueue::new(Duration::ZERO);
        let now = Instant::now();
        queue.enqueue(&event("d/x", ChangeKind::RenamedFrom { correlation: 1 }), now);
        queue.enqueue(&event("e/x", ChangeKind::RenamedTo { correlation: 1 }), now);
        queue.enqueue(&event("d/y", ChangeKind::Deleted), now);
        queue.enqueue(&event("d", ChangeKind::Deleted), now);

        let first: Vec<String> = queue.drain_ready(now).iter().map(|e| e.path.to_string()).collect();
        assert_eq!(first, vec!["d/y", "e/x"]);
        assert!(queue.drain_ready(now).is_empty(), "d drained while its contents were in flight");

        queue.finish(&p("d/y"), Completion::Done, now);
        queue.finish(&p("e/x"), Completion::Done, now);
        let second: Vec<String> = queue.drain_ready(now).iter().map(|e| e.path.to_string()).collect();
        assert_eq!(second, vec!["d"]);
    }
}
