//! Synchronous detector core: turns raw notify events and full scans into
//! canonical [`ChangeEvent`]s.
//!
//! `known` is the detector's picture of the tree: every directory and regular
//! file it has reported (or was seeded with), with size, mtime and, once
//! hashed, chunk fingerprints. Events are emitted only when that picture
//! changes, so a burst of notify events for one write becomes at most one
//! `Modified`.
//!
//! Files that vanish without a paired rename event are held as departures,
//! and newly appeared files as arrivals, for one rename window. [`settle`]
//! hashes what it has not hashed yet and pairs arrivals with departures of
//! identical content into a rename; whatever is left over when the window
//! ends becomes `Created` or `Deleted`.
//!
//! [`settle`]: DetectorState::settle

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};

use treesync_core::{
    ChangeEvent, ChangeKind, ChunkFingerprint, ChunkStore, EntryKind, Manifest, RelPath, SyncConfig,
};

use crate::DetectorError;

/// What the detector last knew about one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// `None` for directories, and for files until they are hashed.
    pub chunks: Option<Vec<ChunkFingerprint>>,
}

impl KnownEntry {
    fn directory(mtime: DateTime<Utc>) -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mtime,
            chunks: None,
        }
    }

    fn file(size: u64, mtime: DateTime<Utc>) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mtime,
            chunks: None,
        }
    }

    fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Whether `self` (gone) and `other` (new) hold the same bytes. Without
    /// fingerprints for `self`, an unchanged mtime stands in for them, since
    /// a rename keeps it.
    fn same_file(&self, other: &KnownEntry) -> bool {
        if self.is_dir() || other.is_dir() || self.size != other.size {
            return false;
        }
        match (&self.chunks, &other.chunks) {
            (Some(a), Some(b)) => a == b,
            (None, _) => self.mtime == other.mtime,
            (Some(_), None) => false,
        }
    }
}

/// A known entry that left the tree without a rename partner yet.
#[derive(Debug)]
struct Departure {
    path: RelPath,
    /// Path named by the event; differs from `path` for a directory's contents.
    origin: RelPath,
    entry: KnownEntry,
    tracker: Option<usize>,
    at: Instant,
}

#[derive(Debug)]
pub struct DetectorState {
    root: PathBuf,
    chunks: ChunkStore,
    rename_window: Duration,
    known: HashMap<RelPath, KnownEntry>,
    /// Files in `known` that appeared but were not reported yet.
    arrivals: HashMap<RelPath, Instant>,
    departures: Vec<Departure>,
    /// Files in `known` whose fingerprints are still missing.
    unhashed: BTreeSet<RelPath>,
    next_correlation: u64,
}

impl DetectorState {
    /// `root` must already be canonical so event paths strip cleanly.
    pub fn new(root: &Path, config: &SyncConfig, seed: &[Manifest]) -> Self {
        let known = seed
            .iter()
            .map(|m| {
                let entry = if m.is_dir() {
                    KnownEntry::directory(m.mtime)
                } else {
                    KnownEntry {
                        chunks: (m.chunk_size == config.chunk_size).then(|| m.chunks.clone()),
                        ..KnownEntry::file(m.size, m.mtime)
                    }
                };
                (m.path.clone(), entry)
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            chunks: ChunkStore::new(config.chunk_size),
            rename_window: config.rename_window(),
            known,
            arrivals: HashMap::new(),
            departures: Vec::new(),
            unhashed: BTreeSet::new(),
            next_correlation: 1,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn known(&self, path: &RelPath) -> Option<&KnownEntry> {
        self.known.get(path)
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    /// Nothing is held or waiting to be hashed, so [`Self::settle`] has no
    /// work to do.
    pub fn is_settled(&self) -> bool {
        self.arrivals.is_empty() && self.departures.is_empty() && self.unhashed.is_empty()
    }

    /// Fold one notify event into the known tree.
    pub fn observe(&mut self, event: &Event, now: Instant) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        match &event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.appeared(path, now, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
                self.renamed(&event.paths[0], &event.paths[1], now, &mut out);
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    if let Some(rel) = self.rel(path) {
                        self.depart(&rel, event.tracker(), now);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    let partner = event
                        .tracker()
                        .and_then(|tracker| self.origin_of(tracker).map(|from| (tracker, from)));
                    match (partner, self.rel(path)) {
                        (Some((tracker, from)), Some(to)) => {
                            self.restore(tracker);
                            self.renamed_rel(&from, &to, path, now, &mut out);
                        }
                        _ => self.appeared(path, now, &mut out),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.exists() {
                        self.appeared(path, now, &mut out);
                    } else if let Some(rel) = self.rel(path) {
                        self.depart(&rel, None, now);
                    }
                }
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    if path.is_file() {
                        self.appeared(path, now, &mut out);
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    if let Some(rel) = self.rel(path) {
                        self.depart(&rel, None, now);
                    }
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
        out
    }

    /// Hash newly seen files, pair held arrivals with departures of the same
    /// content, and report whatever the rename window has given up on.
    ///
    /// Blocking: reads every file that still lacks fingerprints.
    pub fn settle(&mut self, now: Instant) -> Vec<ChangeEvent> {
        self.hash_pending();
        let mut out = Vec::new();
        self.pair_held(&mut out);

        let window = self.rename_window;
        let mut arrived: Vec<RelPath> = self
            .arrivals
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        arrived.sort();
        for path in arrived {
            self.arrivals.remove(&path);
            if self.known.contains_key(&path) {
                out.push(ChangeEvent::new(path, ChangeKind::Created));
            }
        }

        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.departures)
            .into_iter()
            .partition(|gone| now.saturating_duration_since(gone.at) >= window);
        self.departures = waiting;
        let mut expired: Vec<RelPath> = expired.into_iter().map(|gone| gone.path).collect();
        // Contents before their directory.
        expired.sort_by(|a, b| b.cmp(a));
        for path in expired {
            tracing::debug!(path = %path, "left the tree");
            out.push(ChangeEvent::new(path, ChangeKind::Deleted));
        }
        out
    }

    /// Walk the whole tree and report everything that differs from `known`.
    ///
    /// Files whose size and mtime are unchanged are not re-hashed. A created
    /// file with the same content as a vanished one is reported as a rename.
    /// Entries that cannot be read are left alone.
    pub fn scan(&mut self) -> Result<Vec<ChangeEvent>, DetectorError> {
        let mut found = Vec::new();
        let mut unreadable = Vec::new();
        walk(&self.root, &self.root, &mut found, &mut unreadable).map_err(|source| {
            DetectorError::RootInaccessible {
                path: self.root.clone(),
                source,
            }
        })?;
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        let mut seen = HashSet::with_capacity(found.len());
        let mut created = Vec::new();
        for (rel, meta) in found {
            seen.insert(rel.clone());
            let Some((size, mtime)) = stat(&meta) else {
                continue;
            };
            self.return_departed(&rel);
            if meta.is_dir() {
                match self.known.get(&rel) {
                    Some(known) if known.is_dir() => {}
                    Some(_) => {
                        self.known.insert(rel.clone(), KnownEntry::directory(mtime));
                        out.push(ChangeEvent::new(rel, ChangeKind::Modified));
                    }
                    None => {
                        self.known.insert(rel.clone(), KnownEntry::directory(mtime));
                        out.push(ChangeEvent::new(rel, ChangeKind::Created));
                    }
                }
                continue;
            }
            let unchanged = self
                .known
                .get(&rel)
                .is_some_and(|known| !known.is_dir() && known.size == size && known.mtime == mtime);
            if unchanged && self.known.get(&rel).is_some_and(|known| known.chunks.is_some()) {
                continue;
            }

            let file = match self.hash(&rel) {
                Some(file) => file,
                None => continue,
            };
            self.unhashed.remove(&rel);
            let same_bytes = |known: &KnownEntry| {
                !known.is_dir() && known.size == file.size && known.chunks == file.chunks
            };
            match self.known.get(&rel) {
                Some(known) if unchanged || same_bytes(known) => {
                    // Touched, not changed.
                    self.known.insert(rel, file);
                }
                Some(_) if self.arrivals.contains_key(&rel) => {
                    self.known.insert(rel, file);
                }
                Some(_) => {
                    self.known.insert(rel.clone(), file);
                    out.push(ChangeEvent::new(rel, ChangeKind::Modified));
                }
                None => created.push((rel, file)),
            }
        }

        let mut gone: Vec<RelPath> = self
            .known
            .keys()
            .filter(|path| !seen.contains(*path) && !unreadable.iter().any(|dir| path.starts_with(dir)))
            .cloned()
            .collect();
        gone.sort();

        for (rel, file) in created {
            let partner = gone
                .iter()
                .position(|old| self.known.get(old).is_some_and(|k| k.same_file(&file)));
            match partner {
                Some(index) => {
                    let from = gone.remove(index);
                    self.forget(&from);
                    self.push_rename(&from, &rel, &mut out);
                }
                None => out.push(ChangeEvent::new(rel.clone(), ChangeKind::Created)),
            }
            self.known.insert(rel, file);
        }
        // Contents before their directory.
        for path in gone.into_iter().rev() {
            if self.forget(&path) {
                out.push(ChangeEvent::new(path, ChangeKind::Deleted));
            }
        }
        self.pair_held(&mut out);

        if !out.is_empty() {
            tracing::info!(changes = out.len(), entries = self.known.len(), "scan found changes");
        }
        Ok(out)
    }

    fn rel(&self, host: &Path) -> Option<RelPath> {
        RelPath::from_fs(&self.root, host)
            .ok()
            .filter(|rel| !rel.is_reserved())
    }

    fn hash(&self, rel: &RelPath) -> Option<KnownEntry> {
        match self.chunks.scan_file(&rel.to_fs(&self.root)) {
            Ok(state) => Some(KnownEntry {
                kind: EntryKind::File,
                size: state.size,
                mtime: state.mtime,
                chunks: Some(state.chunks),
            }),
            Err(err) => {
                tracing::debug!(path = %rel, error = %err, "skipping unreadable file");
                None
            }
        }
    }

    /// Fill in fingerprints for files seen through events. A file that has
    /// changed again since it was seen keeps waiting for its next event.
    fn hash_pending(&mut self) {
        for rel in std::mem::take(&mut self.unhashed) {
            let Some(file) = self.hash(&rel) else {
                continue;
            };
            if let Some(known) = self.known.get_mut(&rel) {
                if !known.is_dir() && known.size == file.size && known.mtime == file.mtime {
                    known.chunks = file.chunks;
                }
            }
        }
    }

    /// Pair held arrivals with held departures of the same content.
    fn pair_held(&mut self, out: &mut Vec<ChangeEvent>) {
        let mut arrived: Vec<RelPath> = self.arrivals.keys().cloned().collect();
        arrived.sort();
        for path in arrived {
            let Some(file) = self.known.get(&path).filter(|file| file.chunks.is_some()) else {
                continue;
            };
            let Some(index) = self.departures.iter().position(|gone| gone.entry.same_file(file)) else {
                continue;
            };
            let gone = self.departures.remove(index);
            self.arrivals.remove(&path);
            self.push_rename(&gone.path, &path, out);
        }
    }

    /// Drop `path` from `known` and anything held for it. Returns whether it
    /// had been reported.
    fn forget(&mut self, path: &RelPath) -> bool {
        self.unhashed.remove(path);
        let reported = self.arrivals.remove(path).is_none();
        self.known.remove(path).is_some() && reported
    }

    fn appeared(&mut self, host: &Path, now: Instant, out: &mut Vec<ChangeEvent>) {
        let Some(rel) = self.rel(host) else {
            return;
        };
        let Ok(meta) = fs::symlink_metadata(host) else {
            return;
        };
        if meta.is_dir() {
            self.appeared_entry(rel, &meta, now, out);
            let mut found = Vec::new();
            let mut unreadable = Vec::new();
            if walk(&self.root, host, &mut found, &mut unreadable).is_err() {
                return;
            }
            found.sort_by(|a, b| a.0.cmp(&b.0));
            for (rel, meta) in found {
                self.appeared_entry(rel, &meta, now, out);
            }
        } else if meta.is_file() {
            self.appeared_entry(rel, &meta, now, out);
        }
    }

    fn appeared_entry(
        &mut self,
        rel: RelPath,
        meta: &Metadata,
        now: Instant,
        out: &mut Vec<ChangeEvent>,
    ) {
        let Some((size, mtime)) = stat(meta) else {
            return;
        };
        self.return_departed(&rel);

        if meta.is_dir() {
            let unreported = self.arrivals.contains_key(&rel);
            let kind = match self.known.get(&rel) {
                Some(known) if known.is_dir() => return,
                Some(_) if !unreported => ChangeKind::Modified,
                _ => ChangeKind::Created,
            };
            self.unhashed.remove(&rel);
            self.arrivals.remove(&rel);
            self.known.insert(rel.clone(), KnownEntry::directory(mtime));
            out.push(ChangeEvent::new(rel, kind));
            return;
        }

        let kind = match self.known.get(&rel) {
            Some(known) if !known.is_dir() && known.size == size && known.mtime == mtime => return,
            Some(_) if self.arrivals.contains_key(&rel) => None,
            Some(_) => Some(ChangeKind::Modified),
            None => {
                self.arrivals.insert(rel.clone(), now);
                None
            }
        };
        self.known.insert(rel.clone(), KnownEntry::file(size, mtime));
        self.unhashed.insert(rel.clone());
        if let Some(kind) = kind {
            out.push(ChangeEvent::new(rel, kind));
        }
    }

    /// `rel` left the tree: hold it, and everything known beneath it, as
    /// departures.
    fn depart(&mut self, rel: &RelPath, tracker: Option<usize>, now: Instant) {
        let mut beneath: Vec<RelPath> = self
            .known
            .keys()
            .filter(|path| path.starts_with(rel))
            .cloned()
            .collect();
        beneath.sort();
        for path in beneath {
            self.unhashed.remove(&path);
            let unreported = self.arrivals.remove(&path).is_some();
            let Some(entry) = self.known.remove(&path) else {
                continue;
            };
            if unreported {
                continue;
            }
            self.departures.push(Departure {
                path,
                origin: rel.clone(),
                entry,
                tracker,
                at: now,
            });
        }
    }

    /// Removed and re-created in place: take back what was there, so the new
    /// entry is compared against it instead of reported as new.
    fn return_departed(&mut self, rel: &RelPath) {
        if self.known.contains_key(rel) {
            return;
        }
        if let Some(index) = self.departures.iter().position(|gone| &gone.path == rel) {
            let gone = self.departures.remove(index);
            self.known.insert(gone.path, gone.entry);
        }
    }

    /// Origin of the departures carrying `tracker`, if any.
    fn origin_of(&self, tracker: usize) -> Option<RelPath> {
        self.departures
            .iter()
            .find(|gone| gone.tracker == Some(tracker))
            .map(|gone| gone.origin.clone())
    }

    /// Put the departures carrying `tracker` back into `known`.
    fn restore(&mut self, tracker: usize) {
        let (back, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.departures)
            .into_iter()
            .partition(|gone| gone.tracker == Some(tracker));
        self.departures = rest;
        for gone in back {
            if !gone.entry.is_dir() && gone.entry.chunks.is_none() {
                self.unhashed.insert(gone.path.clone());
            }
            self.known.insert(gone.path, gone.entry);
        }
    }

    fn renamed(&mut self, from: &Path, to: &Path, now: Instant, out: &mut Vec<ChangeEvent>) {
        match (self.rel(from), self.rel(to)) {
            (Some(from), Some(to_rel)) => self.renamed_rel(&from, &to_rel, to, now, out),
            (Some(from), None) => self.depart(&from, None, now),
            (None, Some(_)) => self.appeared(to, now, out),
            (None, None) => {}
        }
    }

    /// Re-key `from` (a file or a whole directory) to `to`. Files become
    /// rename pairs; directories are created at `to` and deleted at `from`.
    fn renamed_rel(
        &mut self,
        from: &RelPath,
        to: &RelPath,
        to_host: &Path,
        now: Instant,
        out: &mut Vec<ChangeEvent>,
    ) {
        let mut moves: Vec<(RelPath, RelPath)> = self
            .known
            .keys()
            .filter_map(|path| path.rebase(from, to).map(|dest| (path.clone(), dest)))
            .collect();
        if moves.is_empty() {
            self.appeared(to_host, now, out);
            return;
        }
        moves.sort();

        let mut removed_dirs = Vec::new();
        for (old, new) in moves {
            let unreported = self.arrivals.remove(&old).is_some();
            let pending_hash = self.unhashed.remove(&old);
            let Some(entry) = self.known.remove(&old) else {
                continue;
            };
            if entry.is_dir() {
                self.known.insert(new.clone(), entry);
                out.push(ChangeEvent::new(new, ChangeKind::Created));
                removed_dirs.push(old);
                continue;
            }
            self.known.insert(new.clone(), entry);
            if pending_hash {
                self.unhashed.insert(new.clone());
            }
            if unreported {
                self.arrivals.insert(new, now);
            } else {
                self.push_rename(&old, &new, out);
            }
        }
        for dir in removed_dirs.into_iter().rev() {
            out.push(ChangeEvent::new(dir, ChangeKind::Deleted));
        }
    }

    fn push_rename(&mut self, from: &RelPath, to: &RelPath, out: &mut Vec<ChangeEvent>) {
        let correlation = self.next_correlation;
        self.next_correlation += 1;
        out.push(ChangeEvent::new(from.clone(), ChangeKind::RenamedFrom { correlation }));
        out.push(ChangeEvent::new(to.clone(), ChangeKind::RenamedTo { correlation }));
    }
}

fn stat(meta: &Metadata) -> Option<(u64, DateTime<Utc>)> {
    let mtime = meta.modified().ok()?;
    Some((if meta.is_dir() { 0 } else { meta.len() }, mtime.into()))
}

/// Collect directories and regular files beneath `dir`. Only a failure to
/// list `dir` itself is an error; unreadable subdirectories are recorded and
/// skipped.
fn walk(
    root: &Path,
    dir: &Path,
    found: &mut Vec<(RelPath, Metadata)>,
    unreadable: &mut Vec<RelPath>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let Ok(rel) = RelPath::from_fs(root, &path) else {
            continue;
        };
        if rel.is_reserved() {
            continue;
        }
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(_) => {
                unreadable.push(rel);
                continue;
            }
        };
        if meta.is_dir() {
            if walk(root, &path, found, unreadable).is_err() {
                unreadable.push(rel.clone());
            }
            found.push((rel, meta));
        } else if meta.is_file() {
            found.push((rel, meta));
        }
    }
    Ok(())
}
