// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Filesystem watching with per-directory registration.
//!
//! Every directory under the root is registered individually, non-recursive,
//! so ignored subtrees (`vendor`, `.git`, dependency caches) are never
//! registered at all. Directories created while watching are added to the
//! watch set as their creation events arrive.
//!
//! The notify callback is kept lightweight: raw events cross into async code
//! over a bounded channel, and all path filtering happens on the consumer
//! side in [`FileWatcher::next_change`].

use crate::{
    config::WatchConfig,
    errors::{CreateWatcherError, WatchError},
    pattern::PatternSet,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};
use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, event::ModifyKind,
};
use std::{
    collections::{HashSet, VecDeque},
    fmt, fs,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Capacity of the channel between the notify callback and async code.
const RAW_EVENT_BUFFER: usize = 1024;

/// The kind of change observed for a path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileChangeKind {
    /// The path came into existence.
    Created,

    /// The path's contents changed.
    Modified,

    /// The path was deleted.
    Removed,

    /// The path was renamed; the event names either side of the rename.
    Renamed,
}

impl FileChangeKind {
    /// Returns the lowercase display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Removed => "removed",
            Self::Renamed => "renamed",
        }
    }
}

impl fmt::Display for FileChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change to a file under the watch root that passed the filters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileChangeEvent {
    /// The absolute path that changed, under the canonicalized root.
    pub path: Utf8PathBuf,

    /// The kind of change.
    pub kind: FileChangeKind,

    /// When the change was observed.
    pub timestamp: DateTime<FixedOffset>,
}

/// Path filters derived from configuration.
#[derive(Clone, Debug)]
pub struct WatchFilter {
    include: PatternSet,
    exclude: PatternSet,
    ignore_dirs: PatternSet,
}

impl WatchFilter {
    /// Derives the filter set from configuration.
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            include: PatternSet::new(&config.include),
            exclude: PatternSet::new(&config.exclude),
            ignore_dirs: PatternSet::new(&config.ignore_dirs),
        }
    }

    /// Returns true if a change to `path` should trigger a run. An empty
    /// include list matches every file; excludes always win.
    pub fn is_relevant(&self, path: &Utf8Path) -> bool {
        if !self.include.is_empty() && !self.include.matches_path(path) {
            return false;
        }
        !self.exclude.matches_path(path)
    }

    /// Returns true if a directory must not be registered for watching.
    /// Hidden directories are always skipped.
    fn skip_dir(&self, dir: &Utf8Path) -> bool {
        if dir.file_name().is_some_and(|name| name.starts_with('.')) {
            return true;
        }
        self.ignore_dirs.matches_dir(dir)
    }
}

/// Watches a directory tree and yields filtered [`FileChangeEvent`]s.
///
/// Construction is all-or-nothing: the full tree walk and every watch
/// registration must succeed, or an error is returned and nothing is left
/// watching. Dropping the watcher stops the backend.
#[derive(Debug)]
pub struct FileWatcher {
    /// Kept alive to maintain the watch subscriptions.
    watcher: RecommendedWatcher,

    raw_events: mpsc::Receiver<notify::Result<Event>>,

    /// Filtered events and asynchronous errors not yet handed out.
    pending: VecDeque<Result<FileChangeEvent, WatchError>>,

    filter: WatchFilter,

    /// The canonicalized watch root.
    root: Utf8PathBuf,

    /// Directories currently registered, as root-relative paths.
    registered: HashSet<Utf8PathBuf>,
}

impl FileWatcher {
    /// Builds a watcher over `root`, registering every non-ignored
    /// directory in the tree.
    pub fn new(root: &Utf8Path, filter: WatchFilter) -> Result<Self, CreateWatcherError> {
        let canonical = root
            .canonicalize_utf8()
            .map_err(|_| CreateWatcherError::RootNotFound {
                root: root.to_owned(),
            })?;
        if !canonical.is_dir() {
            return Err(CreateWatcherError::RootNotDirectory {
                root: root.to_owned(),
            });
        }

        let (raw_tx, raw_events) = mpsc::channel(RAW_EVENT_BUFFER);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Dropping an event beats blocking the notify thread; the
                // channel only fills up when the consumer has stalled.
                if raw_tx.try_send(res).is_err() {
                    warn!("filesystem event channel full, dropping event");
                }
            },
            Config::default(),
        )
        .map_err(|error| CreateWatcherError::Init { error })?;

        let mut this = Self {
            watcher,
            raw_events,
            pending: VecDeque::new(),
            filter,
            root: canonical,
            registered: HashSet::new(),
        };
        this.register_initial()?;
        debug!(root = %this.root, dirs = this.registered.len(), "watch registration complete");
        Ok(this)
    }

    /// The canonicalized root being watched.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The number of directories currently registered.
    pub fn watched_dirs(&self) -> usize {
        self.registered.len()
    }

    /// Yields the next filtered change or asynchronous watch error.
    ///
    /// Returns `None` once the backend stream has ended; no further events
    /// will ever arrive. Cancel-safe.
    pub async fn next_change(&mut self) -> Option<Result<FileChangeEvent, WatchError>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            let raw = self.raw_events.recv().await?;
            match raw {
                Ok(event) => self.process(event),
                Err(error) => self.pending.push_back(Err(WatchError::Notify { error })),
            }
        }
    }

    /// Stops watching. Dropping the watcher has the same effect; this makes
    /// the intent explicit at shutdown call sites.
    pub fn close(self) {}

    fn register_initial(&mut self) -> Result<(), CreateWatcherError> {
        for dir in collect_dirs(&self.root, &self.filter, Utf8Path::new("")) {
            let abs = self.root.join(&dir);
            self.watcher
                .watch(abs.as_std_path(), RecursiveMode::NonRecursive)
                .map_err(|error| CreateWatcherError::Register {
                    dir: abs.clone(),
                    error,
                })?;
            self.registered.insert(dir);
        }
        Ok(())
    }

    /// Registers a directory created while watching, and anything already
    /// nested under it. Failures are reported on the event stream rather
    /// than tearing the watcher down.
    fn register_new_tree(&mut self, start: Utf8PathBuf) {
        for dir in collect_dirs(&self.root, &self.filter, &start) {
            if self.registered.contains(&dir) {
                continue;
            }
            let abs = self.root.join(&dir);
            match self
                .watcher
                .watch(abs.as_std_path(), RecursiveMode::NonRecursive)
            {
                Ok(()) => {
                    debug!(dir = %dir, "watching new directory");
                    self.registered.insert(dir);
                }
                Err(error) => {
                    self.pending
                        .push_back(Err(WatchError::WatchNewDir { dir: abs, error }));
                }
            }
        }
    }

    fn process(&mut self, event: Event) {
        trace!(kind = ?event.kind, paths = ?event.paths, "raw filesystem event");
        let Some(kind) = classify(&event.kind) else {
            return;
        };
        let timestamp = chrono::Local::now().fixed_offset();
        for path in &event.paths {
            let Ok(path) = <&Utf8Path>::try_from(path.as_path()) else {
                debug!(?path, "skipping non-UTF-8 path");
                continue;
            };
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let rel = rel.to_owned();

            match kind {
                // A directory appearing, by creation or by being renamed
                // in, brings a subtree to register.
                FileChangeKind::Created | FileChangeKind::Renamed if path.is_dir() => {
                    self.register_new_tree(rel);
                    continue;
                }
                // The backend drops watches on deleted directories itself;
                // just forget the registration. A rename away behaves the
                // same: the path is gone.
                FileChangeKind::Removed => {
                    self.registered.remove(&rel);
                }
                FileChangeKind::Renamed if !path.exists() => {
                    self.registered.remove(&rel);
                }
                _ => {}
            }
            if self.filter.is_relevant(&rel) {
                self.pending.push_back(Ok(FileChangeEvent {
                    path: path.to_owned(),
                    kind,
                    timestamp,
                }));
            }
        }
    }
}

fn classify(kind: &EventKind) -> Option<FileChangeKind> {
    match kind {
        EventKind::Create(_) => Some(FileChangeKind::Created),
        // Metadata-only changes (permissions, timestamps) are noise.
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileChangeKind::Renamed),
        EventKind::Modify(_) => Some(FileChangeKind::Modified),
        EventKind::Remove(_) => Some(FileChangeKind::Removed),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Walks the tree under `root.join(start)` and returns the root-relative
/// paths of every directory to register, ignored and hidden subtrees
/// excluded. Unreadable directories are skipped rather than failing the
/// walk.
fn collect_dirs(root: &Utf8Path, filter: &WatchFilter, start: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([start.to_owned()]);
    while let Some(rel) = queue.pop_front() {
        if filter.skip_dir(&rel) {
            trace!(dir = %rel, "skipping ignored directory");
            continue;
        }
        let abs = root.join(&rel);
        let entries = match fs::read_dir(&abs) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(dir = %abs, %error, "cannot scan directory, skipping");
                continue;
            }
        };
        found.push(rel.clone());
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            // Symlinked directories are not followed.
            if !file_type.is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) => queue.push_back(rel.join(name)),
                None => debug!(path = ?entry.path(), "skipping non-UTF-8 path"),
            }
        }
    }
    found
}
