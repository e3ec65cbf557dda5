// Filesystem watcher bridged onto an `EventBus`.
//
// `FileWatcher` wraps a `notify` watcher and republishes its raw events as
// `FileEvent`s on three channels: `add`, `change`, `unlink`. The relay's
// server loop subscribes to `change` and forwards each path into its control
// channel, where the session reads the file and broadcasts `Update_File`.
//
// Callbacks fire on notify's own thread. Subscribers must therefore be cheap
// and must not touch session state directly; the server's subscriber only
// enqueues the path.

use std::path::{Path, PathBuf};

use notify::event::EventKind;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::FileBridgeError;
use crate::event_bus::EventBus;

pub const ADD_CHANNEL: &str = "add";
pub const CHANGE_CHANNEL: &str = "change";
pub const UNLINK_CHANNEL: &str = "unlink";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileEvent {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Added(p) | FileEvent::Changed(p) | FileEvent::Removed(p) => p,
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            FileEvent::Added(_) => ADD_CHANNEL,
            FileEvent::Changed(_) => CHANGE_CHANNEL,
            FileEvent::Removed(_) => UNLINK_CHANNEL,
        }
    }
}

pub struct FileWatcher {
    watcher: RecommendedWatcher,
    events: EventBus<FileEvent>,
}

impl FileWatcher {
    pub fn new() -> Result<Self, FileBridgeError> {
        let events = EventBus::new();
        let bus = events.clone();
        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for file_event in classify(event) {
                        bus.publish(file_event.channel(), &file_event);
                    }
                }
                Err(e) => warn!(error = %e, "file watch error"),
            },
            Config::default(),
        )?;
        Ok(FileWatcher { watcher, events })
    }

    pub fn events(&self) -> &EventBus<FileEvent> {
        &self.events
    }

    pub fn watch(&mut self, path: &Path) -> Result<(), FileBridgeError> {
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        debug!(path = %path.display(), "watching");
        Ok(())
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<(), FileBridgeError> {
        self.watcher.unwatch(path)?;
        debug!(path = %path.display(), "unwatched");
        Ok(())
    }
}

/// Map a raw notify event to zero or more bus events.
fn classify(event: Event) -> Vec<FileEvent> {
    let make: fn(PathBuf) -> FileEvent = match event.kind {
        EventKind::Create(_) => FileEvent::Added,
        EventKind::Modify(_) => FileEvent::Changed,
        EventKind::Remove(_) => FileEvent::Removed,
        _ => return Vec::new(),
    };
    event.paths.into_iter().map(make).collect()
}
