// Filesystem bridge for the front-end relay.
//
// Clients edit world content live: `Write_Files` persists a batch of files
// under the relay's content root, and `Watch_Files` / `Unwatch_Files` manage
// a set of watched paths whose changes are pushed back to every client as
// `Update_File`. `FileBridge` owns the content root and the optional
// `FileWatcher`; the session calls it synchronously from the control loop.
//
// Paths arrive relative to the content root. A leading `/` is tolerated (the
// browser clients send root-relative paths), but absolute paths in any other
// form and `..` components are rejected so a client cannot write outside the
// root. Each file in a batch succeeds or fails on its own.
//
// `Update_File` names a file exactly as the client spelled it in
// `Watch_Files` (`/worlds/a.js` stays `/worlds/a.js`); clients compare that
// string against the name they watched.
//
// With `guardAgainstOverwrite`, an existing target is left alone and the new
// content goes to a timestamped sibling (see `guarded_path`).

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use metaroom_protocol::FileWrite;
use tracing::{info, warn};

use crate::error::FileBridgeError;
use crate::watcher::FileWatcher;

pub struct FileBridge {
    root: PathBuf,
    watcher: Option<FileWatcher>,
    /// Resolved path → the name the client sent in `Watch_Files`.
    watched: BTreeMap<PathBuf, String>,
}

impl FileBridge {
    /// A bridge with watching disabled.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileBridge {
            root: root.into(),
            watcher: None,
            watched: BTreeMap::new(),
        }
    }

    pub fn with_watcher(root: impl Into<PathBuf>, watcher: FileWatcher) -> Self {
        FileBridge {
            root: root.into(),
            watcher: Some(watcher),
            watched: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watching_enabled(&self) -> bool {
        self.watcher.is_some()
    }

    /// Resolve a client path under the content root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, FileBridgeError> {
        let trimmed = relative.trim_start_matches('/');
        let candidate = Path::new(trimmed);
        let confined = !trimmed.is_empty()
            && candidate
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined {
            return Err(FileBridgeError::OutsideRoot(relative.to_string()));
        }
        Ok(self.root.join(candidate))
    }

    /// The client-facing name for a path reported by the watcher: the
    /// spelling used to watch it, or the path relative to the root.
    pub fn client_name(&self, path: &Path) -> String {
        if let Some(name) = self.watched_name(path) {
            return name.to_string();
        }
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        path.strip_prefix(&root)
            .or_else(|_| path.strip_prefix(&self.root))
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn watched_name(&self, path: &Path) -> Option<&str> {
        if let Some(name) = self.watched.get(path) {
            return Some(name);
        }
        let canonical = path.canonicalize().ok()?;
        self.watched
            .iter()
            .find(|(watched, _)| watched.canonicalize().is_ok_and(|c| c == canonical))
            .map(|(_, name)| name.as_str())
    }

    /// Write one file. Returns the path actually written.
    pub fn write_file(
        &self,
        file: &FileWrite,
        now: DateTime<Local>,
    ) -> Result<PathBuf, FileBridgeError> {
        let mut target = self.resolve(&file.path)?;
        if file.opts.guard_against_overwrite && target.exists() {
            target = guarded_path(&target, now);
        }
        std::fs::write(&target, &file.text).map_err(|source| FileBridgeError::Io {
            action: "write",
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }

    /// Write a batch, logging each outcome. One failure does not stop the
    /// rest of the batch.
    pub fn write_files(
        &self,
        files: &[FileWrite],
        now: DateTime<Local>,
    ) -> Vec<Result<PathBuf, FileBridgeError>> {
        files
            .iter()
            .map(|file| {
                let result = self.write_file(file, now);
                match &result {
                    Ok(path) => info!(path = %path.display(), "wrote file"),
                    Err(e) => warn!(file = %file.path, error = %e, "file write failed"),
                }
                result
            })
            .collect()
    }

    pub fn read(&self, path: &Path) -> Result<String, FileBridgeError> {
        std::fs::read_to_string(path).map_err(|source| FileBridgeError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn watch(&mut self, relative: &str) -> Result<(), FileBridgeError> {
        let path = self.resolve(relative)?;
        let watcher = self.watcher.as_mut().ok_or(FileBridgeError::WatchDisabled)?;
        watcher.watch(&path)?;
        self.watched.insert(path, relative.to_string());
        Ok(())
    }

    pub fn unwatch(&mut self, relative: &str) -> Result<(), FileBridgeError> {
        let path = self.resolve(relative)?;
        let watcher = self.watcher.as_mut().ok_or(FileBridgeError::WatchDisabled)?;
        self.watched.remove(&path);
        watcher.unwatch(&path)
    }
}

/// Sibling path carrying a timestamp suffix before the extension:
/// `world.js` → `world_y_2024_m_3_d_7_h_14_s_9_stamp_1709820009123.js`.
pub fn guarded_path(path: &Path, now: DateTime<Local>) -> PathBuf {
    let suffix = format!(
        "_y_{}_m_{}_d_{}_h_{}_s_{}_stamp_{}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.second(),
        now.timestamp_millis()
    );
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use metaroom_protocol::WriteOptions;

    use super::*;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 9).unwrap()
    }

    fn write(path: &str, text: &str, guard: bool) -> FileWrite {
        FileWrite {
            path: path.into(),
            text: text.into(),
            opts: WriteOptions {
                guard_against_overwrite: guard,
            },
        }
    }

    #[test]
    fn guarded_path_inserts_suffix_before_extension() {
        let now = fixed_time();
        let guarded = guarded_path(Path::new("/content/world.js"), now);
        let expected = format!(
            "world_y_2024_m_3_d_7_h_14_s_9_stamp_{}.js",
            now.timestamp_millis()
        );
        assert_eq!(guarded, Path::new("/content").join(expected));
    }

    #[test]
    fn guarded_path_without_extension_appends() {
        let guarded = guarded_path(Path::new("notes"), fixed_time());
        let name = guarded.to_string_lossy().into_owned();
        assert!(name.starts_with("notes_y_2024_m_3_d_7_h_14_s_9_stamp_"), "{name}");
        assert!(!name.contains('.'));
    }

    #[test]
    fn resolve_rejects_escapes() {
        let bridge = FileBridge::new("/content");
        assert_eq!(
            bridge.resolve("worlds/a.js").unwrap(),
            Path::new("/content/worlds/a.js")
        );
        assert_eq!(
            bridge.resolve("/worlds/a.js").unwrap(),
            Path::new("/content/worlds/a.js")
        );
        assert!(bridge.resolve("../etc/passwd").is_err());
        assert!(bridge.resolve("worlds/../../x").is_err());
        assert!(bridge.resolve("").is_err());
    }

    #[test]
    fn batch_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = FileBridge::new(dir.path());
        let results = bridge.write_files(
            &[
                write("../escape.txt", "no", false),
                write("missing_dir/a.txt", "no", false),
                write("ok.txt", "yes", false),
            ],
            fixed_time(),
        );
        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("ok.txt")).unwrap(),
            "yes"
        );
    }

    #[test]
    fn guard_keeps_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = FileBridge::new(dir.path());
        std::fs::write(dir.path().join("world.js"), "old").unwrap();

        let written = bridge
            .write_file(&write("world.js", "new", true), fixed_time())
            .unwrap();
        assert_ne!(written, dir.path().join("world.js"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("world.js")).unwrap(),
            "old"
        );
        assert_eq!(std::fs::read_to_string(written).unwrap(), "new");

        // Without the guard the original is replaced.
        bridge
            .write_file(&write("world.js", "newer", false), fixed_time())
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("world.js")).unwrap(),
            "newer"
        );
    }

    #[test]
    fn watch_without_watcher_is_an_error() {
        let mut bridge = FileBridge::new("/content");
        assert!(matches!(
            bridge.watch("a.js"),
            Err(FileBridgeError::WatchDisabled)
        ));
    }

    #[test]
    fn client_name_strips_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = FileBridge::new(dir.path());
        let abs = dir.path().canonicalize().unwrap().join("worlds").join("a.js");
        assert_eq!(bridge.client_name(&abs), "worlds/a.js");
    }

    #[test]
    fn watched_files_keep_the_client_spelling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("worlds")).unwrap();
        std::fs::write(dir.path().join("worlds").join("a.js"), "").unwrap();
        let mut bridge = FileBridge::with_watcher(dir.path(), FileWatcher::new().unwrap());

        bridge.watch("/worlds/a.js").unwrap();
        let raw = dir.path().join("worlds").join("a.js");
        let canonical = raw.canonicalize().unwrap();
        assert_eq!(bridge.client_name(&raw), "/worlds/a.js");
        assert_eq!(bridge.client_name(&canonical), "/worlds/a.js");

        bridge.unwatch("/worlds/a.js").unwrap();
        assert_eq!(bridge.client_name(&canonical), "worlds/a.js");
    }
}
