use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::SystemTime,
};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use snafu::Snafu;

use crate::util::io::{self, FileError};

#[derive(Debug, Snafu)]
pub enum TrackerError {
    #[snafu(transparent)]
    File { source: FileError },
    #[snafu(display("malformed dependency tracker file"))]
    Malformed,
}

/// Persists per-file modification times across builds so unchanged sources
/// can be skipped. See `DependencyTracker` in the data model.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    config_mtime: u64,
    files: HashMap<PathBuf, u64>,
}

fn mtime_secs(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    modified.duration_since(SystemTime::UNIX_EPOCH).ok().map(|d| d.as_secs())
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, TrackerError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = io::read_file(path)?;
        let mut cursor = std::io::Cursor::new(bytes);
        let config_mtime = cursor.read_u64::<LE>().map_err(|_| MalformedSnafu.build())?;
        let mut files = HashMap::new();
        while (cursor.position() as usize) < cursor.get_ref().len() {
            let name_len = cursor.read_u16::<LE>().map_err(|_| MalformedSnafu.build())?;
            let mut name_bytes = vec![0u8; name_len as usize];
            std::io::Read::read_exact(&mut cursor, &mut name_bytes).map_err(|_| MalformedSnafu.build())?;
            let path_str = String::from_utf8(name_bytes).map_err(|_| MalformedSnafu.build())?;
            let mtime = cursor.read_u64::<LE>().map_err(|_| MalformedSnafu.build())?;
            let recorded_path = PathBuf::from(path_str);
            // Entries whose path no longer exists are discarded on load, so a
            // deleted source/header doesn't keep a stale stamp forever.
            if recorded_path.exists() {
                files.insert(recorded_path, mtime);
            }
        }
        Ok(Self { config_mtime, files })
    }

    pub fn save(&self, path: &Path) -> Result<(), TrackerError> {
        let mut buf = Vec::new();
        buf.write_u64::<LE>(self.config_mtime).unwrap();
        for (file_path, mtime) in &self.files {
            let path_str = file_path.to_string_lossy();
            let path_bytes = path_str.as_bytes();
            buf.write_u16::<LE>(path_bytes.len() as u16).unwrap();
            buf.extend_from_slice(path_bytes);
            buf.write_u64::<LE>(*mtime).unwrap();
        }
        io::write_file(path, buf)?;
        Ok(())
    }

    /// Returns true (and discards any stale prior record) if the config file
    /// changed since the last build; in that case every source is dirty.
    pub fn config_changed(&mut self, config_path: &Path) -> bool {
        let current = mtime_secs(config_path).unwrap_or(0);
        if current != self.config_mtime {
            self.config_mtime = current;
            self.files.clear();
            true
        } else {
            false
        }
    }

    /// Whether `source` needs recompilation: missing from the tracker, newer
    /// than its recorded stamp, or one of its tracked dependencies (from a
    /// `.d` sidecar) is newer than its recorded stamp or no longer exists.
    pub fn needs_compilation(&self, source: &Path, dep_file: Option<&Path>) -> bool {
        let Some(&recorded) = self.files.get(source) else {
            return true;
        };
        let Some(current) = mtime_secs(source) else {
            return true;
        };
        if current > recorded {
            return true;
        }
        let Some(dep_file) = dep_file else {
            return false;
        };
        if !dep_file.exists() {
            return true;
        }
        let Ok(deps) = parse_dep_file(dep_file) else {
            return true;
        };
        for dep in deps {
            let Some(&dep_recorded) = self.files.get(&dep) else {
                return true;
            };
            match mtime_secs(&dep) {
                Some(dep_current) if dep_current == dep_recorded => {}
                _ => return true,
            }
        }
        false
    }

    /// Stamps the current mtime of `source` and every file referenced by its
    /// `.d` sidecar (if present).
    pub fn record(&mut self, source: &Path, dep_file: Option<&Path>) {
        if let Some(mtime) = mtime_secs(source) {
            self.files.insert(source.to_path_buf(), mtime);
        }
        if let Some(dep_file) = dep_file {
            if let Ok(deps) = parse_dep_file(dep_file) {
                for dep in deps {
                    if let Some(mtime) = mtime_secs(&dep) {
                        self.files.insert(dep, mtime);
                    }
                }
            }
        }
    }

    /// Carries forward the previously recorded stamp for a file that was
    /// skipped this build (up to date), so the snapshot stays complete.
    pub fn carry_forward(&mut self, _source: &Path) {
        // No-op: entries already present in `self.files` are left untouched
        // because `self.files` is only ever replaced wholesale on config
        // change, never cleared per-file.
    }

    pub fn known_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.keys()
    }
}

/// Parses a Make-style `.d` file (`target: dep1 dep2 \\\n dep3 ...`) into the
/// list of dependency paths, ignoring the target itself.
fn parse_dep_file(path: &Path) -> Result<Vec<PathBuf>, TrackerError> {
    let text = io::read_to_string(path)?;
    let joined = text.replace("\\\n", " ");
    let mut parts = joined.split_whitespace();
    let Some(first) = parts.next() else {
        return Ok(Vec::new());
    };
    // First token is "target:" or "target:" glued to the first dependency.
    let rest: Vec<&str> = if let Some(stripped) = first.strip_suffix(':') {
        let _ = stripped;
        parts.collect()
    } else if let Some(idx) = first.find(':') {
        let (_, tail) = first.split_at(idx + 1);
        std::iter::once(tail).chain(parts).collect()
    } else {
        parts.collect()
    };
    Ok(rest.into_iter().filter(|s| !s.is_empty()).map(PathBuf::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_round_trip_save_load() {
        let dir = std::env::temp_dir().join(format!("ffc-tracker-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sidecar = dir.join("tracker.bin");
        let a_path = dir.join("a.cpp");
        let b_path = dir.join("b.cpp");
        std::fs::write(&a_path, "a").unwrap();
        std::fs::write(&b_path, "b").unwrap();

        let mut tracker = DependencyTracker::new();
        tracker.config_mtime = 42;
        tracker.files.insert(a_path.clone(), 100);
        tracker.files.insert(b_path.clone(), 200);
        tracker.save(&sidecar).unwrap();

        let loaded = DependencyTracker::load(&sidecar).unwrap();
        assert_eq!(loaded.config_mtime, 42);
        assert_eq!(loaded.files.get(&a_path), Some(&100));
        assert_eq!(loaded.files.get(&b_path), Some(&200));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_discards_entries_for_deleted_files() {
        let dir = std::env::temp_dir().join(format!("ffc-tracker-stale-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sidecar = dir.join("tracker.bin");
        let gone_path = dir.join("gone.cpp");

        let mut tracker = DependencyTracker::new();
        tracker.config_mtime = 1;
        tracker.files.insert(gone_path.clone(), 123);
        tracker.save(&sidecar).unwrap();

        let loaded = DependencyTracker::load(&sidecar).unwrap();
        assert!(loaded.files.get(&gone_path).is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_source_needs_compilation() {
        let tracker = DependencyTracker::new();
        assert!(tracker.needs_compilation(Path::new("nonexistent.cpp"), None));
    }

    #[test]
    fn test_parse_dep_file() {
        let dir = std::env::temp_dir().join(format!("ffc-tracker-dep-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dep_path = dir.join("a.d");
        let mut file = std::fs::File::create(&dep_path).unwrap();
        writeln!(file, "build/a.o: source/a.cpp \\").unwrap();
        writeln!(file, "  include/a.h include/b.h").unwrap();
        drop(file);

        let deps = parse_dep_file(&dep_path).unwrap();
        assert_eq!(deps, vec![PathBuf::from("source/a.cpp"), PathBuf::from("include/a.h"), PathBuf::from("include/b.h")]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
