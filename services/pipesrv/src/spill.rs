//! Spill store: on publish failure the raw packet bytes are appended to a
//! per-device file under `{path_storage}/{port}/`, to be replayed later by
//! the `pipe-restore` tool over a local TCP connection.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use tracing::{debug, error};

use crate::error::{PipeError, Result};

/// File extension of spill files
pub const SPILL_POSTFIX: &str = ".storage";

fn plain_uid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w-]+$").expect("static pattern"))
}

/// Per-port spill directory.
#[derive(Debug, Clone)]
pub struct SpillStore {
    dir: PathBuf,
}

impl SpillStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Spill file path for a device. Uids made of word characters (and
    /// dashes) name the file directly; anything else is base64-encoded.
    pub fn file_for(&self, uid: &str) -> PathBuf {
        let name = if plain_uid_re().is_match(uid) {
            uid.to_string()
        } else {
            BASE64.encode(uid.as_bytes())
        };
        self.dir.join(format!("{name}{SPILL_POSTFIX}"))
    }

    /// Append raw packet bytes for a device.
    pub fn save(&self, uid: &str, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| PipeError::Spill(format!("create {}: {e}", self.dir.display())))?;
        let path = self.file_for(uid);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipeError::Spill(format!("open {}: {e}", path.display())))?;
        file.write_all(data)
            .map_err(|e| PipeError::Spill(format!("write {}: {e}", path.display())))?;
        debug!(uid, bytes = data.len(), "packet spilled to {}", path.display());
        Ok(())
    }

    /// Read everything spilled for a device (empty if nothing is there).
    pub fn load(&self, uid: &str) -> Vec<u8> {
        fs::read(self.file_for(uid)).unwrap_or_default()
    }
}

/// One spill file found under a storage root.
#[derive(Debug)]
pub struct SpillFile {
    pub port: u16,
    pub path: PathBuf,
}

/// Every spill file under `{root}/{port}/`, for the restore tool.
pub fn scan_storage(root: &Path) -> Vec<SpillFile> {
    let mut found = Vec::new();
    let Ok(ports) = fs::read_dir(root) else {
        return found;
    };
    for entry in ports.flatten() {
        let port_dir = entry.path();
        let Some(port) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u16>().ok())
        else {
            continue;
        };
        let Ok(files) = fs::read_dir(&port_dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SPILL_POSTFIX))
            {
                found.push(SpillFile { port, path });
            }
        }
    }
    found
}

/// Move a replayed spill file into the trash tree.
pub fn trash_file(file: &SpillFile, trash_root: &Path, timestamp: &str) -> Result<()> {
    let target_dir = trash_root.join(timestamp).join(file.port.to_string());
    fs::create_dir_all(&target_dir)
        .map_err(|e| PipeError::Spill(format!("create {}: {e}", target_dir.display())))?;
    let target = target_dir.join(file.path.file_name().unwrap_or_default());
    if let Err(e) = fs::rename(&file.path, &target) {
        error!("failed to trash {}: {e}", file.path.display());
        return Err(PipeError::Spill(e.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_uid_names_file() {
        let store = SpillStore::new("/tmp/x/21001");
        assert_eq!(
            store.file_for("abc-123"),
            PathBuf::from("/tmp/x/21001/abc-123.storage")
        );
        assert_eq!(
            store.file_for("868204003057949"),
            PathBuf::from("/tmp/x/21001/868204003057949.storage")
        );
    }

    #[test]
    fn test_odd_uid_is_base64() {
        let store = SpillStore::new("/tmp/x/21001");
        let path = store.file_for("dev/№7");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(SPILL_POSTFIX));
        assert!(!name.contains('/'));
        assert_eq!(
            name.trim_end_matches(SPILL_POSTFIX),
            BASE64.encode("dev/№7".as_bytes())
        );
    }

    #[test]
    fn test_save_appends() {
        let root = tempfile::tempdir().unwrap();
        let store = SpillStore::new(root.path().join("21001"));
        store.save("abc-123", b"first|").unwrap();
        store.save("abc-123", b"second").unwrap();
        assert_eq!(store.load("abc-123"), b"first|second");
    }

    #[test]
    fn test_scan_and_trash() {
        let root = tempfile::tempdir().unwrap();
        let store = SpillStore::new(root.path().join("21001"));
        store.save("abc-123", b"payload").unwrap();
        fs::create_dir_all(root.path().join("not-a-port")).unwrap();

        let found = scan_storage(root.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, 21001);

        let trash = tempfile::tempdir().unwrap();
        trash_file(&found[0], trash.path(), "1700000000").unwrap();
        assert!(scan_storage(root.path()).is_empty());
        assert!(trash
            .path()
            .join("1700000000/21001/abc-123.storage")
            .exists());
    }
}
