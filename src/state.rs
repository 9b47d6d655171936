use std::collections::HashMap;
use std::fs::{DirBuilder, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, RwLock};

use once_cell::sync::Lazy;
use tracing::info;

use crate::error::{Error, Result};

/// Key/value persistence used for service state outside the certificate
/// store, e.g. the ACME account registrations.
pub trait StateHandler: Send + Sync {
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    fn describe(&self) -> String;
}

static STATE_HANDLER: Lazy<RwLock<Box<dyn StateHandler>>> =
    Lazy::new(|| RwLock::new(Box::new(MemoryStateHandler::default())));

/// Replace the process-wide state handler.
pub fn update_handler(handler: Box<dyn StateHandler>) {
    info!("Using {}", handler.describe());
    *STATE_HANDLER.write().expect("state handler lock poisoned") = handler;
}

pub fn write(path: &str, data: &[u8]) -> Result<()> {
    STATE_HANDLER
        .write()
        .expect("state handler lock poisoned")
        .write(path, data)
}

pub fn read(path: &str) -> Result<Vec<u8>> {
    STATE_HANDLER
        .read()
        .expect("state handler lock poisoned")
        .read(path)
}

/// In-memory state handler; the default until a filesystem handler is
/// installed and the handler of choice for tests.
#[derive(Default)]
pub struct MemoryStateHandler {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl StateHandler for MemoryStateHandler {
    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store
            .lock()
            .expect("memory state lock poisoned")
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.store
            .lock()
            .expect("memory state lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn describe(&self) -> String {
        "memory state handler".to_string()
    }
}

const STATE_DIR_MODE: u32 = 0o700;
const STATE_FILE_MODE: u32 = 0o600;

/// Filesystem state handler rooted at a configured directory. State paths
/// must stay inside the root; absolute paths and `..` escapes are rejected.
pub struct FsStateHandler {
    base_path: PathBuf,
}

impl FsStateHandler {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let state_path = Path::new(path);
        if state_path.is_absolute() {
            return Err(Error::InvalidPath(state_path.to_path_buf()));
        }
        // Component-wise normalization, so a prefix check cannot be fooled
        // by `..` segments or by sibling directories sharing a name prefix.
        let mut normalized = PathBuf::new();
        for component in state_path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(Error::InvalidPath(state_path.to_path_buf()));
                    }
                }
                Component::Normal(name) => normalized.push(name),
                _ => return Err(Error::InvalidPath(state_path.to_path_buf())),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(Error::InvalidPath(state_path.to_path_buf()));
        }
        let base_path = if self.base_path.is_absolute() {
            self.base_path.clone()
        } else {
            std::env::current_dir()?.join(&self.base_path)
        };
        let full_path = base_path.join(normalized);
        if !full_path.starts_with(&base_path) {
            return Err(Error::InvalidPath(state_path.to_path_buf()));
        }
        Ok(full_path)
    }
}

impl StateHandler for FsStateHandler {
    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        if let Some(parent) = full_path.parent() {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(STATE_DIR_MODE);
            }
            builder.create(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(STATE_FILE_MODE);
        }
        let mut file = options.open(&full_path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        let mut file = match std::fs::File::open(&full_path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(path.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn describe(&self) -> String {
        format!("FS state handler; state path: '{}'", self.base_path.display())
    }
}

/// Serializes tests that exercise the process-wide handler.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_write_state(handler: &dyn StateHandler) {
        assert!(matches!(
            handler.read("state.txt"),
            Err(Error::NotFound(_))
        ));
        handler.write("state.txt", b"state").unwrap();
        handler.write("state.txt", b"state").unwrap();
        assert_eq!(handler.read("state.txt").unwrap(), b"state");
    }

    #[test]
    fn test_memory_handler() {
        read_write_state(&MemoryStateHandler::default());
    }

    #[test]
    fn test_fs_handler() {
        let state_dir = tempdir().unwrap();
        read_write_state(&FsStateHandler::new(state_dir.path()));
    }

    #[test]
    fn test_fs_handler_path_checks() {
        let state_dir = tempdir().unwrap();
        let handler = FsStateHandler::new(state_dir.path());
        assert!(matches!(
            handler.read("../some/file.txt"),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            handler.write("/tmp/outside.txt", b"test"),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            handler.write("a/../../escape.txt", b"test"),
            Err(Error::InvalidPath(_))
        ));
        // Escaping via `..` inside the path is fine as long as it stays put.
        handler.write("a/../inside.txt", b"test").unwrap();
        assert_eq!(handler.read("inside.txt").unwrap(), b"test");
    }

    #[test]
    fn test_fs_handler_creates_parent_directories() {
        let state_dir = tempdir().unwrap();
        let handler = FsStateHandler::new(state_dir.path());
        handler.write("nested/dir/state.json", b"{}").unwrap();
        assert_eq!(handler.read("nested/dir/state.json").unwrap(), b"{}");
    }

    #[test]
    fn test_global_handler_replacement() {
        let _guard = TEST_LOCK.lock().unwrap();
        update_handler(Box::new(MemoryStateHandler::default()));
        assert!(matches!(read("state.txt"), Err(Error::NotFound(_))));
        write("state.txt", b"state").unwrap();
        assert_eq!(read("state.txt").unwrap(), b"state");
        // A fresh handler starts empty again.
        update_handler(Box::new(MemoryStateHandler::default()));
        assert!(matches!(read("state.txt"), Err(Error::NotFound(_))));
    }
}
