//! Atomic JSON persistence
//!
//! Records are written to a uniquely named sibling file
//! (`<target>_<uuid>`) and then renamed over the target, so a reader of the
//! target path sees either the previous record or the complete new one,
//! never a partial write.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::errors::PersistError;

/// Write `path` atomically, letting `write` fill the temporary file
///
/// The temporary file is created with mode 0600 on Unix since the records
/// written through here carry private keys. It is flushed and synced before
/// the rename; on any failure it is removed and the target is left untouched.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<(), PersistError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), PersistError>,
{
    let temp_path = temp_path_for(path);

    let result = write_temp(&temp_path, write)
        .and_then(|()| fs::rename(&temp_path, path).map_err(|e| PersistError::io(path, e)));

    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %temp_path.display(),
                    error = %e,
                    "Failed to remove temporary file"
                );
            }
        }
    } else {
        trace!(path = %path.display(), "Persisted record");
    }

    result
}

/// Serialize `value` as JSON (one line, trailing newline) and persist it atomically
pub fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), PersistError>
where
    T: Serialize + ?Sized,
{
    write_atomic(path, |writer| {
        serde_json::to_writer(&mut *writer, value).map_err(|e| PersistError::Encode {
            path: path.to_path_buf(),
            source: e,
        })?;
        writer
            .write_all(b"\n")
            .map_err(|e| PersistError::io(path, e))
    })
}

/// Read and decode a JSON record
pub fn read_json<T>(path: &Path) -> Result<T, PersistError>
where
    T: DeserializeOwned,
{
    let file = File::open(path).map_err(|e| PersistError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| PersistError::Decode {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_temp<F>(temp_path: &Path, write: F) -> Result<(), PersistError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), PersistError>,
{
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let file = options
        .open(temp_path)
        .map_err(|e| PersistError::io(temp_path, e))?;

    let mut writer = BufWriter::new(file);
    write(&mut writer)?;

    let file = writer
        .into_inner()
        .map_err(|e| PersistError::io(temp_path, e.into_error()))?;
    file.sync_all().map_err(|e| PersistError::io(temp_path, e))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push("_");
    name.push(Uuid::new_v4().to_string());
    PathBuf::from(name)
}
