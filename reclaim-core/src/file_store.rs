/// Directory-backed durable store
///
/// Each key lives in its own file:
/// ```text
/// [magic(4)] [crc32(4)] [body...]
/// ```
/// The file name is the URL-safe base64 encoding of the key. Writes go to a
/// temporary file which is fsynced and renamed over the target, so a crash
/// leaves either the old record or the new one, never a torn mix.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{DurableStore, Error, Result};

/// Magic number for record files (big-endian)
const RECORD_MAGIC: u32 = 0x52434C4D; // "RCLM"

/// Size of the record header (magic + crc)
const HEADER_LEN: usize = 8;

const RECORD_EXT: &str = "rec";
const TEMP_EXT: &str = "tmp";

/// Durable store that keeps one checksummed file per key
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// Leftover temporary files from an interrupted write are removed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::StoreUnavailable(format!("{}: {}", dir.display(), e)))?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXT) {
                debug!("Removing interrupted write {}", path.display());
                fs::remove_file(&path)?;
            }
        }

        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory backing this store
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let name = URL_SAFE_NO_PAD.encode(key.as_bytes());
        self.dir.join(format!("{}.{}", name, RECORD_EXT))
    }

    fn decode_name(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let raw = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(raw).ok()
    }

    fn encode_record(value: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + value.len());
        buf.put_u32(RECORD_MAGIC);
        buf.put_u32_le(crc32fast::hash(value));
        buf.put_slice(value);
        buf.freeze()
    }

    fn decode_record(key: &str, data: Vec<u8>) -> Result<Bytes> {
        if data.len() < HEADER_LEN {
            return Err(Error::Corruption(format!("record '{}' is truncated", key)));
        }

        let mut data = Bytes::from(data);
        let magic = data.get_u32();
        if magic != RECORD_MAGIC {
            return Err(Error::Corruption(format!(
                "record '{}' has bad magic {:#010x}",
                key, magic
            )));
        }

        let expected_crc = data.get_u32_le();
        let actual_crc = crc32fast::hash(&data);
        if expected_crc != actual_crc {
            return Err(Error::Corruption(format!(
                "record '{}' checksum mismatch (expected {:#010x}, got {:#010x})",
                key, expected_crc, actual_crc
            )));
        }

        Ok(data)
    }

    fn read_record(&self, key: &str, path: &Path) -> Result<Option<Bytes>> {
        match fs::read(path) {
            Ok(data) => Self::decode_record(key, data).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::StoreUnavailable(format!("read {}: {}", path.display(), e))),
        }
    }

    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.read_record(key, &self.record_path(key))
    }

    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let _guard = self.write_lock.lock();

        let target = self.record_path(key);
        let temp = target.with_extension(TEMP_EXT);
        let record = Self::encode_record(&value);

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(&record)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&temp);
            return Err(Error::StoreUnavailable(format!("write '{}': {}", key, e)));
        }

        self.sync_dir()
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock();

        match fs::remove_file(self.record_path(key)) {
            Ok(()) => self.sync_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StoreUnavailable(format!("delete '{}': {}", key, e))),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| Error::StoreUnavailable(format!("{}: {}", self.dir.display(), e)))?;

        let mut matches = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(key) = Self::decode_name(&path) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            // A concurrent delete between listing and reading is not an error
            match self.read_record(&key, &path)? {
                Some(value) => matches.push((key, value)),
                None => warn!("Record '{}' vanished during scan", key),
            }
        }

        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }
}
