//! File-backed storage engine
//!
//! Each store is persisted as a single image file:
//!
//! ```text
//! <data_dir>/stores/<hex(store name)>.store
//! ```
//!
//! The file holds a JSON envelope `{ "checksum": u32, "image": StoreImage }`
//! where the checksum is CRC32 (IEEE) over the serialized image. A commit
//! rewrites the whole image using write-temp, fsync, rename, fsync-directory,
//! so the version and the records of an upgrade become durable together or
//! not at all.
//!
//! Each store image sits behind its own lock. The map lock is only held to
//! find or insert a store, never across file I/O, so commits to different
//! stores do not wait for each other.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::engine::{CommitRecord, StorageEngine};
use super::errors::{StorageError, StorageResult};
use super::memory::StoreImage;

const STORES_DIR: &str = "stores";
const STORE_EXTENSION: &str = "store";

/// CRC32 over the provided bytes.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageEnvelope {
    checksum: u32,
    image: StoreImage,
}

type ImageSlot = Arc<Mutex<StoreImage>>;

/// Storage engine persisting one checksummed image file per store.
#[derive(Debug)]
pub struct FileEngine {
    stores_dir: PathBuf,
    images: RwLock<HashMap<String, ImageSlot>>,
}

impl FileEngine {
    /// Open the engine rooted at `data_dir`, loading and verifying every store.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        let stores_dir = data_dir.join(STORES_DIR);
        fs::create_dir_all(&stores_dir).map_err(|e| {
            StorageError::io_error(
                format!("failed to create {}", stores_dir.display()),
                e,
            )
        })?;

        let mut images = HashMap::new();
        let entries = fs::read_dir(&stores_dir).map_err(|e| {
            StorageError::io_error(format!("failed to list {}", stores_dir.display()), e)
        })?;
        for entry in entries {
            let entry = entry
                .map_err(|e| StorageError::io_error("failed to read directory entry", e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            let name = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_store_name)
            {
                Some(name) => name,
                None => {
                    return Err(StorageError::corruption_in_file(
                        &path,
                        "store file name is not a valid encoded store name",
                    ))
                }
            };
            images.insert(name, Arc::new(Mutex::new(Self::load_image(&path)?)));
        }

        Ok(Self {
            stores_dir,
            images: RwLock::new(images),
        })
    }

    /// Directory holding the store files.
    pub fn stores_dir(&self) -> &Path {
        &self.stores_dir
    }

    fn store_path(&self, store: &str) -> PathBuf {
        self.stores_dir
            .join(format!("{}.{}", encode_store_name(store), STORE_EXTENSION))
    }

    fn load_image(path: &Path) -> StorageResult<StoreImage> {
        let mut content = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut content))
            .map_err(|e| StorageError::io_error(format!("failed to read {}", path.display()), e))?;

        let envelope: ImageEnvelope = serde_json::from_str(&content)
            .map_err(|e| StorageError::corruption_in_file(path, format!("unparseable image: {}", e)))?;

        let bytes = serde_json::to_vec(&envelope.image)
            .map_err(|e| StorageError::corruption_in_file(path, e.to_string()))?;
        if compute_checksum(&bytes) != envelope.checksum {
            return Err(StorageError::corruption_in_file(path, "checksum mismatch"));
        }
        Ok(envelope.image)
    }

    fn write_image(&self, store: &str, image: &StoreImage) -> StorageResult<()> {
        let path = self.store_path(store);
        let temp_path = path.with_extension(format!("{}.tmp", STORE_EXTENSION));

        let bytes = serde_json::to_vec(image)
            .map_err(|e| StorageError::data_corruption(format!("failed to encode image: {}", e)))?;
        let envelope = ImageEnvelope {
            checksum: compute_checksum(&bytes),
            image: image.clone(),
        };
        let content = serde_json::to_vec(&envelope)
            .map_err(|e| StorageError::data_corruption(format!("failed to encode envelope: {}", e)))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| StorageError::io_error("failed to create temp image", e))?;
        file.write_all(&content)
            .map_err(|e| StorageError::io_error("failed to write temp image", e))?;
        file.sync_all()
            .map_err(|e| StorageError::io_error("failed to fsync temp image", e))?;

        fs::rename(&temp_path, &path)
            .map_err(|e| StorageError::io_error("failed to commit image", e))?;

        if let Ok(dir) = File::open(&self.stores_dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn poisoned() -> StorageError {
        StorageError::unavailable("file engine lock poisoned")
    }

    fn slot(&self, store: &str) -> StorageResult<Option<ImageSlot>> {
        let images = self.images.read().map_err(|_| Self::poisoned())?;
        Ok(images.get(store).cloned())
    }

    fn slot_or_create(&self, store: &str) -> StorageResult<ImageSlot> {
        if let Some(slot) = self.slot(store)? {
            return Ok(slot);
        }
        let mut images = self.images.write().map_err(|_| Self::poisoned())?;
        Ok(Arc::clone(images.entry(store.to_string()).or_default()))
    }

    fn read_image<T>(
        &self,
        store: &str,
        f: impl FnOnce(&StoreImage) -> T,
    ) -> StorageResult<Option<T>> {
        let Some(slot) = self.slot(store)? else {
            return Ok(None);
        };
        let image = slot.lock().map_err(|_| Self::poisoned())?;
        Ok(Some(f(&image)))
    }
}

impl StorageEngine for FileEngine {
    fn persisted_version(&self, store: &str) -> StorageResult<u64> {
        Ok(self.read_image(store, |image| image.version)?.unwrap_or(0))
    }

    fn read_committed(&self, store: &str, key: &str) -> StorageResult<Option<Value>> {
        Ok(self
            .read_image(store, |image| image.records.get(key).cloned())?
            .flatten())
    }

    fn apply(&self, record: CommitRecord) -> StorageResult<()> {
        let store = record.store.clone();
        let slot = self.slot_or_create(&store)?;
        let mut image = slot.lock().map_err(|_| Self::poisoned())?;
        let mut next = image.clone();
        next.apply(record)?;

        // Durable before visible.
        self.write_image(&store, &next)?;
        *image = next;
        Ok(())
    }

    fn stores(&self) -> StorageResult<Vec<(String, u64)>> {
        let slots: Vec<(String, ImageSlot)> = {
            let images = self.images.read().map_err(|_| Self::poisoned())?;
            images
                .iter()
                .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut listed = Vec::with_capacity(slots.len());
        for (name, slot) in slots {
            let version = slot.lock().map_err(|_| Self::poisoned())?.version;
            if version > 0 {
                listed.push((name, version));
            }
        }
        listed.sort();
        Ok(listed)
    }

    fn record_count(&self, store: &str) -> StorageResult<usize> {
        Ok(self
            .read_image(store, |image| image.records.len())?
            .unwrap_or(0))
    }
}

fn encode_store_name(name: &str) -> String {
    name.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_store_name(encoded: &str) -> Option<String> {
    if encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
