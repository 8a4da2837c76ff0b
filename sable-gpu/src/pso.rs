//! Pipeline-state-object library cache.
//!
//! Compiled pipeline blobs are persisted to one cache file per build
//! configuration so later runs skip compilation. The file is versioned by
//! device and driver identity; corruption or an identity mismatch on load
//! is recoverable and resets the library to empty, forcing a rebuild.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::device::{DeviceError, DeviceIdentity};

/// Directory the cache files live under, relative to the working directory.
pub const PSO_CACHE_DIR: &str = "cache/pso";

const MAGIC: u32 = u32::from_le_bytes(*b"SPSO");
const FORMAT_VERSION: u32 = 1;

pub struct PsoLibrary {
    path: PathBuf,
    identity: DeviceIdentity,
    entries: Vec<Option<Vec<u8>>>,
    needs_rebuild: bool,
}

impl PsoLibrary {
    /// Opens (or creates) the library for `name`. A load failure with a
    /// defined cause resets to an empty library and schedules a rebuild; the
    /// cause is returned alongside so the caller can log it.
    pub fn open(
        dir: &Path,
        name: &str,
        identity: DeviceIdentity,
        num_slots: usize,
    ) -> (Self, Option<DeviceError>) {
        let path = dir.join(format!("{}.cache", name));
        let mut lib = Self {
            path,
            identity,
            entries: vec![None; num_slots],
            needs_rebuild: false,
        };

        if !lib.path.exists() {
            lib.needs_rebuild = true;
            return (lib, None);
        }

        match lib.load() {
            Ok(()) => (lib, None),
            Err(err) => {
                match &err {
                    DeviceError::CacheCorrupted => {
                        log::warn!("PSO cache {:?} is corrupted; rebuilding", lib.path)
                    }
                    DeviceError::DriverMismatch => {
                        log::warn!("PSO cache {:?} has a driver mismatch; rebuilding", lib.path)
                    }
                    DeviceError::AdapterMismatch => log::warn!(
                        "PSO cache {:?} was created on different hardware; rebuilding",
                        lib.path
                    ),
                    other => log::warn!("PSO cache {:?} failed to load: {}", lib.path, other),
                }
                lib.reset_to_empty();
                (lib, Some(err))
            }
        }
    }

    fn load(&mut self) -> Result<(), DeviceError> {
        let mut file = fs::File::open(&self.path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut cursor = Cursor { data: &data, pos: 0 };
        if cursor.u32()? != MAGIC || cursor.u32()? != FORMAT_VERSION {
            return Err(DeviceError::CacheCorrupted);
        }
        let adapter = cursor.u64()?;
        let driver = cursor.u64()?;
        if adapter != self.identity.adapter_id {
            return Err(DeviceError::AdapterMismatch);
        }
        if driver != self.identity.driver_version {
            return Err(DeviceError::DriverMismatch);
        }

        let count = cursor.u32()? as usize;
        if count > self.entries.len() {
            return Err(DeviceError::CacheCorrupted);
        }
        for i in 0..count {
            let len = cursor.u32()? as usize;
            let blob = cursor.bytes(len)?;
            self.entries[i] = if blob.is_empty() { None } else { Some(blob.to_vec()) };
        }

        log::info!(
            "loaded PSO cache {:?} ({} populated slots)",
            self.path,
            self.entries.iter().filter(|e| e.is_some()).count()
        );
        Ok(())
    }

    fn reset_to_empty(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
        self.needs_rebuild = true;
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn get(&self, slot: usize) -> Option<&[u8]> {
        self.entries.get(slot)?.as_deref()
    }

    /// Stores a freshly compiled blob; the file is rewritten at shutdown.
    pub fn store(&mut self, slot: usize, blob: Vec<u8>) {
        self.entries[slot] = Some(blob);
        self.needs_rebuild = true;
    }

    /// Drops the cache file and every in-memory blob (shader hot-reload).
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.reset_to_empty();
        Ok(())
    }

    /// Serializes the library back to disk when anything changed.
    pub fn flush_to_disk(&mut self) -> Result<(), DeviceError> {
        if !self.needs_rebuild {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC.to_le_bytes());
        data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        data.extend_from_slice(&self.identity.adapter_id.to_le_bytes());
        data.extend_from_slice(&self.identity.driver_version.to_le_bytes());
        data.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            let blob = entry.as_deref().unwrap_or(&[]);
            data.extend_from_slice(&(blob.len() as u32).to_le_bytes());
            data.extend_from_slice(blob);
        }

        let mut file = fs::File::create(&self.path)?;
        file.write_all(&data)?;
        self.needs_rebuild = false;
        log::info!("wrote PSO cache {:?} ({} bytes)", self.path, data.len());
        Ok(())
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DeviceError> {
        let end = self.pos.checked_add(len).ok_or(DeviceError::CacheCorrupted)?;
        if end > self.data.len() {
            return Err(DeviceError::CacheCorrupted);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, DeviceError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DeviceError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}
