//! Bounded family of numbered files.
//!
//! A [`FileSet`] manages one or more logical sets (index, temp, ...) of
//! numbered files inside a directory. Files are created on demand through a
//! per-set factory callback that decides the new file's capacity, and
//! handles are pinned/unpinned so the whole registry stays within a global
//! open-descriptor budget.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::error::StoreError;
use crate::freemap::FileSource;
use crate::types::FileId;

/// Decides whether file `index` may be created and, if so, its maximum
/// size in bytes.
pub type FileFactory = Box<dyn FnMut(u32) -> Option<u64>>;

/// Identifies one logical set inside a [`FileSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetId(u16);

#[derive(Debug)]
struct FileSlot {
    capacity: u64,
    handle: Option<File>,
    pins: u32,
    last_use: u64,
    removed: bool,
}

struct SetEntry {
    stem: String,
    factory: FileFactory,
    files: Vec<FileSlot>,
}

impl std::fmt::Debug for SetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetEntry")
            .field("stem", &self.stem)
            .field("files", &self.files)
            .finish()
    }
}

pub struct FileSet {
    dir: PathBuf,
    budget: usize,
    open: usize,
    clock: u64,
    sets: Vec<SetEntry>,
}

impl std::fmt::Debug for FileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSet")
            .field("dir", &self.dir)
            .field("budget", &self.budget)
            .field("open", &self.open)
            .field("clock", &self.clock)
            .field("sets", &self.sets)
            .finish()
    }
}

impl FileSet {
    /// `budget` caps the number of simultaneously open descriptors across
    /// every registered set.
    pub fn new(dir: impl Into<PathBuf>, budget: usize) -> Result<Self, StoreError> {
        if budget == 0 {
            return Err(StoreError::Invalid("open-file budget must be nonzero"));
        }
        Ok(Self {
            dir: dir.into(),
            budget,
            open: 0,
            clock: 0,
            sets: Vec::new(),
        })
    }

    /// Register a logical set. Files are named `"{stem}.{index:03}"`.
    pub fn register(&mut self, stem: &str, factory: FileFactory) -> SetId {
        self.sets.push(SetEntry {
            stem: stem.to_string(),
            factory,
            files: Vec::new(),
        });
        SetId((self.sets.len() - 1) as u16)
    }

    /// Path of file `index` within a set, whether or not it exists yet.
    pub fn name(&self, set: SetId, index: u32) -> PathBuf {
        let stem = &self.sets[set.0 as usize].stem;
        self.dir.join(format!("{stem}.{index:03}"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of files this set has attached (created or reopened).
    pub fn file_count(&self, set: SetId) -> u32 {
        self.sets[set.0 as usize].files.len() as u32
    }

    pub fn capacity(&self, set: SetId, file: FileId) -> Result<u64, StoreError> {
        let slot = self.slot(set, file)?;
        Ok(slot.capacity)
    }

    /// Does file `index` exist on disk (attached or not)?
    pub fn exists(&self, set: SetId, index: u32) -> bool {
        self.name(set, index).exists()
    }

    /// Create file `index` through the set's factory. Files are created
    /// densely, so `index` must be the next unattached one.
    pub fn create(&mut self, set: SetId, index: u32) -> Result<u64, StoreError> {
        let entry = &mut self.sets[set.0 as usize];
        if index as usize != entry.files.len() {
            return Err(StoreError::Invalid("file set indices must be created in order"));
        }
        let Some(capacity) = (entry.factory)(index) else {
            return Err(StoreError::NotFound("file (factory declined)"));
        };
        let path = self.name(set, index);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        debug!("created {} (capacity {capacity})", path.display());
        self.sets[set.0 as usize].files.push(FileSlot {
            capacity,
            handle: None,
            pins: 0,
            last_use: 0,
            removed: false,
        });
        Ok(capacity)
    }

    /// Attach an existing on-disk file, asking the factory for its
    /// capacity. Used when reopening a store.
    pub fn open_existing(&mut self, set: SetId, index: u32) -> Result<u64, StoreError> {
        let entry = &mut self.sets[set.0 as usize];
        if index as usize != entry.files.len() {
            return Err(StoreError::Invalid("file set indices must be attached in order"));
        }
        if !self.exists(set, index) {
            return Err(StoreError::NotFound("file"));
        }
        let entry = &mut self.sets[set.0 as usize];
        let Some(capacity) = (entry.factory)(index) else {
            return Err(StoreError::NotFound("file (factory declined)"));
        };
        entry.files.push(FileSlot {
            capacity,
            handle: None,
            pins: 0,
            last_use: 0,
            removed: false,
        });
        Ok(capacity)
    }

    fn slot(&self, set: SetId, file: FileId) -> Result<&FileSlot, StoreError> {
        let slot = self
            .sets
            .get(set.0 as usize)
            .and_then(|s| s.files.get(file as usize))
            .ok_or(StoreError::NotFound("file"))?;
        if slot.removed {
            return Err(StoreError::NotFound("file (unlinked)"));
        }
        Ok(slot)
    }

    /// Close the least recently used open, unpinned file.
    fn evict_one(&mut self) -> Result<(), StoreError> {
        let mut victim: Option<(usize, usize, u64)> = None;
        for (si, set) in self.sets.iter().enumerate() {
            for (fi, slot) in set.files.iter().enumerate() {
                if slot.handle.is_some() && slot.pins == 0 {
                    match victim {
                        Some((_, _, t)) if t <= slot.last_use => {}
                        _ => victim = Some((si, fi, slot.last_use)),
                    }
                }
            }
        }
        let Some((si, fi, _)) = victim else {
            return Err(StoreError::Busy);
        };
        trace!("evicting handle for set {si} file {fi}");
        self.sets[si].files[fi].handle = None;
        self.open -= 1;
        Ok(())
    }

    /// Pin file `file` open for use. Balance with [`FileSet::unpin`].
    pub fn pin(&mut self, set: SetId, file: FileId) -> Result<(), StoreError> {
        self.slot(set, file)?;
        if self.sets[set.0 as usize].files[file as usize].handle.is_none() {
            if self.open >= self.budget {
                self.evict_one()?;
            }
            let path = self.name(set, file as u32);
            let handle = OpenOptions::new().read(true).write(true).open(&path)?;
            self.sets[set.0 as usize].files[file as usize].handle = Some(handle);
            self.open += 1;
        }
        self.clock += 1;
        let slot = &mut self.sets[set.0 as usize].files[file as usize];
        slot.pins += 1;
        slot.last_use = self.clock;
        Ok(())
    }

    /// Borrow the handle of a pinned file.
    pub fn handle(&self, set: SetId, file: FileId) -> Result<&File, StoreError> {
        let slot = self.slot(set, file)?;
        slot.handle
            .as_ref()
            .ok_or(StoreError::Invalid("file is not pinned"))
    }

    pub fn unpin(&mut self, set: SetId, file: FileId) {
        if let Some(slot) = self
            .sets
            .get_mut(set.0 as usize)
            .and_then(|s| s.files.get_mut(file as usize))
        {
            debug_assert!(slot.pins > 0, "unpin without matching pin");
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    /// Read exactly `buf.len()` bytes at `offset`, pinning around the I/O.
    pub fn read_at(
        &mut self,
        set: SetId,
        file: FileId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StoreError> {
        self.check_range(set, file, offset, buf.len())?;
        self.pin(set, file)?;
        let res = self.handle(set, file).and_then(|f| {
            f.read_exact_at(buf, offset).map_err(StoreError::from)
        });
        self.unpin(set, file);
        res
    }

    /// Write `buf` at `offset`, pinning around the I/O.
    pub fn write_at(
        &mut self,
        set: SetId,
        file: FileId,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), StoreError> {
        self.check_range(set, file, offset, buf.len())?;
        self.pin(set, file)?;
        let res = self.handle(set, file).and_then(|f| {
            f.write_all_at(buf, offset).map_err(StoreError::from)
        });
        self.unpin(set, file);
        res
    }

    fn check_range(
        &self,
        set: SetId,
        file: FileId,
        offset: u64,
        len: usize,
    ) -> Result<(), StoreError> {
        let slot = self.slot(set, file)?;
        if offset + len as u64 > slot.capacity {
            return Err(StoreError::Invalid("I/O past file capacity"));
        }
        Ok(())
    }

    /// Remove file `file`'s backing store. The slot stays numbered but
    /// refuses further use.
    pub fn unlink(&mut self, set: SetId, file: FileId) -> Result<(), StoreError> {
        self.slot(set, file)?;
        let slot = &mut self.sets[set.0 as usize].files[file as usize];
        if slot.pins > 0 {
            return Err(StoreError::Busy);
        }
        if slot.handle.take().is_some() {
            self.open -= 1;
        }
        let slot = &mut self.sets[set.0 as usize].files[file as usize];
        slot.removed = true;
        slot.capacity = 0;
        let path = self.name(set, file as u32);
        fs::remove_file(&path)?;
        debug!("unlinked {}", path.display());
        Ok(())
    }

    /// Adapter exposing this set's factory path to the free map.
    pub fn grow_source(&mut self, set: SetId) -> SetGrow<'_> {
        SetGrow { files: self, set }
    }
}

/// [`FileSource`] that creates files in one set of a [`FileSet`].
pub struct SetGrow<'a> {
    files: &'a mut FileSet,
    set: SetId,
}

impl FileSource for SetGrow<'_> {
    fn provide(&mut self, index: u32) -> Option<u64> {
        match self.files.create(self.set, index) {
            Ok(capacity) => Some(capacity),
            Err(err) => {
                debug!("file set declined to grow: {err}");
                None
            }
        }
    }
}
