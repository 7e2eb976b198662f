//! In-memory object store.
//!
//! Stands in for the server's storage engine. Operation state machines
//! never call it directly; they post store jobs through
//! [`crate::job::JobContext::post_store`] and read the result when the job
//! completes.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use stratafs_core::{AttrUpdate, Errno, FsId, Handle, ObjectRef};

/// Attributes of a stored object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttr {
    /// Permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Byte length of the object's data.
    pub size: u64,
}

/// File system usage summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    /// File system queried.
    pub fs_id: u32,
    /// Objects in the file system.
    pub object_count: u64,
    /// Bytes of object data.
    pub bytes_used: u64,
}

#[derive(Debug, Clone)]
struct Object {
    fs_id: FsId,
    attr: ObjectAttr,
    data: Vec<u8>,
}

/// Storage backend used by store jobs.
pub trait ObjectStore: Send + Sync {
    /// Allocates a new empty object.
    fn create(&self, fs_id: FsId) -> Result<Handle, Errno>;

    /// Deletes an object.
    fn remove(&self, obj: ObjectRef) -> Result<(), Errno>;

    /// Reads an object's attributes.
    fn getattr(&self, obj: ObjectRef) -> Result<ObjectAttr, Errno>;

    /// Applies the set fields of `update`.
    fn setattr(&self, obj: ObjectRef, update: &AttrUpdate) -> Result<ObjectAttr, Errno>;

    /// Shrinks or zero-extends an object to `size` bytes. Sizes past the
    /// store's cap fail with `ENOSPC`.
    fn truncate(&self, obj: ObjectRef, size: u64) -> Result<(), Errno>;

    /// Reads up to `len` bytes at `offset`; short at end of object.
    fn read(&self, obj: ObjectRef, offset: u64, len: u64) -> Result<Vec<u8>, Errno>;

    /// Writes `data` at `offset`, zero-filling any gap. Returns bytes written.
    /// Fails with `ENOSPC` when the write would end past the store's cap.
    fn write(&self, obj: ObjectRef, offset: u64, data: &[u8]) -> Result<u64, Errno>;

    /// Usage of one file system.
    fn statfs(&self, fs_id: FsId) -> Result<StatFs, Errno>;
}

/// Largest object a store accepts unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 64 * 1024 * 1024;

/// Object store backed by a concurrent hash map.
pub struct MemStore {
    objects: DashMap<Handle, Object>,
    next_handle: AtomicU64,
    max_object_size: u64,
}

impl MemStore {
    /// Creates an empty store with the default object size cap.
    pub fn new() -> Self {
        Self::with_max_object_size(DEFAULT_MAX_OBJECT_SIZE)
    }

    /// Creates an empty store whose objects never grow past `max` bytes.
    pub fn with_max_object_size(max: u64) -> Self {
        Self {
            objects: DashMap::new(),
            next_handle: AtomicU64::new(1),
            max_object_size: max,
        }
    }

    /// Size cap enforced by truncate and write.
    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    /// Number of objects across all file systems.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true when no objects exist.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn lookup(&self, obj: ObjectRef) -> Result<dashmap::mapref::one::RefMut<'_, Handle, Object>, Errno> {
        match self.objects.get_mut(&obj.handle) {
            Some(entry) if entry.fs_id == obj.fs_id => Ok(entry),
            _ => Err(Errno::NoEnt),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemStore {
    fn create(&self, fs_id: FsId) -> Result<Handle, Errno> {
        let handle = Handle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.objects.insert(
            handle,
            Object {
                fs_id,
                attr: ObjectAttr {
                    mode: 0o644,
                    ..Default::default()
                },
                data: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn remove(&self, obj: ObjectRef) -> Result<(), Errno> {
        self.objects
            .remove_if(&obj.handle, |_, o| o.fs_id == obj.fs_id)
            .map(|_| ())
            .ok_or(Errno::NoEnt)
    }

    fn getattr(&self, obj: ObjectRef) -> Result<ObjectAttr, Errno> {
        Ok(self.lookup(obj)?.attr)
    }

    fn setattr(&self, obj: ObjectRef, update: &AttrUpdate) -> Result<ObjectAttr, Errno> {
        let mut entry = self.lookup(obj)?;
        if let Some(mode) = update.mode {
            entry.attr.mode = mode;
        }
        if let Some(uid) = update.uid {
            entry.attr.uid = uid;
        }
        if let Some(gid) = update.gid {
            entry.attr.gid = gid;
        }
        Ok(entry.attr)
    }

    fn truncate(&self, obj: ObjectRef, size: u64) -> Result<(), Errno> {
        if size > self.max_object_size {
            return Err(Errno::NoSpc);
        }
        let len = usize::try_from(size).map_err(|_| Errno::Overflow)?;
        let mut entry = self.lookup(obj)?;
        entry.data.resize(len, 0);
        entry.attr.size = size;
        Ok(())
    }

    fn read(&self, obj: ObjectRef, offset: u64, len: u64) -> Result<Vec<u8>, Errno> {
        let entry = self.lookup(obj)?;
        let size = entry.data.len() as u64;
        let start = offset.min(size) as usize;
        let end = offset.saturating_add(len).min(size) as usize;
        Ok(entry.data[start..end].to_vec())
    }

    fn write(&self, obj: ObjectRef, offset: u64, data: &[u8]) -> Result<u64, Errno> {
        let last = offset
            .checked_add(data.len() as u64)
            .ok_or(Errno::Overflow)?;
        if last > self.max_object_size {
            return Err(Errno::NoSpc);
        }
        let start = usize::try_from(offset).map_err(|_| Errno::Overflow)?;
        let end = start.checked_add(data.len()).ok_or(Errno::Overflow)?;
        let mut entry = self.lookup(obj)?;
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[start..end].copy_from_slice(data);
        entry.attr.size = entry.data.len() as u64;
        Ok(data.len() as u64)
    }

    fn statfs(&self, fs_id: FsId) -> Result<StatFs, Errno> {
        let mut stat = StatFs {
            fs_id: fs_id.as_u32(),
            ..Default::default()
        };
        for entry in self.objects.iter().filter(|e| e.fs_id == fs_id) {
            stat.object_count += 1;
            stat.bytes_used += entry.data.len() as u64;
        }
        Ok(stat)
    }
}
