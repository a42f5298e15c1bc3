// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./memory_test.rs"]
mod memory_test;

/// A transport for named memory regions that can be shared
/// between processes.
pub trait SharedMemory: Send + Sync + std::fmt::Debug {
    /// Open the named segment, creating it zero-filled if it
    /// does not exist yet.
    ///
    /// Every call for the same name must map the same memory, so
    /// that writes through one region are visible through all others.
    /// A segment that no open region refers to any more (because its
    /// users exited without cleaning up) starts over zero-filled too.
    fn open(&self, name: &str, len: usize) -> Result<Region>;

    /// Remove the named segment so that the next open starts from
    /// a zero-filled region. Regions that are already open stay valid.
    fn remove(&self, name: &str) -> Result<()>;
}

/// A mapped view of a shared memory segment.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

enum Backing {
    Mapped {
        _map: memmap2::MmapMut,
        _lease: FileLease,
    },
    Local(Arc<LocalSegment>),
}

// Safety: the region only hands out a raw pointer, and the memory it
// points at is owned by the backing for as long as the region lives
unsafe impl Send for Region {}
// Safety: see above, all access to the pointed-at memory goes through
// atomics or fields that are written once before being published
unsafe impl Sync for Region {}

impl Region {
    /// The start of the mapped memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The length of the mapped memory in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no memory is mapped at all
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Mapped { .. } => "mapped",
            Backing::Local(_) => "local",
        };
        f.debug_struct("Region")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("kind", &kind)
            .finish()
    }
}

/// Shares memory between processes through memory-mapped files.
///
/// On linux the default location is `/dev/shm`, so the segments never
/// touch a disk.
///
/// Each open region holds a shared `flock` on its segment file. The
/// kernel drops it when the process exits, however that happens, so an
/// exclusive lock that can be taken on open means the file was left
/// behind and is reset.
#[derive(Clone, Debug)]
pub struct FileMemory {
    root: PathBuf,
}

impl Default for FileMemory {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

impl FileMemory {
    /// Share memory through files in the given directory
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The directory used when none is specified
    pub fn default_root() -> PathBuf {
        let shm = Path::new("/dev/shm");
        if cfg!(target_os = "linux") && shm.is_dir() {
            return shm.to_owned();
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("redirfs")
    }

    /// The directory holding the segment files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segment_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(|c| matches!(c, '/' | '\\' | '\0'))
        {
            return Err(Error::InvalidSegmentName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

impl SharedMemory for FileMemory {
    fn open(&self, name: &str, len: usize) -> Result<Region> {
        let path = self.segment_path(name)?;
        std::fs::create_dir_all(&self.root).map_err(|err| Error::SegmentOpen(path.clone(), err))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| Error::SegmentOpen(path.clone(), err))?;
        let lease =
            FileLease::acquire(file, &path).map_err(|err| Error::SegmentOpen(path.clone(), err))?;
        let file = lease.file();

        // growing to the same length from two processes at once
        // is harmless, and never truncates an initialized record
        let current = file
            .metadata()
            .map_err(|err| Error::SegmentOpen(path.clone(), err))?
            .len();
        if current < len as u64 {
            file.set_len(len as u64)
                .map_err(|err| Error::SegmentOpen(path.clone(), err))?;
        }

        // Safety: the file is mapped shared and may change underneath us,
        // which is why the record only exposes it through atomics and
        // fields that are written once before the record is published
        let mut mmap = unsafe { memmap2::MmapOptions::new().len(len).map_mut(file) }
            .map_err(|err| Error::SegmentOpen(path.clone(), err))?;
        let ptr = NonNull::from(&mut mmap[..]).cast::<u8>();
        tracing::trace!(?path, %len, "mapped shared memory segment");
        Ok(Region {
            ptr,
            len,
            backing: Backing::Mapped {
                _map: mmap,
                _lease: lease,
            },
        })
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.segment_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(?path, "removed shared memory segment");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::SegmentRemove(path, err)),
        }
    }
}

/// Marks an open segment file as in use by this process
#[cfg(unix)]
struct FileLease(nix::fcntl::Flock<File>);

#[cfg(unix)]
impl FileLease {
    fn acquire(file: File, path: &Path) -> io::Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                if lock.metadata()?.len() > 0 {
                    tracing::debug!(?path, "resetting shared memory segment without users");
                }
                lock.set_len(0)?;
                lock.relock(FlockArg::LockShared)?;
                Ok(Self(lock))
            }
            Err((file, errno)) if errno == Errno::EWOULDBLOCK => {
                match Flock::lock(file, FlockArg::LockShared) {
                    Ok(lock) => Ok(Self(lock)),
                    Err((_, errno)) => Err(errno.into()),
                }
            }
            Err((_, errno)) => Err(errno.into()),
        }
    }

    fn file(&self) -> &File {
        &self.0
    }
}

// TODO: hold the segment with LockFileEx on windows, until then a
// segment left behind by a crashed process keeps its old contents
#[cfg(not(unix))]
struct FileLease(File);

#[cfg(not(unix))]
impl FileLease {
    fn acquire(file: File, _path: &Path) -> io::Result<Self> {
        Ok(Self(file))
    }

    fn file(&self) -> &File {
        &self.0
    }
}

/// Shares memory between the users of one instance, within a
/// single process.
///
/// This stands in for a real transport wherever the processes of
/// a session are simulated by threads.
#[derive(Debug, Default)]
pub struct LocalMemory {
    segments: DashMap<String, Arc<LocalSegment>>,
}

impl LocalMemory {
    /// An empty set of segments
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the named segment currently exists
    pub fn contains(&self, name: &str) -> bool {
        self.segments.contains_key(name)
    }
}

#[derive(Debug)]
struct LocalSegment {
    // words rather than bytes, so that the region is aligned for the record
    words: Box<[AtomicU64]>,
}

impl LocalSegment {
    fn zeroed(len: usize) -> Self {
        let words = len.div_ceil(std::mem::size_of::<AtomicU64>());
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.words.len() * std::mem::size_of::<AtomicU64>()
    }
}

impl SharedMemory for LocalMemory {
    fn open(&self, name: &str, len: usize) -> Result<Region> {
        let segment = match self.segments.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                // only the map refers to it, so every user has gone
                if Arc::strong_count(entry.get()) == 1 {
                    entry.insert(Arc::new(LocalSegment::zeroed(len)));
                }
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                Arc::clone(entry.insert(Arc::new(LocalSegment::zeroed(len))).value())
            }
        };
        if segment.len() < len {
            return Err(Error::RegionTooSmall {
                len: segment.len(),
                required: len,
            });
        }
        // the atomics provide the interior mutability that
        // writes through this pointer rely on
        let ptr = NonNull::from(&segment.words[..]).cast::<u8>();
        Ok(Region {
            ptr,
            len,
            backing: Backing::Local(segment),
        })
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.segments.remove(name);
        Ok(())
    }
}
