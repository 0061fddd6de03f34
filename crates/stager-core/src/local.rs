//! Collaborators backed by local directories.
//!
//! Used by the operator CLI and the integration tests: the cache lives under one
//! directory, tape and optical volumes are image files, disk-archive volumes are
//! directory trees, and silo volumes are directories of object files.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::checksum::ChecksumValue;
use crate::collab::{
    CacheFile, CacheOpen, Catalog, FilesystemLink, IntakeEvent, LibraryInfo, MediaProvider,
    StageDescriptor, VolumeInfo,
};
use crate::config::MediaOptions;
use crate::error::StageErrno;
use crate::media::{BlockDevice, DiskArchive, Media, ObjectStore, SequentialDevice, SiloSource};
use crate::sync::{lock_unpoisoned, wait_timeout_unpoisoned, wait_unpoisoned};
use crate::types::{FileId, FsId, LibraryId, MediaType, Vsn};
use crate::{Result, StagerError};

/// Final answer the filesystem received for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageResponse {
    pub id: FileId,
    pub fseq: FsId,
    pub result: std::result::Result<(), StageErrno>,
}

/// Filesystem whose cache files live under one directory.
pub struct LocalFilesystem {
    cache_root: PathBuf,
    events_tx: Sender<IntakeEvent>,
    events_rx: Receiver<IntakeEvent>,
    responses: Mutex<Vec<StageResponse>>,
    responded: Condvar,
    checksums: Mutex<HashMap<(FileId, FsId), ChecksumValue>>,
    unmounted: Mutex<HashSet<FsId>>,
    gate: Arc<WriteGate>,
}

impl LocalFilesystem {
    pub fn new(cache_root: impl Into<PathBuf>) -> io::Result<Self> {
        let cache_root = cache_root.into();
        fs::create_dir_all(&cache_root)?;
        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            cache_root,
            events_tx,
            events_rx,
            responses: Mutex::new(Vec::new()),
            responded: Condvar::new(),
            checksums: Mutex::new(HashMap::new()),
            unmounted: Mutex::new(HashSet::new()),
            gate: Arc::new(WriteGate::default()),
        })
    }

    /// Queues a stage request as if a reader had blocked on the file.
    pub fn submit(&self, descriptor: StageDescriptor) {
        let _ = self.events_tx.send(IntakeEvent::Stage(descriptor));
    }

    pub fn cancel(&self, id: FileId, fseq: FsId) {
        let _ = self.events_tx.send(IntakeEvent::Cancel { id, fseq });
    }

    /// Checksum the file was archived with.
    pub fn record_checksum(&self, id: FileId, fseq: FsId, value: ChecksumValue) {
        lock_unpoisoned(&self.checksums).insert((id, fseq), value);
    }

    pub fn set_mounted(&self, fseq: FsId, mounted: bool) {
        let mut unmounted = lock_unpoisoned(&self.unmounted);
        if mounted {
            unmounted.remove(&fseq);
        } else {
            unmounted.insert(fseq);
        }
    }

    /// Parks every cache write until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        lock_unpoisoned(&self.gate.state).held = true;
    }

    pub fn release_writes(&self) {
        lock_unpoisoned(&self.gate.state).held = false;
        self.gate.changed.notify_all();
    }

    /// Waits until a cache write is parked by [`hold_writes`](Self::hold_writes).
    pub fn wait_for_held_write(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock_unpoisoned(&self.gate.state);
        while state.parked == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = wait_timeout_unpoisoned(&self.gate.changed, state, deadline - now);
            state = guard;
        }
        true
    }

    pub fn cache_path(&self, id: FileId, fseq: FsId) -> PathBuf {
        self.cache_root
            .join(fseq.0.to_string())
            .join(format!("{}.{}", id.ino, id.r#gen))
    }

    pub fn read_cache(&self, id: FileId, fseq: FsId) -> io::Result<Vec<u8>> {
        fs::read(self.cache_path(id, fseq))
    }

    pub fn responses(&self) -> Vec<StageResponse> {
        lock_unpoisoned(&self.responses).clone()
    }

    /// Waits for the response to `id`.
    pub fn wait_for_response(&self, id: FileId, timeout: Duration) -> Option<StageResponse> {
        let deadline = Instant::now() + timeout;
        let mut responses = lock_unpoisoned(&self.responses);
        loop {
            if let Some(response) = responses.iter().find(|response| response.id == id) {
                return Some(*response);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = wait_timeout_unpoisoned(&self.responded, responses, deadline - now);
            responses = guard;
        }
    }
}

impl FilesystemLink for LocalFilesystem {
    fn next_event(&self, timeout: Duration) -> Result<Option<IntakeEvent>> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StagerError::Stage(StageErrno::CommFailure)),
        }
    }

    fn respond(&self, id: FileId, fseq: FsId, result: std::result::Result<(), StageErrno>) -> Result<()> {
        tracing::debug!(ino = id.ino, fseq = fseq.0, ?result, "stage response");
        lock_unpoisoned(&self.responses).push(StageResponse { id, fseq, result });
        self.responded.notify_all();
        Ok(())
    }

    fn open_cache(&self, open: &CacheOpen) -> std::result::Result<Box<dyn CacheFile>, StageErrno> {
        let path = self.cache_path(open.id, open.fseq);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StageErrno::from(&err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| StageErrno::from(&err))?;
        Ok(Box::new(LocalCacheFile {
            file,
            gate: self.gate.clone(),
        }))
    }

    fn recorded_checksum(&self, id: FileId, fseq: FsId) -> Result<ChecksumValue> {
        lock_unpoisoned(&self.checksums)
            .get(&(id, fseq))
            .copied()
            .ok_or(StagerError::Stage(StageErrno::NotFound))
    }

    fn is_mounted(&self, fseq: FsId) -> bool {
        !lock_unpoisoned(&self.unmounted).contains(&fseq)
    }

    fn file_exists(&self, id: FileId, fseq: FsId) -> bool {
        self.cache_path(id, fseq).exists()
    }
}

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    parked: usize,
}

#[derive(Debug, Default)]
struct WriteGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl WriteGate {
    fn pass(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if !state.held {
            return;
        }
        state.parked += 1;
        self.changed.notify_all();
        while state.held {
            state = wait_unpoisoned(&self.changed, state);
        }
        state.parked -= 1;
    }
}

struct LocalCacheFile {
    file: File,
    gate: Arc<WriteGate>,
}

impl CacheFile for LocalCacheFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.gate.pass();
        self.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Catalog kept in memory, edited by the caller.
#[derive(Debug, Default)]
pub struct LocalCatalog {
    volumes: Mutex<HashMap<(Vsn, MediaType), VolumeInfo>>,
    libraries: Mutex<Vec<LibraryInfo>>,
    suspended: Mutex<HashSet<MediaType>>,
    load_requests: Mutex<Vec<Vsn>>,
    refuse_loads: AtomicBool,
}

impl LocalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_library(&self, id: LibraryId, drives: usize) {
        let mut libraries = lock_unpoisoned(&self.libraries);
        libraries.retain(|library| library.id != id);
        libraries.push(LibraryInfo { id, drives, on: true });
    }

    pub fn set_library_on(&self, id: LibraryId, on: bool) {
        for library in lock_unpoisoned(&self.libraries).iter_mut() {
            if library.id == id {
                library.on = on;
            }
        }
    }

    /// Registers a volume in `library`, available and not loaded.
    pub fn add_volume(&self, vsn: Vsn, media: MediaType, library: LibraryId) {
        let info = VolumeInfo {
            vsn: vsn.clone(),
            media,
            library,
            loaded: false,
            unavailable: false,
            bad_media: false,
        };
        lock_unpoisoned(&self.volumes).insert((vsn, media), info);
    }

    /// Applies `edit` to a registered volume; returns false when it is unknown.
    pub fn update_volume(&self, vsn: &Vsn, media: MediaType, edit: impl FnOnce(&mut VolumeInfo)) -> bool {
        match lock_unpoisoned(&self.volumes).get_mut(&(vsn.clone(), media)) {
            Some(volume) => {
                edit(volume);
                true
            }
            None => false,
        }
    }

    pub fn suspend(&self, media: MediaType, suspended: bool) {
        let mut set = lock_unpoisoned(&self.suspended);
        if suspended {
            set.insert(media);
        } else {
            set.remove(&media);
        }
    }

    pub fn refuse_loads(&self, refuse: bool) {
        self.refuse_loads.store(refuse, Ordering::Release);
    }

    /// Volumes an operator was asked to load.
    pub fn load_requests(&self) -> Vec<Vsn> {
        lock_unpoisoned(&self.load_requests).clone()
    }
}

impl Catalog for LocalCatalog {
    fn find_volume(&self, vsn: &Vsn, media: MediaType) -> Option<VolumeInfo> {
        lock_unpoisoned(&self.volumes).get(&(vsn.clone(), media)).cloned()
    }

    fn libraries(&self) -> Vec<LibraryInfo> {
        lock_unpoisoned(&self.libraries).clone()
    }

    fn drive_free(&self, library: LibraryId) -> bool {
        self.library(library).is_some_and(|library| library.on && library.drives > 0)
    }

    fn staging_suspended(&self, media: MediaType) -> bool {
        lock_unpoisoned(&self.suspended).contains(&media)
    }

    fn request_load(&self, vsn: &Vsn, _media: MediaType) -> bool {
        if self.refuse_loads.load(Ordering::Acquire) {
            return false;
        }
        lock_unpoisoned(&self.load_requests).push(vsn.clone());
        true
    }
}

/// Tape or optical volume stored as `<root>/<vsn>.img`, addressed in fixed blocks.
pub struct FileBlockDevice {
    root: PathBuf,
    block_size: usize,
    file: Option<File>,
}

impl FileBlockDevice {
    pub fn new(root: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            root: root.into(),
            block_size,
            file: None,
        }
    }

    pub fn image_path(root: &Path, vsn: &Vsn) -> PathBuf {
        root.join(format!("{}.img", vsn.as_str()))
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))
    }
}

impl BlockDevice for FileBlockDevice {
    fn mount(&mut self, vsn: &Vsn) -> io::Result<usize> {
        let path = Self::image_path(&self.root, vsn);
        let file = File::open(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => io::Error::from_raw_os_error(libc::ENODEV),
            _ => err,
        })?;
        self.file = Some(file);
        Ok(self.block_size)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => break,
                read => filled += read,
            }
        }
        Ok(filled)
    }

    fn locate(&mut self, block: u64) -> io::Result<()> {
        let offset = block * self.block_size as u64;
        self.file()?.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn skip(&mut self, bytes: u64) -> io::Result<()> {
        let bytes = i64::try_from(bytes).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.file()?.seek(SeekFrom::Current(bytes))?;
        Ok(())
    }

    fn unmount(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Silo whose volumes are directories holding one file per object position.
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, vsn: &Vsn, position: u64) -> PathBuf {
        self.root.join(vsn.as_str()).join(position.to_string())
    }
}

impl ObjectStore for DirectoryObjectStore {
    fn contains_volume(&self, vsn: &Vsn) -> bool {
        self.root.join(vsn.as_str()).is_dir()
    }

    fn fetch(&self, vsn: &Vsn, position: u64, offset: u64, len: usize) -> io::Result<Bytes> {
        let file = File::open(self.object_path(vsn, position))?;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read_at(&mut data[filled..], offset + filled as u64)? {
                0 => break,
                read => filled += read,
            }
        }
        data.truncate(filled);
        Ok(Bytes::from(data))
    }
}

/// Opens local backends: image files for sequential media, directory trees for disk
/// archives and silos.
#[derive(Debug, Clone)]
pub struct LocalMediaProvider {
    pub tape_root: PathBuf,
    pub disk_root: PathBuf,
    pub silo_root: PathBuf,
    pub tape_block_size: usize,
    pub options: MediaOptions,
}

impl LocalMediaProvider {
    /// All media rooted under one directory: `tape/`, `disk/` and `silo/`.
    pub fn under(root: &Path, options: MediaOptions) -> Self {
        Self {
            tape_root: root.join("tape"),
            disk_root: root.join("disk"),
            silo_root: root.join("silo"),
            tape_block_size: 512,
            options,
        }
    }

    pub fn with_tape_block_size(mut self, block_size: usize) -> Self {
        self.tape_block_size = block_size;
        self
    }
}

impl MediaProvider for LocalMediaProvider {
    fn open(&self, volume: &VolumeInfo, drive: usize) -> Result<Media> {
        tracing::debug!(vsn = %volume.vsn, media = %volume.media, drive, "opening local media");
        let media = match volume.media {
            MediaType::Tape | MediaType::Optical => Media::Sequential(SequentialDevice::new(
                Box::new(FileBlockDevice::new(&self.tape_root, self.tape_block_size)),
                volume.media,
                &self.options,
            )),
            MediaType::Disk => Media::DiskArchive(DiskArchive::new(
                &self.disk_root,
                self.options.disk_archive_block_size,
            )),
            MediaType::Silo => Media::Silo(SiloSource::new(
                Arc::new(DirectoryObjectStore::new(&self.silo_root)),
                self.options.disk_archive_block_size,
                self.options.silo_fetch_size,
            )?),
        };
        Ok(media)
    }
}
