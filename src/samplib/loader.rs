//! Async sample library loader.
//!
//! Requirements, in order of importance:
//! 1. The audio thread gets committed assets with zero locks.
//! 2. Already-loaded assets resolve fast.
//! 3. In-progress loads that are no longer needed get cancelled.
//! 4. The GUI can read loading percentages.
//! 5. No asset is duplicated in memory.
//! 6. Unused assets are freed.
//!
//! One background thread consumes a lock-free request queue, decodes audio
//! (fanning file decodes out over a small worker pool), and publishes
//! finished assets through completion callbacks. Assets carry explicit
//! reference counts; a reaper pass on the loader thread frees whatever has
//! dropped to zero. Releasing a count never frees memory on the caller's
//! thread - it just pokes the loader's work signaller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;

use crate::constants::NUM_LAYERS;
use crate::samplib::{
    AudioData, AudioDecoder, Instrument, InstrumentId, IrId, Library, LibraryId, LibraryProvider,
};
use crate::sync::error_notifications::{error_id, ErrorNotice, ErrorNotifications};
use crate::sync::ref_list::{AtomicRefList, Node, RetainedValue};
use crate::sync::signal::WorkSignaller;
use crate::sync::thread_pool::ThreadPool;
use crate::types::{LoadError, RequestId};

const REAP_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Reference-counted assets

/// A decoded audio file held in the loader's cache.
pub struct ListedAudioData {
    pub library: LibraryId,
    pub path: PathBuf,
    pub audio: AudioData,
    refs: AtomicU32,
}

/// An instrument paired with the decoded audio for each of its regions.
/// `audio_datas` is parallel to `instrument.regions`.
pub struct LoadedInstrument {
    pub id: InstrumentId,
    pub instrument: Instrument,
    audio_datas: Vec<NonNull<ListedAudioData>>,
}

impl LoadedInstrument {
    #[inline]
    pub fn audio_for_region(&self, region_index: usize) -> &AudioData {
        // Safety: the owning ListedInstrument holds a retain on every entry
        // for as long as it lives.
        unsafe { &self.audio_datas[region_index].as_ref().audio }
    }

    pub fn num_regions(&self) -> usize {
        self.instrument.regions.len()
    }
}

// Safety: the pointed-to cache entries are only freed by the reaper after
// every retain is gone.
unsafe impl Send for LoadedInstrument {}
unsafe impl Sync for LoadedInstrument {}

pub struct ListedInstrument {
    pub loaded: LoadedInstrument,
    content_hash: u64,
    refs: AtomicU32,
}

/// Borrowed, copyable reference to a loaded instrument. Valid while the
/// holder owns at least one retain and the loader is alive.
#[derive(Clone, Copy)]
pub struct InstrumentHandle {
    inst: NonNull<ListedInstrument>,
    signaller: NonNull<WorkSignaller>,
}

unsafe impl Send for InstrumentHandle {}
unsafe impl Sync for InstrumentHandle {}

impl InstrumentHandle {
    #[inline]
    pub fn loaded(&self) -> &LoadedInstrument {
        unsafe { &self.inst.as_ref().loaded }
    }

    #[inline]
    pub fn retain(&self) {
        unsafe { self.inst.as_ref() }
            .refs
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Never frees on the calling thread; the loader's reaper does the work.
    #[inline]
    pub fn release(&self) {
        let prev = unsafe { self.inst.as_ref() }
            .refs
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0);
        if prev == 1 {
            unsafe { self.signaller.as_ref() }.signal();
        }
    }

    pub fn ptr_for_identity(&self) -> *const () {
        self.inst.as_ptr() as *const ()
    }

    pub(crate) fn from_raw(inst: NonNull<ListedInstrument>, signaller: NonNull<WorkSignaller>) -> Self {
        Self { inst, signaller }
    }

    /// Safety: caller must guarantee `ptr` came from `ptr_for_identity` on a
    /// handle whose retain is still held.
    pub unsafe fn from_identity_ptr(ptr: *const (), signaller: &WorkSignaller) -> Self {
        Self {
            inst: NonNull::new(ptr as *mut ListedInstrument).unwrap(),
            signaller: NonNull::from(signaller),
        }
    }
}

/// Borrowed, copyable reference to a loaded impulse response.
#[derive(Clone, Copy)]
pub struct IrHandle {
    data: NonNull<ListedAudioData>,
    signaller: NonNull<WorkSignaller>,
}

unsafe impl Send for IrHandle {}
unsafe impl Sync for IrHandle {}

impl IrHandle {
    #[inline]
    pub fn audio(&self) -> &AudioData {
        unsafe { &self.data.as_ref().audio }
    }

    #[inline]
    pub fn retain(&self) {
        unsafe { self.data.as_ref() }
            .refs
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn release(&self) {
        let prev = unsafe { self.data.as_ref() }
            .refs
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0);
        if prev == 1 {
            unsafe { self.signaller.as_ref() }.signal();
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and results

#[derive(Debug, Clone)]
pub enum LoadRequest {
    Instrument { layer_index: u32, id: InstrumentId },
    Ir { id: IrId },
}

#[derive(Clone, Copy)]
pub enum AssetRef {
    Instrument(InstrumentHandle),
    Ir(IrHandle),
}

pub enum LoadOutcome {
    Success(AssetRef),
    Error(LoadError),
    Cancelled,
}

pub struct LoadResult {
    pub id: RequestId,
    pub outcome: LoadOutcome,
}

pub type LoadCompletedCallback = Box<dyn Fn(&LoadResult) + Send + Sync>;

/// A client endpoint. The loader owns the connection; clients get an `Arc`
/// that stays valid until `close_connection`.
pub struct Connection {
    completed_callback: LoadCompletedCallback,
    error_notifications: Arc<ErrorNotifications>,
    /// Latest request id per layer; an older in-flight request for the same
    /// layer is superseded and reports Cancelled.
    latest_request_per_layer: [AtomicU64; NUM_LAYERS],
    /// -1 when idle, else 0..=100.
    pub instrument_loading_percents: [AtomicI32; NUM_LAYERS],
    open: AtomicBool,
}

struct QueuedRequest {
    id: RequestId,
    request: LoadRequest,
    connection: Arc<Connection>,
}

// ---------------------------------------------------------------------------
// Loader

struct Shared {
    request_queue: SegQueue<QueuedRequest>,
    work_signaller: WorkSignaller,
    end_thread: AtomicBool,
    rescan_requested: AtomicBool,
    connections: Mutex<Vec<Arc<Connection>>>,
    libraries: AtomicRefList<Library>,
    libraries_by_id: DashMap<LibraryId, LibraryNodePtr>,
    request_id_counter: AtomicU64,
    error_notifications: Arc<ErrorNotifications>,

    // Observational counters, read relaxed by the GUI.
    total_bytes_used_by_samples: AtomicU64,
    num_insts_loaded: AtomicU32,
    num_samples_loaded: AtomicU32,
}

#[derive(Clone, Copy)]
struct LibraryNodePtr(*const Node<Library>);
unsafe impl Send for LibraryNodePtr {}
unsafe impl Sync for LibraryNodePtr {}

pub struct Loader {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Cheap handle for sending requests and managing connections without
/// borrowing the `Loader` itself. Keeps the loader's shared state (and with
/// it the work signaller inside every asset handle) alive.
#[derive(Clone)]
pub struct LoaderClient {
    shared: Arc<Shared>,
}

impl LoaderClient {
    pub fn send_load_request(
        &self,
        connection: &Arc<Connection>,
        request: LoadRequest,
    ) -> RequestId {
        self.shared.send_load_request(connection, request)
    }

    pub fn close_connection(&self, connection: &Arc<Connection>) {
        self.shared.close_connection(connection);
    }

    pub fn work_signaller(&self) -> &WorkSignaller {
        &self.shared.work_signaller
    }

    pub fn error_notifications(&self) -> &Arc<ErrorNotifications> {
        &self.shared.error_notifications
    }
}

impl Shared {
    fn send_load_request(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        request: LoadRequest,
    ) -> RequestId {
        let id = self.request_id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let LoadRequest::Instrument { layer_index, .. } = &request {
            connection.latest_request_per_layer[*layer_index as usize]
                .store(id, Ordering::Release);
            connection.instrument_loading_percents[*layer_index as usize]
                .store(0, Ordering::Relaxed);
        }
        self.request_queue.push(QueuedRequest {
            id,
            request,
            connection: Arc::clone(connection),
        });
        self.work_signaller.signal();
        id
    }

    fn close_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        connection.open.store(false, Ordering::Release);
        self.connections
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, connection));
        self.work_signaller.signal();
    }
}

impl Loader {
    pub fn new(
        provider: Box<dyn LibraryProvider>,
        decoder: Box<dyn AudioDecoder + 'static>,
        error_notifications: Arc<ErrorNotifications>,
        num_decode_threads: Option<usize>,
    ) -> Self {
        let shared = Arc::new(Shared {
            request_queue: SegQueue::new(),
            work_signaller: WorkSignaller::new(),
            end_thread: AtomicBool::new(false),
            rescan_requested: AtomicBool::new(true),
            connections: Mutex::new(Vec::new()),
            libraries: AtomicRefList::new(),
            libraries_by_id: DashMap::new(),
            request_id_counter: AtomicU64::new(0),
            error_notifications,
            total_bytes_used_by_samples: AtomicU64::new(0),
            num_insts_loaded: AtomicU32::new(0),
            num_samples_loaded: AtomicU32::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("sample-loader".to_string())
            .spawn(move || {
                LoaderThread {
                    shared: thread_shared,
                    provider,
                    decoder: Arc::from(decoder),
                    decode_pool: ThreadPool::new("decode", num_decode_threads),
                    audio_cache: Vec::new(),
                    instrument_cache: Vec::new(),
                }
                .run();
            })
            .expect("Failed to spawn loader thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn open_connection(&self, completed_callback: LoadCompletedCallback) -> Arc<Connection> {
        let connection = Arc::new(Connection {
            completed_callback,
            error_notifications: Arc::clone(&self.shared.error_notifications),
            latest_request_per_layer: Default::default(),
            instrument_loading_percents: [(); NUM_LAYERS].map(|_| AtomicI32::new(-1)),
            open: AtomicBool::new(true),
        });
        self.shared
            .connections
            .lock()
            .unwrap()
            .push(Arc::clone(&connection));
        connection
    }

    pub fn close_connection(&self, connection: &Arc<Connection>) {
        self.shared.close_connection(connection);
    }

    pub fn send_load_request(
        &self,
        connection: &Arc<Connection>,
        request: LoadRequest,
    ) -> RequestId {
        self.shared.send_load_request(connection, request)
    }

    pub fn client(&self) -> LoaderClient {
        LoaderClient {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Ask the loader thread to re-read libraries from the provider.
    pub fn request_rescan(&self) {
        self.shared.rescan_requested.store(true, Ordering::Release);
        self.shared.work_signaller.signal();
    }

    /// Reader-side access to the scanned libraries. The closure runs with a
    /// retain held; iteration is weakly consistent with concurrent rescans.
    pub fn for_each_library(&self, mut f: impl FnMut(&Library)) {
        for node in self.shared.libraries.iter() {
            if let Some(library) = node.try_scoped() {
                f(&library);
            }
        }
    }

    /// Retained lookup of one library by identity.
    pub fn find_library_retained(&self, id: &LibraryId) -> Option<RetainedValue<'_, Library>> {
        let node_ptr = *self.shared.libraries_by_id.get(id)?;
        // Safety: nodes are never freed while the loader lives.
        unsafe { (*node_ptr.0).try_scoped() }
    }

    pub fn total_bytes_used_by_samples(&self) -> u64 {
        self.shared.total_bytes_used_by_samples.load(Ordering::Relaxed)
    }

    pub fn num_instruments_loaded(&self) -> u32 {
        self.shared.num_insts_loaded.load(Ordering::Relaxed)
    }

    pub fn num_samples_loaded(&self) -> u32 {
        self.shared.num_samples_loaded.load(Ordering::Relaxed)
    }

    pub fn work_signaller(&self) -> &WorkSignaller {
        &self.shared.work_signaller
    }

    /// Block until every queued request has been handled and the reaper has
    /// run. Test and shutdown aid; not for realtime use.
    pub fn drain(&self) {
        while !self.shared.request_queue.is_empty() {
            self.shared.work_signaller.signal();
            std::thread::sleep(Duration::from_millis(1));
        }
        // One extra beat for the request in flight.
        std::thread::sleep(Duration::from_millis(20));
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shared.end_thread.store(true, Ordering::Release);
        self.shared.work_signaller.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Loader thread internals

struct CachedAudio {
    data: Box<ListedAudioData>,
}

struct LoaderThread {
    shared: Arc<Shared>,
    provider: Box<dyn LibraryProvider>,
    decoder: Arc<dyn AudioDecoder>,
    decode_pool: ThreadPool,
    audio_cache: Vec<CachedAudio>,
    instrument_cache: Vec<Box<ListedInstrument>>,
}

impl LoaderThread {
    fn run(mut self) {
        loop {
            if self.shared.end_thread.load(Ordering::Acquire) {
                break;
            }

            if self.shared.rescan_requested.swap(false, Ordering::AcqRel) {
                self.scan_libraries();
            }

            while let Some(queued) = self.shared.request_queue.pop() {
                self.handle_request(queued);
            }

            self.reap();

            self.shared
                .work_signaller
                .wait_until_signalled_or_timeout(REAP_INTERVAL);
        }

        // Shutdown: drop every cached asset regardless of refcounts; by
        // contract all clients are gone before the loader.
        self.instrument_cache.clear();
        self.audio_cache.clear();
        self.shared.libraries_by_id.clear();
        self.shared.libraries.remove_all();
        self.shared.libraries.delete_removed_and_unreferenced();
    }

    fn scan_libraries(&mut self) {
        match self.provider.read_libraries() {
            Ok(libraries) => {
                // Replace changed libraries, keep unchanged ones, drop
                // removed ones. Readers holding retains keep old nodes
                // alive until they release.
                let mut incoming: HashMap<LibraryId, Library> = libraries
                    .into_iter()
                    .map(|library| (library.id.clone(), library))
                    .collect();

                let mut to_remove = Vec::new();
                for node in self.shared.libraries.iter() {
                    let existing = self.shared.libraries.writer_get(node);
                    match incoming.get(&existing.id) {
                        Some(new) if new.content_hash == existing.content_hash => {
                            incoming.remove(&existing.id);
                        }
                        _ => to_remove.push(existing.id.clone()),
                    }
                }
                for id in to_remove {
                    self.shared.libraries_by_id.remove(&id);
                    self.shared
                        .libraries
                        .remove_where(|library| library.id == id);
                }
                for (id, library) in incoming {
                    let node = self.shared.libraries.insert(library);
                    self.shared
                        .libraries_by_id
                        .insert(id, LibraryNodePtr(node as *const _));
                }
            }
            Err(error) => {
                self.shared.error_notifications.add_or_update(ErrorNotice {
                    title: "Library scan failed".to_string(),
                    message: error.to_string(),
                    id: error_id(*b"scan", "library-scan"),
                    error: Some(error),
                });
            }
        }
    }

    fn handle_request(&mut self, queued: QueuedRequest) {
        if !queued.connection.open.load(Ordering::Acquire) {
            return;
        }

        let outcome = match &queued.request {
            LoadRequest::Instrument { layer_index, id } => {
                self.load_instrument(&queued, *layer_index as usize, id)
            }
            LoadRequest::Ir { id } => self.load_ir(id),
        };

        if let LoadRequest::Instrument { layer_index, .. } = &queued.request {
            queued.connection.instrument_loading_percents[*layer_index as usize]
                .store(-1, Ordering::Relaxed);
        }

        if let LoadOutcome::Error(error) = &outcome {
            let distinguisher = format!("{:?}", queued.request);
            queued.connection.error_notifications.add_or_update(ErrorNotice {
                title: "Failed to load".to_string(),
                message: error.to_string(),
                id: error_id(*b"load", &distinguisher),
                error: Some(error.clone()),
            });
        }

        // A successful outcome arrives holding one temporary retain taken by
        // the load path, so the asset cannot be reaped before the client has
        // had the chance to retain it. Drop that retain once the callback
        // returns.
        let result = LoadResult {
            id: queued.id,
            outcome,
        };
        (queued.connection.completed_callback)(&result);
        if let LoadOutcome::Success(asset) = &result.outcome {
            match asset {
                AssetRef::Instrument(handle) => handle.release(),
                AssetRef::Ir(handle) => handle.release(),
            }
        }
    }

    fn superseded(&self, queued: &QueuedRequest, layer_index: usize) -> bool {
        queued.connection.latest_request_per_layer[layer_index].load(Ordering::Acquire)
            != queued.id
    }

    fn load_instrument(
        &mut self,
        queued: &QueuedRequest,
        layer_index: usize,
        id: &InstrumentId,
    ) -> LoadOutcome {
        if self.superseded(queued, layer_index) {
            return LoadOutcome::Cancelled;
        }

        let (instrument, library_path, content_hash) = {
            let Some(library) = self.find_library(&id.library) else {
                return LoadOutcome::Error(LoadError::InvalidLibrary {
                    library: id.library.to_string(),
                    reason: "not found".to_string(),
                });
            };
            let Some(instrument) = library.instrument(&id.instrument_name) else {
                return LoadOutcome::Error(LoadError::InvalidLibrary {
                    library: id.library.to_string(),
                    reason: format!("no instrument named '{}'", id.instrument_name),
                });
            };
            (
                instrument.clone(),
                library.path.clone(),
                library.content_hash,
            )
        };

        // Fast path: an identical instrument is already cached.
        if let Some(existing) = self.instrument_cache.iter().find(|listed| {
            listed.loaded.id == *id && listed.content_hash == content_hash
        }) {
            let handle = self.instrument_handle(&**existing);
            queued.connection.instrument_loading_percents[layer_index]
                .store(100, Ordering::Relaxed);
            return LoadOutcome::Success(AssetRef::Instrument(handle));
        }

        // Fan uncached files out over the decode pool first; single files
        // decode inline in audio_data_for_path.
        let mut uncached: Vec<PathBuf> = instrument
            .regions
            .iter()
            .map(|region| library_path.join(&region.path))
            .filter(|path| !self.audio_cache.iter().any(|c| c.data.path == *path))
            .collect();
        uncached.sort();
        uncached.dedup();
        if uncached.len() > 1 {
            for (path, decoded) in self.decode_parallel(uncached) {
                if let Ok(audio) = decoded {
                    self.insert_decoded_audio(&id.library, path, audio);
                }
                // Errors re-surface from audio_data_for_path below.
            }
        }

        let num_regions = instrument.regions.len();
        let mut audio_datas = Vec::with_capacity(num_regions);
        for (region_index, region) in instrument.regions.iter().enumerate() {
            let path = library_path.join(&region.path);
            match self.audio_data_for_path(&id.library, &path) {
                Ok(data) => audio_datas.push(data),
                Err(error) => {
                    // Release what was already retained for this build.
                    for &data in &audio_datas {
                        unsafe { data.as_ref() }.refs.fetch_sub(1, Ordering::AcqRel);
                    }
                    return LoadOutcome::Error(error);
                }
            }
            queued.connection.instrument_loading_percents[layer_index].store(
                ((region_index + 1) * 100 / num_regions.max(1)) as i32,
                Ordering::Relaxed,
            );
        }

        // The decode may have taken a while; a fresher request for this
        // layer wins. The decoded audio stays cached for whoever needs it.
        if self.superseded(queued, layer_index) {
            for &data in &audio_datas {
                unsafe { data.as_ref() }.refs.fetch_sub(1, Ordering::AcqRel);
            }
            return LoadOutcome::Cancelled;
        }

        let listed = Box::new(ListedInstrument {
            loaded: LoadedInstrument {
                id: id.clone(),
                instrument,
                audio_datas,
            },
            content_hash,
            refs: AtomicU32::new(0),
        });
        let handle = self.instrument_handle(&*listed);
        self.instrument_cache.push(listed);
        self.shared.num_insts_loaded.fetch_add(1, Ordering::Relaxed);

        LoadOutcome::Success(AssetRef::Instrument(handle))
    }

    fn load_ir(&mut self, id: &IrId) -> LoadOutcome {
        let path = {
            let Some(library) = self.find_library(&id.library) else {
                return LoadOutcome::Error(LoadError::InvalidLibrary {
                    library: id.library.to_string(),
                    reason: "not found".to_string(),
                });
            };
            let Some(ir) = library.ir(&id.ir_name) else {
                return LoadOutcome::Error(LoadError::InvalidLibrary {
                    library: id.library.to_string(),
                    reason: format!("no impulse response named '{}'", id.ir_name),
                });
            };
            library.resolve_audio_path(&ir.path)
        };

        match self.audio_data_for_path(&id.library, &path) {
            Ok(data) => LoadOutcome::Success(AssetRef::Ir(IrHandle {
                data,
                signaller: NonNull::from(&self.shared.work_signaller),
            })),
            Err(error) => LoadOutcome::Error(error),
        }
    }

    fn find_library(&self, id: &LibraryId) -> Option<RetainedValue<'_, Library>> {
        let node_ptr = *self.shared.libraries_by_id.get(id)?;
        unsafe { (*node_ptr.0).try_scoped() }
    }

    /// `listed` must be (or be about to be) a boxed member of
    /// `instrument_cache`; Box contents have stable addresses.
    fn instrument_handle(&self, listed: &ListedInstrument) -> InstrumentHandle {
        listed.refs.fetch_add(1, Ordering::Relaxed);
        InstrumentHandle::from_raw(
            NonNull::from(listed),
            NonNull::from(&self.shared.work_signaller),
        )
    }

    /// Get or decode the audio for `path`, returning a pointer the caller
    /// now holds one retain on.
    fn audio_data_for_path(
        &mut self,
        library: &LibraryId,
        path: &PathBuf,
    ) -> Result<NonNull<ListedAudioData>, LoadError> {
        if let Some(cached) = self.audio_cache.iter().find(|c| c.data.path == *path) {
            cached.data.refs.fetch_add(1, Ordering::Relaxed);
            return Ok(NonNull::from(&*cached.data));
        }

        let audio = self.decoder.decode(path)?;
        let ptr = self.insert_decoded_audio(library, path.clone(), audio);
        unsafe { ptr.as_ref() }.refs.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    /// Cache freshly decoded audio with a zero reference count.
    fn insert_decoded_audio(
        &mut self,
        library: &LibraryId,
        path: PathBuf,
        audio: AudioData,
    ) -> NonNull<ListedAudioData> {
        let size = audio.size_bytes();
        let data = Box::new(ListedAudioData {
            library: library.clone(),
            path,
            audio,
            refs: AtomicU32::new(0),
        });
        let ptr = NonNull::from(&*data);
        self.audio_cache.push(CachedAudio { data });
        self.shared
            .total_bytes_used_by_samples
            .fetch_add(size as u64, Ordering::Relaxed);
        self.shared.num_samples_loaded.fetch_add(1, Ordering::Relaxed);
        ptr
    }

    /// Decode several files concurrently on the worker pool.
    fn decode_parallel(
        &self,
        paths: Vec<PathBuf>,
    ) -> Vec<(PathBuf, Result<AudioData, LoadError>)> {
        let results = Arc::new(Mutex::new(Vec::with_capacity(paths.len())));
        let remaining = Arc::new(AtomicU32::new(paths.len() as u32));
        let done = Arc::new(WorkSignaller::new());

        for path in paths {
            let decoder = Arc::clone(&self.decoder);
            let results = Arc::clone(&results);
            let remaining = Arc::clone(&remaining);
            let done = Arc::clone(&done);
            self.decode_pool.add_job(move || {
                let decoded = decoder.decode(&path);
                results.lock().unwrap().push((path, decoded));
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    done.signal();
                }
            });
        }

        while remaining.load(Ordering::Acquire) != 0 {
            done.wait_until_signalled_or_timeout(Duration::from_millis(100));
        }
        let mut guard = results.lock().unwrap();
        std::mem::take(&mut *guard)
    }

    /// Free instruments and audio whose reference counts dropped to zero.
    fn reap(&mut self) {
        let mut index = 0;
        while index < self.instrument_cache.len() {
            if self.instrument_cache[index].refs.load(Ordering::Acquire) == 0 {
                let listed = self.instrument_cache.swap_remove(index);
                for data in &listed.loaded.audio_datas {
                    unsafe { data.as_ref() }.refs.fetch_sub(1, Ordering::AcqRel);
                }
                self.shared.num_insts_loaded.fetch_sub(1, Ordering::Relaxed);
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.audio_cache.len() {
            if self.audio_cache[index].data.refs.load(Ordering::Acquire) == 0 {
                let cached = self.audio_cache.swap_remove(index);
                self.shared.total_bytes_used_by_samples.fetch_sub(
                    cached.data.audio.size_bytes() as u64,
                    Ordering::Relaxed,
                );
                self.shared.num_samples_loaded.fetch_sub(1, Ordering::Relaxed);
            } else {
                index += 1;
            }
        }

        self.shared.libraries.delete_removed_and_unreferenced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplib::{InstrumentMetadata, Region};
    use std::path::Path;
    use std::sync::mpsc;

    struct TestProvider {
        libraries: Vec<Library>,
    }

    impl LibraryProvider for TestProvider {
        fn read_libraries(&self) -> Result<Vec<Library>, LoadError> {
            Ok(self.libraries.clone())
        }
    }

    /// Decoder producing a short ramp; optionally gated so tests can hold
    /// the loader mid-decode.
    struct TestDecoder {
        gate: Option<Arc<WorkSignaller>>,
        fail_paths: Vec<PathBuf>,
    }

    impl AudioDecoder for TestDecoder {
        fn decode(&self, path: &Path) -> Result<AudioData, LoadError> {
            if let Some(gate) = &self.gate {
                gate.wait_until_signalled();
            }
            if self.fail_paths.iter().any(|p| p == path) {
                return Err(LoadError::FileNotFound {
                    path: path.display().to_string(),
                });
            }
            let samples: Vec<f32> = (0..256).flat_map(|i| {
                let v = i as f32 / 256.0;
                [v, v]
            }).collect();
            Ok(AudioData {
                num_frames: 256,
                sample_rate: 44100,
                channels: 2,
                samples: samples.into_boxed_slice(),
            })
        }
    }

    fn test_library() -> Library {
        let region = |path: &str| Region {
            path: PathBuf::from(path),
            root_key: 60,
            key_range: (0, 128),
            velocity_range: (0, 128),
            round_robin_index: None,
            timbre_layer_range: None,
            builtin_loop: None,
            always_loop: false,
            gain_db: 0.0,
        };
        Library {
            id: LibraryId {
                author: "Tests".to_string(),
                name: "Basics".to_string(),
            },
            version: "1.0.0".to_string(),
            url: String::new(),
            path: PathBuf::from("/virtual"),
            content_hash: 1,
            instruments: vec![
                Instrument {
                    name: "Piano".to_string(),
                    metadata: InstrumentMetadata::default(),
                    regions: vec![region("piano_a.wav"), region("piano_b.wav")],
                },
                Instrument {
                    name: "Broken".to_string(),
                    metadata: InstrumentMetadata::default(),
                    regions: vec![region("missing.wav")],
                },
            ],
            irs: vec![crate::samplib::ImpulseResponse {
                name: "Hall".to_string(),
                path: PathBuf::from("hall.wav"),
            }],
        }
    }

    fn inst_id(name: &str) -> InstrumentId {
        InstrumentId {
            library: LibraryId {
                author: "Tests".to_string(),
                name: "Basics".to_string(),
            },
            instrument_name: name.to_string(),
        }
    }

    fn make_loader(gate: Option<Arc<WorkSignaller>>, fail_paths: Vec<PathBuf>) -> Loader {
        Loader::new(
            Box::new(TestProvider {
                libraries: vec![test_library()],
            }),
            Box::new(TestDecoder { gate, fail_paths }),
            Arc::new(ErrorNotifications::new()),
            Some(1),
        )
    }

    enum Completion {
        Success(RequestId),
        Error(RequestId, LoadError),
        Cancelled(RequestId),
    }

    fn recording_callback() -> (LoadCompletedCallback, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        let callback: LoadCompletedCallback = Box::new(move |result| {
            let completion = match &result.outcome {
                LoadOutcome::Success(asset) => {
                    // Keep the asset alive like a real client would.
                    if let AssetRef::Instrument(handle) = asset {
                        handle.retain();
                    }
                    Completion::Success(result.id)
                }
                LoadOutcome::Error(e) => Completion::Error(result.id, e.clone()),
                LoadOutcome::Cancelled => Completion::Cancelled(result.id),
            };
            tx.send(completion).unwrap();
        });
        (callback, rx)
    }

    #[test]
    fn loads_an_instrument_and_counts_assets() {
        let loader = make_loader(None, Vec::new());
        let (callback, rx) = recording_callback();
        let connection = loader.open_connection(callback);

        let id = loader.send_load_request(
            &connection,
            LoadRequest::Instrument {
                layer_index: 0,
                id: inst_id("Piano"),
            },
        );

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Completion::Success(result_id) => assert_eq!(result_id, id),
            _ => panic!("expected success"),
        }
        assert_eq!(loader.num_instruments_loaded(), 1);
        assert_eq!(loader.num_samples_loaded(), 2);
        assert!(loader.total_bytes_used_by_samples() > 0);
        loader.close_connection(&connection);
    }

    #[test]
    fn missing_file_reports_error_and_notification() {
        let loader = make_loader(None, vec![PathBuf::from("/virtual/missing.wav")]);
        let (callback, rx) = recording_callback();
        let connection = loader.open_connection(callback);

        loader.send_load_request(
            &connection,
            LoadRequest::Instrument {
                layer_index: 0,
                id: inst_id("Broken"),
            },
        );

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Completion::Error(_, LoadError::FileNotFound { .. }) => {}
            _ => panic!("expected FileNotFound"),
        }

        let mut notified = false;
        connection.error_notifications.for_each(|_| notified = true);
        assert!(notified, "expected a user-facing notification");
        loader.close_connection(&connection);
    }

    #[test]
    fn superseding_request_cancels_the_previous_one() {
        // Gate the decoder so request A is guaranteed to still be queued or
        // mid-flight when request B arrives for the same layer.
        let gate = Arc::new(WorkSignaller::new());
        let loader = make_loader(Some(Arc::clone(&gate)), Vec::new());
        let (callback, rx) = recording_callback();
        let connection = loader.open_connection(callback);

        let id_a = loader.send_load_request(
            &connection,
            LoadRequest::Instrument {
                layer_index: 0,
                id: inst_id("Piano"),
            },
        );
        let id_b = loader.send_load_request(
            &connection,
            LoadRequest::Instrument {
                layer_index: 0,
                id: inst_id("Piano"),
            },
        );

        // Release the decoder for however many decodes follow.
        for _ in 0..8 {
            gate.signal();
            std::thread::sleep(Duration::from_millis(5));
        }

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        match (first, second) {
            (Completion::Cancelled(a), Completion::Success(b)) => {
                assert_eq!(a, id_a);
                assert_eq!(b, id_b);
            }
            _ => panic!("expected A cancelled then B success"),
        }
        loader.close_connection(&connection);
    }

    #[test]
    fn unretained_assets_are_reaped() {
        let loader = make_loader(None, Vec::new());
        // Callback that does NOT retain.
        let (tx, rx) = mpsc::channel();
        let callback: LoadCompletedCallback = Box::new(move |result| {
            if let LoadOutcome::Success(_) = result.outcome {
                tx.send(()).unwrap();
            }
        });
        let connection = loader.open_connection(callback);

        loader.send_load_request(
            &connection,
            LoadRequest::Instrument {
                layer_index: 0,
                id: inst_id("Piano"),
            },
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Nothing holds a retain, so the next reap pass frees everything.
        loader.work_signaller().signal();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while loader.num_instruments_loaded() != 0 {
            assert!(std::time::Instant::now() < deadline, "instrument never reaped");
            loader.work_signaller().signal();
            std::thread::sleep(Duration::from_millis(10));
        }
        while loader.num_samples_loaded() != 0 {
            assert!(std::time::Instant::now() < deadline, "audio never reaped");
            loader.work_signaller().signal();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(loader.total_bytes_used_by_samples(), 0);
        loader.close_connection(&connection);
    }

    #[test]
    fn loading_twice_shares_cached_audio() {
        let loader = make_loader(None, Vec::new());
        let (callback, rx) = recording_callback();
        let connection = loader.open_connection(callback);

        for layer in 0..2u32 {
            loader.send_load_request(
                &connection,
                LoadRequest::Instrument {
                    layer_index: layer,
                    id: inst_id("Piano"),
                },
            );
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        // Two layers, one instrument record, two audio files total.
        assert_eq!(loader.num_instruments_loaded(), 1);
        assert_eq!(loader.num_samples_loaded(), 2);
        loader.close_connection(&connection);
    }

    #[test]
    fn ir_requests_load_audio() {
        let loader = make_loader(None, Vec::new());
        let (tx, rx) = mpsc::channel();
        let callback: LoadCompletedCallback = Box::new(move |result| {
            if let LoadOutcome::Success(AssetRef::Ir(handle)) = &result.outcome {
                tx.send(handle.audio().num_frames).unwrap();
            }
        });
        let connection = loader.open_connection(callback);

        loader.send_load_request(
            &connection,
            LoadRequest::Ir {
                id: IrId {
                    library: LibraryId {
                        author: "Tests".to_string(),
                        name: "Basics".to_string(),
                    },
                    ir_name: "Hall".to_string(),
                },
            },
        );
        let frames = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frames, 256);
        loader.close_connection(&connection);
    }
}
