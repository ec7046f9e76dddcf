use std::fs::{self, File};
use std::io::{self, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use rxcl_spec::DATASET_ITEM_SIZE;

use crate::ui;

/// Derivation of dataset items from a seed.
///
/// `init_items` is called concurrently on disjoint ranges and must be a pure
/// function of the cache and the item index.
pub trait DatasetEngine: Send + Sync {
    type Cache: Sync;

    fn item_count(&self) -> u64;

    fn init_cache(&self, seed: &[u8], large_pages: bool) -> Result<Self::Cache>;

    fn init_items(&self, cache: &Self::Cache, first_item: u64, out: &mut [u8]);
}

/// Run-wide record of whether large pages can still be requested.
///
/// Starts as requested by configuration and only ever goes from available to
/// unavailable.
#[derive(Clone, Debug)]
pub struct LargePages {
    available: Arc<AtomicBool>,
}

impl LargePages {
    pub fn new(enabled: bool) -> Self {
        Self {
            available: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn disable(&self, what: &str) {
        if self.available.swap(false, Ordering::AcqRel) {
            ui::warn(
                "MEM",
                format!("large pages unavailable for {what}, using standard pages from now on"),
            );
        }
    }
}

pub enum DatasetMemory {
    #[cfg(target_os = "linux")]
    HugePages(HugePageRegion),
    Heap(Vec<u8>),
}

impl DatasetMemory {
    pub fn heap(len: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|err| anyhow!("failed to reserve {len} bytes of host memory: {err}"))?;
        bytes.resize(len, 0);
        Ok(Self::Heap(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            #[cfg(target_os = "linux")]
            Self::HugePages(region) => region.as_slice(),
            Self::Heap(bytes) => bytes,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            #[cfg(target_os = "linux")]
            Self::HugePages(region) => region.as_mut_slice(),
            Self::Heap(bytes) => bytes,
        }
    }

    pub fn is_large_pages(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Self::HugePages(_) => true,
            Self::Heap(_) => false,
        }
    }
}

pub trait PageAllocator: Send + Sync {
    /// Returns `None` when large pages cannot back `len` bytes.
    fn large(&self, len: usize) -> Option<DatasetMemory>;

    fn standard(&self, len: usize) -> Result<DatasetMemory> {
        DatasetMemory::heap(len)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPages;

impl PageAllocator for SystemPages {
    fn large(&self, len: usize) -> Option<DatasetMemory> {
        #[cfg(target_os = "linux")]
        {
            HugePageRegion::map(len).map(DatasetMemory::HugePages)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = len;
            None
        }
    }
}

/// Anonymous mapping backed by explicit 2 MB pages from the hugetlbfs pool.
///
/// MAP_POPULATE pre-faults the pages so dataset initialisation never takes a
/// soft fault.
#[cfg(target_os = "linux")]
pub struct HugePageRegion {
    ptr: *mut u8,
    len: usize,
}

#[cfg(target_os = "linux")]
impl HugePageRegion {
    fn map(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(target_os = "linux")]
impl Drop for HugePageRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// Safety: the mapping is exclusively owned and only reachable through
// `&self` / `&mut self`, so the usual borrow rules cover concurrent access.
#[cfg(target_os = "linux")]
unsafe impl Send for HugePageRegion {}
#[cfg(target_os = "linux")]
unsafe impl Sync for HugePageRegion {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetOrigin {
    CacheFile,
    Computed,
}

pub struct Dataset {
    memory: DatasetMemory,
    item_count: u64,
    origin: DatasetOrigin,
}

impl Dataset {
    pub fn bytes(&self) -> &[u8] {
        self.memory.bytes()
    }

    pub fn len(&self) -> usize {
        self.memory.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    pub fn item(&self, index: u64) -> &[u8] {
        let start = index as usize * DATASET_ITEM_SIZE;
        &self.bytes()[start..start + DATASET_ITEM_SIZE]
    }

    pub fn uses_large_pages(&self) -> bool {
        self.memory.is_large_pages()
    }

    pub fn origin(&self) -> DatasetOrigin {
        self.origin
    }
}

pub struct DatasetBuilder<E: DatasetEngine, A: PageAllocator = SystemPages> {
    engine: E,
    allocator: A,
    large_pages: LargePages,
    cache_file: Option<PathBuf>,
    threads: usize,
}

impl<E: DatasetEngine> DatasetBuilder<E, SystemPages> {
    pub fn new(engine: E, large_pages: LargePages) -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            engine,
            allocator: SystemPages,
            large_pages,
            cache_file: None,
            threads,
        }
    }
}

impl<E: DatasetEngine, A: PageAllocator> DatasetBuilder<E, A> {
    pub fn with_allocator<B: PageAllocator>(self, allocator: B) -> DatasetBuilder<E, B> {
        DatasetBuilder {
            engine: self.engine,
            allocator,
            large_pages: self.large_pages,
            cache_file: self.cache_file,
            threads: self.threads,
        }
    }

    pub fn cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn byte_len(&self) -> Result<usize> {
        let len = self
            .engine
            .item_count()
            .checked_mul(DATASET_ITEM_SIZE as u64)
            .ok_or_else(|| anyhow!("dataset item count overflows"))?;
        usize::try_from(len).context("dataset does not fit in the address space")
    }

    /// Loads the dataset from the cache file or derives it from `seed`.
    pub fn build(&self, seed: &[u8]) -> Result<Dataset> {
        let len = self.byte_len()?;
        let item_count = self.engine.item_count();
        if item_count == 0 {
            bail!("dataset must contain at least one item");
        }
        let mut memory = self.allocate(len)?;

        if let Some(path) = &self.cache_file {
            if load_cache_file(path, memory.bytes_mut())? {
                ui::success(
                    "DATASET",
                    format!("loaded {} from {}", ui::format_bytes(len as u64), path.display()),
                );
                return Ok(Dataset {
                    memory,
                    item_count,
                    origin: DatasetOrigin::CacheFile,
                });
            }
        }

        let started = Instant::now();
        let cache = self.init_cache(seed)?;
        let ranges = partition_items(item_count, self.threads);
        ui::info(
            "DATASET",
            format!(
                "initializing {} items ({}) on {} threads",
                item_count,
                ui::format_bytes(len as u64),
                ranges.len()
            ),
        );
        self.compute(&cache, &ranges, memory.bytes_mut())?;
        ui::success(
            "DATASET",
            format!("initialized in {:.2}s", started.elapsed().as_secs_f64()),
        );

        let dataset = Dataset {
            memory,
            item_count,
            origin: DatasetOrigin::Computed,
        };
        if let Some(path) = &self.cache_file {
            if let Err(err) = persist_cache_file(path, dataset.bytes()) {
                ui::warn("DATASET", format!("{err:#}"));
            }
        }
        Ok(dataset)
    }

    fn allocate(&self, len: usize) -> Result<DatasetMemory> {
        if self.large_pages.available() {
            if let Some(memory) = self.allocator.large(len) {
                return Ok(memory);
            }
            self.large_pages.disable("the dataset");
        }
        self.allocator
            .standard(len)
            .context("failed to allocate dataset memory")
    }

    fn init_cache(&self, seed: &[u8]) -> Result<E::Cache> {
        if self.large_pages.available() {
            match self.engine.init_cache(seed, true) {
                Ok(cache) => return Ok(cache),
                Err(err) => {
                    ui::warn("DATASET", format!("cache allocation with large pages failed: {err:#}"));
                    self.large_pages.disable("the dataset cache");
                }
            }
        }
        self.engine
            .init_cache(seed, false)
            .context("failed to initialize dataset cache")
    }

    fn compute(&self, cache: &E::Cache, ranges: &[Range<u64>], out: &mut [u8]) -> Result<()> {
        let engine = &self.engine;
        thread::scope(|scope| -> Result<()> {
            let mut rest = out;
            let mut handles = Vec::with_capacity(ranges.len());
            for (idx, range) in ranges.iter().enumerate() {
                let bytes = (range.end - range.start) as usize * DATASET_ITEM_SIZE;
                let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(bytes);
                rest = tail;
                let first_item = range.start;
                let handle = thread::Builder::new()
                    .name(format!("rxcl-dataset-{idx}"))
                    .spawn_scoped(scope, move || engine.init_items(cache, first_item, chunk))
                    .context("failed to spawn dataset thread")?;
                handles.push(handle);
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| anyhow!("dataset thread panicked"))?;
            }
            Ok(())
        })
    }
}

/// Splits `count` items into at most `parts` contiguous, non-overlapping ranges.
pub fn partition_items(count: u64, parts: usize) -> Vec<Range<u64>> {
    let parts = parts.max(1) as u64;
    (0..parts)
        .map(|i| (i * count / parts)..((i + 1) * count / parts))
        .filter(|range| !range.is_empty())
        .collect()
}

fn load_cache_file(path: &Path, out: &mut [u8]) -> Result<bool> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if metadata.len() != out.len() as u64 {
        ui::warn(
            "DATASET",
            format!(
                "ignoring {}: {} bytes on disk, expected {}",
                path.display(),
                metadata.len(),
                out.len()
            ),
        );
        return Ok(false);
    }
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    file.read_exact(out)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(true)
}

fn persist_cache_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    fs::write(path, bytes)
        .with_context(|| format!("failed to write dataset cache {}", path.display()))?;
    ui::info("DATASET", format!("saved dataset to {}", path.display()));
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::refhash::ReferenceEngine;

    pub(crate) fn unique_temp_file(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let serial = NEXT.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "rxcl-{name}-{}-{nanos}-{serial}",
            std::process::id()
        ))
    }

    struct NoLargePages {
        attempts: AtomicUsize,
    }

    impl PageAllocator for NoLargePages {
        fn large(&self, _len: usize) -> Option<DatasetMemory> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    struct CountingEngine {
        inner: ReferenceEngine,
        item_calls: AtomicUsize,
    }

    impl DatasetEngine for CountingEngine {
        type Cache = <ReferenceEngine as DatasetEngine>::Cache;

        fn item_count(&self) -> u64 {
            self.inner.item_count()
        }

        fn init_cache(&self, seed: &[u8], large_pages: bool) -> Result<Self::Cache> {
            self.inner.init_cache(seed, large_pages)
        }

        fn init_items(&self, cache: &Self::Cache, first_item: u64, out: &mut [u8]) {
            self.item_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.init_items(cache, first_item, out);
        }
    }

    fn engine(items: u64) -> ReferenceEngine {
        ReferenceEngine::new(items).with_cache_items(32)
    }

    #[test]
    fn partition_covers_range_without_overlap() {
        for (count, parts) in [(100u64, 7usize), (64, 64), (5, 8), (1, 1), (1000, 3)] {
            let ranges = partition_items(count, parts);
            assert!(ranges.len() <= parts);
            let mut next = 0;
            for range in &ranges {
                assert_eq!(range.start, next);
                assert!(range.end > range.start);
                next = range.end;
            }
            assert_eq!(next, count);
        }
    }

    #[test]
    fn build_is_deterministic_across_thread_counts() {
        let a = DatasetBuilder::new(engine(257), LargePages::new(false))
            .threads(1)
            .build(b"seed")
            .expect("dataset");
        let b = DatasetBuilder::new(engine(257), LargePages::new(false))
            .threads(5)
            .build(b"seed")
            .expect("dataset");
        assert_eq!(a.len(), 257 * DATASET_ITEM_SIZE);
        assert_eq!(a.bytes(), b.bytes());
        assert_eq!(a.origin(), DatasetOrigin::Computed);

        let c = DatasetBuilder::new(engine(257), LargePages::new(false))
            .threads(3)
            .build(b"other seed")
            .expect("dataset");
        assert_ne!(a.bytes(), c.bytes());
    }

    #[test]
    fn cache_file_is_written_then_trusted() {
        let path = unique_temp_file("dataset-cache");
        let first = DatasetBuilder::new(engine(128), LargePages::new(false))
            .cache_file(&path)
            .build(b"seed")
            .expect("computed");
        assert_eq!(first.origin(), DatasetOrigin::Computed);
        assert_eq!(fs::metadata(&path).expect("cache written").len(), 128 * 64);

        let counting = CountingEngine {
            inner: engine(128),
            item_calls: AtomicUsize::new(0),
        };
        let builder = DatasetBuilder::new(counting, LargePages::new(false)).cache_file(&path);
        let second = builder.build(b"seed").expect("loaded");
        assert_eq!(second.origin(), DatasetOrigin::CacheFile);
        assert_eq!(second.bytes(), first.bytes());
        assert_eq!(builder.engine.item_calls.load(Ordering::SeqCst), 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn cache_file_with_wrong_length_is_recomputed() {
        let path = unique_temp_file("dataset-short");
        fs::write(&path, vec![0xffu8; 100]).expect("write stale cache");

        let dataset = DatasetBuilder::new(engine(64), LargePages::new(false))
            .cache_file(&path)
            .build(b"seed")
            .expect("dataset");
        assert_eq!(dataset.origin(), DatasetOrigin::Computed);
        assert_eq!(fs::read(&path).expect("rewritten"), dataset.bytes());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn large_page_failure_falls_back_and_sticks() {
        let large_pages = LargePages::new(true);
        let allocator = NoLargePages {
            attempts: AtomicUsize::new(0),
        };
        let builder = DatasetBuilder::new(engine(64), large_pages.clone())
            .with_allocator(allocator)
            .threads(2);

        let dataset = builder.build(b"seed").expect("fallback dataset");
        assert!(!dataset.uses_large_pages());
        assert!(!large_pages.available());
        assert_eq!(builder.allocator.attempts.load(Ordering::SeqCst), 1);

        let reference = DatasetBuilder::new(engine(64), LargePages::new(false))
            .build(b"seed")
            .expect("reference dataset");
        assert_eq!(dataset.bytes(), reference.bytes());

        builder.build(b"seed").expect("second build");
        assert_eq!(builder.allocator.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let err = DatasetBuilder::new(engine(0), LargePages::new(false))
            .build(b"seed")
            .err()
            .expect("empty dataset");
        assert!(err.to_string().contains("at least one item"));
    }
}
