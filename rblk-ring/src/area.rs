use crate::endpoint::{AreaConsumer, AreaProducer};
use crate::layout::{AreaHeader, RingLayout};
use memmap2::{MmapMut, MmapOptions};
use rblk_core::{
    FAULT_AREA_VERSION, PageBuffer, RblkError, Result, TASK_DESCRIPTOR_SIZE, TaskDescriptor,
};
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

enum Backing {
    Heap(PageBuffer),
    Mapped(MmapMut),
}

/// One direction of shared traffic: a task queue plus its payload byte ring.
///
/// Heap-backed areas serve in-process peers; file-backed areas are mapped
/// shared so a peer in another process can attach with [`FaultArea::open_file`].
/// Role claims are tracked per mapping, so across processes each side must
/// claim only its own role.
pub struct FaultArea {
    base: NonNull<u8>,
    layout: RingLayout,
    producer_claimed: AtomicBool,
    consumer_claimed: AtomicBool,
    backing: Backing,
}

// SAFETY: the header is only accessed through atomics and the immutable
// geometry fields; slot and byte regions are partitioned between the single
// producer and single consumer by the head/tail protocol.
unsafe impl Send for FaultArea {}
unsafe impl Sync for FaultArea {}

impl FaultArea {
    /// Create an in-process area.
    ///
    /// # Errors
    /// Returns an error if the layout is invalid or allocation fails.
    pub fn create(layout: RingLayout) -> Result<Arc<Self>> {
        layout.validate()?;
        let mut buffer = PageBuffer::zeroed(layout.total_len())?;
        let base = NonNull::new(buffer.as_mut_ptr()).ok_or(RblkError::AllocFailed(0))?;

        // SAFETY: base points to total_len zeroed bytes, page aligned
        unsafe { init_header(base, layout) };
        debug!(
            target: "rblk::ring",
            queue_slots = layout.queue_slots,
            byte_capacity = layout.byte_capacity,
            "Created heap fault area"
        );
        Ok(Arc::new(Self::from_parts(base, layout, Backing::Heap(buffer))))
    }

    /// Create (or truncate) a file-backed area at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be sized or mapped.
    pub fn create_file(path: &Path, layout: RingLayout) -> Result<Arc<Self>> {
        layout.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(layout.total_len() as u64)?;

        // SAFETY: the file was just sized to total_len and stays open for the mapping
        let mut mmap = unsafe { MmapOptions::new().len(layout.total_len()).map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(RblkError::AllocFailed(0))?;

        // SAFETY: a freshly extended file reads as zeroes; mappings are page aligned
        unsafe { init_header(base, layout) };
        info!(
            target: "rblk::ring",
            path = %path.display(),
            queue_slots = layout.queue_slots,
            byte_capacity = layout.byte_capacity,
            "Created shared fault area"
        );
        Ok(Arc::new(Self::from_parts(base, layout, Backing::Mapped(mmap))))
    }

    /// Attach to an area created by another process. The geometry is read
    /// from the area header.
    ///
    /// # Errors
    /// Returns `LayoutMismatch` if the version tag, descriptor size or file
    /// length disagree with this build.
    pub fn open_file(path: &Path) -> Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = usize::try_from(file.metadata()?.len())
            .map_err(|_| RblkError::LayoutMismatch("area file too large".into()))?;
        if file_len < RingLayout::header_len() {
            return Err(RblkError::LayoutMismatch(format!(
                "area file has {file_len} bytes, header alone needs {}",
                RingLayout::header_len()
            )));
        }

        // SAFETY: the mapping covers the whole file, which stays open
        let mut mmap = unsafe { MmapOptions::new().len(file_len).map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(RblkError::AllocFailed(0))?;

        // SAFETY: at least header_len bytes are mapped and the mapping is page aligned
        let header = unsafe { &*base.as_ptr().cast::<AreaHeader>() };
        let version = header.version.load(Ordering::Acquire);
        if version != FAULT_AREA_VERSION {
            return Err(RblkError::LayoutMismatch(format!(
                "area version {version}, expected {FAULT_AREA_VERSION}"
            )));
        }
        if header.task_size as usize != TASK_DESCRIPTOR_SIZE {
            return Err(RblkError::LayoutMismatch(format!(
                "descriptor size {}, expected {TASK_DESCRIPTOR_SIZE}",
                header.task_size
            )));
        }
        let layout = RingLayout::new(
            usize::try_from(header.queue_slots).unwrap_or(0),
            usize::try_from(header.byte_capacity).unwrap_or(0),
        );
        layout
            .validate()
            .map_err(|e| RblkError::LayoutMismatch(e.to_string()))?;
        if layout.total_len() != file_len {
            return Err(RblkError::LayoutMismatch(format!(
                "header describes {} bytes, file has {file_len}",
                layout.total_len()
            )));
        }

        info!(
            target: "rblk::ring",
            path = %path.display(),
            queue_slots = layout.queue_slots,
            byte_capacity = layout.byte_capacity,
            "Attached to shared fault area"
        );
        Ok(Arc::new(Self::from_parts(base, layout, Backing::Mapped(mmap))))
    }

    fn from_parts(base: NonNull<u8>, layout: RingLayout, backing: Backing) -> Self {
        Self {
            base,
            layout,
            producer_claimed: AtomicBool::new(false),
            consumer_claimed: AtomicBool::new(false),
            backing,
        }
    }

    #[inline]
    #[must_use]
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Claim the producer end.
    ///
    /// # Errors
    /// Returns `RoleClaimed` while another producer handle is alive.
    pub fn producer(self: &Arc<Self>) -> Result<AreaProducer> {
        if self.producer_claimed.swap(true, Ordering::AcqRel) {
            return Err(RblkError::RoleClaimed("producer"));
        }
        Ok(AreaProducer::new(Arc::clone(self)))
    }

    /// Claim the consumer end.
    ///
    /// # Errors
    /// Returns `RoleClaimed` while another consumer handle is alive.
    pub fn consumer(self: &Arc<Self>) -> Result<AreaConsumer> {
        if self.consumer_claimed.swap(true, Ordering::AcqRel) {
            return Err(RblkError::RoleClaimed("consumer"));
        }
        Ok(AreaConsumer::new(Arc::clone(self)))
    }

    pub(crate) fn release_producer(&self) {
        self.producer_claimed.store(false, Ordering::Release);
    }

    pub(crate) fn release_consumer(&self) {
        self.consumer_claimed.store(false, Ordering::Release);
    }

    /// Descriptors pushed but not yet popped.
    #[must_use]
    pub fn queued_tasks(&self) -> usize {
        let header = self.header();
        let head = load_index(&header.queue_head);
        let tail = load_index(&header.queue_tail);
        (tail + self.layout.queue_slots - head) % self.layout.queue_slots
    }

    /// Payload bytes written but not yet consumed.
    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        let header = self.header();
        let head = load_index(&header.byte_head);
        let tail = load_index(&header.byte_tail);
        (head + self.layout.byte_capacity - tail) % self.layout.byte_capacity
    }

    #[inline]
    pub(crate) fn header(&self) -> &AreaHeader {
        // SAFETY: the header was initialised or verified before construction
        unsafe { &*self.base.as_ptr().cast::<AreaHeader>() }
    }

    #[inline]
    pub(crate) fn slot_ptr(&self, index: usize) -> *mut TaskDescriptor {
        debug_assert!(index < self.layout.queue_slots);
        // SAFETY: index < queue_slots keeps the pointer inside the slot region
        unsafe {
            self.base
                .as_ptr()
                .add(RingLayout::header_len() + index * TASK_DESCRIPTOR_SIZE)
                .cast::<TaskDescriptor>()
        }
    }

    #[inline]
    pub(crate) fn bytes_ptr(&self) -> *mut u8 {
        // SAFETY: bytes_offset + byte_capacity == total_len, within the backing
        unsafe { self.base.as_ptr().add(self.layout.bytes_offset()) }
    }
}

impl std::fmt::Debug for FaultArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, mapped_len) = match &self.backing {
            Backing::Heap(buffer) => ("heap", buffer.capacity()),
            Backing::Mapped(mmap) => ("file", mmap.len()),
        };
        f.debug_struct("FaultArea")
            .field("backing", &kind)
            .field("mapped_len", &mapped_len)
            .field("layout", &self.layout)
            .field("queued_tasks", &self.queued_tasks())
            .field("bytes_in_use", &self.bytes_in_use())
            .finish()
    }
}

#[inline]
pub(crate) fn load_index(index: &std::sync::atomic::AtomicU64) -> usize {
    // Indices are always reduced modulo a usize-sized capacity.
    index.load(Ordering::Acquire) as usize
}

/// Write the control block of a zeroed area and publish its version.
///
/// # Safety
/// `base` must point to at least `layout.total_len()` zeroed, writable bytes
/// aligned for [`AreaHeader`].
unsafe fn init_header(base: NonNull<u8>, layout: RingLayout) {
    let header = base.as_ptr().cast::<AreaHeader>();
    // SAFETY: guaranteed by the caller; atomics are valid when zeroed
    unsafe {
        std::ptr::addr_of_mut!((*header).task_size).write(TASK_DESCRIPTOR_SIZE as u32);
        std::ptr::addr_of_mut!((*header).queue_slots).write(layout.queue_slots as u64);
        std::ptr::addr_of_mut!((*header).byte_capacity).write(layout.byte_capacity as u64);
        (*header).version.store(FAULT_AREA_VERSION, Ordering::Release);
    }
}
