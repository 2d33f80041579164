// Ring buffer lock-free SPSC - base des queues de commandes/résultats
//
// Fixed-capacity circular buffer with one write index and one read index.
// Both indices grow monotonically (wrapping on usize overflow) and are mapped
// to a slot with `index & mask`, so the whole capacity is usable and
// `read_available() + write_available() == capacity()` always holds.
//
// Real-time constraints:
// - No allocations after construction
// - No locks, no CAS loops: exactly one writer and one reader, each owning
//   its index and publishing it with a Release store
// - Only whole elements are ever copied

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{MixerError, MixerResult};

struct Shared<T> {
    data: Box<[UnsafeCell<T>]>,
    /// Capacity in elements (power of two)
    capacity: usize,
    mask: usize,
    /// Number of `T` values per element
    element_len: usize,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
    /// Called on every unread value when the last half goes away
    on_drop: Option<fn(&mut T)>,
}

// SAFETY: slots are only touched between the published indices. The writer
// only writes slots in [write, read + capacity), the reader only reads slots
// in [read, write), and each index is published with Release after the slots
// it covers are done.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T: Copy + Default> Shared<T> {
    fn new(element_len: usize, capacity: usize) -> MixerResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(MixerError::InvalidCapacity(capacity));
        }
        if element_len == 0 {
            return Err(MixerError::InvalidElementLength);
        }

        let data = (0..capacity * element_len)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            data,
            capacity,
            mask: capacity - 1,
            element_len,
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
            on_drop: None,
        })
    }

    #[inline]
    fn read_available(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity)
    }

    #[inline]
    fn write_available(&self) -> usize {
        self.capacity - self.read_available()
    }

    #[inline]
    fn base_ptr(&self) -> *mut T {
        // UnsafeCell<T> is repr(transparent)
        self.data.as_ptr() as *mut T
    }

    /// Splits `count` elements starting at `index` into (slot, first_len, second_len)
    #[inline]
    fn split_range(&self, index: usize, count: usize) -> (usize, usize, usize) {
        let slot = index & self.mask;
        let first = count.min(self.capacity - slot);
        (slot, first, count - first)
    }

    /// # Safety
    /// Must only be called by the single consumer. The returned slices are
    /// valid until the read index is advanced.
    unsafe fn read_regions(&self, max_elements: usize) -> (&[T], &[T]) {
        let read = self.read_index.load(Ordering::Relaxed);
        let count = max_elements.min(self.read_available());
        let (slot, first, second) = self.split_range(read, count);
        let ptr = self.base_ptr();
        let len = self.element_len;
        // SAFETY: [read, read + count) has been published by the writer and
        // the writer will not touch it until the read index moves past it.
        unsafe {
            (
                std::slice::from_raw_parts(ptr.add(slot * len), first * len),
                std::slice::from_raw_parts(ptr, second * len),
            )
        }
    }

    /// # Safety
    /// Must only be called by the single producer. The returned slices are
    /// valid until the write index is advanced.
    #[allow(clippy::mut_from_ref)]
    unsafe fn write_regions(&self, max_elements: usize) -> (&mut [T], &mut [T]) {
        let write = self.write_index.load(Ordering::Relaxed);
        let count = max_elements.min(self.write_available());
        let (slot, first, second) = self.split_range(write, count);
        let ptr = self.base_ptr();
        let len = self.element_len;
        // SAFETY: [write, write + count) is free: the reader has released it
        // and only reads up to the published write index.
        unsafe {
            (
                std::slice::from_raw_parts_mut(ptr.add(slot * len), first * len),
                std::slice::from_raw_parts_mut(ptr, second * len),
            )
        }
    }

    fn advance_write_index(&self, elements: usize) -> usize {
        let elements = elements.min(self.write_available());
        let write = self.write_index.load(Ordering::Relaxed);
        self.write_index
            .store(write.wrapping_add(elements), Ordering::Release);
        elements
    }

    fn advance_read_index(&self, elements: usize) -> usize {
        let elements = elements.min(self.read_available());
        let read = self.read_index.load(Ordering::Relaxed);
        self.read_index
            .store(read.wrapping_add(elements), Ordering::Release);
        elements
    }

    /// # Safety
    /// Producer side only.
    unsafe fn write(&self, data: &[T]) -> usize {
        let wanted = data.len() / self.element_len;
        // SAFETY: forwarded producer-only contract
        let (first, second) = unsafe { self.write_regions(wanted) };
        let (head, tail) = data.split_at(first.len());
        first.copy_from_slice(head);
        second.copy_from_slice(&tail[..second.len()]);
        let written = (first.len() + second.len()) / self.element_len;
        self.advance_write_index(written)
    }

    /// # Safety
    /// Consumer side only.
    unsafe fn read(&self, data: &mut [T]) -> usize {
        let wanted = data.len() / self.element_len;
        // SAFETY: forwarded consumer-only contract
        let (first, second) = unsafe { self.read_regions(wanted) };
        let (head, tail) = data.split_at_mut(first.len());
        head.copy_from_slice(first);
        tail[..second.len()].copy_from_slice(second);
        let read = (first.len() + second.len()) / self.element_len;
        self.advance_read_index(read)
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let Some(hook) = self.on_drop else {
            return;
        };
        // Both halves are gone, so nobody else can touch the slots
        let read = *self.read_index.get_mut();
        let write = *self.write_index.get_mut();
        let unread = write.wrapping_sub(read).min(self.capacity);
        let len = self.element_len;
        for i in 0..unread {
            let slot = read.wrapping_add(i) & self.mask;
            for value in &mut self.data[slot * len..(slot + 1) * len] {
                hook(value.get_mut());
            }
        }
    }
}

/// Lock-free single-producer/single-consumer ring buffer.
///
/// An element is `element_len` consecutive `T` values: a ring buffer of
/// stereo frames is a `RingBuffer<f32>` with `element_len == 2`. All counts
/// (capacity, available, read/write results) are in elements.
///
/// While unsplit the buffer is exclusively owned and can be written, read and
/// flushed from one place. [`RingBuffer::split`] hands out the producer and
/// consumer halves, which can live on different threads.
pub struct RingBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a ring buffer of single-value elements.
    ///
    /// Fails with [`MixerError::InvalidCapacity`] unless `capacity` is a
    /// power of two.
    pub fn new(capacity: usize) -> MixerResult<Self> {
        Self::with_element_len(1, capacity)
    }

    /// Create a ring buffer whose elements are `element_len` values wide.
    pub fn with_element_len(element_len: usize, capacity: usize) -> MixerResult<Self> {
        Ok(Self {
            shared: Arc::new(Shared::new(element_len, capacity)?),
        })
    }

    /// Single-value ring buffer that passes every value still unread to
    /// `hook` once both halves have been dropped. Used for queues whose
    /// values own something, like raw action pointers.
    pub(crate) fn with_drop_hook(capacity: usize, hook: fn(&mut T)) -> MixerResult<Self> {
        let mut shared = Shared::new(1, capacity)?;
        shared.on_drop = Some(hook);
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn element_len(&self) -> usize {
        self.shared.element_len
    }

    /// Element size in bytes
    pub fn element_size(&self) -> usize {
        self.shared.element_len * std::mem::size_of::<T>()
    }

    pub fn read_available(&self) -> usize {
        self.shared.read_available()
    }

    pub fn write_available(&self) -> usize {
        self.shared.write_available()
    }

    /// Copy as many whole elements from `data` as fit. Returns the number of
    /// elements written.
    pub fn write(&mut self, data: &[T]) -> usize {
        // SAFETY: unsplit buffer, we are the only producer
        unsafe { self.shared.write(data) }
    }

    /// Copy as many whole elements into `data` as are available. Returns the
    /// number of elements read.
    pub fn read(&mut self, data: &mut [T]) -> usize {
        // SAFETY: unsplit buffer, we are the only consumer
        unsafe { self.shared.read(data) }
    }

    /// Reset the buffer to empty.
    ///
    /// Exclusive access guarantees that neither side is reading or writing.
    pub fn flush(&mut self) {
        self.shared.write_index.store(0, Ordering::Release);
        self.shared.read_index.store(0, Ordering::Release);
    }

    /// Split into producer and consumer halves.
    pub fn split(self) -> (RingWriter<T>, RingReader<T>) {
        (
            RingWriter {
                shared: Arc::clone(&self.shared),
            },
            RingReader {
                shared: self.shared,
            },
        )
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.shared.capacity)
            .field("element_len", &self.shared.element_len)
            .finish()
    }
}

/// Producer half of a [`RingBuffer`].
pub struct RingWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Default> RingWriter<T> {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn element_len(&self) -> usize {
        self.shared.element_len
    }

    /// Element size in bytes
    pub fn element_size(&self) -> usize {
        self.shared.element_len * std::mem::size_of::<T>()
    }

    /// Free elements. Exact from this side, may be stale anywhere else.
    pub fn write_available(&self) -> usize {
        self.shared.write_available()
    }

    pub fn read_available(&self) -> usize {
        self.shared.read_available()
    }

    pub fn write(&mut self, data: &[T]) -> usize {
        // SAFETY: RingWriter is the unique producer handle
        unsafe { self.shared.write(data) }
    }

    /// Up to two contiguous regions covering at most `max_elements` free
    /// elements. Fill them, then commit with [`advance_write_index`].
    ///
    /// [`advance_write_index`]: RingWriter::advance_write_index
    pub fn write_regions(&mut self, max_elements: usize) -> (&mut [T], &mut [T]) {
        // SAFETY: RingWriter is the unique producer handle, and the regions
        // borrow self mutably so the index cannot move under them
        unsafe { self.shared.write_regions(max_elements) }
    }

    /// Publish `elements` written elements. Returns how many were published
    /// (clamped to the free space).
    pub fn advance_write_index(&mut self, elements: usize) -> usize {
        self.shared.advance_write_index(elements)
    }

    /// True once the reader half has been dropped
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T> fmt::Debug for RingWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingWriter")
            .field("capacity", &self.shared.capacity)
            .field("element_len", &self.shared.element_len)
            .finish()
    }
}

/// Consumer half of a [`RingBuffer`].
pub struct RingReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Default> RingReader<T> {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn element_len(&self) -> usize {
        self.shared.element_len
    }

    /// Element size in bytes
    pub fn element_size(&self) -> usize {
        self.shared.element_len * std::mem::size_of::<T>()
    }

    /// Filled elements. Exact from this side, may be stale anywhere else.
    pub fn read_available(&self) -> usize {
        self.shared.read_available()
    }

    pub fn write_available(&self) -> usize {
        self.shared.write_available()
    }

    pub fn read(&mut self, data: &mut [T]) -> usize {
        // SAFETY: RingReader is the unique consumer handle
        unsafe { self.shared.read(data) }
    }

    /// Up to two contiguous regions covering at most `max_elements` readable
    /// elements. Consume them, then release with [`advance_read_index`].
    ///
    /// [`advance_read_index`]: RingReader::advance_read_index
    pub fn read_regions(&self, max_elements: usize) -> (&[T], &[T]) {
        // SAFETY: RingReader is the unique consumer handle; the read index
        // only moves through &mut self
        unsafe { self.shared.read_regions(max_elements) }
    }

    /// Release `elements` consumed elements. Returns how many were released
    /// (clamped to what was readable).
    pub fn advance_read_index(&mut self, elements: usize) -> usize {
        self.shared.advance_read_index(elements)
    }

    /// Drop everything currently readable.
    pub fn flush(&mut self) {
        let write = self.shared.write_index.load(Ordering::Acquire);
        self.shared.read_index.store(write, Ordering::Release);
    }

    /// True once the writer half has been dropped
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T> fmt::Debug for RingReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingReader")
            .field("capacity", &self.shared.capacity)
            .field("element_len", &self.shared.element_len)
            .finish()
    }
}
