//! Fixed-capacity byte buffer for audio data
//!
//! Backing storage is allocated as `u64` words so the start of the buffer is
//! always 8-byte aligned, which lets any PCM encoding be viewed in place.
//!
//! Two consumption styles are supported:
//! - **Shift**: copy the head out and compact the remainder to the front.
//! - **Cursor**: read the buffer piecemeal (`cursor_read`) while more data
//!   may already be queued behind the cursor, then `clear` or `shift`.
//!
//! No locking is done here. Owners synchronize access.

/// Aligned, fixed-capacity byte buffer
#[derive(Debug, Default)]
pub struct AudioBuffer {
    storage: Vec<u64>,
    capacity: usize,
    used: usize,
    cursor: usize,
}

impl AudioBuffer {
    /// Create an unallocated buffer (capacity 0)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and allocate a buffer of `size` bytes
    pub fn with_capacity(size: usize) -> Self {
        let mut buffer = Self::new();
        buffer.alloc(size);
        buffer
    }

    /// Reserve `size` bytes of zeroed, aligned storage and reset all cursors
    ///
    /// Any previous contents are discarded.
    pub fn alloc(&mut self, size: usize) {
        self.storage = vec![0u64; size.div_ceil(8)];
        self.capacity = size;
        self.used = 0;
        self.cursor = 0;
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.storage)[..self.capacity]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.storage)[..capacity]
    }

    /// Append `src` at the write position
    ///
    /// # Panics
    /// If `src` does not fit in the free space.
    pub fn push(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.free(),
            "AudioBuffer overflow: pushing {} bytes with {} free",
            src.len(),
            self.free()
        );
        let start = self.used;
        self.used += src.len();
        let end = self.used;
        self.bytes_mut()[start..end].copy_from_slice(src);
    }

    /// Remove the first `n` bytes, copying them into `dst` if given
    ///
    /// The remainder is compacted to the front. The read cursor moves back by
    /// `n` so it keeps pointing at the same data.
    ///
    /// # Panics
    /// If fewer than `n` bytes are buffered, or `dst` is shorter than `n`.
    pub fn shift(&mut self, dst: Option<&mut [u8]>, n: usize) {
        assert!(n <= self.used, "AudioBuffer underflow: shifting {} of {}", n, self.used);
        if let Some(dst) = dst {
            dst[..n].copy_from_slice(&self.bytes()[..n]);
        }
        let used = self.used;
        self.bytes_mut().copy_within(n..used, 0);
        self.used -= n;
        self.cursor = self.cursor.saturating_sub(n);
    }

    /// Reserve `n` bytes at the write position and return them for filling
    ///
    /// The write position advances immediately; the caller writes directly
    /// into the returned slice instead of going through `push`.
    ///
    /// # Panics
    /// If `n` exceeds the free space.
    pub fn take(&mut self, n: usize) -> &mut [u8] {
        assert!(n <= self.free(), "AudioBuffer overflow: taking {} with {} free", n, self.free());
        let start = self.used;
        self.used += n;
        let end = self.used;
        &mut self.bytes_mut()[start..end]
    }

    /// Move the read cursor to absolute byte position `pos`
    pub fn cursor_seek(&mut self, pos: usize) {
        assert!(pos <= self.used, "cursor {} beyond {} used bytes", pos, self.used);
        self.cursor = pos;
    }

    /// Return the next `n` bytes at the cursor and advance past them
    ///
    /// # Panics
    /// If fewer than `n` bytes remain after the cursor.
    pub fn cursor_read(&mut self, n: usize) -> &[u8] {
        assert!(
            n <= self.cursor_remaining(),
            "cursor read of {} with {} remaining",
            n,
            self.cursor_remaining()
        );
        let start = self.cursor;
        self.cursor += n;
        &self.bytes()[start..start + n]
    }

    pub fn cursor_offset(&self) -> usize {
        self.cursor
    }

    pub fn cursor_remaining(&self) -> usize {
        self.used - self.cursor
    }

    /// True once the cursor has consumed everything written so far
    pub fn cursor_end(&self) -> bool {
        self.cursor >= self.used
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes()[..self.used]
    }

    /// Drop all contents and reset the cursor (capacity is kept)
    pub fn clear(&mut self) {
        self.used = 0;
        self.cursor = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.capacity - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_resets() {
        let mut buf = AudioBuffer::with_capacity(16);
        buf.push(&[1, 2, 3]);
        buf.alloc(32);
        assert_eq!(buf.capacity(), 32);
        assert!(buf.is_empty());
        assert_eq!(buf.cursor_offset(), 0);
    }

    #[test]
    fn test_storage_is_aligned() {
        let buf = AudioBuffer::with_capacity(13);
        assert_eq!(buf.bytes().as_ptr() as usize % 8, 0);
        assert_eq!(buf.bytes().len(), 13);
    }

    #[test]
    fn test_push_and_shift_compacts() {
        let mut buf = AudioBuffer::with_capacity(8);
        buf.push(&[1, 2, 3, 4, 5]);
        assert_eq!(buf.free(), 3);

        let mut head = [0u8; 2];
        buf.shift(Some(&mut head), 2);
        assert_eq!(head, [1, 2]);
        assert_eq!(buf.as_slice(), &[3, 4, 5]);

        buf.shift(None, 1);
        assert_eq!(buf.as_slice(), &[4, 5]);
        assert_eq!(buf.free(), 6);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_push_overflow_panics() {
        let mut buf = AudioBuffer::with_capacity(4);
        buf.push(&[0; 5]);
    }

    #[test]
    fn test_take_fills_in_place() {
        let mut buf = AudioBuffer::with_capacity(8);
        buf.push(&[9]);
        let slot = buf.take(3);
        slot.copy_from_slice(&[7, 7, 7]);
        assert_eq!(buf.as_slice(), &[9, 7, 7, 7]);
        assert_eq!(buf.used(), 4);
    }

    #[test]
    fn test_cursor_reads_piecemeal() {
        let mut buf = AudioBuffer::with_capacity(8);
        buf.push(&[1, 2, 3, 4]);

        assert_eq!(buf.cursor_read(2), &[1, 2]);
        assert!(!buf.cursor_end());

        // More data queued behind the cursor
        buf.push(&[5, 6]);
        assert_eq!(buf.cursor_read(4), &[3, 4, 5, 6]);
        assert!(buf.cursor_end());

        buf.cursor_seek(1);
        assert_eq!(buf.cursor_remaining(), 5);
    }

    #[test]
    fn test_shift_moves_cursor_with_data() {
        let mut buf = AudioBuffer::with_capacity(8);
        buf.push(&[1, 2, 3, 4]);
        buf.cursor_seek(3);
        buf.shift(None, 2);
        assert_eq!(buf.cursor_offset(), 1);
        assert_eq!(buf.cursor_read(1), &[4]);
    }
}
