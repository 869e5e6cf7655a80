//! Circular reads over the blob's data region.
//!
//! The wraparound math lives here and nowhere else: a read that crosses the
//! end of the buffer continues from offset 0.

use crate::error::BlobError;

/// Read-only circular view over a byte slice.
pub struct CircularBuffer<'a> {
    data: &'a [u8],
}

impl<'a> CircularBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read `len` bytes starting at `offset mod len()`, wrapping past the end.
    ///
    /// A read longer than the buffer itself is rejected rather than repeated.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, BlobError> {
        if len > self.data.len() {
            return Err(BlobError::ReadTooLong {
                len: len as u64,
                size: self.data.len() as u64,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let size = self.data.len() as u64;
        let start = (offset % size) as usize;

        let mut out = Vec::with_capacity(len);
        if start + len <= self.data.len() {
            out.extend_from_slice(&self.data[start..start + len]);
        } else {
            let tail = self.data.len() - start;
            out.extend_from_slice(&self.data[start..]);
            out.extend_from_slice(&self.data[..len - tail]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_contiguous_read() {
        let data: Vec<u8> = (0..16).collect();
        let buf = CircularBuffer::new(&data);
        assert_eq!(buf.read(4, 4).unwrap(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_wraparound_read() {
        let data: Vec<u8> = (0..16).collect();
        let buf = CircularBuffer::new(&data);
        assert_eq!(buf.read(14, 4).unwrap(), vec![14, 15, 0, 1]);
    }

    #[test]
    fn test_offset_mod_size() {
        let data: Vec<u8> = (0..16).collect();
        let buf = CircularBuffer::new(&data);
        assert_eq!(buf.read(20, 2).unwrap(), buf.read(4, 2).unwrap());
    }

    #[test]
    fn test_zero_length_read() {
        let data = [1u8, 2, 3];
        let buf = CircularBuffer::new(&data);
        assert!(buf.read(1, 0).unwrap().is_empty());
    }

    #[test]
    fn test_read_too_long() {
        let data = [0u8; 8];
        let buf = CircularBuffer::new(&data);
        assert!(buf.read(0, 9).is_err());
    }

    proptest! {
        // read(o, l) crossing the end == read(o, size-o') ++ read(0, rest)
        #[test]
        fn prop_wrap_equals_tail_plus_head(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            offset in any::<u64>(),
            len_frac in 0.0f64..1.0,
        ) {
            let size = data.len();
            let len = ((size as f64) * len_frac) as usize;
            let buf = CircularBuffer::new(&data);
            let start = (offset % size as u64) as usize;

            let whole = buf.read(offset, len).unwrap();
            if start + len > size {
                let tail = buf.read(start as u64, size - start).unwrap();
                let head = buf.read(0, len - (size - start)).unwrap();
                let mut joined = tail;
                joined.extend_from_slice(&head);
                prop_assert_eq!(whole, joined);
            } else {
                prop_assert_eq!(&whole[..], &data[start..start + len]);
            }
        }
    }
}
