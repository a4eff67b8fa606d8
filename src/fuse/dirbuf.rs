// Directory buffer packer
//
// Encodes directory entries in the kernel's `fuse_dirent` layout:
//
//   u64 ino | u64 off | u32 namelen | u32 type | name bytes | zero padding
//
// Each record is padded to an 8 byte boundary. A buffer is filled until the
// first entry that does not fit; that entry is rejected without touching the
// buffer so the kernel can resume from the last packed offset.

use std::collections::TryReserveError;

/// Smallest buffer handed to a readdir, whatever size the kernel asks for
pub const MIN_DIR_BUFFER: usize = 4096;

/// Size of the fixed part of a `fuse_dirent`
pub const DIRENT_HEADER: usize = 24;

const DIRENT_ALIGN: usize = 8;

/// Encoded size of one entry with a name of `namelen` bytes
pub fn dirent_size(namelen: usize) -> usize {
    (DIRENT_HEADER + namelen + DIRENT_ALIGN - 1) & !(DIRENT_ALIGN - 1)
}

/// Capacity-bounded write cursor for one readdir reply
#[derive(Debug)]
pub struct DirBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl DirBuffer {
    /// Allocate a buffer of exactly `capacity` bytes up front
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)?;
        Ok(Self { buf, capacity })
    }

    /// Append one entry if it fits in the remaining space
    ///
    /// Returns `false`, leaving the buffer unchanged, when it does not.
    pub fn pack(&mut self, name: &[u8], ino: u64, mode: u32, next_offset: i64) -> bool {
        let size = dirent_size(name.len());
        if size > self.remaining() {
            return false;
        }

        let dtype = (mode & libc::S_IFMT as u32) >> 12;
        self.buf.extend_from_slice(&ino.to_ne_bytes());
        self.buf.extend_from_slice(&next_offset.to_ne_bytes());
        self.buf.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        self.buf.extend_from_slice(&dtype.to_ne_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(self.buf.len() + size - DIRENT_HEADER - name.len(), 0);
        true
    }

    /// Bytes written so far
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The packed bytes, exactly as sent to the kernel
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Decode the packed entries in order
    pub fn entries(&self) -> Dirents<'_> {
        Dirents { rest: &self.buf }
    }
}

/// A packed entry read back from a [`DirBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent<'a> {
    pub ino: u64,
    pub offset: i64,
    /// File-type bits in `st_mode` position (`S_IFDIR`, `S_IFREG`, ...)
    pub mode: u32,
    pub name: &'a [u8],
}

/// Iterator over the entries of a [`DirBuffer`]
pub struct Dirents<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Dirents<'a> {
    type Item = Dirent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < DIRENT_HEADER {
            return None;
        }

        let (header, tail) = self.rest.split_at(DIRENT_HEADER);
        let ino = u64::from_ne_bytes(header[0..8].try_into().ok()?);
        let offset = i64::from_ne_bytes(header[8..16].try_into().ok()?);
        let namelen = u32::from_ne_bytes(header[16..20].try_into().ok()?) as usize;
        let dtype = u32::from_ne_bytes(header[20..24].try_into().ok()?);

        let size = dirent_size(namelen);
        if tail.len() < size - DIRENT_HEADER {
            return None;
        }

        let name = &tail[..namelen];
        self.rest = &self.rest[size..];
        Some(Dirent { ino, offset, mode: dtype << 12, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DIR: u32 = libc::S_IFDIR as u32;
    const REG: u32 = libc::S_IFREG as u32;

    #[test]
    fn test_dirent_size_is_aligned() {
        assert_eq!(dirent_size(0), 24);
        assert_eq!(dirent_size(1), 32);
        assert_eq!(dirent_size(8), 32);
        assert_eq!(dirent_size(9), 40);
        assert_eq!(dirent_size(255), 280);
    }

    #[test]
    fn test_pack_writes_kernel_layout() {
        let mut buf = DirBuffer::try_with_capacity(64).unwrap();
        assert!(buf.pack(b"abc", 7, DIR | 0o755, 1));
        assert_eq!(buf.offset(), 32);

        let bytes = buf.as_bytes();
        assert_eq!(&bytes[0..8], &7u64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &1i64.to_ne_bytes());
        assert_eq!(&bytes[16..20], &3u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &(libc::DT_DIR as u32).to_ne_bytes());
        assert_eq!(&bytes[24..27], b"abc");
        assert!(bytes[27..32].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_oversized_allocation_fails() {
        assert!(DirBuffer::try_with_capacity(usize::MAX).is_err());
    }

    #[test]
    fn test_exact_fit_is_accepted() {
        // Two 32 byte entries fill a 64 byte buffer to the last byte.
        let mut buf = DirBuffer::try_with_capacity(64).unwrap();
        assert!(buf.pack(b"a", 2, REG, 1));
        assert!(buf.pack(b"b", 3, REG, 2));
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_overflow_leaves_buffer_untouched() {
        let mut buf = DirBuffer::try_with_capacity(60).unwrap();
        assert!(buf.pack(b"a", 2, REG, 1));
        let before = buf.as_bytes().to_vec();

        assert!(!buf.pack(b"b", 3, REG, 2));
        assert_eq!(buf.offset(), 32);
        assert_eq!(buf.as_bytes(), before.as_slice());
    }

    #[test]
    fn test_long_name_rejected_after_short_one() {
        let long = vec![b'b'; 96];
        let mut buf = DirBuffer::try_with_capacity(100).unwrap();
        assert!(buf.pack(b"a", 2, DIR, 1));
        assert!(!buf.pack(&long, 3, REG, 2));

        let names: Vec<&[u8]> = buf.entries().map(|e| e.name).collect();
        assert_eq!(names, vec![b"a".as_slice()]);
    }

    #[test]
    fn test_entries_decode_in_order() {
        let mut buf = DirBuffer::try_with_capacity(MIN_DIR_BUFFER).unwrap();
        assert!(buf.pack(b".", 1, DIR, 1));
        assert!(buf.pack(b"..", 1, DIR, 2));
        assert!(buf.pack(b"file.txt", 5, REG | 0o644, 3));

        let entries: Vec<Dirent<'_>> = buf.entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], Dirent { ino: 5, offset: 3, mode: REG, name: b"file.txt" });
        assert_eq!(entries[1].mode, DIR);
    }

    #[test]
    fn test_empty_buffer() {
        let buf = DirBuffer::try_with_capacity(MIN_DIR_BUFFER).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), MIN_DIR_BUFFER);
        assert_eq!(buf.entries().count(), 0);
    }

    proptest! {
        #[test]
        fn prop_packing_stops_at_first_overflow(
            names in proptest::collection::vec("[a-z]{0,40}", 1..40),
            capacity in 0usize..1024,
        ) {
            let mut buf = DirBuffer::try_with_capacity(capacity).unwrap();
            let mut used = 0usize;
            let mut packed = 0usize;

            for (i, name) in names.iter().enumerate() {
                let size = dirent_size(name.len());
                let fits = buf.pack(name.as_bytes(), i as u64 + 2, REG, i as i64 + 1);
                prop_assert_eq!(fits, used + size <= capacity);
                if !fits {
                    break;
                }
                used += size;
                packed += 1;
            }

            prop_assert_eq!(buf.offset(), used);
            prop_assert_eq!(buf.entries().count(), packed);
        }
    }
}
