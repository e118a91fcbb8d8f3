use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

/// Reads `buf.len()` bytes at `offset` into the logical concatenation of
/// `files`, whose logical lengths are given by `sizes`.
///
/// Offsets past the end of the concatenation read as zero bytes. A file
/// that is physically shorter than its recorded size also reads as zero
/// past its physical end, which keeps a half-written cache file from
/// poisoning the rest of an XOR reduction with stale buffer contents.
pub fn read_pad_n(
    files: &mut [File],
    sizes: &[u64],
    mut offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    assert_eq!(files.len(), sizes.len(), "file/size count mismatch");

    let mut filled = 0usize;
    for (file, &size) in files.iter_mut().zip(sizes) {
        if filled == buf.len() {
            break;
        }
        if offset >= size {
            offset -= size;
            continue;
        }
        let avail = (size - offset).min((buf.len() - filled) as u64) as usize;
        crate::read_at_padded(file, offset, &mut buf[filled..filled + avail])?;
        filled += avail;
        offset = 0;
    }

    // past the end of every file: zero padding
    buf[filled..].fill(0);
    Ok(())
}

/// Writes `buf` at `offset` into the logical concatenation of `files`.
///
/// Bytes that fall past the end of the concatenation are padding produced
/// by the encode and are discarded.
pub fn write_pad_n(
    files: &mut [File],
    sizes: &[u64],
    mut offset: u64,
    buf: &[u8],
) -> io::Result<()> {
    assert_eq!(files.len(), sizes.len(), "file/size count mismatch");

    let mut consumed = 0usize;
    for (file, &size) in files.iter_mut().zip(sizes) {
        if consumed == buf.len() {
            break;
        }
        if offset >= size {
            offset -= size;
            continue;
        }
        let avail = (size - offset).min((buf.len() - consumed) as u64) as usize;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf[consumed..consumed + avail])?;
        consumed += avail;
        offset = 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};

    fn open_rw(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn read_spans_files_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"abcd").unwrap();
        fs::write(&b, b"ef").unwrap();

        let mut files = vec![open_rw(&a), open_rw(&b)];
        let sizes = vec![4, 2];

        let mut buf = [0u8; 8];
        read_pad_n(&mut files, &sizes, 2, &mut buf).unwrap();
        assert_eq!(&buf, b"cdef\0\0\0\0");
    }

    #[test]
    fn write_spans_files_and_drops_padding() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"....").unwrap();
        fs::write(&b, b"..").unwrap();

        let mut files = vec![open_rw(&a), open_rw(&b)];
        let sizes = vec![4, 2];

        write_pad_n(&mut files, &sizes, 2, b"XYZW\0\0\0\0").unwrap();
        assert_eq!(fs::read(&a).unwrap(), b"..XY");
        assert_eq!(fs::read(&b).unwrap(), b"ZW");
    }
}
