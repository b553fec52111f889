//! Offset-index trailer appended after the two end-of-archive zero
//! blocks. Standard tar readers stop at the zero blocks and never see
//! it; the extractor uses it to fan tasks out by offset.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};

pub const MAGIC: &[u8; 8] = b"!!PTAR!!";

/// Byte image of the trailer: one big-endian offset per entry in
/// emission order, the entry count, then the magic cookie.
pub fn encode(offsets: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(offsets.len() * 8 + 16);
    for &offset in offsets {
        buf.extend_from_slice(&offset.to_be_bytes());
    }
    buf.extend_from_slice(&(offsets.len() as u64).to_be_bytes());
    buf.extend_from_slice(MAGIC);
    buf
}

/// Reads the offset index back from the tail of `input`.
///
/// `NotAPtarArchive` means the magic is absent and the caller should
/// hand the file to a standard tar instead.
pub fn read_offsets(input: &mut File, path: &Path) -> Result<Vec<u64>> {
    let len = input
        .metadata()
        .map_err(|source| Error::StatFailed {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if len < 16 {
        return Err(Error::NotAPtarArchive);
    }

    let mut word = [0u8; 8];
    read_at(input, path, len - 8, &mut word)?;
    if &word != MAGIC {
        return Err(Error::NotAPtarArchive);
    }

    read_at(input, path, len - 16, &mut word)?;
    let count = u64::from_be_bytes(word);
    if count > (len - 16) / 8 {
        return Err(Error::ReadFailed {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "offset index larger than the archive",
            ),
        });
    }

    let mut index = vec![0u8; (count * 8) as usize];
    read_at(input, path, len - 16 - count * 8, &mut index)?;
    let mut offsets = Vec::with_capacity(count as usize);
    for chunk in index.chunks_exact(8) {
        word.copy_from_slice(chunk);
        offsets.push(u64::from_be_bytes(word));
    }
    Ok(offsets)
}

fn read_at(input: &mut File, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
    input
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::SeekFailed {
            path: path.to_path_buf(),
            offset,
            source,
        })?;
    input.read_exact(buf).map_err(|source| Error::ReadFailed {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn encode_layout() {
        let buf = encode(&[0, 1024]);
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[..8], &0u64.to_be_bytes());
        assert_eq!(&buf[8..16], &1024u64.to_be_bytes());
        assert_eq!(&buf[16..24], &2u64.to_be_bytes());
        assert_eq!(&buf[24..32], MAGIC);
    }

    #[test]
    fn file_round_trip() {
        let offsets = vec![0u64, 512, 2048, 4096];
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 6144]).unwrap();
        file.write_all(&encode(&offsets)).unwrap();
        let decoded = read_offsets(&mut file, Path::new("test.ptar")).unwrap();
        assert_eq!(decoded, offsets);
    }

    #[test]
    fn missing_magic_is_not_a_ptar_archive() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"plain old data, long enough to hold a trailer")
            .unwrap();
        assert!(matches!(
            read_offsets(&mut file, Path::new("test.tar")),
            Err(Error::NotAPtarArchive)
        ));
    }

    #[test]
    fn short_file_is_not_a_ptar_archive() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abc").unwrap();
        assert!(matches!(
            read_offsets(&mut file, Path::new("test.tar")),
            Err(Error::NotAPtarArchive)
        ));
    }

    #[test]
    fn impossible_count_is_rejected() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&u64::MAX.to_be_bytes()).unwrap();
        file.write_all(MAGIC).unwrap();
        assert!(matches!(
            read_offsets(&mut file, Path::new("test.ptar")),
            Err(Error::ReadFailed { .. })
        ));
    }
}
