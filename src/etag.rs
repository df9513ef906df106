//! ETag-compatible fingerprints for local files.
//!
//! Reproduces the object-store ETag convention: a single MD5 in hex for
//! single-part uploads, `hex(md5(concat of per-part MD5s))-<parts>` for
//! multi-part ones. Hash equivalence requires the part size used here to
//! equal the uploader's part size.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::{Digest, Md5};

/// Computes the ETag-compatible hash of a local file.
///
/// Reads the file in `chunk_size` parts. A file no larger than one part, or
/// any file when `with_parts` is false, hashes to a plain MD5. Otherwise
/// each part is hashed separately and the ETag is the MD5 of the
/// concatenated part digests with a `-<count>` suffix, where the count is
/// `ceil(size / chunk_size)` — an exact multiple gains no extra part.
///
/// # Arguments
///
/// * `path` - File to fingerprint
/// * `chunk_size` - Part size in bytes; must match the uploader's part size
/// * `with_parts` - When false, always compute a single MD5
pub fn compute_etag(path: &Path, chunk_size: i64, with_parts: bool) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(1 << 20, file);

    if !with_parts {
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1 << 20];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        return Ok(format!("{:x}", hasher.finalize()));
    }

    let mut digests: Vec<[u8; 16]> = Vec::new();
    let mut chunk = vec![0u8; chunk_size as usize];
    loop {
        let n = read_full(&mut reader, &mut chunk)?;
        if n == 0 {
            break;
        }
        digests.push(Md5::digest(&chunk[..n]).into());
        if n < chunk.len() {
            break;
        }
    }

    Ok(match digests.len() {
        0 => format!("{:x}", Md5::digest(b"")),
        1 => hex(&digests[0]),
        count => {
            let mut combined = Md5::new();
            for digest in &digests {
                combined.update(digest);
            }
            format!("{:x}-{}", combined.finalize(), count)
        }
    })
}

/// Fills `buf` from `reader`, tolerating short reads; returns bytes read,
/// which is less than `buf.len()` only at end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn hex(digest: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().expect("tmp file");
        tmp.write_all(content).expect("write");
        tmp.flush().expect("flush");
        tmp
    }

    /// The multi-part formula computed independently of the code under test.
    fn expected_multipart(content: &[u8], chunk: usize) -> String {
        let digests: Vec<[u8; 16]> = content
            .chunks(chunk)
            .map(|c| Md5::digest(c).into())
            .collect();
        let mut combined = Md5::new();
        for d in &digests {
            combined.update(d);
        }
        format!("{:x}-{}", combined.finalize(), digests.len())
    }

    #[test]
    fn empty_file_is_the_well_known_single_part_md5() {
        let tmp = file_with(b"");
        let etag = compute_etag(tmp.path(), 8 << 20, true).expect("etag");
        assert_eq!(etag, EMPTY_MD5);
    }

    #[test]
    fn file_smaller_than_one_chunk_is_single_part() {
        let content = vec![7u8; 1 << 20];
        let tmp = file_with(&content);
        let etag = compute_etag(tmp.path(), 8 << 20, true).expect("etag");
        assert_eq!(etag, format!("{:x}", Md5::digest(&content)));
        assert!(!etag.contains('-'));
        assert_eq!(etag.len(), 32);
    }

    #[test]
    fn three_chunks_get_the_dash_three_suffix() {
        let content: Vec<u8> = (0..2560u32).map(|i| (i % 251) as u8).collect();
        let tmp = file_with(&content);
        let etag = compute_etag(tmp.path(), 1024, true).expect("etag");
        assert!(etag.ends_with("-3"));
        assert_eq!(etag, expected_multipart(&content, 1024));
    }

    #[test]
    fn exact_multiple_has_no_extra_part() {
        let content = vec![42u8; 2048];
        let tmp = file_with(&content);
        let etag = compute_etag(tmp.path(), 1024, true).expect("etag");
        assert!(etag.ends_with("-2"), "got {etag}");
        assert_eq!(etag, expected_multipart(&content, 1024));
    }

    #[test]
    fn file_of_exactly_one_chunk_is_single_part() {
        let content = vec![9u8; 1024];
        let tmp = file_with(&content);
        let etag = compute_etag(tmp.path(), 1024, true).expect("etag");
        assert_eq!(etag, format!("{:x}", Md5::digest(&content)));
    }

    #[test]
    fn disabling_parts_hashes_the_whole_stream() {
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 13) as u8).collect();
        let tmp = file_with(&content);
        let etag = compute_etag(tmp.path(), 1024, false).expect("etag");
        assert_eq!(etag, format!("{:x}", Md5::digest(&content)));
    }

    #[test]
    fn different_content_yields_different_etags() {
        let a = file_with(b"one payload");
        let b = file_with(b"two payload");
        let ea = compute_etag(a.path(), 1024, true).expect("etag");
        let eb = compute_etag(b.path(), 1024, true).expect("etag");
        assert_ne!(ea, eb);
    }

    #[test]
    fn missing_file_reports_io_error() {
        let err = compute_etag(Path::new("/nonexistent/x"), 1024, true).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
