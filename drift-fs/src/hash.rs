//! MD5 content hashing.
//!
//! The wire protocol identifies file content by its MD5 digest as a
//! lowercase hex string; these helpers are the only place the digest is
//! computed.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};

/// Hash a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Hash everything a reader yields, in 64 KiB chunks.
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file's full content. O(file size) — callers cache the result
/// against the file's mtime and only call this again when the mtime moves.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_known_digest() {
        assert_eq!(hash_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn known_vector() {
        // RFC 1321 test suite: MD5("abc")
        assert_eq!(hash_bytes(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn reader_and_bytes_agree() {
        let data = vec![0xA5u8; 200_000]; // spans multiple read chunks
        let from_reader = hash_reader(&mut &data[..]).unwrap();
        assert_eq!(from_reader, hash_bytes(&data));
    }
}
