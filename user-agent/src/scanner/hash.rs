// src/scanner/hash.rs

//! # Hashing Utilities
//!
//! Streams an image once through every configured digest.

use crate::config::model::HashAlgorithm;
use crate::scanner::cache::CacheKey;
use crate::scanner::stamp;
use log::Level;
use md5::Context as Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, Read},
    path::Path,
};

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hashes {
    pub md5:    Option<[u8; 16]>,
    pub sha1:   Option<[u8; 20]>,
    pub sha256: Option<[u8; 32]>,
}

/// Hash `path` with every algorithm in `algs`.
///
/// Fails with `InvalidData` when the open file does not match `key`, before
/// or after reading. A digest is never attributed to another file generation.
pub fn hash_file(path: &Path, algs: &BTreeSet<HashAlgorithm>, key: &CacheKey) -> io::Result<Hashes> {
    let mut f = File::open(path)?;
    ensure_unchanged(&f, key)?;

    let mut md5 = algs.contains(&HashAlgorithm::Md5).then(Md5::new);
    let mut sha1 = algs.contains(&HashAlgorithm::Sha1).then(Sha1::new);
    let mut sha256 = algs.contains(&HashAlgorithm::Sha256).then(Sha256::new);

    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let chunk = &buf[..n];
        if let Some(h) = md5.as_mut() {
            h.consume(chunk);
        }
        if let Some(h) = sha1.as_mut() {
            h.update(chunk);
        }
        if let Some(h) = sha256.as_mut() {
            h.update(chunk);
        }
    }
    ensure_unchanged(&f, key)?;

    let hashes = Hashes {
        md5:    md5.map(|h| h.compute().0),
        sha1:   sha1.map(|h| digest_bytes(&h.finalize())),
        sha256: sha256.map(|h| digest_bytes(&h.finalize())),
    };
    hostmon_log!(Level::Debug, "hash", "hashed {:?} ({} bytes)", path, key.fp.size);
    Ok(hashes)
}

fn digest_bytes<const N: usize>(out: &[u8]) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(out);
    bytes
}

fn ensure_unchanged(f: &File, key: &CacheKey) -> io::Result<()> {
    let now = CacheKey::from(&stamp(&f.metadata()?));
    let same_file = now.file == key.file;
    let same_gen = now.fp.size == key.fp.size
        && (key.fp.mtime.is_none() || now.fp.mtime == key.fp.mtime);
    if same_file && same_gen {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::InvalidData, "file changed while hashing"))
    }
}
