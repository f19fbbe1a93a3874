//! Dynamic-linker preload scan.
//!
//! Decides from the image alone whether the loader would honour preload
//! variables for it, then combines that with the exec environment.

use crate::comms::events::FileStamp;
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

const PT_INTERP: u32 = 3;
const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const MAX_PHDRS: u16 = 512;

/// Environment variables the dynamic loaders read for forced library loads.
pub const PRELOAD_VARS: &[&str] = &["LD_PRELOAD", "DYLD_INSERT_LIBRARIES"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadVerdict {
    /// Dynamically linked; preload variables take effect.
    Dynamic,
    Static,
    /// set-id image; the loader runs in secure mode.
    Restricted,
    Script,
    Unknown,
}

impl PreloadVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            PreloadVerdict::Dynamic => "dynamic",
            PreloadVerdict::Static => "static",
            PreloadVerdict::Restricted => "restricted",
            PreloadVerdict::Script => "script",
            PreloadVerdict::Unknown => "unknown",
        }
    }
}

pub fn scan(path: &Path, stat: &FileStamp) -> io::Result<PreloadVerdict> {
    let mut f = File::open(path)?;
    let mut ident = [0u8; 64];
    let n = read_up_to(&mut f, &mut ident)?;
    let head = &ident[..n];
    if head.starts_with(b"#!") {
        return Ok(PreloadVerdict::Script);
    }
    if !head.starts_with(b"\x7fELF") || n < 52 {
        return Ok(PreloadVerdict::Unknown);
    }
    if stat.mode & (S_ISUID | S_ISGID) != 0 {
        return Ok(PreloadVerdict::Restricted);
    }
    let Some(elf) = ElfHeader::parse(head) else { return Ok(PreloadVerdict::Unknown) };
    if elf.has_program_header(&mut f, PT_INTERP)? {
        Ok(PreloadVerdict::Dynamic)
    } else {
        Ok(PreloadVerdict::Static)
    }
}

/// Preload entries from `env` that will actually be loaded for this image.
pub fn effective_preload(env: &[String], verdict: PreloadVerdict) -> Vec<String> {
    if verdict != PreloadVerdict::Dynamic {
        return Vec::new();
    }
    env.iter()
        .filter_map(|kv| kv.split_once('='))
        .filter(|(k, _)| PRELOAD_VARS.contains(k))
        .flat_map(|(_, v)| v.split([':', ' ']))
        .filter(|lib| !lib.is_empty())
        .map(str::to_owned)
        .collect()
}

fn read_up_to(f: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match f.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

struct ElfHeader {
    big:       bool,
    phoff:     u64,
    phentsize: u16,
    phnum:     u16,
}

impl ElfHeader {
    fn parse(h: &[u8]) -> Option<Self> {
        let wide = match h[4] {
            1 => false,
            2 => true,
            _ => return None,
        };
        let big = match h[5] {
            1 => false,
            2 => true,
            _ => return None,
        };
        if wide && h.len() < 64 {
            return None;
        }
        let u16_at = |o: usize| {
            let b = [h[o], h[o + 1]];
            if big { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) }
        };
        let (phoff, phentsize, phnum) = if wide {
            let b: [u8; 8] = h[0x20..0x28].try_into().ok()?;
            let off = if big { u64::from_be_bytes(b) } else { u64::from_le_bytes(b) };
            (off, u16_at(0x36), u16_at(0x38))
        } else {
            let b: [u8; 4] = h[0x1c..0x20].try_into().ok()?;
            let off = if big { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) };
            (u64::from(off), u16_at(0x2a), u16_at(0x2c))
        };
        if phentsize < 4 || phnum > MAX_PHDRS {
            return None;
        }
        Some(Self { big, phoff, phentsize, phnum })
    }

    fn has_program_header(&self, f: &mut File, wanted: u32) -> io::Result<bool> {
        let mut p_type = [0u8; 4];
        for i in 0..u64::from(self.phnum) {
            f.seek(SeekFrom::Start(self.phoff + i * u64::from(self.phentsize)))?;
            if read_up_to(f, &mut p_type)? < 4 {
                return Ok(false);
            }
            let t = if self.big { u32::from_be_bytes(p_type) } else { u32::from_le_bytes(p_type) };
            if t == wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Minimal little-endian ELF64 header with the given program header types.
    fn elf64(types: &[u32]) -> Vec<u8> {
        let mut img = vec![0u8; 64];
        img[..4].copy_from_slice(b"\x7fELF");
        img[4] = 2;
        img[5] = 1;
        img[0x20..0x28].copy_from_slice(&64u64.to_le_bytes());
        img[0x36..0x38].copy_from_slice(&56u16.to_le_bytes());
        img[0x38..0x3a].copy_from_slice(&(types.len() as u16).to_le_bytes());
        for t in types {
            let mut ph = vec![0u8; 56];
            ph[..4].copy_from_slice(&t.to_le_bytes());
            img.extend(ph);
        }
        img
    }

    fn write(bytes: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn classifies_images() {
        let st = FileStamp { mode: 0o755, ..Default::default() };
        let dynamic = write(&elf64(&[6, PT_INTERP, 1]));
        let stat = write(&elf64(&[1, 1]));
        let script = write(b"#!/bin/sh\necho hi\n");
        let junk = write(b"MZ\x90\x00");
        assert_eq!(scan(dynamic.path(), &st).unwrap(), PreloadVerdict::Dynamic);
        assert_eq!(scan(stat.path(), &st).unwrap(), PreloadVerdict::Static);
        assert_eq!(scan(script.path(), &st).unwrap(), PreloadVerdict::Script);
        assert_eq!(scan(junk.path(), &st).unwrap(), PreloadVerdict::Unknown);

        let setuid = FileStamp { mode: 0o4755, ..Default::default() };
        assert_eq!(scan(dynamic.path(), &setuid).unwrap(), PreloadVerdict::Restricted);
    }

    #[test]
    fn effective_preload_needs_a_dynamic_image() {
        let env = vec![
            "PATH=/usr/bin".to_owned(),
            "LD_PRELOAD=/tmp/a.so:/tmp/b.so".to_owned(),
        ];
        assert_eq!(effective_preload(&env, PreloadVerdict::Dynamic), vec!["/tmp/a.so", "/tmp/b.so"]);
        assert!(effective_preload(&env, PreloadVerdict::Static).is_empty());
    }
}
