//! Code-signature verdicts.
//!
//! Verification itself is platform specific and sits behind
//! [`SignatureVerifier`]. The default verifier knows no signature format; it
//! classifies root-owned, non-writable images under the system prefixes as
//! platform images so that `omit_platform_hashes` has something to act on.

use std::{fs, io, os::unix::fs::MetadataExt, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignResult {
    Good,
    Unsigned,
    Bad,
    Error,
}

impl SignResult {
    pub fn as_str(self) -> &'static str {
        match self {
            SignResult::Good => "good",
            SignResult::Unsigned => "unsigned",
            SignResult::Bad => "bad",
            SignResult::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOrigin {
    Platform,
    ThirdParty,
}

impl SignOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            SignOrigin::Platform => "system",
            SignOrigin::ThirdParty => "devid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSignature {
    pub result:  SignResult,
    pub origin:  Option<SignOrigin>,
    pub ident:   Option<String>,
    pub team_id: Option<String>,
    pub cdhash:  Option<Vec<u8>>,
    pub cert_cn: Option<String>,
}

impl CodeSignature {
    pub fn unsigned() -> Self {
        Self {
            result:  SignResult::Unsigned,
            origin:  None,
            ident:   None,
            team_id: None,
            cdhash:  None,
            cert_cn: None,
        }
    }

    pub fn is_platform(&self) -> bool {
        self.origin == Some(SignOrigin::Platform)
    }
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, path: &Path) -> io::Result<CodeSignature>;
}

const SYSTEM_PREFIXES: &[&str] = &["/bin/", "/sbin/", "/usr/bin/", "/usr/sbin/", "/usr/lib/", "/usr/libexec/", "/lib/"];

/// Classifies images by location and ownership only.
#[derive(Debug, Default)]
pub struct SystemImageVerifier;

impl SignatureVerifier for SystemImageVerifier {
    fn verify(&self, path: &Path) -> io::Result<CodeSignature> {
        let meta = fs::metadata(path)?;
        let system_dir = path
            .to_str()
            .is_some_and(|p| SYSTEM_PREFIXES.iter().any(|pre| p.starts_with(pre)));
        let locked = meta.uid() == 0 && meta.mode() & 0o022 == 0;
        let mut sig = CodeSignature::unsigned();
        if system_dir && locked {
            sig.origin = Some(SignOrigin::Platform);
            sig.ident = path.file_name().map(|n| n.to_string_lossy().into_owned());
        }
        Ok(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn user_files_are_not_platform() {
        let f = NamedTempFile::new().unwrap();
        let sig = SystemImageVerifier.verify(f.path()).unwrap();
        assert_eq!(sig.result, SignResult::Unsigned);
        assert!(!sig.is_platform());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(SystemImageVerifier.verify(Path::new("/nonexistent/hostmon")).is_err());
    }
}
