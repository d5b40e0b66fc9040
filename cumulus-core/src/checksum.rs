//! Share and file checksums
//!
//! Every share and every file carries two checksums: a rolling Adler-32 for
//! cheap corruption checks and an MD5 digest.

use crate::error::{CumulusError, Result};
use adler32::RollingAdler32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An MD5 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Md5Digest(pub [u8; 16]);

impl Md5Digest {
    pub fn compute(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({})", self.to_hex())
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Size and checksums of one share as sent over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareChecksum {
    pub size: u64,
    pub adler32: u32,
    pub md5: Md5Digest,
}

impl ShareChecksum {
    pub fn of(data: &[u8]) -> Self {
        let mut adler = RollingAdler32::new();
        adler.update_buffer(data);
        Self {
            size: data.len() as u64,
            adler32: adler.hash(),
            md5: Md5Digest::compute(data),
        }
    }

    /// Check received bytes against the declared checksum
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = ShareChecksum::of(data);
        if actual.size != self.size {
            return Err(CumulusError::SizeMismatch {
                declared: self.size,
                actual: actual.size,
            });
        }
        if actual.adler32 != self.adler32 {
            return Err(CumulusError::Adler32Mismatch {
                declared: self.adler32,
                actual: actual.adler32,
            });
        }
        if actual.md5 != self.md5 {
            return Err(CumulusError::Md5Mismatch(format!(
                "declared {}, actual {}",
                self.md5, actual.md5
            )));
        }
        Ok(())
    }
}

/// Running size, Adler-32 and MD5 over a whole unencoded file
pub struct FileChecksum {
    size: u64,
    adler: RollingAdler32,
    md5: md5::Context,
}

impl FileChecksum {
    pub fn new() -> Self {
        Self {
            size: 0,
            adler: RollingAdler32::new(),
            md5: md5::Context::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        self.adler.update_buffer(data);
        self.md5.consume(data);
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> ShareChecksum {
        ShareChecksum {
            size: self.size,
            adler32: self.adler.hash(),
            md5: Md5Digest(self.md5.compute().0),
        }
    }
}

impl Default for FileChecksum {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let mut running = FileChecksum::new();
        for chunk in data.chunks(777) {
            running.update(chunk);
        }
        assert_eq!(running.finish(), ShareChecksum::of(&data));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let checksum = ShareChecksum::of(b"share bytes");
        assert!(checksum.verify(b"share bytes").is_ok());
        assert!(matches!(
            checksum.verify(b"share byte"),
            Err(CumulusError::SizeMismatch { .. })
        ));
        assert!(checksum.verify(b"share bytez").unwrap_err().is_integrity());
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(
            Md5Digest::compute(b"").to_hex(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }
}
