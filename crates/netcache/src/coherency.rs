//! Coherency fingerprint ("aux data") for cached file objects.
//!
//! Every file object stored in the backend carries a small fixed-size
//! fingerprint of the remote metadata it was cached under: modification time
//! and logical size. When the backend revisits the object it asks for a fresh
//! fingerprint and compares the two byte for byte. Any difference, including a
//! length difference, marks the stored content obsolete.
//!
//! # Layout
//!
//! | Bytes   | Field                       |
//! |---------|-----------------------------|
//! | 0..8    | mtime seconds (i64, LE)     |
//! | 8..12   | mtime nanoseconds (u32, LE) |
//! | 12..20  | size in bytes (u64, LE)     |

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

/// Encoded length of a [`CoherencyAux`].
pub const AUX_LEN: usize = 20;

/// Verdict of an aux comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAux {
    /// The stored content matches the current remote file.
    Okay,
    /// The stored content is stale and must not be served.
    Obsolete,
}

/// Modification timestamp with nanosecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: i64,
    /// Sub-second nanoseconds.
    pub nanos: u32,
}

impl Timestamp {
    /// Create a timestamp.
    pub const fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Whole-second timestamp.
    pub const fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            #[allow(clippy::cast_possible_wrap)]
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                // Before the epoch: negative seconds, positive nanos.
                let d = e.duration();
                #[allow(clippy::cast_possible_wrap)]
                let secs = -(d.as_secs() as i64);
                if d.subsec_nanos() == 0 {
                    Self::new(secs, 0)
                } else {
                    Self::new(secs - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

/// Fingerprint of the remote metadata a cache object was populated under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CoherencyAux {
    /// Remote modification time.
    pub mtime: Timestamp,
    /// Remote logical size.
    pub size: u64,
}

impl CoherencyAux {
    /// Create a fingerprint.
    pub const fn new(mtime: Timestamp, size: u64) -> Self {
        Self { mtime, size }
    }

    /// Encode to the fixed byte layout.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUX_LEN);
        buf.put_i64_le(self.mtime.secs);
        buf.put_u32_le(self.mtime.nanos);
        buf.put_u64_le(self.size);
        buf.freeze()
    }

    /// Decode from the fixed byte layout.
    ///
    /// Returns `None` if `data` is not exactly [`AUX_LEN`] bytes.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != AUX_LEN {
            return None;
        }
        let secs = i64::from_le_bytes(data[0..8].try_into().ok()?);
        let nanos = u32::from_le_bytes(data[8..12].try_into().ok()?);
        let size = u64::from_le_bytes(data[12..20].try_into().ok()?);
        Some(Self::new(Timestamp::new(secs, nanos), size))
    }

    /// Compare stored aux bytes against this (current) fingerprint.
    ///
    /// Byte-exact equality is the only accepted match.
    pub fn check(&self, stored: &[u8]) -> CheckAux {
        if stored.len() != AUX_LEN {
            return CheckAux::Obsolete;
        }
        if stored == self.to_bytes().as_ref() {
            CheckAux::Okay
        } else {
            CheckAux::Obsolete
        }
    }
}
