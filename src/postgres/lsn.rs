//! Log sequence numbers and the shared confirmed position.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::{Error, Result};

/// A position in the PostgreSQL write-ahead log.
///
/// Formatted the way the server prints it, `high/low` in upper-case hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| Error::Protocol(format!("Invalid LSN '{}': expected high/low", s)))?;

        let high = u32::from_str_radix(high, 16)
            .map_err(|e| Error::Protocol(format!("Invalid LSN high part in '{}': {}", s, e)))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|e| Error::Protocol(format!("Invalid LSN low part in '{}': {}", s, e)))?;

        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The highest position the consumer has acknowledged.
///
/// Only ever moves forward. Written by the acknowledgment listener, read by
/// the streamer's keepalives and by status reporters.
#[derive(Debug, Default)]
pub struct ConfirmedPosition(AtomicU64);

impl ConfirmedPosition {
    pub fn new(initial: Lsn) -> Self {
        Self(AtomicU64::new(initial.0))
    }

    pub fn get(&self) -> Lsn {
        Lsn(self.0.load(Ordering::Acquire))
    }

    /// Folds `lsn` in; returns true when the position advanced.
    pub fn advance(&self, lsn: Lsn) -> bool {
        let previous = self.0.fetch_max(lsn.0, Ordering::AcqRel);
        let advanced = lsn.0 > previous;
        if advanced {
            trace!(from = %Lsn(previous), to = %lsn, "confirmed position advanced");
        }
        advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.value(), 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("12345".parse::<Lsn>().is_err());
        assert!("0/XYZ".parse::<Lsn>().is_err());
        assert!("1/2/3".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_json_form_is_a_string() {
        let json = serde_json::to_string(&Lsn(0x1_0000_00FF)).unwrap();
        assert_eq!(json, "\"1/FF\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Lsn(0x1_0000_00FF));
    }

    fn fold(acks: &[u64]) -> Lsn {
        let confirmed = ConfirmedPosition::default();
        for ack in acks {
            confirmed.advance(Lsn(*ack));
        }
        confirmed.get()
    }

    #[test]
    fn test_ack_folding_is_order_independent() {
        assert_eq!(fold(&[5, 3, 5, 10, 7]), Lsn(10));
        assert_eq!(fold(&[10]), Lsn(10));
        assert_eq!(fold(&[3, 5, 7, 10, 5]), Lsn(10));
    }

    #[test]
    fn test_advance_reports_progress_only() {
        let confirmed = ConfirmedPosition::new(Lsn(4));
        assert!(!confirmed.advance(Lsn(4)));
        assert!(!confirmed.advance(Lsn(2)));
        assert!(confirmed.advance(Lsn(9)));
        assert_eq!(confirmed.get(), Lsn(9));
    }
}
