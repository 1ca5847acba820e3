use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::timeutils::{format_hms, parse_hms_or_human_time};

const KIB: u64 = 1024;

/// Memory amount in the scheduler's size notation (`512M`, `4G`, ...).
/// A bare number is interpreted as megabytes, which is what the scheduler
/// does for `--mem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemSize {
    bytes: u64,
}

impl MemSize {
    pub fn from_bytes(bytes: u64) -> MemSize {
        MemSize { bytes }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl FromStr for MemSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow!("Empty memory size"));
        }
        let (digits, multiplier) = match s.chars().last().unwrap().to_ascii_uppercase() {
            'K' => (&s[..s.len() - 1], KIB),
            'M' => (&s[..s.len() - 1], KIB * KIB),
            'G' => (&s[..s.len() - 1], KIB * KIB * KIB),
            'T' => (&s[..s.len() - 1], KIB * KIB * KIB * KIB),
            c if c.is_ascii_digit() => (s, KIB * KIB),
            c => return Err(anyhow!("Invalid memory size suffix `{c}`")),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| anyhow!("Invalid memory size `{s}`"))?;
        if value == 0 {
            return Err(anyhow!("Memory size must be positive"));
        }
        Ok(MemSize {
            bytes: value * multiplier,
        })
    }
}

impl fmt::Display for MemSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, factor) in [
            ('T', KIB * KIB * KIB * KIB),
            ('G', KIB * KIB * KIB),
            ('M', KIB * KIB),
            ('K', KIB),
        ] {
            if self.bytes % factor == 0 {
                return write!(f, "{}{}", self.bytes / factor, unit);
            }
        }
        write!(f, "{}", self.bytes)
    }
}

impl Serialize for MemSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MemSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

/// Wall-clock limit, rendered in the scheduler's `HH:MM:SS` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WallTime {
    duration: Duration,
}

impl WallTime {
    pub fn from_duration(duration: Duration) -> WallTime {
        WallTime { duration }
    }

    pub fn as_duration(&self) -> Duration {
        self.duration
    }
}

impl FromStr for WallTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(WallTime {
            duration: parse_hms_or_human_time(s)?,
        })
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hms(&self.duration))
    }
}

impl Serialize for WallTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WallTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_parse() {
        assert_eq!(
            "1G".parse::<MemSize>().unwrap().bytes(),
            1024 * 1024 * 1024
        );
        assert_eq!("512M".parse::<MemSize>().unwrap().bytes(), 512 << 20);
        assert_eq!("2048".parse::<MemSize>().unwrap().bytes(), 2048 << 20);
        assert!("".parse::<MemSize>().is_err());
        assert!("4X".parse::<MemSize>().is_err());
        assert!("0G".parse::<MemSize>().is_err());
    }

    #[test]
    fn mem_display_roundtrip() {
        for spec in ["1G", "512M", "1536M", "3T"] {
            assert_eq!(spec.parse::<MemSize>().unwrap().to_string(), spec);
        }
        // Bare megabytes normalize to an explicit suffix.
        assert_eq!("2048".parse::<MemSize>().unwrap().to_string(), "2G");
    }

    #[test]
    fn mem_ordering() {
        let small: MemSize = "900M".parse().unwrap();
        let big: MemSize = "1G".parse().unwrap();
        assert!(small < big);
    }

    #[test]
    fn walltime_roundtrip() {
        let time: WallTime = "01:05:02".parse().unwrap();
        assert_eq!(time.as_duration().as_secs(), 3902);
        assert_eq!(time.to_string(), "01:05:02");

        let time: WallTime = "2h".parse().unwrap();
        assert_eq!(time.to_string(), "02:00:00");
    }
}
