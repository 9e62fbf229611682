//! Protocol-level result classification
//!
//! Reduces a completion's status bytes and sense data to one [`Category`].
//! `Clean` and `Recovered` count as success; every other category ends the
//! owning worker's loop.

use crate::sg::sys::{DID_OK, DRIVER_OK, DRIVER_SENSE, SAM_STAT_CHECK_CONDITION, SAM_STAT_GOOD};
use std::fmt;

/// Sense key: no error.
pub const SENSE_KEY_NO_SENSE: u8 = 0x0;
/// Sense key: the command succeeded after recovery action.
pub const SENSE_KEY_RECOVERED_ERROR: u8 = 0x1;
/// Sense key: logical unit not ready.
pub const SENSE_KEY_NOT_READY: u8 = 0x2;
/// Sense key: unrecovered media error.
pub const SENSE_KEY_MEDIUM_ERROR: u8 = 0x3;
/// Sense key: bad CDB or parameter.
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x5;
/// Sense key: unit attention.
pub const SENSE_KEY_UNIT_ATTENTION: u8 = 0x6;

/// Classified outcome of one completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// GOOD status, no transport error.
    Clean,
    /// CHECK CONDITION with RECOVERED ERROR sense.
    Recovered,
    /// CHECK CONDITION with any other sense.
    CheckCondition {
        /// Sense key.
        key: u8,
        /// Additional sense code.
        asc: u8,
        /// Additional sense code qualifier.
        ascq: u8,
    },
    /// Any other non-GOOD SCSI status.
    Status(u8),
    /// Host adapter or driver reported an error.
    Transport {
        /// `host_status` / `transport_status`.
        host: u16,
        /// `driver_status` with the sense-valid bit removed.
        driver: u16,
    },
}

impl Category {
    /// Success, possibly with a warning.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Clean | Self::Recovered)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Recovered => write!(f, "recovered error"),
            Self::CheckCondition { key, asc, ascq } => write!(
                f,
                "check condition: {} (asc=0x{asc:02x} ascq=0x{ascq:02x})",
                sense_key_name(*key)
            ),
            Self::Status(s) => write!(f, "SCSI status 0x{s:02x}"),
            Self::Transport { host, driver } => {
                write!(f, "transport error host=0x{host:x} driver=0x{driver:x}")
            }
        }
    }
}

fn sense_key_name(key: u8) -> &'static str {
    match key {
        SENSE_KEY_NO_SENSE => "no sense",
        SENSE_KEY_RECOVERED_ERROR => "recovered error",
        SENSE_KEY_NOT_READY => "not ready",
        SENSE_KEY_MEDIUM_ERROR => "medium error",
        0x4 => "hardware error",
        SENSE_KEY_ILLEGAL_REQUEST => "illegal request",
        SENSE_KEY_UNIT_ATTENTION => "unit attention",
        0x7 => "data protect",
        0xb => "aborted command",
        _ => "other sense key",
    }
}

/// Key, ASC and ASCQ parsed from fixed or descriptor format sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseSummary {
    /// Sense key.
    pub key: u8,
    /// Additional sense code.
    pub asc: u8,
    /// Additional sense code qualifier.
    pub ascq: u8,
}

/// Parse the first bytes of a sense buffer.
pub fn parse_sense(sense: &[u8]) -> Option<SenseSummary> {
    let code = sense.first()? & 0x7f;
    match code {
        // fixed format
        0x70 | 0x71 if sense.len() >= 14 => Some(SenseSummary {
            key: sense[2] & 0x0f,
            asc: sense[12],
            ascq: sense[13],
        }),
        0x70 | 0x71 if sense.len() >= 3 => Some(SenseSummary {
            key: sense[2] & 0x0f,
            asc: 0,
            ascq: 0,
        }),
        // descriptor format
        0x72 | 0x73 if sense.len() >= 4 => Some(SenseSummary {
            key: sense[1] & 0x0f,
            asc: sense[2],
            ascq: sense[3],
        }),
        _ => None,
    }
}

/// Write a fixed-format sense block into `buf`, returning the bytes used.
pub fn write_fixed_sense(buf: &mut [u8], key: u8, asc: u8, ascq: u8) -> usize {
    let len = buf.len().min(18);
    buf[..len].fill(0);
    if len < 14 {
        return 0;
    }
    buf[0] = 0x70;
    buf[2] = key & 0x0f;
    buf[7] = (len - 8) as u8;
    buf[12] = asc;
    buf[13] = ascq;
    len
}

/// Classify one completion.
pub fn classify(status: u8, host_status: u16, driver_status: u16, sense: &[u8]) -> Category {
    let driver = driver_status & !DRIVER_SENSE;
    if host_status != DID_OK || driver != DRIVER_OK {
        return Category::Transport {
            host: host_status,
            driver,
        };
    }
    match status & 0x7e {
        SAM_STAT_GOOD => Category::Clean,
        SAM_STAT_CHECK_CONDITION => match parse_sense(sense) {
            Some(s) if s.key == SENSE_KEY_RECOVERED_ERROR || s.key == SENSE_KEY_NO_SENSE => {
                Category::Recovered
            }
            Some(s) => Category::CheckCondition {
                key: s.key,
                asc: s.asc,
                ascq: s.ascq,
            },
            None => Category::Status(status),
        },
        other => Category::Status(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sg::sys::SAM_STAT_BUSY;

    #[test]
    fn test_classify_good() {
        assert_eq!(classify(SAM_STAT_GOOD, 0, 0, &[]), Category::Clean);
        assert!(Category::Clean.is_success());
    }

    #[test]
    fn test_classify_recovered_fixed() {
        let mut sense = [0u8; 32];
        write_fixed_sense(&mut sense, SENSE_KEY_RECOVERED_ERROR, 0x17, 0x01);
        let cat = classify(SAM_STAT_CHECK_CONDITION, 0, DRIVER_SENSE, &sense);
        assert_eq!(cat, Category::Recovered);
        assert!(cat.is_success());
    }

    #[test]
    fn test_classify_medium_error() {
        let mut sense = [0u8; 32];
        write_fixed_sense(&mut sense, SENSE_KEY_MEDIUM_ERROR, 0x11, 0x00);
        let cat = classify(SAM_STAT_CHECK_CONDITION, 0, DRIVER_SENSE, &sense);
        assert_eq!(
            cat,
            Category::CheckCondition {
                key: SENSE_KEY_MEDIUM_ERROR,
                asc: 0x11,
                ascq: 0
            }
        );
        assert!(!cat.is_success());
        assert!(cat.to_string().contains("medium error"));
    }

    #[test]
    fn test_classify_descriptor_sense() {
        let sense = [0x72, SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00, 0, 0, 0, 0];
        let cat = classify(SAM_STAT_CHECK_CONDITION, 0, 0, &sense);
        assert_eq!(
            cat,
            Category::CheckCondition {
                key: SENSE_KEY_ILLEGAL_REQUEST,
                asc: 0x24,
                ascq: 0
            }
        );
    }

    #[test]
    fn test_classify_busy_status() {
        assert_eq!(classify(SAM_STAT_BUSY, 0, 0, &[]), Category::Status(SAM_STAT_BUSY));
    }

    #[test]
    fn test_classify_transport_error() {
        // DID_NO_CONNECT
        let cat = classify(SAM_STAT_GOOD, 0x01, 0, &[]);
        assert_eq!(cat, Category::Transport { host: 1, driver: 0 });
        assert!(!cat.is_success());
    }

    #[test]
    fn test_check_condition_without_sense() {
        assert_eq!(
            classify(SAM_STAT_CHECK_CONDITION, 0, 0, &[0u8; 8]),
            Category::Status(SAM_STAT_CHECK_CONDITION)
        );
    }

    #[test]
    fn test_write_fixed_sense_too_small() {
        let mut buf = [0u8; 8];
        assert_eq!(write_fixed_sense(&mut buf, 3, 0x11, 0), 0);
        assert!(parse_sense(&buf).is_none());
    }
}
