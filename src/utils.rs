//! Miscellaneous helper utilities.
use std::collections::HashSet;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::{Error, Result};

/// Length in bytes of a KSV or HDCP2 receiver ID.
pub const KSV_LEN: usize = 5;

/// A KSV is valid when exactly 20 of its 40 bits are set.
#[must_use]
pub fn is_valid_ksv(ksv: &[u8; KSV_LEN]) -> bool {
    ksv.iter().map(|b| b.count_ones()).sum::<u32>() == 20
}

/// Poll `op` until `done` accepts its result, `unplugged` reports the link
/// gone, or `timeout` passes.
///
/// Unplug always wins: it is checked before the first poll and after every
/// poll, ahead of both the completion and the deadline test. The deadline is
/// sampled before `op` runs, so a condition that becomes true on the last
/// poll is still reported as done. The sleep between polls starts at
/// `min_poll` and doubles up to `max_poll`.
pub fn wait_for<C: ?Sized, T>(
    ctx: &mut C,
    timeout: Duration,
    min_poll: Duration,
    max_poll: Duration,
    mut op: impl FnMut(&mut C) -> T,
    mut unplugged: impl FnMut(&C) -> bool,
    mut done: impl FnMut(&T) -> bool,
) -> Result<T> {
    if unplugged(ctx) {
        return Err(Error::Plugout);
    }

    let deadline = Instant::now() + timeout;
    let mut poll = min_poll;
    loop {
        let expired = Instant::now() > deadline;
        let value = op(ctx);
        if unplugged(ctx) {
            return Err(Error::Plugout);
        }
        if done(&value) {
            return Ok(value);
        }
        if expired {
            return Err(Error::WaitTimeout);
        }
        thread::sleep(poll);
        poll = (poll * 2).min(max_poll);
    }
}

/// Error returned when revocation list text cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid revocation entry {entry:?} on line {line}")]
pub struct RevocationParseError {
    pub line: usize,
    pub entry: String,
}

/// Set of revoked KSVs and HDCP2 receiver IDs.
///
/// Text form is one 10-digit hex id per line. Blank lines and anything after
/// `#` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevocationList {
    ids: HashSet<[u8; KSV_LEN]>,
}

impl RevocationList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: [u8; KSV_LEN]) -> bool {
        self.ids.insert(id)
    }

    #[must_use]
    pub fn contains(&self, id: &[u8; KSV_LEN]) -> bool {
        self.ids.contains(id)
    }

    /// True if any 5-byte id packed in `list` is revoked. A trailing partial
    /// id is ignored.
    #[must_use]
    pub fn contains_any(&self, list: &[u8]) -> bool {
        if self.ids.is_empty() {
            return false;
        }
        list.chunks_exact(KSV_LEN).any(|chunk| {
            let mut id = [0u8; KSV_LEN];
            id.copy_from_slice(chunk);
            self.ids.contains(&id)
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<[u8; KSV_LEN]> for RevocationList {
    fn from_iter<I: IntoIterator<Item = [u8; KSV_LEN]>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Parse a single hex-encoded 5-byte id.
pub fn parse_ksv(s: &str) -> std::result::Result<[u8; KSV_LEN], hex::FromHexError> {
    let mut id = [0u8; KSV_LEN];
    hex::decode_to_slice(s.trim(), &mut id)?;
    Ok(id)
}

impl FromStr for RevocationList {
    type Err = RevocationParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut list = RevocationList::new();
        for (idx, raw) in s.lines().enumerate() {
            let entry = raw.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }
            let id = parse_ksv(entry).map_err(|_| RevocationParseError {
                line: idx + 1,
                entry: entry.to_string(),
            })?;
            list.insert(id);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::{is_valid_ksv, parse_ksv, wait_for, RevocationList};
    use crate::error::Error;

    fn reference_weight(ksv: &[u8; 5]) -> u32 {
        let mut n = 0;
        for byte in ksv {
            for bit in 0..8 {
                n += u32::from((byte >> bit) & 1);
            }
        }
        n
    }

    #[test]
    fn ksv_weight_matches_reference() {
        let mut rng = StdRng::seed_from_u64(0x4844_4350);
        for _ in 0..10_000 {
            let ksv: [u8; 5] = rng.gen();
            assert_eq!(is_valid_ksv(&ksv), reference_weight(&ksv) == 20);
        }
    }

    #[test]
    fn ksv_known_values() {
        assert!(is_valid_ksv(&[0xff, 0xff, 0x0f, 0x00, 0x00]));
        assert!(is_valid_ksv(&[0x14, 0xf7, 0x61, 0x03, 0xb7]));
        assert!(!is_valid_ksv(&[0; 5]));
        assert!(!is_valid_ksv(&[0xff; 5]));
    }

    #[test]
    fn unplug_wins_over_timeout() {
        let polls = Cell::new(0u32);
        let res = wait_for(
            &mut (),
            Duration::ZERO,
            Duration::from_millis(1),
            Duration::from_millis(1),
            |_| polls.set(polls.get() + 1),
            // plugged for the initial check, gone after the first poll
            |_| polls.get() > 0,
            |_| false,
        );
        assert_eq!(res, Err(Error::Plugout));
    }

    #[test]
    fn unplug_wins_over_done() {
        let polls = Cell::new(0u32);
        let res = wait_for(
            &mut (),
            Duration::from_millis(50),
            Duration::from_millis(1),
            Duration::from_millis(1),
            |_| polls.set(polls.get() + 1),
            |_| polls.get() > 0,
            |_| true,
        );
        assert_eq!(res, Err(Error::Plugout));
    }

    #[test]
    fn unplugged_before_start() {
        let res = wait_for(
            &mut (),
            Duration::from_millis(50),
            Duration::from_millis(1),
            Duration::from_millis(1),
            |_| panic!("op must not run"),
            |_| true,
            |_: &()| true,
        );
        assert_eq!(res, Err(Error::Plugout));
    }

    #[test]
    fn times_out() {
        let res = wait_for(
            &mut 0u32,
            Duration::from_millis(5),
            Duration::from_millis(1),
            Duration::from_millis(2),
            |n| {
                *n += 1;
                *n
            },
            |_| false,
            |_| false,
        );
        assert_eq!(res, Err(Error::WaitTimeout));
    }

    #[test]
    fn completes_with_value() {
        let mut counter = 0u32;
        let res = wait_for(
            &mut counter,
            Duration::from_secs(1),
            Duration::from_millis(1),
            Duration::from_millis(4),
            |n| {
                *n += 1;
                *n
            },
            |_| false,
            |v| *v == 3,
        );
        assert_eq!(res, Ok(3));
        assert_eq!(counter, 3);
    }

    #[test]
    fn revocation_list_parse() {
        let text = "# revoked sinks\n\
                    0102030405\n\
                    \n\
                    a1b2c3d4e5  # repeater\n";
        let list: RevocationList = text.parse().expect("parse");
        assert_eq!(list.len(), 2);
        assert!(list.contains(&[1, 2, 3, 4, 5]));
        assert!(list.contains(&[0xa1, 0xb2, 0xc3, 0xd4, 0xe5]));
        assert!(list.contains_any(&[9, 9, 9, 9, 9, 0xa1, 0xb2, 0xc3, 0xd4, 0xe5]));
        assert!(!list.contains_any(&[9, 9, 9, 9, 9, 1, 2, 3, 4]));
    }

    #[test]
    fn revocation_list_rejects_bad_line() {
        let err = "0102030405\nnot-hex\n"
            .parse::<RevocationList>()
            .expect_err("bad entry");
        assert_eq!(err.line, 2);
        assert_eq!(err.entry, "not-hex");
    }

    #[test]
    fn parse_single_ksv() {
        assert_eq!(parse_ksv("14F76103B7").expect("ksv"), [0x14, 0xf7, 0x61, 0x03, 0xb7]);
        assert!(parse_ksv("14F761").is_err());
    }
}
