//! Per-feed sequence watermarks.
//!
//! A [`Timeframe`] records, for each feed key, the highest sequence number
//! known to be processed. It is used as a resumable cursor over many feeds.
//! Values never move backwards.

use crate::keys::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from feed key to highest processed sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<PublicKey, u64>,
}

impl Timeframe {
    /// Empty timeframe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest processed seq for `feed`, if any.
    pub fn get(&self, feed: &PublicKey) -> Option<u64> {
        self.frames.get(feed).copied()
    }

    /// Record `seq` for `feed`. Returns `false` and leaves the timeframe
    /// untouched if it would move the watermark backwards.
    pub fn set(&mut self, feed: PublicKey, seq: u64) -> bool {
        match self.frames.get(&feed) {
            Some(&current) if current >= seq => false,
            _ => {
                self.frames.insert(feed, seq);
                true
            }
        }
    }

    /// Take the per-key maximum of both timeframes.
    pub fn merge(&mut self, other: &Timeframe) {
        for (feed, seq) in other.iter() {
            self.set(feed, seq);
        }
    }

    /// Entries of `other` this timeframe has not reached yet.
    pub fn dependencies(&self, other: &Timeframe) -> Timeframe {
        let frames = other
            .frames
            .iter()
            .filter(|(feed, seq)| self.get(feed).map_or(true, |own| own < **seq))
            .map(|(feed, seq)| (*feed, *seq))
            .collect();
        Timeframe { frames }
    }

    /// True when `other` has reached every entry of this timeframe.
    pub fn is_satisfied_by(&self, other: &Timeframe) -> bool {
        other.dependencies(self).is_empty()
    }

    /// True if no feed has been recorded.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of feeds tracked.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Iterate `(feed, seq)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (PublicKey, u64)> + '_ {
        self.frames.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(PublicKey, u64)> for Timeframe {
    fn from_iter<I: IntoIterator<Item = (PublicKey, u64)>>(iter: I) -> Self {
        let mut timeframe = Timeframe::new();
        for (feed, seq) in iter {
            timeframe.set(feed, seq);
        }
        timeframe
    }
}
