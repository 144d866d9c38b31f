//! Pure decision rules for product videos: duration parsing, aspect-ratio
//! screening, per-product selection and the run-wide duplicate guard.

use crate::model::VideoDescriptor;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

const TARGET_RATIO: f64 = 16.0 / 9.0;
const TARGET_RATIO_TOLERANCE: f64 = 0.2;
const MIN_RATIO: f64 = 1.3;
const WIDESCREEN_RATIO: f64 = 1.5;

/// Seconds in an `M:SS` or `H:MM:SS` timestamp. Anything unparsable, zero,
/// or longer than `max_seconds` yields 0.
pub fn parse_duration(text: &str, max_seconds: u32) -> u32 {
    let parts: Option<Vec<u64>> = text
        .trim()
        .split(':')
        .map(|p| p.trim().parse::<u64>().ok())
        .collect();

    let seconds = match parts.as_deref() {
        Some([m, s]) => m.saturating_mul(60).saturating_add(*s),
        Some([h, m, s]) => h
            .saturating_mul(3600)
            .saturating_add(m.saturating_mul(60))
            .saturating_add(*s),
        _ => return 0,
    };

    if seconds > 0 && seconds <= u64::from(max_seconds) {
        seconds as u32
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectVerdict {
    Accepted,
    Portrait,
    TooNarrow,
    Unsuitable,
}

impl AspectVerdict {
    pub fn is_accepted(self) -> bool {
        self == AspectVerdict::Accepted
    }
}

/// Only landscape footage close to 16:9, or wider than 3:2, is usable.
pub fn classify_aspect(width: u32, height: u32) -> AspectVerdict {
    if width <= height {
        return AspectVerdict::Portrait;
    }
    let ratio = width as f64 / height as f64;
    if ratio < MIN_RATIO {
        AspectVerdict::TooNarrow
    } else if (ratio - TARGET_RATIO).abs() < TARGET_RATIO_TOLERANCE || ratio > WIDESCREEN_RATIO {
        AspectVerdict::Accepted
    } else {
        AspectVerdict::Unsuitable
    }
}

/// Picks the footage for one product from its screened videos.
///
/// The longest video of at least `long_seconds` wins on its own. Failing
/// that, the two longest short clips are taken together. Anything else is
/// rejected with an empty result.
pub fn select_videos(mut candidates: Vec<VideoDescriptor>, long_seconds: u32) -> Vec<VideoDescriptor> {
    candidates.sort_by(|a, b| b.duration.cmp(&a.duration));

    if let Some(longest) = candidates.iter().find(|v| v.duration >= long_seconds) {
        return vec![longest.clone()];
    }

    let shorts: Vec<VideoDescriptor> = candidates
        .into_iter()
        .filter(|v| v.duration > 0 && v.duration < long_seconds)
        .take(2)
        .collect();
    if shorts.len() == 2 { shorts } else { Vec::new() }
}

/// Video ids already used by accepted products in this run. Cloned into
/// every detail-fetch task.
#[derive(Debug, Clone, Default)]
pub struct SeenVideoIds {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SeenVideoIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims all ids for one product, or none of them if any id is taken.
    /// Returns the first conflicting id on rejection.
    pub fn try_claim<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<(), String> {
        let ids: Vec<&str> = ids.into_iter().collect();
        let mut seen = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(dup) = ids.iter().find(|id| seen.contains(**id)) {
            return Err(dup.to_string());
        }
        for id in ids {
            seen.insert(id.to_string());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
