use std::collections::HashMap;

/// Dwell time at which a region counts as glossed over.
pub const GLOSSED_THRESHOLD_MS: u64 = 7_000;
/// Dwell time at which a region counts as read.
pub const READ_THRESHOLD_MS: u64 = 42_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwellVerdict {
    Glossed,
    Read,
}

impl DwellVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            DwellVerdict::Glossed => "GLOSSED",
            DwellVerdict::Read => "READ",
        }
    }

    /// `None` below the glossed threshold; such dwell is not reported.
    pub fn classify(duration_ms: u64, glossed_ms: u64, read_ms: u64) -> Option<Self> {
        if duration_ms >= read_ms {
            Some(DwellVerdict::Read)
        } else if duration_ms >= glossed_ms {
            Some(DwellVerdict::Glossed)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionVerdict {
    pub region_id: String,
    pub verdict: DwellVerdict,
    pub duration_ms: u64,
}

/// Open dwell observations, keyed by region id.
///
/// An entry exists exactly while its region is in view (or until the next
/// flush). Timestamps are epoch milliseconds supplied by the caller.
#[derive(Debug)]
pub struct DwellLedger {
    open: HashMap<String, u64>,
    glossed_ms: u64,
    read_ms: u64,
}

impl Default for DwellLedger {
    fn default() -> Self {
        Self::with_thresholds(GLOSSED_THRESHOLD_MS, READ_THRESHOLD_MS)
    }
}

impl DwellLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(glossed_ms: u64, read_ms: u64) -> Self {
        Self {
            open: HashMap::new(),
            glossed_ms,
            read_ms: read_ms.max(glossed_ms),
        }
    }

    /// Starts an observation. A duplicate enter keeps the original start.
    pub fn enter(&mut self, region_id: &str, now_ms: u64) -> bool {
        if self.open.contains_key(region_id) {
            return false;
        }
        self.open.insert(region_id.to_string(), now_ms);
        true
    }

    /// Ends an observation and classifies it.
    pub fn leave(&mut self, region_id: &str, now_ms: u64) -> Option<RegionVerdict> {
        let start = self.open.remove(region_id)?;
        self.verdict(region_id.to_string(), start, now_ms)
    }

    /// Ends every observation against `now_ms` (page exit or navigation).
    /// Results are ordered by region id.
    pub fn flush(&mut self, now_ms: u64) -> Vec<RegionVerdict> {
        let mut open: Vec<(String, u64)> = self.open.drain().collect();
        open.sort();
        open.into_iter()
            .filter_map(|(region_id, start)| self.verdict(region_id, start, now_ms))
            .collect()
    }

    pub fn is_open(&self, region_id: &str) -> bool {
        self.open.contains_key(region_id)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    fn verdict(&self, region_id: String, start: u64, now_ms: u64) -> Option<RegionVerdict> {
        let duration_ms = now_ms.saturating_sub(start);
        DwellVerdict::classify(duration_ms, self.glossed_ms, self.read_ms).map(|verdict| {
            RegionVerdict {
                region_id,
                verdict,
                duration_ms,
            }
        })
    }
}
