//! Usage descriptors and cache persistence
//!
//! Per-destination request counters survive restarts in a single
//! zlib-compressed JSON snapshot. Entries inactive past the configured
//! lifetime decay (count ÷ 3, floored) each time they are judged, and drop
//! out entirely at zero, so the cache tracks what the user still visits.

use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Snapshot entry, wire-compatible with the cache file format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageRecord {
    #[serde(rename = "dAndP")]
    d_and_p: String,
    count: u64,
    /// Last active time, by the hour
    #[serde(skip_serializing_if = "Option::is_none")]
    at: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(rename = "domainReqCountsDec", default)]
    domain_req_counts_dec: Vec<UsageRecord>,
}

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    count: u64,
    at_hour: u64,
}

#[derive(Default)]
struct SaveJudge {
    last_saved_ms: u64,
    last_size: usize,
}

/// Request counters keyed by `domain:port`
pub struct UsageBook {
    path: PathBuf,
    life_hours: u64,
    entries: Mutex<HashMap<String, UsageEntry>>,
    judge: Mutex<SaveJudge>,
    save_pending: AtomicBool,
}

/// Hours since the epoch
pub fn now_hour() -> u64 {
    (chrono::Utc::now().timestamp().max(0) as u64) / 3600
}

impl UsageBook {
    pub fn new(path: impl Into<PathBuf>, life_hours: u64) -> Self {
        UsageBook {
            path: path.into(),
            life_hours,
            entries: Mutex::new(HashMap::new()),
            judge: Mutex::new(SaveJudge::default()),
            save_pending: AtomicBool::new(false),
        }
    }

    /// Count one request. Returns true when the destination is new.
    pub fn record(&self, d_and_p: &str) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry(d_and_p.to_string()).or_insert(UsageEntry {
            count: 0,
            at_hour: 0,
        });
        let fresh = entry.count == 0;
        entry.count += 1;
        entry.at_hour = now_hour();
        fresh
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn count(&self, d_and_p: &str) -> u64 {
        self.entries.lock().get(d_and_p).map(|e| e.count).unwrap_or(0)
    }

    /// Decay entries inactive past the lifetime: count ÷ 3 floored, zero
    /// entries removed. Applied before trusting a restored snapshot.
    pub fn decay(&self, now_hour: u64) {
        let mut entries = self.entries.lock();
        entries.retain(|d_and_p, entry| {
            if entry.at_hour + self.life_hours < now_hour {
                entry.count /= 3;
                entry.at_hour = now_hour;
                if entry.count == 0 {
                    debug!("Usage entry {} decayed away", d_and_p);
                    return false;
                }
            }
            true
        });
    }

    /// Restore from the snapshot file. Missing file is not an error.
    /// Returns restored destinations ordered by descending count, for
    /// background re-probing.
    pub fn restore(&self) -> Result<Vec<String>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut decoder = ZlibDecoder::new(raw.as_slice());
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .map_err(|e| Error::parse(format!("cache file corrupt: {}", e)))?;
        let snapshot: Snapshot = serde_json::from_str(&json)?;

        let now = now_hour();
        {
            let mut entries = self.entries.lock();
            for rec in snapshot.domain_req_counts_dec {
                entries.insert(
                    rec.d_and_p,
                    UsageEntry {
                        count: rec.count,
                        at_hour: rec.at.unwrap_or(now),
                    },
                );
            }
        }
        self.decay(now);

        let mut restored: Vec<(String, u64)> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.count))
            .collect();
        restored.sort_by(|a, b| b.1.cmp(&a.1));
        info!("Restored {} usage entries from cache", restored.len());
        Ok(restored.into_iter().map(|(k, _)| k).collect())
    }

    /// Write the snapshot atomically (temp file + rename)
    pub fn save(&self) -> Result<()> {
        let mut records: Vec<UsageRecord> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| UsageRecord {
                d_and_p: k.clone(),
                count: v.count,
                at: Some(v.at_hour),
            })
            .collect();
        records.sort_by(|a, b| b.count.cmp(&a.count));
        let snapshot = Snapshot {
            domain_req_counts_dec: records,
        };

        let json = serde_json::to_vec(&snapshot)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;

        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &compressed)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            "Saved {} usage entries ({} bytes compressed)",
            snapshot.domain_req_counts_dec.len(),
            compressed.len()
        );
        Ok(())
    }

    /// Opportunistic save: skip when nothing changed, or when fewer than
    /// three new destinations appeared within ten minutes of the last write.
    pub fn judge_save(&self, now_ms: u64) {
        let size = self.len();
        {
            let mut judge = self.judge.lock();
            if size == judge.last_size {
                return;
            }
            if judge.last_saved_ms > 0
                && size.saturating_sub(judge.last_size) < 3
                && now_ms.saturating_sub(judge.last_saved_ms) < 10 * 60 * 1000
            {
                return;
            }
            judge.last_saved_ms = now_ms;
            judge.last_size = size;
        }
        if let Err(e) = self.save() {
            warn!("Opportunistic cache save failed: {}", e);
        }
    }

    /// Debounce flag for scheduled saves; returns true when the caller
    /// should schedule a save task.
    pub fn try_schedule_save(&self) -> bool {
        !self.save_pending.swap(true, Ordering::SeqCst)
    }

    pub fn save_scheduled_done(&self) {
        self.save_pending.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("racegate-usage-{}-{}.bin", tag, std::process::id()))
    }

    #[test]
    fn test_round_trip() {
        let path = temp_path("roundtrip");
        let book = UsageBook::new(&path, 720);
        for _ in 0..5 {
            book.record("example.com:443");
        }
        book.record("rust-lang.org:443");
        book.save().unwrap();

        let restored = UsageBook::new(&path, 720);
        restored.restore().unwrap();
        assert_eq!(restored.count("example.com:443"), 5);
        assert_eq!(restored.count("rust-lang.org:443"), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_decay_divides_and_evicts() {
        let path = temp_path("decay");
        let book = UsageBook::new(&path, 10);
        {
            let mut entries = book.entries.lock();
            entries.insert(
                "old.example:443".into(),
                UsageEntry {
                    count: 9,
                    at_hour: 100,
                },
            );
            entries.insert(
                "gone.example:443".into(),
                UsageEntry {
                    count: 2,
                    at_hour: 100,
                },
            );
            entries.insert(
                "fresh.example:443".into(),
                UsageEntry {
                    count: 4,
                    at_hour: 199,
                },
            );
        }
        // now = hour 200: entries last active at hour 100 are past the
        // 10 hour life; the fresh one is not
        book.decay(200);
        assert_eq!(book.count("old.example:443"), 3);
        assert_eq!(book.count("gone.example:443"), 0);
        assert_eq!(book.count("fresh.example:443"), 4);
        assert_eq!(book.len(), 2);
    }

    #[test]
    fn test_restore_missing_file_ok() {
        let book = UsageBook::new(temp_path("missing-nonexistent"), 720);
        assert!(book.restore().unwrap().is_empty());
    }

    #[test]
    fn test_restore_order_by_count() {
        let path = temp_path("order");
        let book = UsageBook::new(&path, 720);
        book.record("low.example:443");
        for _ in 0..9 {
            book.record("high.example:443");
        }
        book.save().unwrap();

        let restored = UsageBook::new(&path, 720);
        let order = restored.restore().unwrap();
        assert_eq!(order[0], "high.example:443");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_judge_save_skips_small_changes() {
        let path = temp_path("judge");
        let book = UsageBook::new(&path, 720);
        book.record("a.example:443");
        book.judge_save(1_000);
        let first_write = std::fs::metadata(&path).unwrap().modified().unwrap();

        // one new domain within ten minutes: skipped
        book.record("b.example:443");
        book.judge_save(2_000);
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            first_write
        );
        std::fs::remove_file(&path).ok();
    }
}
