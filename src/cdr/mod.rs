//! Call Detail Record recorder (4.8): one row per Call-ID (or per
//! call-id+CSeq for MESSAGE), merged across milestones, flushed once to a
//! date-bucketed CSV file and then tombstoned against a second write.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    Success,
    Unregistered,
    NoAnswer,
    Busy,
    Failed,
    Cancelled,
}

impl CallResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallResult::Success => "SUCCESS",
            CallResult::Unregistered => "UNREGISTERED",
            CallResult::NoAnswer => "NO_ANSWER",
            CallResult::Busy => "BUSY",
            CallResult::Failed => "FAILED",
            CallResult::Cancelled => "CANCELLED",
        }
    }
}

/// One row, per the minimum field set the data model and §4.8 name. Fields
/// that only apply to some milestones (e.g. `ringing_time` before any 180
/// arrives) stay an empty string rather than `Option` — `csv`'s struct
/// serialization needs a fixed column count per row, so "unset" has to be
/// the empty cell rather than an omitted field.
#[derive(Debug, Clone, Serialize)]
pub struct CdrRow {
    pub record_id: String,
    /// CALL, REGISTER, MESSAGE, or OPTIONS (4.8).
    pub record_type: String,
    pub call_id: String,
    #[serde(rename = "state")]
    pub result: String,
    pub date: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    pub caller_uri: String,
    pub caller_user: String,
    pub caller_host_port: String,
    pub callee_uri: String,
    pub callee_user: String,
    pub callee_host_port: String,
    #[serde(default)]
    pub invite_time: String,
    #[serde(default)]
    pub ringing_time: String,
    #[serde(default)]
    pub answer_time: String,
    #[serde(default)]
    pub bye_time: String,
    #[serde(default)]
    pub duration_seconds: String,
    #[serde(default)]
    pub final_status_code: String,
    /// Termination reason (7, 4.7): e.g. "Timeout" for an idle-dialog sweep
    /// or a NAT-unreachable downstream, empty for an ordinary completion.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub cseq: String,
    #[serde(skip)]
    #[serde(default)]
    last_touched: Option<Instant>,
}

impl CdrRow {
    fn blank() -> Self {
        let now = Local::now();
        CdrRow {
            record_id: Uuid::new_v4().to_string(),
            record_type: String::new(),
            call_id: String::new(),
            result: CallResult::Failed.as_str().to_string(),
            date: now.format("%Y-%m-%d").to_string(),
            start_time: now.to_rfc3339(),
            end_time: String::new(),
            caller_uri: String::new(),
            caller_user: String::new(),
            caller_host_port: String::new(),
            callee_uri: String::new(),
            callee_user: String::new(),
            callee_host_port: String::new(),
            invite_time: String::new(),
            ringing_time: String::new(),
            answer_time: String::new(),
            bye_time: String::new(),
            duration_seconds: String::new(),
            final_status_code: String::new(),
            reason: String::new(),
            user_agent: String::new(),
            contact: String::new(),
            cseq: String::new(),
            last_touched: None,
        }
    }
}

/// Staged, not-yet-written rows plus the flushed-Call-ID tombstone set, the
/// same staging-dict-plus-tombstone shape the design keeps from the
/// original system (9, Design Notes).
pub struct CdrRecorder {
    dir: PathBuf,
    merge_mode: bool,
    staged: Mutex<HashMap<String, CdrRow>>,
    flushed: Mutex<HashMap<String, Instant>>,
}

impl CdrRecorder {
    pub fn new(dir: impl Into<PathBuf>, merge_mode: bool) -> Self {
        CdrRecorder {
            dir: dir.into(),
            merge_mode,
            staged: Mutex::new(HashMap::new()),
            flushed: Mutex::new(HashMap::new()),
        }
    }

    /// Dedup key: Call-ID for everything except MESSAGE, which dedups on
    /// `(call-id, cseq)` so distinct in-dialog MESSAGE requests each get
    /// their own row (9, Open Question #3).
    pub fn dedup_key(method: &str, call_id: &str, cseq: u32) -> String {
        if method.eq_ignore_ascii_case("MESSAGE") {
            format!("{call_id}:{cseq}")
        } else {
            call_id.to_string()
        }
    }

    /// Records or updates a milestone for a call. In merged mode
    /// (`CDR_MERGE_MODE = true`, the default) later milestones overwrite
    /// fields on the same staged row; in per-milestone mode each call
    /// appends its own row directly.
    pub fn record_or_update(&self, key: String, update: impl FnOnce(&mut CdrRow)) {
        if self.flushed.lock().unwrap().contains_key(&key) {
            return;
        }
        if self.merge_mode {
            let mut staged = self.staged.lock().unwrap();
            let row = staged.entry(key).or_insert_with(CdrRow::blank);
            update(row);
            row.last_touched = Some(Instant::now());
        } else {
            let mut row = CdrRow::blank();
            update(&mut row);
            let _ = self.write_row(&row);
        }
    }

    pub fn set_result(&self, key: &str, result: CallResult) {
        if let Some(row) = self.staged.lock().unwrap().get_mut(key) {
            row.result = result.as_str().to_string();
        }
    }

    /// Records why a call ended (7: Timeout, NetworkError, ...). A no-op if
    /// the row was already flushed — matches `set_result`.
    pub fn set_reason(&self, key: &str, reason: &str) {
        if let Some(row) = self.staged.lock().unwrap().get_mut(key) {
            row.reason = reason.to_string();
        }
    }

    /// Writes every staged row whose key is in `keys_to_flush` and tombstones
    /// it, so a later `record_or_update` on the same key is a no-op until
    /// `sweep_flushed` ages the tombstone out.
    pub fn flush(&self, keys_to_flush: &[String]) -> Result<()> {
        let mut staged = self.staged.lock().unwrap();
        let mut flushed = self.flushed.lock().unwrap();
        for key in keys_to_flush {
            if let Some(row) = staged.remove(key) {
                self.write_row(&row)?;
                flushed.insert(key.clone(), Instant::now());
            }
        }
        Ok(())
    }

    /// Flushes every staged row unconditionally — used on shutdown (5).
    pub fn flush_all(&self) -> Result<()> {
        let keys: Vec<String> = self.staged.lock().unwrap().keys().cloned().collect();
        self.flush(&keys)
    }

    /// Timer wheel sweep target (4.7, 3600s default): drops old tombstones
    /// so the flushed-set doesn't grow without bound.
    pub fn sweep_flushed(&self, max_age: Duration) {
        let now = Instant::now();
        self.flushed
            .lock()
            .unwrap()
            .retain(|_, at| now.duration_since(*at) < max_age);
    }

    #[cfg(test)]
    pub fn dir_for_test(&self) -> &std::path::Path {
        &self.dir
    }

    fn write_row(&self, row: &CdrRow) -> Result<()> {
        let day_dir = self.dir.join(&row.date);
        fs::create_dir_all(&day_dir)?;
        let path = day_dir.join(format!("cdr_{}.csv", row.date));
        let needs_header = !path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record([
                "record_id",
                "record_type",
                "call_id",
                "state",
                "date",
                "start_time",
                "end_time",
                "caller_uri",
                "caller_user",
                "caller_host_port",
                "callee_uri",
                "callee_user",
                "callee_host_port",
                "invite_time",
                "ringing_time",
                "answer_time",
                "bye_time",
                "duration_seconds",
                "final_status_code",
                "reason",
                "user_agent",
                "contact",
                "cseq",
            ])?;
        }
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }
}

/// Current local wall-clock time in ISO 8601, for CDR milestone timestamps
/// (6: "date and time are local wall-clock, ISO 8601").
pub fn now_iso() -> String {
    Local::now().to_rfc3339()
}

/// Seconds between two ISO-8601 timestamps, or empty if either is unset or
/// unparseable — `duration-seconds` is the connected-call duration from
/// answer to end (8, scenario 1: "duration≈5 s").
pub fn duration_seconds(start: &str, end: &str) -> String {
    if start.is_empty() || end.is_empty() {
        return String::new();
    }
    let (Ok(start), Ok(end)) = (
        chrono::DateTime::parse_from_rfc3339(start),
        chrono::DateTime::parse_from_rfc3339(end),
    ) else {
        return String::new();
    };
    (end - start).num_seconds().max(0).to_string()
}
