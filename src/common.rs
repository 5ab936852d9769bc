use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

pub fn delete_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed deleting {}", path.display()))?;
    }
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }
    Ok(())
}

/// Sibling path used while a file is being written, renamed into place on success.
pub fn tmp_path_for(output_path: &Path, fallback_name: &str) -> PathBuf {
    let file_name = output_path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or(fallback_name);
    output_path.with_file_name(format!("{file_name}.tmp"))
}

pub fn promote_tmp(tmp_path: &Path, output_path: &Path) -> Result<()> {
    fs::rename(tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving temp file {} to {}",
            tmp_path.display(),
            output_path.display()
        )
    })
}

pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        trimmed.to_string()
    } else {
        let mut cut = max_len;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    }
}

pub async fn wait_for_rate_slot(next_slot: &Arc<Mutex<Instant>>, min_interval: Duration) {
    if min_interval.is_zero() {
        return;
    }
    let mut guard = next_slot.lock().await;
    let now = Instant::now();
    if *guard > now {
        sleep(*guard - now).await;
    }
    *guard = Instant::now() + min_interval;
}

pub fn min_interval_for_rate(requests_per_second: u32) -> Duration {
    if requests_per_second == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / requests_per_second as f64)
    }
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// `<dir>/<stem>_<unix seconds>.<ext>`
pub fn timestamped_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(format!("{stem}_{}.{ext}", now_unix_seconds()))
}

/// File-name-safe form of free text: alphanumerics kept, runs of anything else
/// collapsed to `_`.
pub fn file_stem_for(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if c.is_alphanumeric() || c == '.' || c == '-' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_');
    if out.is_empty() {
        "query".to_string()
    } else {
        out.chars().take(60).collect()
    }
}

/// Most recent `<stem>_<unix seconds>.<ext>` file in `dir`, if any.
pub fn latest_timestamped_file(dir: &Path, stem: &str, ext: &str) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let prefix = format!("{stem}_");
    let suffix = format!(".{ext}");

    let mut best: Option<(i64, PathBuf)> = None;
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed listing {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("Failed reading entry in {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(stamp) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
            .and_then(|stamp| stamp.parse::<i64>().ok())
        else {
            continue;
        };
        if best.as_ref().is_none_or(|(current, _)| stamp > *current) {
            best = Some((stamp, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}
