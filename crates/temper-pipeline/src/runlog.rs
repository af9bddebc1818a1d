//! Append-only run log.
//!
//! One JSONL line per attempt under `<instance>/logs/runs.jsonl`. The log is
//! an audit trail: the status query reads it to distinguish "never ran" from
//! "ran and exhausted retries", and operators read it to intervene. It is
//! never consulted for eligibility decisions.

use std::path::{Path, PathBuf};

use temper_types::{Result, StageRunRecord};
use tokio::io::AsyncWriteExt;

const OUTPUT_TAIL_CHARS: usize = 4_000;

/// Location of an instance's run log.
pub fn log_path(instance_root: &Path) -> PathBuf {
    instance_root.join("logs").join("runs.jsonl")
}

/// Keep the last `max_chars` of captured output for a log record, with a
/// marker noting how much was dropped.
pub fn tail(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }
    // Cut on a character boundary.
    let mut start = output.len() - max_chars;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!(
        "[truncated {} characters]\n{}",
        start,
        &output[start..]
    )
}

/// Truncate with the default tail budget.
pub fn default_tail(output: &str) -> String {
    tail(output, OUTPUT_TAIL_CHARS)
}

/// Append one record. The log file is created on first use and only ever
/// appended to.
pub async fn append_record(instance_root: &Path, record: &StageRunRecord) -> Result<()> {
    let path = log_path(instance_root);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// All records in append order. A missing log means no runs yet. Unreadable
/// lines are skipped rather than poisoning the whole log.
pub async fn read_records(instance_root: &Path) -> Result<Vec<StageRunRecord>> {
    let path = log_path(instance_root);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StageRunRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable run-log line"),
        }
    }
    Ok(records)
}

/// Records of the most recent run (same `run_id`) for one stage, in attempt
/// order. Empty when the stage never ran.
pub async fn last_run_for_stage(
    instance_root: &Path,
    stage: &str,
) -> Result<Vec<StageRunRecord>> {
    let records = read_records(instance_root).await?;
    let last_run_id = match records.iter().rev().find(|r| r.stage == stage) {
        Some(r) => r.run_id,
        None => return Ok(Vec::new()),
    };
    Ok(records
        .into_iter()
        .filter(|r| r.stage == stage && r.run_id == last_run_id)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use temper_types::RunDisposition;
    use uuid::Uuid;

    fn record(run_id: Uuid, stage: &str, attempt: u32, disposition: RunDisposition) -> StageRunRecord {
        StageRunRecord {
            run_id,
            stage: stage.into(),
            attempt,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            exit_code: Some(1),
            timed_out: false,
            signature: None,
            remediations: vec![],
            disposition,
            output_tail: String::new(),
        }
    }

    #[tokio::test]
    async fn append_then_read_preserves_order() {
        let dir = TempDir::new().unwrap();
        let run = Uuid::new_v4();
        for attempt in 1..=3 {
            append_record(dir.path(), &record(run, "train", attempt, RunDisposition::Retrying))
                .await
                .unwrap();
        }
        let records = read_records(dir.path()).await.unwrap();
        assert_eq!(records.len(), 3);
        let attempts: Vec<u32> = records.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_records(dir.path()).await.unwrap().is_empty());
        assert!(last_run_for_stage(dir.path(), "train").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_run_selects_only_the_newest_run_id() {
        let dir = TempDir::new().unwrap();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        append_record(dir.path(), &record(old, "train", 1, RunDisposition::Exhausted))
            .await
            .unwrap();
        append_record(dir.path(), &record(new, "train", 1, RunDisposition::Retrying))
            .await
            .unwrap();
        append_record(dir.path(), &record(new, "train", 2, RunDisposition::Succeeded))
            .await
            .unwrap();
        // Another stage's run is invisible here.
        append_record(dir.path(), &record(Uuid::new_v4(), "export", 1, RunDisposition::Succeeded))
            .await
            .unwrap();

        let last = last_run_for_stage(dir.path(), "train").await.unwrap();
        assert_eq!(last.len(), 2);
        assert!(last.iter().all(|r| r.run_id == new));
        assert_eq!(last.last().unwrap().disposition, RunDisposition::Succeeded);
    }

    #[tokio::test]
    async fn unreadable_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        append_record(dir.path(), &record(Uuid::new_v4(), "train", 1, RunDisposition::Succeeded))
            .await
            .unwrap();
        let path = log_path(dir.path());
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("not json at all\n");
        std::fs::write(&path, text).unwrap();
        append_record(dir.path(), &record(Uuid::new_v4(), "train", 1, RunDisposition::Succeeded))
            .await
            .unwrap();

        let records = read_records(dir.path()).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn tail_keeps_the_end_and_marks_the_cut() {
        let input: String = (0..100).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let out = tail(&input, 40);
        assert!(out.starts_with("[truncated 60 characters]"));
        assert!(out.ends_with(&input[60..]));

        assert_eq!(tail("short", 40), "short");
    }
}
