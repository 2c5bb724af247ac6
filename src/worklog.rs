use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Append a worklog entry for a dispatched or completed workflow.
///
/// Entries accumulate in `{worklog_dir}/YYYY-MM.md`, one file per month.
/// Creates the file and parent directories if missing.
///
/// Format:
/// ```text
/// ## {datetime} — {repo}#{ticket_id} ({title})
///
/// - **Stage:** {stage}
/// - **Outcome:** {outcome}
/// - **Summary:** {summary}
///
/// ---
/// ```
pub fn write_entry(
    worklog_dir: &Path,
    item_ref: &str,
    title: &str,
    stage: &str,
    outcome: &str,
    summary: &str,
) -> Result<(), String> {
    let now = chrono::Utc::now();
    let filename = now.format("%Y-%m").to_string();
    let worklog_path = worklog_dir.join(format!("{}.md", filename));

    fs::create_dir_all(worklog_dir).map_err(|e| {
        format!(
            "Failed to create worklog directory {}: {}",
            worklog_dir.display(),
            e
        )
    })?;

    let datetime = now.to_rfc3339();
    let entry = format!(
        "## {} — {} ({})\n\n- **Stage:** {}\n- **Outcome:** {}\n- **Summary:** {}\n\n---\n\n",
        datetime, item_ref, title, stage, outcome, summary,
    );

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&worklog_path)
        .map_err(|e| format!("Failed to open worklog at {}: {}", worklog_path.display(), e))?;

    file.write_all(entry.as_bytes())
        .map_err(|e| format!("Failed to write worklog at {}: {}", worklog_path.display(), e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_appends_to_monthly_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let worklog_dir = dir.path().join("worklog");

        write_entry(
            &worklog_dir,
            "github.com/acme/widgets#42",
            "Add widget cache",
            "research",
            "Dispatched",
            "",
        )
        .unwrap();
        write_entry(
            &worklog_dir,
            "github.com/acme/widgets#42",
            "Add widget cache",
            "research",
            "Completed",
            "Findings written",
        )
        .unwrap();

        let month_file = worklog_dir.join(format!("{}.md", chrono::Utc::now().format("%Y-%m")));
        let contents = fs::read_to_string(month_file).unwrap();
        assert_eq!(contents.matches("## ").count(), 2);
        assert!(contents.contains("github.com/acme/widgets#42 (Add widget cache)"));
        assert!(contents.contains("- **Stage:** research"));
        assert!(contents.contains("- **Outcome:** Dispatched"));
        assert!(contents.contains("- **Outcome:** Completed"));
        assert!(contents.contains("- **Summary:** Findings written"));
    }

    #[test]
    fn entries_keep_write_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let worklog_dir = dir.path().join("worklog");

        write_entry(&worklog_dir, "a#1", "First", "research", "Dispatched", "").unwrap();
        write_entry(&worklog_dir, "a#2", "Second", "plan", "Dispatched", "").unwrap();

        let month_file = worklog_dir.join(format!("{}.md", chrono::Utc::now().format("%Y-%m")));
        let contents = fs::read_to_string(month_file).unwrap();
        let first = contents.find("a#1 (First)").unwrap();
        let second = contents.find("a#2 (Second)").unwrap();
        assert!(first < second, "Entries must append chronologically");
    }

    #[test]
    fn creates_nested_worklog_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let worklog_dir = dir.path().join(".drover").join("worklog");

        write_entry(&worklog_dir, "a#1", "First", "research", "Dispatched", "").unwrap();

        assert!(worklog_dir.is_dir());
    }
}
