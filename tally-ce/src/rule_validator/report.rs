//! Report output for the rule validator

use super::RuleReport;
use std::path::{Path, PathBuf};
use tally_common::{Error, Result};

pub const JSON_REPORT_FILE: &str = "rule_validation.json";
pub const TEXT_REPORT_FILE: &str = "rule_validation.txt";

/// Write the JSON report and text summary into `dir`
///
/// # Returns
/// Paths of the JSON and text files
pub fn write_reports(report: &RuleReport, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(report)
        .map_err(|e| Error::Internal(format!("Failed to serialize rule report: {}", e)))?;
    let json_path = dir.join(JSON_REPORT_FILE);
    std::fs::write(&json_path, json)?;

    let text_path = dir.join(TEXT_REPORT_FILE);
    std::fs::write(&text_path, report.summary())?;

    tracing::info!(
        json = %json_path.display(),
        text = %text_path.display(),
        "Rule validation reports written"
    );
    Ok((json_path, text_path))
}
