//! Google Sheets QA mirror: positional row schema and values-API client
//!
//! Each project has one tab with a fixed column layout:
//! A date, B drop number, C..P the 14 step checkboxes, Q completed count,
//! R outstanding count, S user, T 1MAP-loaded, U comment, V incomplete,
//! W resubmitted, X completed.
//!
//! Rows are parsed defensively: short rows are padded rather than rejected,
//! and anything that does not carry a drop number in column B (headers,
//! blanks) is silently skipped. Human reviewers own the step checkboxes and
//! the incomplete flag; the monitors only ever write the V/W/X flag trio and
//! append new drop rows.

use crate::config::SheetsConfig;
use crate::qa::{ChecklistSteps, ReviewFlags, STEP_COUNT};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Number of header rows at the top of every tab.
const HEADER_ROWS: usize = 2;

/// The tracked cell range of one tab.
const TAB_RANGE: &str = "A:X";

// 0-based column indices of the fixed layout.
const COL_DATE: usize = 0;
const COL_DROP: usize = 1;
const COL_FIRST_STEP: usize = 2;
const COL_USER: usize = 18;
const COL_COMMENT: usize = 20;
const COL_INCOMPLETE: usize = 21;
const COL_RESUBMITTED: usize = 22;
const COL_COMPLETED: usize = 23;

/// One parsed QA row from a project tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    /// 1-based row number as the Sheets API addresses it.
    pub row_number: usize,
    pub drop_number: String,
    pub date: String,
    pub steps: ChecklistSteps,
    pub user: String,
    pub comment: String,
    pub flags: ReviewFlags,
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

fn cell_bool(row: &[String], index: usize) -> bool {
    cell(row, index).trim().eq_ignore_ascii_case("true")
}

/// Parse one raw row. Returns `None` for header rows, blank rows, and rows
/// whose column B is not a drop number; never fails on short rows.
///
/// Flags are normalized through [`ReviewFlags::derive`]: completion (all
/// steps ticked, or the reviewer's column-X verdict) always clears the
/// incomplete flag, so a parsed row never carries both.
pub fn parse_row(row: &[String], row_number: usize) -> Option<SheetRow> {
    if row_number <= HEADER_ROWS {
        return None;
    }
    let drop_number = cell(row, COL_DROP).trim().to_string();
    if !drop_number.to_uppercase().starts_with("DR") {
        return None;
    }

    let mut steps = ChecklistSteps::all_false();
    for i in 0..STEP_COUNT {
        steps.0[i] = cell_bool(row, COL_FIRST_STEP + i);
    }

    let mut flags = ReviewFlags::derive(&steps, cell_bool(row, COL_INCOMPLETE));
    flags.resubmitted = cell_bool(row, COL_RESUBMITTED);
    if cell_bool(row, COL_COMPLETED) {
        flags.completed = true;
        flags.incomplete = false;
    }

    Some(SheetRow {
        row_number,
        drop_number,
        date: cell(row, COL_DATE).to_string(),
        steps,
        user: cell(row, COL_USER).to_string(),
        comment: cell(row, COL_COMMENT).to_string(),
        flags,
    })
}

/// Parse a whole tab into QA rows, skipping everything non-parseable.
pub fn parse_tab(values: &[Vec<String>]) -> Vec<SheetRow> {
    values
        .iter()
        .enumerate()
        .filter_map(|(index, row)| parse_row(row, index + 1))
        .collect()
}

/// 1-based row number of the row holding `drop_number` in column B.
pub fn find_row_by_drop(values: &[Vec<String>], drop_number: &str) -> Option<usize> {
    values
        .iter()
        .position(|row| cell(row, COL_DROP).trim().eq_ignore_ascii_case(drop_number))
        .map(|index| index + 1)
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Thin client over the Sheets values API.
pub struct SheetClient {
    http: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    api_token: String,
}

impl SheetClient {
    pub fn new(config: &SheetsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            api_token: config.api_token.clone(),
        })
    }

    fn values_url(&self, suffix: &str) -> String {
        // Tab names may contain spaces; the values API accepts %20.
        format!(
            "{}/{}/values/{}",
            self.base_url,
            self.spreadsheet_id,
            suffix.replace(' ', "%20")
        )
    }

    /// Read the full tracked range of one tab.
    pub async fn read_tab(&self, tab: &str) -> Result<Vec<Vec<String>>> {
        let url = self.values_url(&format!("{tab}!{TAB_RANGE}"));
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Sheets(format!("read {tab} failed: {status}: {body}")));
        }

        let range: ValueRange = response.json().await?;
        debug!("Read {} rows from tab {}", range.values.len(), tab);
        Ok(range.values)
    }

    /// Reset the flag trio for a resubmitted drop:
    /// V (incomplete) = FALSE, W (resubmitted) = TRUE, X (completed) = FALSE.
    /// Column W is what notifies the human QA reviewer.
    pub async fn mark_resubmitted(&self, tab: &str, row_number: usize) -> Result<()> {
        let data = json!([
            { "range": format!("{tab}!V{row_number}"), "values": [["FALSE"]] },
            { "range": format!("{tab}!W{row_number}"), "values": [["TRUE"]] },
            { "range": format!("{tab}!X{row_number}"), "values": [["FALSE"]] },
        ]);
        self.batch_update(data).await?;
        info!("Sheet {tab} row {row_number}: flags reset for resubmission");
        Ok(())
    }

    /// Append a freshly sighted drop as a new row (date, drop number, all
    /// steps unchecked, contractor in the user column). Step checkboxes
    /// belong to the reviewer, so they are written once here and never
    /// touched again by the monitors.
    pub async fn append_drop_row(&self, tab: &str, date: &str, drop_number: &str, user: &str) -> Result<()> {
        let mut row: Vec<String> = vec![date.to_string(), drop_number.to_string()];
        row.extend(std::iter::repeat("FALSE".to_string()).take(STEP_COUNT));
        // Q, R: photo counters
        row.push("0".to_string());
        row.push(STEP_COUNT.to_string());
        row.push(user.to_string());

        let url = format!(
            "{}:append?valueInputOption=USER_ENTERED",
            self.values_url(&format!("{tab}!{TAB_RANGE}"))
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&json!({ "values": [row] }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Sheets(format!("append to {tab} failed: {status}")));
        }
        info!("Appended {} to sheet tab {}", drop_number, tab);
        Ok(())
    }

    async fn batch_update(&self, data: serde_json::Value) -> Result<()> {
        let url = format!(
            "{}/{}/values:batchUpdate",
            self.base_url, self.spreadsheet_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&json!({
                "valueInputOption": "USER_ENTERED",
                "data": data,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Sheets(format!("batch update failed: {status}: {body}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn review_row(
        drop: &str,
        steps_done: usize,
        incomplete: &str,
        resubmitted: &str,
        completed: &str,
    ) -> Vec<String> {
        let mut cells = vec!["2025-10-02".to_string(), drop.to_string()];
        for i in 0..STEP_COUNT {
            cells.push(if i < steps_done { "TRUE" } else { "FALSE" }.to_string());
        }
        cells.extend([
            steps_done.to_string(),                  // Q completed count
            (STEP_COUNT - steps_done).to_string(),   // R outstanding
            "Morne".to_string(),                     // S user
            "yes".to_string(),                       // T 1MAP
            "looks good".to_string(),                // U comment
            incomplete.to_string(),                  // V
            resubmitted.to_string(),                 // W
            completed.to_string(),                   // X
        ]);
        cells
    }

    #[test]
    fn header_and_blank_rows_are_skipped() {
        assert!(parse_row(&row(&["Date", "Drop Number"]), 1).is_none());
        assert!(parse_row(&row(&["", ""]), 3).is_none());
        assert!(parse_row(&row(&["2025-10-02", "not-a-drop"]), 4).is_none());
    }

    #[test]
    fn short_rows_are_padded_not_rejected() {
        let parsed = parse_row(&row(&["2025-10-02", "DR1748808", "TRUE"]), 5).unwrap();
        assert_eq!(parsed.drop_number, "DR1748808");
        assert!(parsed.steps.0[0]);
        assert!(!parsed.steps.0[1]);
        assert!(!parsed.flags.incomplete);
        assert_eq!(parsed.user, "");
    }

    #[test]
    fn incomplete_row_parses_flags_and_steps() {
        let parsed = parse_row(&review_row("DR1748808", 12, "TRUE", "FALSE", "FALSE"), 7).unwrap();
        assert_eq!(parsed.row_number, 7);
        assert!(!parsed.steps.all_complete());
        assert!(parsed.flags.incomplete);
        assert!(!parsed.flags.completed);
        assert!(!parsed.flags.resubmitted);
        assert_eq!(parsed.user, "Morne");
        assert_eq!(parsed.comment, "looks good");
    }

    #[test]
    fn all_steps_ticked_wins_over_incomplete_flag() {
        let parsed = parse_row(&review_row("DR1748808", STEP_COUNT, "TRUE", "FALSE", "FALSE"), 7)
            .unwrap();
        assert!(parsed.flags.completed);
        assert!(!parsed.flags.incomplete);
    }

    #[test]
    fn reviewer_completed_verdict_wins_over_incomplete_flag() {
        let parsed = parse_row(&review_row("DR1", 10, "TRUE", "FALSE", "TRUE"), 3).unwrap();
        assert!(parsed.flags.completed);
        assert!(!parsed.flags.incomplete);
    }

    #[test]
    fn boolean_cells_are_case_insensitive() {
        let parsed = parse_row(&review_row("DR1", 10, "true", "True", "false"), 3).unwrap();
        assert!(parsed.flags.incomplete);
        assert!(parsed.flags.resubmitted);
        assert!(!parsed.flags.completed);
    }

    #[test]
    fn parse_tab_keeps_only_drop_rows() {
        let values = vec![
            row(&["QA Photo Reviews"]),
            row(&["Date", "Drop Number"]),
            review_row("DR0000001", 14, "FALSE", "FALSE", "FALSE"),
            row(&[""]),
            review_row("DR0000002", 9, "TRUE", "FALSE", "FALSE"),
        ];
        let rows = parse_tab(&values);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].drop_number, "DR0000001");
        assert_eq!(rows[0].row_number, 3);
        assert_eq!(rows[1].row_number, 5);
    }

    #[test]
    fn find_row_is_case_insensitive_and_one_based() {
        let values = vec![
            row(&["Date", "Drop Number"]),
            review_row("DR0000007", 14, "FALSE", "FALSE", "FALSE"),
        ];
        assert_eq!(find_row_by_drop(&values, "dr0000007"), Some(2));
        assert_eq!(find_row_by_drop(&values, "DR9999999"), None);
    }
}
