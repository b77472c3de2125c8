use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rollcall_upstream::{Attendee, EventDetail};
use serde_json::Value;
use tracing::info;

use crate::delivery::DocumentGenerator;
use crate::error::Result;

const DEFAULT_COLUMNS: [&str; 3] = ["last_name", "first_name", "email"];

/// Writes `<output_dir>/<event-id>.csv`.
///
/// Recognised layout keys: `title` (a single-cell first row) and `columns`
/// (attendee fields to emit, in order). Unknown column names are looked up
/// in the attendee's extra fields and left blank when absent.
pub struct RosterWriter {
    output_dir: PathBuf,
}

impl RosterWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Ids are escaped byte-wise (`_` followed by two hex digits) so that
    /// distinct ids never share a file.
    fn file_name(event_id: &str) -> String {
        let mut safe = String::with_capacity(event_id.len() + 4);
        for byte in event_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                safe.push(char::from(byte));
            } else {
                safe.push_str(&format!("_{byte:02X}"));
            }
        }
        format!("{safe}.csv")
    }
}

fn columns(layout: &Value) -> Vec<String> {
    match layout.get("columns").and_then(Value::as_array) {
        Some(cols) if !cols.is_empty() => cols
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
    }
}

fn field(attendee: &Attendee, column: &str) -> String {
    match column {
        "first_name" => attendee.first_name.clone().unwrap_or_default(),
        "last_name" => attendee.last_name.clone().unwrap_or_default(),
        "name" => attendee.display_name(),
        "email" => attendee.email.clone().unwrap_or_default(),
        "id" => attendee.id.clone().unwrap_or_default(),
        other => match attendee.extra.get(other) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(v) => v.to_string(),
        },
    }
}

fn escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn row<I, S>(cells: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = cells
        .into_iter()
        .map(|c| escape(c.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

/// Render the roster as CSV text.
pub fn render_roster(attendees: &[Attendee], layout: &Value) -> String {
    let columns = columns(layout);
    let mut out = String::new();
    if let Some(title) = layout.get("title").and_then(Value::as_str) {
        out.push_str(&row([title]));
    }
    out.push_str(&row(&columns));
    for attendee in attendees {
        out.push_str(&row(columns.iter().map(|c| field(attendee, c))));
    }
    out
}

#[async_trait]
impl DocumentGenerator for RosterWriter {
    async fn generate(
        &self,
        event: &EventDetail,
        attendees: &[Attendee],
        layout: &Value,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(Self::file_name(&event.id));
        tokio::fs::write(&path, render_roster(attendees, layout)).await?;
        info!(event_id = %event.id, path = %path.display(), rows = attendees.len(), "roster written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attendee(first: &str, last: &str, email: &str) -> Attendee {
        Attendee {
            first_name: Some(first.into()),
            last_name: Some(last.into()),
            email: Some(email.into()),
            ..Attendee::default()
        }
    }

    fn detail(id: &str) -> EventDetail {
        serde_json::from_value(json!({
            "id": id,
            "name": "Open house",
            "startDate": "2026-05-04T18:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn default_columns_with_escaping() {
        let csv = render_roster(
            &[attendee("Ada", "Lovelace, Countess", "ada@example.org")],
            &Value::Null,
        );
        assert_eq!(
            csv,
            "last_name,first_name,email\n\"Lovelace, Countess\",Ada,ada@example.org\n"
        );
    }

    #[test]
    fn layout_title_and_custom_columns() {
        let mut a = attendee("Grace", "Hopper", "g@example.org");
        a.extra.insert("ticket".into(), json!("VIP"));
        let layout = json!({ "title": "Open house", "columns": ["name", "ticket", "seat"] });
        let csv = render_roster(&[a], &layout);
        assert_eq!(csv, "Open house\nname,ticket,seat\nGrace Hopper,VIP,\n");
    }

    #[tokio::test]
    async fn writes_file_named_after_event() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RosterWriter::new(dir.path().join("rosters"));
        let path = writer
            .generate(&detail("evt/7"), &[attendee("A", "B", "c@d")], &Value::Null)
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "evt_2F7.csv");
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("last_name,first_name,email\n"));
    }

    #[tokio::test]
    async fn distinct_ids_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RosterWriter::new(dir.path());
        let mut paths = Vec::new();
        for id in ["a/b", "a_b", "a b", "ab"] {
            let path = writer
                .generate(&detail(id), &[attendee("A", "B", "c@d")], &Value::Null)
                .await
                .unwrap();
            paths.push(path);
        }
        assert_eq!(RosterWriter::file_name("a_b"), "a_5Fb.csv");
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 4);
    }
}
