//! Parsing of model output into an [`AnalysisResult`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::{AnalysisFailure, AnalysisResult, DerivedEntry, EntryKind, Importance};

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Slice from the first `{` to the last `}`; models like to wrap JSON in prose.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Parse an entry timestamp. Naive values are taken as UTC.
pub fn parse_entry_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn parse_score(value: Option<&Value>) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(5.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(5.0),
        _ => 5.0,
    };
    raw.round().clamp(1.0, 10.0) as u8
}

fn parse_entry(value: &Value) -> Option<DerivedEntry> {
    let Some(start_time) = parse_entry_time(str_field(value, "start_time")) else {
        debug!(entry = %value, "dropping entry without a parseable start time");
        return None;
    };

    let importance = str_field(value, "importance_level")
        .parse::<Importance>()
        .unwrap_or_default();
    let kind = str_field(value, "duration_type")
        .parse::<EntryKind>()
        .unwrap_or_default();
    let title = match str_field(value, "title").trim() {
        "" => "Untitled event".to_string(),
        t => t.to_string(),
    };

    Some(DerivedEntry {
        title,
        description: str_field(value, "description").to_string(),
        start_time,
        end_time: parse_entry_time(str_field(value, "end_time")),
        location: str_field(value, "location").to_string(),
        importance,
        kind,
    })
}

/// Parse model output text.
pub fn parse_analysis(
    content: &str,
    model_tag: &str,
    produced_at: DateTime<Utc>,
) -> Result<AnalysisResult, AnalysisFailure> {
    let json = extract_json_object(content)
        .ok_or_else(|| AnalysisFailure::Malformed("no JSON object in response".to_string()))?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| AnalysisFailure::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(AnalysisFailure::Malformed("response is not an object".to_string()));
    }

    let derived_entries = value
        .get("events")
        .and_then(Value::as_array)
        .map(|events| events.iter().filter_map(parse_entry).collect())
        .unwrap_or_default();

    Ok(AnalysisResult {
        summary: str_field(&value, "summary").to_string(),
        importance_score: parse_score(value.get("importance_score")),
        importance_reason: str_field(&value, "importance_reason").to_string(),
        derived_entries,
        model_tag: model_tag.to_string(),
        produced_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_wrapped_response() {
        let content = r#"Sure, here you go:
```json
{
  "summary": "Exam next week",
  "importance_score": 14,
  "importance_reason": "graded",
  "events": [
    {"title": "Final exam", "start_time": "2026-11-02 14:00:00", "importance_level": "important", "duration_type": "point"},
    {"title": "No time", "start_time": ""},
    {"title": "Weird level", "start_time": "2026-11-03", "importance_level": "urgent"}
  ]
}
```"#;
        let result = parse_analysis(content, "m", Utc::now()).unwrap();
        assert_eq!(result.summary, "Exam next week");
        assert_eq!(result.importance_score, 10);
        assert_eq!(result.derived_entries.len(), 2);

        let exam = &result.derived_entries[0];
        assert_eq!(exam.importance, Importance::Important);
        assert_eq!(
            exam.start_time,
            Utc.with_ymd_and_hms(2026, 11, 2, 14, 0, 0).unwrap()
        );
        assert_eq!(result.derived_entries[1].importance, Importance::Normal);
    }

    #[test]
    fn test_score_defaults_and_clamps() {
        let low = parse_analysis(r#"{"summary":"x","importance_score":"0"}"#, "m", Utc::now())
            .unwrap();
        assert_eq!(low.importance_score, 1);
        let missing = parse_analysis(r#"{"summary":"x"}"#, "m", Utc::now()).unwrap();
        assert_eq!(missing.importance_score, 5);
        assert!(missing.derived_entries.is_empty());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_analysis("no json here", "m", Utc::now()),
            Err(AnalysisFailure::Malformed(_))
        ));
        assert!(matches!(
            parse_analysis("{not json}", "m", Utc::now()),
            Err(AnalysisFailure::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_entry_time_formats() {
        assert!(parse_entry_time("2026-01-15T14:00:00+08:00").is_some());
        assert!(parse_entry_time("2026/01/15 14:00").is_some());
        assert!(parse_entry_time("tomorrow").is_none());
    }
}
