//! Pure workflow analysis over recorded events and tool statistics.
//!
//! Consumes the event store's output and produces a compact narrative of
//! what an agent actually did: dominant workflow shape, hottest tools and
//! files, error summary, and domain tags. No I/O.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::domain::event::{EventKind, EventLevel, StoredEvent, ToolStat};

/// Minimum tool calls before a workflow label is assigned.
const WORKFLOW_MIN_CALLS: usize = 10;

/// Minimum edits for a file to count as hot.
const HOT_FILE_MIN_EDITS: usize = 3;

/// Hot files reported, at most.
const HOT_FILE_CAP: usize = 3;

/// Tools reported in the profile, at most.
const TOOL_PROFILE_CAP: usize = 5;

/// Fixed path-prefix to domain-tag table.
const DOMAIN_TAGS: [(&str, &str); 7] = [
    ("src/", "code"),
    ("tests/", "testing"),
    ("docs/", "documentation"),
    (".github/", "ci"),
    ("ci/", "ci"),
    ("migrations/", "database"),
    ("config/", "config"),
];

/// Dominant workflow shape over one event window.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkflowKind {
    ReadHeavy,
    WriteHeavy,
    BashHeavy,
    Balanced,
}

impl WorkflowKind {
    fn label(self) -> &'static str {
        match self {
            WorkflowKind::ReadHeavy => "read-heavy",
            WorkflowKind::WriteHeavy => "write-heavy",
            WorkflowKind::BashHeavy => "bash-heavy",
            WorkflowKind::Balanced => "balanced",
        }
    }
}

/// Edit pressure on one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileActivity {
    /// File path as recorded in filtered tool args.
    pub path: String,
    /// Number of `Write`/`Edit` invocations touching the path.
    pub edits: usize,
}

/// Result of analyzing one agent's event window.
#[derive(Clone, Debug, Default)]
pub struct InsightAnalysis {
    /// Human-readable findings, one per line.
    pub insights: Vec<String>,
    /// Top tools by call count with duration aggregates.
    pub tool_profile: Vec<ToolStat>,
    /// Hot files, most-edited first.
    pub file_profile: Vec<FileActivity>,
}

/// Analyzes events and tool statistics into an [`InsightAnalysis`].
pub fn analyze(events: &[StoredEvent], tool_stats: &[ToolStat]) -> InsightAnalysis {
    let mut insights = Vec::new();

    if let Some(workflow) = classify_workflow(events) {
        insights.push(format!("workflow: {}", workflow.label()));
    }

    let mut tool_profile: Vec<ToolStat> = tool_stats.to_vec();
    tool_profile.sort_by(|a, b| b.count.cmp(&a.count).then(a.tool_name.cmp(&b.tool_name)));
    tool_profile.truncate(TOOL_PROFILE_CAP);
    for stat in &tool_profile {
        insights.push(format!(
            "tool {}: {} calls, {:.0} ms mean",
            stat.tool_name, stat.count, stat.avg_duration_ms
        ));
    }

    let file_profile = hot_files(events);
    for activity in &file_profile {
        insights.push(format!("hot file {} ({} edits)", activity.path, activity.edits));
    }

    if let Some(summary) = error_summary(events) {
        insights.push(summary);
    }

    let tags = domain_tags(events);
    if !tags.is_empty() {
        insights.push(format!(
            "domains: {}",
            tags.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    InsightAnalysis {
        insights,
        tool_profile,
        file_profile,
    }
}

/// Labels the dominant workflow once enough tool calls are observed.
pub fn classify_workflow(events: &[StoredEvent]) -> Option<WorkflowKind> {
    let tool_calls: Vec<&str> = events
        .iter()
        .filter(|event| event.kind == EventKind::ToolStart)
        .filter_map(|event| event.tool_name.as_deref())
        .collect();
    if tool_calls.len() < WORKFLOW_MIN_CALLS {
        return None;
    }

    let mut reads = 0usize;
    let mut writes = 0usize;
    let mut bash = 0usize;
    for tool in &tool_calls {
        match *tool {
            "Read" | "Glob" | "Grep" => reads += 1,
            "Write" | "Edit" => writes += 1,
            "Bash" => bash += 1,
            _ => {}
        }
    }

    let total = tool_calls.len();
    let dominant = reads.max(writes).max(bash);
    if dominant * 2 < total {
        return Some(WorkflowKind::Balanced);
    }

    if dominant == reads {
        Some(WorkflowKind::ReadHeavy)
    } else if dominant == writes {
        Some(WorkflowKind::WriteHeavy)
    } else {
        Some(WorkflowKind::BashHeavy)
    }
}

fn hot_files(events: &[StoredEvent]) -> Vec<FileActivity> {
    let mut edits: BTreeMap<String, usize> = BTreeMap::new();
    for path in edited_paths(events) {
        *edits.entry(path).or_insert(0) += 1;
    }

    let mut hot: Vec<FileActivity> = edits
        .into_iter()
        .filter(|(_, count)| *count >= HOT_FILE_MIN_EDITS)
        .map(|(path, edits)| FileActivity { path, edits })
        .collect();
    hot.sort_by(|a, b| b.edits.cmp(&a.edits).then(a.path.cmp(&b.path)));
    hot.truncate(HOT_FILE_CAP);

    hot
}

fn error_summary(events: &[StoredEvent]) -> Option<String> {
    let errors: Vec<&StoredEvent> = events
        .iter()
        .filter(|event| event.level == EventLevel::Error)
        .collect();
    if errors.is_empty() {
        return None;
    }

    let tools: BTreeSet<&str> = errors
        .iter()
        .filter_map(|event| event.tool_name.as_deref())
        .collect();
    if tools.is_empty() {
        return Some(format!("{} error(s) recorded", errors.len()));
    }

    Some(format!(
        "{} error(s) involving: {}",
        errors.len(),
        tools.into_iter().collect::<Vec<_>>().join(", ")
    ))
}

fn domain_tags(events: &[StoredEvent]) -> BTreeSet<&'static str> {
    let mut tags = BTreeSet::new();
    for path in touched_paths(events) {
        for (prefix, tag) in DOMAIN_TAGS {
            if path.starts_with(prefix) {
                tags.insert(tag);
            }
        }
        if path.ends_with(".toml") || path.ends_with(".yaml") || path.ends_with(".yml") {
            tags.insert("config");
        }
    }

    tags
}

fn edited_paths(events: &[StoredEvent]) -> impl Iterator<Item = String> + '_ {
    events
        .iter()
        .filter(|event| event.kind == EventKind::ToolStart)
        .filter(|event| {
            matches!(event.tool_name.as_deref(), Some("Write") | Some("Edit"))
        })
        .filter_map(|event| arg_file_path(event.tool_args.as_deref()?))
}

fn touched_paths(events: &[StoredEvent]) -> impl Iterator<Item = String> + '_ {
    events
        .iter()
        .filter(|event| event.kind == EventKind::ToolStart)
        .filter_map(|event| arg_file_path(event.tool_args.as_deref()?))
}

fn arg_file_path(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let path = value.get("args")?.get("file_path")?.as_str()?;
    if path.is_empty() {
        return None;
    }

    Some(path.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::app::filter::filter_tool_args;

    fn tool_event(tool: &str, file_path: Option<&str>) -> StoredEvent {
        let mut event = StoredEvent::tool("builder-1", EventKind::ToolStart, tool);
        let raw = file_path.map_or_else(|| json!({}), |path| json!({ "file_path": path }));
        event.tool_args = Some(filter_tool_args(tool, &raw).to_json_string());

        event
    }

    #[test]
    fn test_workflow_requires_ten_tool_calls() {
        // Arrange
        let events: Vec<StoredEvent> = (0..9).map(|_| tool_event("Read", None)).collect();

        // Act
        let workflow = classify_workflow(&events);

        // Assert
        assert!(workflow.is_none());
    }

    #[test]
    fn test_workflow_read_heavy() {
        // Arrange — 8 reads, 2 writes
        let mut events: Vec<StoredEvent> = (0..8).map(|_| tool_event("Read", None)).collect();
        events.extend((0..2).map(|_| tool_event("Edit", Some("src/a.rs"))));

        // Act
        let workflow = classify_workflow(&events);

        // Assert
        assert_eq!(workflow, Some(WorkflowKind::ReadHeavy));
    }

    #[test]
    fn test_workflow_balanced_when_no_kind_dominates() {
        // Arrange — 4 reads, 4 writes, 4 bash
        let mut events: Vec<StoredEvent> = (0..4).map(|_| tool_event("Read", None)).collect();
        events.extend((0..4).map(|_| tool_event("Write", Some("src/a.rs"))));
        events.extend((0..4).map(|_| tool_event("Bash", None)));

        // Act
        let workflow = classify_workflow(&events);

        // Assert
        assert_eq!(workflow, Some(WorkflowKind::Balanced));
    }

    #[test]
    fn test_hot_files_require_three_edits_and_cap_at_three() {
        // Arrange — a.rs edited 4 times, b.rs 3, c.rs 3, d.rs 3, e.rs twice
        let mut events = Vec::new();
        for (path, edits) in [
            ("src/a.rs", 4),
            ("src/b.rs", 3),
            ("src/c.rs", 3),
            ("src/d.rs", 3),
            ("src/e.rs", 2),
        ] {
            for _ in 0..edits {
                events.push(tool_event("Edit", Some(path)));
            }
        }

        // Act
        let analysis = analyze(&events, &[]);

        // Assert
        assert_eq!(analysis.file_profile.len(), HOT_FILE_CAP);
        assert_eq!(analysis.file_profile[0].path, "src/a.rs");
        assert_eq!(analysis.file_profile[0].edits, 4);
        assert!(
            analysis
                .file_profile
                .iter()
                .all(|activity| activity.path != "src/e.rs")
        );
    }

    #[test]
    fn test_tool_profile_is_top_five_by_count() {
        // Arrange
        let stats: Vec<ToolStat> = (0..7)
            .map(|index| ToolStat {
                tool_name: format!("Tool{index}"),
                count: i64::from(index),
                avg_duration_ms: 10.0,
                max_duration_ms: 20,
            })
            .collect();

        // Act
        let analysis = analyze(&[], &stats);

        // Assert
        assert_eq!(analysis.tool_profile.len(), TOOL_PROFILE_CAP);
        assert_eq!(analysis.tool_profile[0].tool_name, "Tool6");
    }

    #[test]
    fn test_error_summary_names_involved_tools() {
        // Arrange
        let mut bash_error = StoredEvent::tool("builder-1", EventKind::Error, "Bash");
        bash_error.level = EventLevel::Error;
        let mut plain_error = StoredEvent::new("builder-1", EventKind::Error);
        plain_error.level = EventLevel::Error;

        // Act
        let analysis = analyze(&[bash_error, plain_error], &[]);

        // Assert
        assert!(
            analysis
                .insights
                .iter()
                .any(|insight| insight.contains("2 error(s)") && insight.contains("Bash"))
        );
    }

    #[test]
    fn test_domain_tags_follow_path_prefixes() {
        // Arrange
        let events = vec![
            tool_event("Edit", Some("src/lib.rs")),
            tool_event("Edit", Some("tests/pipeline.rs")),
            tool_event("Write", Some("Cargo.toml")),
        ];

        // Act
        let analysis = analyze(&events, &[]);

        // Assert
        let domains = analysis
            .insights
            .iter()
            .find(|insight| insight.starts_with("domains:"))
            .expect("expected domains insight");
        assert!(domains.contains("code"));
        assert!(domains.contains("testing"));
        assert!(domains.contains("config"));
    }
}
