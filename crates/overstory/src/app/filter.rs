//! Deterministic tool-argument filter for event recording.
//!
//! Raw tool payloads carry bulk content (file bodies, diffs, fetched pages)
//! that must not land in the event store. The filter reduces each payload to
//! a compact `{ args, summary }` form that keeps identifying fields only.
//! Dispatch is a closed match over known tool names; unknown tools pass
//! through with empty args and a summary built from the key list.

use serde_json::{Map, Value, json};

/// Longest command text preserved for `Bash` invocations.
const MAX_COMMAND_LEN: usize = 200;

/// Compact event-safe form of one tool invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct FilteredToolArgs {
    /// Identifying fields only, bulk content removed.
    pub args: Value,
    /// One-line human summary of the invocation.
    pub summary: String,
}

impl FilteredToolArgs {
    /// Serializes the filtered form for the `tool_args` column.
    pub fn to_json_string(&self) -> String {
        json!({ "args": self.args, "summary": self.summary }).to_string()
    }
}

/// Reduces one tool payload to its event-safe form.
pub fn filter_tool_args(tool_name: &str, raw: &Value) -> FilteredToolArgs {
    match tool_name {
        "Bash" => {
            let command = truncate(str_field(raw, "command"), MAX_COMMAND_LEN);
            let summary = command.lines().next().unwrap_or("").to_string();

            FilteredToolArgs {
                args: json!({ "command": command }),
                summary,
            }
        }
        "Read" => {
            let file_path = str_field(raw, "file_path");

            FilteredToolArgs {
                args: json!({ "file_path": file_path }),
                summary: format!("read {file_path}"),
            }
        }
        "Write" => {
            let file_path = str_field(raw, "file_path");

            FilteredToolArgs {
                args: json!({ "file_path": file_path }),
                summary: format!("write {file_path}"),
            }
        }
        "Edit" => {
            let file_path = str_field(raw, "file_path");

            FilteredToolArgs {
                args: json!({ "file_path": file_path }),
                summary: format!("edit {file_path}"),
            }
        }
        "Glob" => {
            let pattern = str_field(raw, "pattern");
            let path = str_field(raw, "path");

            FilteredToolArgs {
                args: json!({ "pattern": pattern, "path": path }),
                summary: format!("glob {pattern}"),
            }
        }
        "Grep" => {
            let pattern = str_field(raw, "pattern");
            let path = str_field(raw, "path");
            let glob = str_field(raw, "glob");

            FilteredToolArgs {
                args: json!({ "pattern": pattern, "path": path, "glob": glob }),
                summary: format!("grep {pattern}"),
            }
        }
        "WebFetch" => {
            let url = str_field(raw, "url");

            FilteredToolArgs {
                args: json!({ "url": url }),
                summary: format!("fetch {url}"),
            }
        }
        "Task" => {
            let description = str_field(raw, "description");

            FilteredToolArgs {
                args: json!({ "description": description }),
                summary: format!("task {description}"),
            }
        }
        _ => {
            let keys = key_list(raw);
            let summary = if keys.is_empty() {
                format!("{tool_name} invocation")
            } else {
                format!("{tool_name} with keys: {}", keys.join(", "))
            };

            FilteredToolArgs {
                args: Value::Object(Map::new()),
                summary,
            }
        }
    }
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn key_list(raw: &Value) -> Vec<String> {
    match raw {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn truncate(text: String, max_len: usize) -> String {
    if text.len() <= max_len {
        return text;
    }

    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}…", &text[..end])
}
