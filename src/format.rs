//! Output formatting for CLI queries: JSON or markdown.

use crate::types::{Board, BudgetCheck, Instance, Priority, Task, TaskStatus};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    #[value(alias = "md")]
    #[serde(alias = "md")]
    Markdown,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "markdown" | "md" => Some(OutputFormat::Markdown),
            _ => None,
        }
    }
}

/// Render `value` as pretty JSON or with the given markdown renderer.
pub fn render<T: Serialize>(
    value: &T,
    format: OutputFormat,
    markdown: impl FnOnce(&T) -> String,
) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Markdown => Ok(markdown(value)),
    }
}

/// Format a state name for display (capitalize, replace underscores with spaces).
fn format_state_name(state: &str) -> String {
    state
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_uppercase().chain(chars).collect(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_time(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Format a task in short form for lists.
fn format_task_short(task: &Task) -> String {
    let priority_marker = match task.priority {
        Priority::High => "!!! ",
        Priority::Medium | Priority::Low => "",
    };

    let claimant = task
        .claimed_by
        .as_ref()
        .map(|c| format!(" @{}", c))
        .unwrap_or_default();

    let reason = task
        .rejection_reason
        .as_ref()
        .map(|r| format!(" - _{}_", r))
        .unwrap_or_default();

    format!(
        "- {}`{}` {} ({}){}{}\n",
        priority_marker, task.id, task.title, task.assigned_to, claimant, reason,
    )
}

/// Format a board as markdown, one section per non-empty column.
pub fn format_board_markdown(board: &Board) -> String {
    let mut md = format!("# Board ({})\n\n", board.total());

    for status in TaskStatus::ALL {
        let tasks = board.column(*status);
        if tasks.is_empty() {
            continue;
        }
        md.push_str(&format!(
            "## {} ({})\n\n",
            format_state_name(status.as_str()),
            tasks.len()
        ));
        for task in tasks {
            md.push_str(&format_task_short(task));
        }
        md.push('\n');
    }

    md
}

/// Format stale instances as markdown.
pub fn format_instances_markdown(instances: &[Instance]) -> String {
    let mut md = format!("# Stale instances ({})\n\n", instances.len());

    for instance in instances {
        md.push_str(&format!("## {}\n", instance.instance_id));
        md.push_str(&format!("- **role**: {}\n", instance.role));
        md.push_str(&format!("- **status**: {}\n", instance.status));
        if let Some(ref task) = instance.current_task {
            md.push_str(&format!("- **task**: `{}`\n", task));
        }
        let heartbeat = instance
            .last_heartbeat
            .map(format_time)
            .unwrap_or_else(|| "never".to_string());
        md.push_str(&format!("- **last heartbeat**: {}\n", heartbeat));
        md.push('\n');
    }

    md
}

/// Format a budget admission check as markdown.
pub fn format_budget_markdown(check: &BudgetCheck) -> String {
    let mut md = String::from("# Budget\n\n");
    md.push_str(&format!(
        "- **allowed**: {}\n",
        if check.allowed { "yes" } else { "no" }
    ));

    match (check.scope, check.budget, check.spent, check.remaining) {
        (Some(scope), Some(budget), Some(spent), Some(remaining)) => {
            md.push_str(&format!("- **scope**: {}\n", scope));
            md.push_str(&format!("- **budget**: ${:.2}\n", budget));
            md.push_str(&format!("- **spent**: ${:.2}\n", spent));
            md.push_str(&format!("- **remaining**: ${:.2}\n", remaining));
        }
        _ => md.push_str("- no active budget applies\n"),
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BudgetScope, InstanceStatus};

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.into(),
            group_id: "GRP-001".into(),
            parent_id: None,
            title: format!("Task {}", id),
            description: None,
            task_type: "feature".into(),
            priority: Priority::Medium,
            assigned_to: "coder".into(),
            claimed_by: None,
            executed_by: None,
            status,
            created_by: "pm-1".into(),
            created_at: 0,
            started_at: None,
            completed_at: None,
            rejection_reason: None,
            output_ref: None,
            revision_of: None,
        }
    }

    #[test]
    fn format_names_parse_case_insensitively() {
        assert_eq!(OutputFormat::parse("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("md"), Some(OutputFormat::Markdown));
        assert_eq!(OutputFormat::parse("xml"), None);
    }

    #[test]
    fn board_skips_empty_columns() {
        let mut board = Board::default();
        board.push(task("CD-001", TaskStatus::InProgress));
        board.push(task("CD-002", TaskStatus::Blocked));

        let md = format_board_markdown(&board);
        assert!(md.starts_with("# Board (2)"));
        assert!(md.contains("## In Progress (1)"));
        assert!(md.contains("`CD-002` Task CD-002 (coder)"));
        assert!(!md.contains("## Completed"));
        // Columns follow lifecycle order.
        assert!(md.find("## Blocked").unwrap() < md.find("## In Progress").unwrap());
    }

    #[test]
    fn instance_without_heartbeat_says_never() {
        let instance = Instance {
            instance_id: "coder-1".into(),
            role: "coder".into(),
            status: InstanceStatus::Working,
            current_task: Some("CD-001".into()),
            started_at: 0,
            last_heartbeat: None,
        };
        let md = format_instances_markdown(&[instance]);
        assert!(md.contains("- **last heartbeat**: never"));
        assert!(md.contains("- **task**: `CD-001`"));
    }

    #[test]
    fn budget_check_renders_amounts() {
        let check = BudgetCheck {
            allowed: false,
            remaining: Some(0.0),
            budget: Some(10.0),
            spent: Some(12.5),
            scope: Some(BudgetScope::Group),
            budget_id: Some(3),
        };
        let md = format_budget_markdown(&check);
        assert!(md.contains("- **allowed**: no"));
        assert!(md.contains("- **spent**: $12.50"));
    }

    #[test]
    fn json_rendering_ignores_markdown_renderer() {
        let check = BudgetCheck {
            allowed: true,
            remaining: None,
            budget: None,
            spent: None,
            scope: None,
            budget_id: None,
        };
        let out = render(&check, OutputFormat::Json, |_| unreachable!()).unwrap();
        assert!(out.contains("\"allowed\": true"));
    }
}
