// src/transformer/mod.rs
//! Document Transformer (C4, §4.4): pure function from an entity snapshot
//! to `{text, metadata}`. Grounded on the teacher's text-composition habit
//! in `memory::features::document_processing` (sentence-oriented,
//! relation-aware summaries) but built fresh for the four task-manager
//! entity kinds named in §3.1/§3.2.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::entities::{EntityKind, EntitySnapshot, TaskStatus};

const MAX_LISTED_MEMBERS: usize = 5;

pub struct TransformedDocument {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
    pub relationships: BTreeMap<String, String>,
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|api[-_]?key|secret)\s*[:=]\s*\S+").unwrap()
});

/// §4.4 sanitisation: replace any token matching the secret pattern
/// followed by a value with `[REDACTED]`.
pub fn sanitize(text: &str) -> String {
    SECRET_PATTERN.replace_all(text, "$1: [REDACTED]").into_owned()
}

pub fn transform(snapshot: &EntitySnapshot, now: DateTime<Utc>) -> TransformedDocument {
    match snapshot {
        EntitySnapshot::User { user, team, tasks } => {
            let mut sentences = vec![format!("User {} ({}).", user.name, role_str(user.role))];

            if let Some(team) = team {
                sentences.push(format!("Member of team {}.", team.name));
            }

            let by_status = breakdown_by_status(tasks);
            if !tasks.is_empty() {
                sentences.push(format!(
                    "Assigned {} task(s): {} to do, {} in progress, {} done.",
                    tasks.len(),
                    by_status.todo,
                    by_status.in_progress,
                    by_status.done
                ));
            }

            let mut metadata = Map::new();
            metadata.insert("user_name".into(), json!(user.name));
            metadata.insert("user_email".into(), json!(user.email));
            metadata.insert("user_role".into(), json!(role_str(user.role)));
            metadata.insert(
                "team_name".into(),
                json!(team.as_ref().map(|t| t.name.clone())),
            );
            metadata.insert("tasks_count".into(), json!(tasks.len()));

            let mut relationships = BTreeMap::new();
            if let Some(team) = team {
                relationships.insert("team_id".into(), team.id.to_string());
            }

            TransformedDocument {
                entity_type: "user",
                entity_id: user.id.to_string(),
                text: sanitize(&sentences.join(" ")),
                metadata,
                relationships,
            }
        }

        EntitySnapshot::Team { team, owner, project, members } => {
            let mut sentences = vec![format!("Team {}.", team.name)];

            if let Some(owner) = owner {
                sentences.push(format!("Owned by {}.", owner.name));
            }
            if let Some(project) = project {
                sentences.push(format!("Part of project {}.", project.name));
            }
            sentences.push(member_listing_sentence("member", members.iter().map(|m| m.name.as_str())));

            let mut metadata = Map::new();
            metadata.insert("team_name".into(), json!(team.name));
            metadata.insert(
                "owner_name".into(),
                json!(owner.as_ref().map(|o| o.name.clone())),
            );
            metadata.insert(
                "project_name".into(),
                json!(project.as_ref().map(|p| p.name.clone())),
            );
            metadata.insert("members_count".into(), json!(members.len()));

            let mut relationships = BTreeMap::new();
            if let Some(project) = project {
                relationships.insert("project_id".into(), project.id.to_string());
            }

            TransformedDocument {
                entity_type: "team",
                entity_id: team.id.to_string(),
                text: sanitize(&sentences.join(" ")),
                metadata,
                relationships,
            }
        }

        EntitySnapshot::Project { project, teams, member_count } => {
            let mut sentences = vec![format!("Project {}.", project.name)];
            if let Some(desc) = &project.description {
                sentences.push(desc.clone());
            }
            sentences.push(member_listing_sentence("team", teams.iter().map(|t| t.name.as_str())));

            let mut metadata = Map::new();
            metadata.insert("project_name".into(), json!(project.name));
            metadata.insert("teams_count".into(), json!(teams.len()));
            metadata.insert("total_members".into(), json!(member_count));

            TransformedDocument {
                entity_type: "project",
                entity_id: project.id.to_string(),
                text: sanitize(&sentences.join(" ")),
                metadata,
                relationships: BTreeMap::new(),
            }
        }

        EntitySnapshot::Task { task, assignee, team, project } => {
            let mut sentences = vec![format!("Task '{}'.", task.title)];
            if let Some(desc) = &task.description {
                sentences.push(desc.clone());
            }
            sentences.push(format!("Status: {}.", task.status.human()));

            if let Some(assignee) = assignee {
                sentences.push(format!("Assigned to {}.", assignee.name));
            }
            if let Some(team) = team {
                sentences.push(format!("Team: {}.", team.name));
            }
            if let Some(project) = project {
                sentences.push(format!("Project: {}.", project.name));
            }

            let days_until_deadline = task.deadline.map(|d| days_until(d, now));
            if let Some(days) = days_until_deadline {
                sentences.push(deadline_sentence(days));
            }

            let is_overdue = days_until_deadline.map(|d| d < 0).unwrap_or(false);
            let is_urgent = days_until_deadline.map(|d| (0..=3).contains(&d)).unwrap_or(false);

            let mut metadata = Map::new();
            metadata.insert("task_status".into(), json!(task.status.as_str()));
            metadata.insert("is_overdue".into(), json!(is_overdue));
            metadata.insert("is_urgent".into(), json!(is_urgent));
            metadata.insert("days_until_deadline".into(), json!(days_until_deadline));
            metadata.insert(
                "assignee_name".into(),
                json!(assignee.as_ref().map(|a| a.name.clone())),
            );
            metadata.insert(
                "team_name".into(),
                json!(team.as_ref().map(|t| t.name.clone())),
            );
            metadata.insert(
                "project_name".into(),
                json!(project.as_ref().map(|p| p.name.clone())),
            );

            let mut relationships = BTreeMap::new();
            if let Some(team) = team {
                relationships.insert("team_id".into(), team.id.to_string());
            }
            if let Some(project) = project {
                relationships.insert("project_id".into(), project.id.to_string());
            }
            if let Some(assignee) = assignee {
                relationships.insert("assigned_to".into(), assignee.id.to_string());
            }

            TransformedDocument {
                entity_type: "task",
                entity_id: task.id.to_string(),
                text: sanitize(&sentences.join(" ")),
                metadata,
                relationships,
            }
        }
    }
}

pub fn entity_type_str(kind: EntityKind) -> &'static str {
    kind.as_str()
}

fn role_str(role: crate::entities::Role) -> &'static str {
    match role {
        crate::entities::Role::Admin => "admin",
        crate::entities::Role::Member => "member",
    }
}

struct StatusBreakdown {
    todo: usize,
    in_progress: usize,
    done: usize,
}

fn breakdown_by_status(tasks: &[crate::entities::Task]) -> StatusBreakdown {
    let mut b = StatusBreakdown { todo: 0, in_progress: 0, done: 0 };
    for t in tasks {
        match t.status {
            TaskStatus::Todo => b.todo += 1,
            TaskStatus::InProgress => b.in_progress += 1,
            TaskStatus::Done => b.done += 1,
        }
    }
    b
}

/// §4.4: list up to the first N members, then `"plus K more (T total <label>s)"`.
fn member_listing_sentence<'a>(label: &str, names: impl Iterator<Item = &'a str> + Clone) -> String {
    let total = names.clone().count();
    if total == 0 {
        return format!("No {label}s.");
    }
    let listed: Vec<&str> = names.take(MAX_LISTED_MEMBERS).collect();
    let mut sentence = format!("{}s: {}.", capitalize(label), listed.join(", "));
    if total > MAX_LISTED_MEMBERS {
        let remaining = total - MAX_LISTED_MEMBERS;
        sentence.push_str(&format!(" plus {remaining} more ({total} total {label}s)"));
    }
    sentence
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn days_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (deadline.date_naive() - now.date_naive()).num_days()
}

/// §4.4 deadline rendering.
fn deadline_sentence(days: i64) -> String {
    if days < 0 {
        format!("Overdue by {} days.", -days)
    } else if days == 0 {
        "Due today.".to_string()
    } else if days <= 3 {
        format!("Due in {days} days (urgent).")
    } else {
        format!("Due in {days} days.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Role, Task, TaskStatus, User};
    use chrono::Duration;
    use uuid::Uuid;

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{name}@example.com"),
            role: Role::Member,
            team_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sanitize_redacts_secrets() {
        let text = "note: password=hunter2 and api_key: sk-abc123";
        let out = sanitize(text);
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("sk-abc123"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn deadline_sentence_boundaries() {
        assert_eq!(deadline_sentence(-2), "Overdue by 2 days.");
        assert_eq!(deadline_sentence(0), "Due today.");
        assert_eq!(deadline_sentence(3), "Due in 3 days (urgent).");
        assert_eq!(deadline_sentence(10), "Due in 10 days.");
    }

    #[test]
    fn task_overdue_flags_are_derived() {
        let now = Utc::now();
        let assignee = user("Youssef Mohamed");
        let task = Task {
            id: Uuid::new_v4(),
            title: "Database Optimization".into(),
            description: None,
            status: TaskStatus::InProgress,
            assigned_to: Some(assignee.id),
            deadline: Some(now - Duration::days(5)),
            created_at: now,
            updated_at: now,
        };
        let snapshot = EntitySnapshot::Task {
            task,
            assignee: Some(assignee),
            team: None,
            project: None,
        };
        let doc = transform(&snapshot, now);
        assert_eq!(doc.metadata["is_overdue"], json!(true));
        assert!(doc.text.contains("Overdue by"));
        assert!(doc.text.contains("Youssef Mohamed"));
    }

    #[test]
    fn member_listing_truncates_with_count() {
        let names = vec!["a", "b", "c", "d", "e", "f", "g"];
        let sentence = member_listing_sentence("member", names.iter().copied());
        assert!(sentence.contains("plus 2 more (7 total members)"));
    }
}
