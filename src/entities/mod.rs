// src/entities/mod.rs
//! Domain entities (§3.1) owned by external services. The Pipeline only
//! reads/writes them through the `EntityService` contract (§6.2); it never
//! owns their storage or validation rules.

pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    /// §4.11 status normalisation: case-insensitive, whitespace-tolerant.
    pub fn parse_loose(input: &str) -> Option<Self> {
        let normalized = input.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "todo" | "to_do" => Some(Self::Todo),
            "in_progress" | "inprogress" => Some(Self::InProgress),
            "done" | "completed" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }

    /// §4.4 human-readable rendering for document text.
    pub fn human(&self) -> &'static str {
        match self {
            Self::Todo => "To Do",
            Self::InProgress => "In Progress",
            Self::Done => "Done",
        }
    }
}

// §6.2: the external CRUD service speaks camelCase JSON (matching the
// `assignedTo`/`teamId`-style argument names the Action Executor extracts
// in §4.11.2), so these wire structs rename to match rather than assuming
// the service mirrors Rust's snake_case field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub team_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub project_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub assigned_to: Option<Uuid>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The entity kinds the Pipeline operates over (§3.1, used throughout §4.7-4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Team,
    Project,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
            Self::Project => "project",
            Self::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" => Some(Self::User),
            "team" => Some(Self::Team),
            "project" => Some(Self::Project),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

/// A snapshot with its eagerly-loaded relations (§9: "treat as a read-only
/// view ... one bounded-join read per entity with a fixed relation set").
#[derive(Debug, Clone)]
pub enum EntitySnapshot {
    User {
        user: User,
        team: Option<Team>,
        tasks: Vec<Task>,
    },
    Team {
        team: Team,
        owner: Option<User>,
        project: Option<Project>,
        members: Vec<User>,
    },
    Project {
        project: Project,
        teams: Vec<Team>,
        member_count: usize,
    },
    Task {
        task: Task,
        assignee: Option<User>,
        team: Option<Team>,
        project: Option<Project>,
    },
}

impl EntitySnapshot {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User { .. } => EntityKind::User,
            Self::Team { .. } => EntityKind::Team,
            Self::Project { .. } => EntityKind::Project,
            Self::Task { .. } => EntityKind::Task,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::User { user, .. } => user.id,
            Self::Team { team, .. } => team.id,
            Self::Project { project, .. } => project.id,
            Self::Task { task, .. } => task.id,
        }
    }
}
