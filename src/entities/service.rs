// src/entities/service.rs
//! The "Dependent CRUD service contract" (§6.2): an external collaborator
//! the Pipeline calls over HTTP, never a direct database connection
//! (§1 Out of scope names "the relational database" as external). Modelled
//! on the teacher's `reqwest`-based provider clients (`llm::provider::openai`)
//! for retry/timeout texture.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EntityKind, EntitySnapshot, Project, Task, Team, User};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PagedResult {
    pub data: Vec<Value>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

/// §6.2: `Create`, `FindOne`, `FindAll`, `Update`, `Remove` per entity kind,
/// plus the bounded-join snapshot read the Indexer (C5) and Document
/// Transformer (C4) need. DTOs are passed as `serde_json::Value` since the
/// Pipeline does not own entity validation (non-goal); the external service
/// is the authority on shape and semantic constraints (email uniqueness,
/// status enum, password length, role enum).
#[async_trait]
pub trait EntityService: Send + Sync {
    async fn find_one(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>>;

    async fn find_all(
        &self,
        kind: EntityKind,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<PagedResult>;

    async fn create(&self, kind: EntityKind, dto: Value) -> Result<Value>;

    async fn update(&self, kind: EntityKind, id: Uuid, patch: Value) -> Result<Value>;

    async fn remove(&self, kind: EntityKind, id: Uuid) -> Result<()>;

    /// Fetch an entity plus its eagerly-loaded relations as one tree
    /// snapshot (§9: ORM-cycle redesign note). Returns `None` when the
    /// root entity itself is absent.
    async fn load_snapshot(&self, kind: EntityKind, id: Uuid) -> Result<Option<EntitySnapshot>>;

    /// §4.10/§6.2: list all entities of a kind, paginated with page size up
    /// to 1000, used by the Entity Resolver's name-matching fallback.
    async fn list_all(&self, kind: EntityKind) -> Result<Vec<Value>> {
        let page = self.find_all(kind, 1, 1000, None).await?;
        Ok(page.data)
    }
}

/// HTTP implementation against a REST CRUD service, e.g.
/// `POST /{kind}s`, `GET /{kind}s/:id`, `GET /{kind}s?page=&limit=&search=`,
/// `PATCH /{kind}s/:id`, `DELETE /{kind}s/:id`.
pub struct HttpEntityService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEntityService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn collection_path(&self, kind: EntityKind) -> String {
        format!("{}/{}s", self.base_url, kind.as_str())
    }
}

#[async_trait]
impl EntityService for HttpEntityService {
    async fn find_one(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>> {
        let url = format!("{}/{id}", self.collection_path(kind));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow!("find_one {kind:?}/{id} failed: {}", resp.status()));
        }
        Ok(Some(resp.json().await.context("decode entity body")?))
    }

    async fn find_all(
        &self,
        kind: EntityKind,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<PagedResult> {
        let mut req = self
            .client
            .get(self.collection_path(kind))
            .query(&[("page", page.to_string()), ("limit", page_size.to_string())]);
        if let Some(search) = search {
            req = req.query(&[("search", search)]);
        }
        let resp = req.send().await.context("find_all request")?;
        if !resp.status().is_success() {
            return Err(anyhow!("find_all {kind:?} failed: {}", resp.status()));
        }
        resp.json().await.context("decode find_all body")
    }

    async fn create(&self, kind: EntityKind, dto: Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.collection_path(kind))
            .json(&dto)
            .send()
            .await
            .context("create request")?;
        match resp.status() {
            s if s.is_success() => resp.json().await.context("decode create body"),
            reqwest::StatusCode::CONFLICT => Err(anyhow!("conflict creating {kind:?}")),
            s => Err(anyhow!("create {kind:?} failed: {s}")),
        }
    }

    async fn update(&self, kind: EntityKind, id: Uuid, patch: Value) -> Result<Value> {
        let url = format!("{}/{id}", self.collection_path(kind));
        let resp = self
            .client
            .patch(&url)
            .json(&patch)
            .send()
            .await
            .context("update request")?;
        match resp.status() {
            s if s.is_success() => resp.json().await.context("decode update body"),
            reqwest::StatusCode::NOT_FOUND => Err(anyhow!("not found: {kind:?}/{id}")),
            reqwest::StatusCode::CONFLICT => Err(anyhow!("conflict updating {kind:?}/{id}")),
            s => Err(anyhow!("update {kind:?}/{id} failed: {s}")),
        }
    }

    async fn remove(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        let url = format!("{}/{id}", self.collection_path(kind));
        let resp = self.client.delete(&url).send().await.context("remove request")?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(anyhow!("not found: {kind:?}/{id}")),
            s => Err(anyhow!("remove {kind:?}/{id} failed: {s}")),
        }
    }

    async fn load_snapshot(&self, kind: EntityKind, id: Uuid) -> Result<Option<EntitySnapshot>> {
        let Some(root) = self.find_one(kind, id).await? else {
            return Ok(None);
        };

        let snapshot = match kind {
            EntityKind::User => {
                let user: User = serde_json::from_value(root)?;
                let team = match user.team_id {
                    Some(team_id) => self
                        .find_one(EntityKind::Team, team_id)
                        .await?
                        .and_then(|v| serde_json::from_value(v).ok()),
                    None => None,
                };
                let tasks = self.tasks_assigned_to(user.id).await?;
                EntitySnapshot::User { user, team, tasks }
            }
            EntityKind::Team => {
                let team: Team = serde_json::from_value(root)?;
                let owner = self
                    .find_one(EntityKind::User, team.owner_id)
                    .await?
                    .and_then(|v| serde_json::from_value(v).ok());
                let project = match team.project_id {
                    Some(pid) => self
                        .find_one(EntityKind::Project, pid)
                        .await?
                        .and_then(|v| serde_json::from_value(v).ok()),
                    None => None,
                };
                let members = self.users_on_team(team.id).await?;
                EntitySnapshot::Team {
                    team,
                    owner,
                    project,
                    members,
                }
            }
            EntityKind::Project => {
                let project: Project = serde_json::from_value(root)?;
                let all_teams = self.list_all(EntityKind::Team).await?;
                let teams: Vec<Team> = all_teams
                    .into_iter()
                    .filter_map(|v| serde_json::from_value::<Team>(v).ok())
                    .filter(|t| t.project_id == Some(project.id))
                    .collect();
                let member_count = {
                    let mut total = 0usize;
                    for team in &teams {
                        total += self.users_on_team(team.id).await?.len();
                    }
                    total
                };
                EntitySnapshot::Project {
                    project,
                    teams,
                    member_count,
                }
            }
            EntityKind::Task => {
                let task: Task = serde_json::from_value(root)?;
                let assignee = match task.assigned_to {
                    Some(uid) => self
                        .find_one(EntityKind::User, uid)
                        .await?
                        .and_then(|v| serde_json::from_value(v).ok()),
                    None => None,
                };
                let team = match assignee.as_ref().and_then(|u: &User| u.team_id) {
                    Some(tid) => self
                        .find_one(EntityKind::Team, tid)
                        .await?
                        .and_then(|v| serde_json::from_value(v).ok()),
                    None => None,
                };
                let project = match team.as_ref().and_then(|t: &Team| t.project_id) {
                    Some(pid) => self
                        .find_one(EntityKind::Project, pid)
                        .await?
                        .and_then(|v| serde_json::from_value(v).ok()),
                    None => None,
                };
                EntitySnapshot::Task {
                    task,
                    assignee,
                    team,
                    project,
                }
            }
        };

        Ok(Some(snapshot))
    }
}

impl HttpEntityService {
    async fn tasks_assigned_to(&self, user_id: Uuid) -> Result<Vec<Task>> {
        let all = self.list_all(EntityKind::Task).await?;
        Ok(all
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Task>(v).ok())
            .filter(|t| t.assigned_to == Some(user_id))
            .collect())
    }

    async fn users_on_team(&self, team_id: Uuid) -> Result<Vec<User>> {
        let all = self.list_all(EntityKind::User).await?;
        Ok(all
            .into_iter()
            .filter_map(|v| serde_json::from_value::<User>(v).ok())
            .filter(|u| u.team_id == Some(team_id))
            .collect())
    }
}

/// §7: swallow upstream read failures and treat them as "not found", used
/// by the Entity Resolver (C10).
pub async fn find_one_or_none(
    service: &dyn EntityService,
    kind: EntityKind,
    id: Uuid,
) -> Option<Value> {
    match service.find_one(kind, id).await {
        Ok(v) => v,
        Err(e) => {
            warn!("entity read failed, treating as not found: {e}");
            None
        }
    }
}

#[allow(dead_code)]
fn log_listing(kind: EntityKind, count: usize) {
    debug!("listed {count} entities of kind {}", kind.as_str());
}
