//! `rusqlite`-backed persistence, grounded on `engine/sessions.rs`'s
//! `SessionStore`: a single connection behind a `parking_lot::Mutex`, WAL
//! mode, `CREATE TABLE IF NOT EXISTS` schema setup on open, typed row
//! mapping. One struct implements both [`PermissionStore`] and [`JobStore`]
//! since they share a connection, the way `SessionStore` owns sessions,
//! messages, config, and tasks together.

use crate::domain::*;
use crate::error::{EngineError, EngineResult};
use crate::external::{JobStore, PermissionStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct EngineStore {
    conn: Arc<Mutex<Connection>>,
}

/// Default on-disk location, mirroring `engine_db_path()`'s
/// `dirs::home_dir().join(".paw")` convention, renamed for this crate.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clearance-engine")
        .join("engine.db")
}

impl EngineStore {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init(conn: &Connection) -> EngineResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS permission_sets (
                id TEXT PRIMARY KEY,
                default_clearance INTEGER NOT NULL,
                flag_create_sub_agent INTEGER NOT NULL,
                flag_create_container INTEGER NOT NULL,
                flag_register_info_store INTEGER NOT NULL,
                flag_edit_any_task INTEGER NOT NULL,
                flag_access_localhost_browser INTEGER NOT NULL,
                flag_access_localhost_cli INTEGER NOT NULL,
                user_whitelist TEXT NOT NULL,
                agent_whitelist TEXT NOT NULL,
                default_grant TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS grants (
                id TEXT PRIMARY KEY,
                permission_set_id TEXT NOT NULL,
                category TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                clearance INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_grants_ps ON grants(permission_set_id, category);

            CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                permission_set_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                default_agent_id TEXT,
                context_id TEXT,
                permission_set_id TEXT,
                allowed_agents TEXT NOT NULL,
                disable_chat_header INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channel_contexts (
                id TEXT PRIMARY KEY,
                default_agent_id TEXT,
                permission_set_id TEXT,
                allowed_agents TEXT NOT NULL,
                disable_chat_header INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                role_id TEXT,
                model_id TEXT
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                role_id TEXT
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                channel_id TEXT,
                caller_user_id TEXT,
                caller_agent_id TEXT,
                action TEXT NOT NULL,
                resource_id TEXT,
                status TEXT NOT NULL,
                effective_clearance INTEGER,
                approved_by_user_id TEXT,
                approved_by_agent_id TEXT,
                result_data TEXT,
                error_log TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS job_log_entries (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_log_job_created ON job_log_entries(job_id, created_at);

            CREATE TABLE IF NOT EXISTS transcription_segments (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                text TEXT NOT NULL,
                confidence REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_segments_job_start ON transcription_segments(job_id, start_time);

            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                path TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS system_users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                working_directory TEXT,
                sandbox_root TEXT
            );

            CREATE TABLE IF NOT EXISTS skills (
                resource_id TEXT PRIMARY KEY,
                text TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS provider_keys (
                model_id TEXT PRIMARY KEY,
                encrypted_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT,
                tool_call_id TEXT,
                tool_calls TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_channel ON chat_messages(channel_id, created_at);
            "#,
        )?;
        Ok(())
    }
}

/// Runs a synchronous rusqlite closure on the blocking thread pool, the
/// way the teacher's command handlers keep `SessionStore` calls off the
/// async reactor thread (there it happens implicitly via Tauri's command
/// thread pool; here it is explicit, per SPEC_FULL.md §5).
async fn blocking<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> EngineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let guard = conn.lock();
        f(&guard)
    })
    .await
    .map_err(|e| EngineError::Other(format!("store task panicked: {e}")))?
}

fn json_vec(v: &[String]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_vec(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn row_to_grant(id: String, category: String, resource_id: String, clearance: i64) -> Grant {
    Grant {
        id,
        category: ResourceCategory::parse(&category).unwrap_or(ResourceCategory::Skill),
        resource_id,
        clearance: Clearance::from_i64(clearance),
    }
}

fn load_grants(conn: &Connection, permission_set_id: &str) -> EngineResult<HashMap<ResourceCategory, Vec<Grant>>> {
    let mut stmt = conn.prepare(
        "SELECT id, category, resource_id, clearance FROM grants WHERE permission_set_id = ?1 ORDER BY resource_id != ?2",
    )?;
    let rows = stmt.query_map(params![permission_set_id, ALL_RESOURCES], |row| {
        Ok(row_to_grant(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })?;
    let mut map: HashMap<ResourceCategory, Vec<Grant>> = HashMap::new();
    for grant in rows {
        let grant = grant?;
        map.entry(grant.category).or_default().push(grant);
    }
    Ok(map)
}

fn load_permission_set(conn: &Connection, id: &str) -> EngineResult<Option<PermissionSet>> {
    let row = conn
        .query_row(
            "SELECT default_clearance, flag_create_sub_agent, flag_create_container, \
             flag_register_info_store, flag_edit_any_task, flag_access_localhost_browser, \
             flag_access_localhost_cli, user_whitelist, agent_whitelist, default_grant, \
             created_at, updated_at FROM permission_sets WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                ))
            },
        )
        .optional()?;

    let Some((
        default_clearance,
        flag_create_sub_agent,
        flag_create_container,
        flag_register_info_store,
        flag_edit_any_task,
        flag_access_localhost_browser,
        flag_access_localhost_cli,
        user_whitelist,
        agent_whitelist,
        default_grant,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let default_grant: HashMap<String, String> = serde_json::from_str(&default_grant).unwrap_or_default();
    let default_grant = default_grant
        .into_iter()
        .filter_map(|(k, v)| ResourceCategory::parse(&k).map(|c| (c, v)))
        .collect();

    Ok(Some(PermissionSet {
        id: id.to_string(),
        default_clearance: Clearance::from_i64(default_clearance),
        flag_create_sub_agent,
        flag_create_container,
        flag_register_info_store,
        flag_edit_any_task,
        flag_access_localhost_browser,
        flag_access_localhost_cli,
        grants: load_grants(conn, id)?,
        default_grant,
        user_whitelist: parse_json_vec(&user_whitelist),
        agent_whitelist: parse_json_vec(&agent_whitelist),
        created_at,
        updated_at,
    }))
}

#[async_trait]
impl PermissionStore for EngineStore {
    async fn get_permission_set(&self, id: &str) -> EngineResult<Option<PermissionSet>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| load_permission_set(conn, &id)).await
    }

    async fn put_permission_set(&self, ps: &PermissionSet) -> EngineResult<()> {
        let ps = ps.clone();
        blocking(self.conn.clone(), move |conn| {
            let default_grant: HashMap<&str, &str> = ps
                .default_grant
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            conn.execute(
                "INSERT INTO permission_sets (id, default_clearance, flag_create_sub_agent, \
                 flag_create_container, flag_register_info_store, flag_edit_any_task, \
                 flag_access_localhost_browser, flag_access_localhost_cli, user_whitelist, \
                 agent_whitelist, default_grant, created_at, updated_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13) \
                 ON CONFLICT(id) DO UPDATE SET default_clearance=?2, flag_create_sub_agent=?3, \
                 flag_create_container=?4, flag_register_info_store=?5, flag_edit_any_task=?6, \
                 flag_access_localhost_browser=?7, flag_access_localhost_cli=?8, \
                 user_whitelist=?9, agent_whitelist=?10, default_grant=?11, updated_at=?13",
                params![
                    ps.id,
                    ps.default_clearance as i64,
                    ps.flag_create_sub_agent,
                    ps.flag_create_container,
                    ps.flag_register_info_store,
                    ps.flag_edit_any_task,
                    ps.flag_access_localhost_browser,
                    ps.flag_access_localhost_cli,
                    json_vec(&ps.user_whitelist),
                    json_vec(&ps.agent_whitelist),
                    serde_json::to_string(&default_grant)?,
                    ps.created_at,
                    ps.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn put_grant(&self, permission_set_id: &str, grant: &Grant) -> EngineResult<()> {
        let permission_set_id = permission_set_id.to_string();
        let grant = grant.clone();
        blocking(self.conn.clone(), move |conn| {
            let existing_wildcard: Option<String> = conn
                .query_row(
                    "SELECT id FROM grants WHERE permission_set_id = ?1 AND category = ?2 AND resource_id = ?3",
                    params![permission_set_id, grant.category.as_str(), ALL_RESOURCES],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing_id) = &existing_wildcard {
                // A wildcard grant already on file for this category is
                // immutable: reject any write that touches it, whether an
                // update of the same row or an attempt to insert another.
                if grant.is_wildcard() {
                    return Err(EngineError::InvariantViolation(format!(
                        "grant {existing_id} is AllResources and cannot be modified"
                    )));
                }
            }
            conn.execute(
                "INSERT INTO grants (id, permission_set_id, category, resource_id, clearance) \
                 VALUES (?1,?2,?3,?4,?5) \
                 ON CONFLICT(id) DO UPDATE SET resource_id=?4, clearance=?5",
                params![
                    grant.id,
                    permission_set_id,
                    grant.category.as_str(),
                    grant.resource_id,
                    grant.clearance as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_grant(&self, permission_set_id: &str, grant_id: &str) -> EngineResult<()> {
        let permission_set_id = permission_set_id.to_string();
        let grant_id = grant_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            let resource_id: Option<String> = conn
                .query_row(
                    "SELECT resource_id FROM grants WHERE id = ?1 AND permission_set_id = ?2",
                    params![grant_id, permission_set_id],
                    |row| row.get(0),
                )
                .optional()?;
            if resource_id.as_deref() == Some(ALL_RESOURCES) {
                return Err(EngineError::InvariantViolation(format!(
                    "grant {grant_id} is AllResources and cannot be deleted"
                )));
            }
            conn.execute(
                "DELETE FROM grants WHERE id = ?1 AND permission_set_id = ?2",
                params![grant_id, permission_set_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_role(&self, id: &str) -> EngineResult<Option<Role>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT id, name, permission_set_id FROM roles WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Role {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        permission_set_id: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    async fn put_role(&self, role: &Role) -> EngineResult<()> {
        let role = role.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO roles (id, name, permission_set_id) VALUES (?1,?2,?3) \
                 ON CONFLICT(id) DO UPDATE SET name=?2, permission_set_id=?3",
                params![role.id, role.name, role.permission_set_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_channel(&self, id: &str) -> EngineResult<Option<Channel>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT id, default_agent_id, context_id, permission_set_id, allowed_agents, \
                 disable_chat_header FROM channels WHERE id = ?1",
                params![id],
                |row| {
                    let allowed: String = row.get(4)?;
                    Ok(Channel {
                        id: row.get(0)?,
                        default_agent_id: row.get(1)?,
                        context_id: row.get(2)?,
                        permission_set_id: row.get(3)?,
                        allowed_agents: parse_json_vec(&allowed),
                        disable_chat_header: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    async fn put_channel(&self, channel: &Channel) -> EngineResult<()> {
        let channel = channel.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO channels (id, default_agent_id, context_id, permission_set_id, \
                 allowed_agents, disable_chat_header) VALUES (?1,?2,?3,?4,?5,?6) \
                 ON CONFLICT(id) DO UPDATE SET default_agent_id=?2, context_id=?3, \
                 permission_set_id=?4, allowed_agents=?5, disable_chat_header=?6",
                params![
                    channel.id,
                    channel.default_agent_id,
                    channel.context_id,
                    channel.permission_set_id,
                    json_vec(&channel.allowed_agents),
                    channel.disable_chat_header,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_channel_context(&self, id: &str) -> EngineResult<Option<ChannelContext>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT id, default_agent_id, permission_set_id, allowed_agents, \
                 disable_chat_header FROM channel_contexts WHERE id = ?1",
                params![id],
                |row| {
                    let allowed: String = row.get(3)?;
                    Ok(ChannelContext {
                        id: row.get(0)?,
                        default_agent_id: row.get(1)?,
                        permission_set_id: row.get(2)?,
                        allowed_agents: parse_json_vec(&allowed),
                        disable_chat_header: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    async fn put_channel_context(&self, context: &ChannelContext) -> EngineResult<()> {
        let context = context.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO channel_contexts (id, default_agent_id, permission_set_id, \
                 allowed_agents, disable_chat_header) VALUES (?1,?2,?3,?4,?5) \
                 ON CONFLICT(id) DO UPDATE SET default_agent_id=?2, permission_set_id=?3, \
                 allowed_agents=?4, disable_chat_header=?5",
                params![
                    context.id,
                    context.default_agent_id,
                    context.permission_set_id,
                    json_vec(&context.allowed_agents),
                    context.disable_chat_header,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_agent_role_id(&self, agent_id: &str) -> EngineResult<Option<String>> {
        let agent_id = agent_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row("SELECT role_id FROM agents WHERE id = ?1", params![agent_id], |row| row.get(0))
                .optional()
                .map_err(EngineError::from)
        })
        .await
    }

    async fn get_user_role_id(&self, user_id: &str) -> EngineResult<Option<String>> {
        let user_id = user_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row("SELECT role_id FROM users WHERE id = ?1", params![user_id], |row| row.get(0))
                .optional()
                .map_err(EngineError::from)
        })
        .await
    }

    async fn put_user_role(&self, user_id: &str, role_id: &str) -> EngineResult<()> {
        let user_id = user_id.to_string();
        let role_id = role_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO users (id, role_id) VALUES (?1,?2) ON CONFLICT(id) DO UPDATE SET role_id=?2",
                params![user_id, role_id],
            )?;
            Ok(())
        })
        .await
    }
}

fn row_to_job(
    id: String,
    agent_id: String,
    channel_id: Option<String>,
    caller_user_id: Option<String>,
    caller_agent_id: Option<String>,
    action: String,
    resource_id: Option<String>,
    status: String,
    effective_clearance: Option<i64>,
    approved_by_user_id: Option<String>,
    approved_by_agent_id: Option<String>,
    result_data: Option<String>,
    error_log: Option<String>,
    payload: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
) -> EngineResult<Job> {
    Ok(Job {
        id,
        agent_id,
        channel_id,
        caller_user_id,
        caller_agent_id,
        action: serde_json::from_str(&format!("\"{action}\"")).map_err(|e| {
            EngineError::Other(format!("corrupt job action {action}: {e}"))
        })?,
        resource_id,
        status: JobStatus::parse(&status)
            .ok_or_else(|| EngineError::Other(format!("corrupt job status {status}")))?,
        effective_clearance: effective_clearance.map(Clearance::from_i64),
        approved_by_user_id,
        approved_by_agent_id,
        result_data,
        error_log,
        payload: serde_json::from_str(&payload)?,
        created_at,
        started_at,
        completed_at,
    })
}

#[async_trait]
impl JobStore for EngineStore {
    async fn insert_job(&self, job: &Job) -> EngineResult<()> {
        let job = job.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, agent_id, channel_id, caller_user_id, caller_agent_id, \
                 action, resource_id, status, effective_clearance, approved_by_user_id, \
                 approved_by_agent_id, result_data, error_log, payload, created_at, started_at, \
                 completed_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                params![
                    job.id,
                    job.agent_id,
                    job.channel_id,
                    job.caller_user_id,
                    job.caller_agent_id,
                    serde_json::to_value(job.action)?.as_str().unwrap_or_default(),
                    job.resource_id,
                    job.status.as_str(),
                    job.effective_clearance.map(|c| c as i64),
                    job.approved_by_user_id,
                    job.approved_by_agent_id,
                    job.result_data,
                    job.error_log,
                    serde_json::to_string(&job.payload)?,
                    job.created_at,
                    job.started_at,
                    job.completed_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> EngineResult<Option<Job>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT id, agent_id, channel_id, caller_user_id, caller_agent_id, action, \
                 resource_id, status, effective_clearance, approved_by_user_id, \
                 approved_by_agent_id, result_data, error_log, payload, created_at, started_at, \
                 completed_at FROM jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(row_to_job(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                        row.get(13)?,
                        row.get(14)?,
                        row.get(15)?,
                        row.get(16)?,
                    ))
                },
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn update_job(&self, job: &Job) -> EngineResult<()> {
        let job = job.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "UPDATE jobs SET status=?2, effective_clearance=?3, approved_by_user_id=?4, \
                 approved_by_agent_id=?5, result_data=?6, error_log=?7, payload=?8, \
                 started_at=?9, completed_at=?10, resource_id=?11 WHERE id=?1",
                params![
                    job.id,
                    job.status.as_str(),
                    job.effective_clearance.map(|c| c as i64),
                    job.approved_by_user_id,
                    job.approved_by_agent_id,
                    job.result_data,
                    job.error_log,
                    serde_json::to_string(&job.payload)?,
                    job.started_at,
                    job.completed_at,
                    job.resource_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_log(&self, entry: &LogEntry) -> EngineResult<()> {
        let entry = entry.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO job_log_entries (id, job_id, severity, message, created_at) \
                 VALUES (?1,?2,?3,?4,?5)",
                params![entry.id, entry.job_id, entry.severity.as_str(), entry.message, entry.created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_logs(&self, job_id: &str) -> EngineResult<Vec<LogEntry>> {
        let job_id = job_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, severity, message, created_at FROM job_log_entries \
                 WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![job_id], |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    severity: Severity::parse(&row.get::<_, String>(2)?),
                    message: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
    }

    async fn append_segment(&self, segment: &TranscriptionSegment) -> EngineResult<()> {
        let segment = segment.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO transcription_segments (id, job_id, start_time, end_time, text, \
                 confidence, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    segment.id,
                    segment.job_id,
                    segment.start_time,
                    segment.end_time,
                    segment.text,
                    segment.confidence,
                    segment.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_segments(&self, job_id: &str) -> EngineResult<Vec<TranscriptionSegment>> {
        let job_id = job_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, start_time, end_time, text, confidence, created_at \
                 FROM transcription_segments WHERE job_id = ?1 ORDER BY start_time ASC",
            )?;
            let rows = stmt.query_map(params![job_id], segment_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
    }

    async fn get_segments_since(&self, job_id: &str, timestamp: f64) -> EngineResult<Vec<TranscriptionSegment>> {
        let job_id = job_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, start_time, end_time, text, confidence, created_at \
                 FROM transcription_segments WHERE job_id = ?1 AND start_time >= ?2 ORDER BY start_time ASC",
            )?;
            let rows = stmt.query_map(params![job_id, timestamp], segment_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
    }

    async fn list_stale_transcription_jobs(&self) -> EngineResult<Vec<Job>> {
        blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, channel_id, caller_user_id, caller_agent_id, action, \
                 resource_id, status, effective_clearance, approved_by_user_id, \
                 approved_by_agent_id, result_data, error_log, payload, created_at, started_at, \
                 completed_at FROM jobs WHERE status IN ('executing', 'queued') \
                 AND action LIKE 'transcribe_from_%'",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(row_to_job(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                    row.get(13)?,
                    row.get(14)?,
                    row.get(15)?,
                    row.get(16)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, rusqlite::Error>>()?
                .into_iter()
                .collect::<EngineResult<Vec<_>>>()
        })
        .await
    }

    async fn get_container(&self, id: &str) -> EngineResult<Option<Container>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT id, name, kind, path, description, created_at FROM containers WHERE id = ?1",
                params![id],
                |row| {
                    let kind: String = row.get(2)?;
                    Ok(Container {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: if kind == "docker" { ContainerKind::Docker } else { ContainerKind::SandboxedDsl },
                        path: row.get(3)?,
                        description: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    async fn get_container_by_name(&self, name: &str) -> EngineResult<Option<Container>> {
        let name = name.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT id, name, kind, path, description, created_at FROM containers WHERE name = ?1",
                params![name],
                |row| {
                    let kind: String = row.get(2)?;
                    Ok(Container {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: if kind == "docker" { ContainerKind::Docker } else { ContainerKind::SandboxedDsl },
                        path: row.get(3)?,
                        description: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    async fn put_container(&self, container: &Container) -> EngineResult<()> {
        let container = container.clone();
        blocking(self.conn.clone(), move |conn| {
            let kind = match container.kind {
                ContainerKind::Docker => "docker",
                ContainerKind::SandboxedDsl => "sandboxed_dsl",
            };
            conn.execute(
                "INSERT INTO containers (id, name, kind, path, description, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6) ON CONFLICT(id) DO UPDATE SET name=?2, path=?4, description=?5",
                params![container.id, container.name, kind, container.path, container.description, container.created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_system_user(&self, id: &str) -> EngineResult<Option<SystemUser>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT id, name, working_directory, sandbox_root FROM system_users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SystemUser {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        working_directory: row.get(2)?,
                        sandbox_root: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    async fn put_system_user(&self, user: &SystemUser) -> EngineResult<()> {
        let user = user.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO system_users (id, name, working_directory, sandbox_root) \
                 VALUES (?1,?2,?3,?4) ON CONFLICT(id) DO UPDATE SET name=?2, \
                 working_directory=?3, sandbox_root=?4",
                params![user.id, user.name, user.working_directory, user.sandbox_root],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_skill_text(&self, resource_id: &str) -> EngineResult<Option<String>> {
        let resource_id = resource_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row("SELECT text FROM skills WHERE resource_id = ?1", params![resource_id], |row| row.get(0))
                .optional()
                .map_err(EngineError::from)
        })
        .await
    }

    async fn put_skill_text(&self, resource_id: &str, text: &str) -> EngineResult<()> {
        let resource_id = resource_id.to_string();
        let text = text.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO skills (resource_id, text) VALUES (?1,?2) \
                 ON CONFLICT(resource_id) DO UPDATE SET text=?2",
                params![resource_id, text],
            )?;
            Ok(())
        })
        .await
    }

    async fn put_agent(&self, agent: &Agent) -> EngineResult<()> {
        let agent = agent.clone();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO agents (id, role_id, model_id) VALUES (?1,?2,?3) \
                 ON CONFLICT(id) DO UPDATE SET role_id=?2, model_id=?3",
                params![agent.id, agent.role_id, agent.model_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_agent(&self, id: &str) -> EngineResult<Option<Agent>> {
        let id = id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row("SELECT id, role_id, model_id FROM agents WHERE id = ?1", params![id], |row| {
                Ok(Agent { id: row.get(0)?, role_id: row.get(1)?, model_id: row.get(2)? })
            })
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }
}

#[async_trait]
impl crate::external::ChatHistoryStore for EngineStore {
    async fn get_history(&self, channel_id: &str) -> EngineResult<Vec<crate::external::ChatMessage>> {
        let channel_id = channel_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, tool_call_id, tool_calls FROM chat_messages \
                 WHERE channel_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![channel_id], |row| {
                let tool_calls: Option<String> = row.get(3)?;
                Ok(crate::external::ChatMessage {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    tool_call_id: row.get(2)?,
                    tool_calls: tool_calls.and_then(|s| serde_json::from_str(&s).ok()),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(EngineError::from)
        })
        .await
    }

    async fn append_message(&self, channel_id: &str, message: &crate::external::ChatMessage) -> EngineResult<()> {
        let channel_id = channel_id.to_string();
        let message = message.clone();
        blocking(self.conn.clone(), move |conn| {
            let tool_calls = message
                .tool_calls
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                "INSERT INTO chat_messages (id, channel_id, role, content, tool_call_id, tool_calls, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    channel_id,
                    message.role,
                    message.content,
                    message.tool_call_id,
                    tool_calls,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

impl EngineStore {
    /// Raw encrypted-at-rest provider key lookup, consumed by
    /// [`crate::crypto::VaultKeyResolver`]. Not part of [`JobStore`] or
    /// [`PermissionStore`] — it is a storage detail of the vault, not a
    /// spec.md §3 entity.
    pub async fn get_encrypted_provider_key(&self, model_id: &str) -> EngineResult<Option<String>> {
        let model_id = model_id.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.query_row(
                "SELECT encrypted_key FROM provider_keys WHERE model_id = ?1",
                params![model_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    pub async fn put_encrypted_provider_key(&self, model_id: &str, encrypted_key: &str) -> EngineResult<()> {
        let model_id = model_id.to_string();
        let encrypted_key = encrypted_key.to_string();
        blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO provider_keys (model_id, encrypted_key) VALUES (?1,?2) \
                 ON CONFLICT(model_id) DO UPDATE SET encrypted_key=?2",
                params![model_id, encrypted_key],
            )?;
            Ok(())
        })
        .await
    }
}

fn segment_from_row(row: &rusqlite::Row) -> rusqlite::Result<TranscriptionSegment> {
    Ok(TranscriptionSegment {
        id: row.get(0)?,
        job_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        text: row.get(4)?,
        confidence: row.get(5)?,
        created_at: row.get(6)?,
    })
}
