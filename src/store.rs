//! Store: unified cache and durable persistence for agents.
//!
//! The [`Store`] is the main interface of the crate. It combines three
//! layers behind one handle:
//!
//! - an in-process asset cache (id → asset), guarded by a mutex;
//! - a SQLite backing reached through an `sqlx` connection pool;
//! - transactional cascade writes, so a new agent is never visible without
//!   its prompt, conversation, and messages.
//!
//! A store created with [`Store::in_memory`] drops the SQLite layer and
//! pins every asset in the cache instead; database-only operations like
//! [`gc`](Store::gc) become no-ops there. The relational-backed store uses
//! a bounded LRU cache — entries may be discarded at any time because the
//! database remains the source of truth.
//!
//! All reads go cache-first. All writes cache the written assets, so a
//! turn's working set stays hot.
//!
//! ```rust,no_run
//! # async fn example() -> versioned_agent::Result<()> {
//! use versioned_agent::{AgentSpec, Store};
//!
//! let store = Store::connect("sqlite:agents.db").await?;
//! let agent = store
//!     .create_agent(AgentSpec::new(
//!         "Calculator",
//!         "You are a calculator.",
//!         "claude-3-5-haiku",
//!     ))
//!     .await?;
//!
//! let reloaded = store.load_agent(agent.id).await?;
//! assert_eq!(reloaded, agent);
//! # Ok(())
//! # }
//! ```

use crate::assets::{
    Agent, Conversation, Message, MessageRole, SystemPrompt, ToolCall, new_id, now_utc,
};
use crate::config::{LlmConfig, StoreConfig};
use crate::llm::{ChatProvider, HttpChatProvider, LlmClient};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use lru::LruCache;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Entries kept by the relational-backed cache before old ones are
/// discarded. The database is authoritative, so eviction only costs a
/// re-read.
const CACHE_CAPACITY: usize = 4096;

const SCHEMA: &str = "
-- System prompts
CREATE TABLE IF NOT EXISTS system_prompts (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    content TEXT NOT NULL
);

-- Messages
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT,
    tool_calls TEXT,
    tool_call_id TEXT,
    input_tokens INTEGER,
    output_tokens INTEGER
);

-- Conversations (ordered JSON array of message ids)
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    message_ids TEXT NOT NULL
);

-- Agents
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    name TEXT NOT NULL,
    system_prompt_id TEXT NOT NULL REFERENCES system_prompts(id),
    parent_id TEXT REFERENCES agents(id) ON DELETE SET NULL,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    model TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    model_config TEXT NOT NULL DEFAULT '{}'
);

-- Indexes for common lookups
CREATE INDEX IF NOT EXISTS idx_agents_parent_id ON agents(parent_id);
CREATE INDEX IF NOT EXISTS idx_agents_conversation_id ON agents(conversation_id);
CREATE INDEX IF NOT EXISTS idx_agents_name ON agents(name);
";

const AGENT_COLUMNS: &str = "id, created_at, name, system_prompt_id, parent_id, \
     conversation_id, model, metadata, model_config";

// ============================================================================
// SPECS AND RESULT TYPES
// ============================================================================

/// Inputs for [`Store::create_agent`].
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Human-readable agent name.
    pub name: String,
    /// System prompt content (a new prompt asset is minted).
    pub system_prompt: String,
    /// Model identifier for the provider.
    pub model: String,
    /// Optional free-form metadata.
    pub metadata: Option<Map<String, Value>>,
    /// Optional default LLM options for every turn.
    pub model_config: Option<Map<String, Value>>,
}

impl AgentSpec {
    /// Spec with the three required fields.
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            metadata: None,
            model_config: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach default model options.
    pub fn with_model_config(mut self, model_config: Map<String, Value>) -> Self {
        self.model_config = Some(model_config);
        self
    }
}

/// Per-kind deletion counts returned by [`Store::gc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcCounts {
    pub system_prompts: u64,
    pub conversations: u64,
    pub messages: u64,
}

/// Summed token usage returned by [`Store::token_usage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ============================================================================
// CACHE
// ============================================================================

#[derive(Clone)]
pub(crate) enum CachedAsset {
    Prompt(SystemPrompt),
    Message(Message),
    Conversation(Conversation),
    Agent(Agent),
}

impl CachedAsset {
    fn id(&self) -> Uuid {
        match self {
            CachedAsset::Prompt(p) => p.id,
            CachedAsset::Message(m) => m.id,
            CachedAsset::Conversation(c) => c.id,
            CachedAsset::Agent(a) => a.id,
        }
    }
}

/// Bounded for the relational-backed store, pinned for the memory store
/// (which has no fallback to reload from).
enum AssetCache {
    Bounded(LruCache<Uuid, CachedAsset>),
    Pinned(HashMap<Uuid, CachedAsset>),
}

impl AssetCache {
    fn get(&mut self, id: &Uuid) -> Option<CachedAsset> {
        match self {
            AssetCache::Bounded(lru) => lru.get(id).cloned(),
            AssetCache::Pinned(map) => map.get(id).cloned(),
        }
    }

    fn insert(&mut self, asset: CachedAsset) {
        match self {
            AssetCache::Bounded(lru) => {
                lru.put(asset.id(), asset);
            }
            AssetCache::Pinned(map) => {
                map.insert(asset.id(), asset);
            }
        }
    }

    fn remove(&mut self, id: &Uuid) {
        match self {
            AssetCache::Bounded(lru) => {
                lru.pop(id);
            }
            AssetCache::Pinned(map) => {
                map.remove(id);
            }
        }
    }

    fn clear(&mut self) {
        match self {
            AssetCache::Bounded(lru) => lru.clear(),
            AssetCache::Pinned(map) => map.clear(),
        }
    }

    /// Snapshot of every cached agent (memory-store queries scan this).
    fn agents(&self) -> Vec<Agent> {
        let pick = |asset: &CachedAsset| match asset {
            CachedAsset::Agent(a) => Some(a.clone()),
            _ => None,
        };
        match self {
            AssetCache::Bounded(lru) => lru.iter().filter_map(|(_, a)| pick(a)).collect(),
            AssetCache::Pinned(map) => map.values().filter_map(pick).collect(),
        }
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn format_instant(at: DateTime<Utc>) -> String {
    // Fixed-width form so lexicographic TEXT ordering matches time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::decode(format!("invalid id '{s}': {e}")))
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::decode(format!("invalid timestamp '{s}': {e}")))
}

fn parse_json_map(s: &str, what: &str) -> Result<Map<String, Value>> {
    serde_json::from_str(s).map_err(|e| Error::decode(format!("invalid {what} JSON: {e}")))
}

fn prompt_from_row(row: &SqliteRow) -> Result<SystemPrompt> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(SystemPrompt {
        id: parse_id(&id)?,
        created_at: parse_instant(&created_at)?,
        content: row.try_get("content")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let role: String = row.try_get("role")?;
    let tool_calls: Option<String> = row.try_get("tool_calls")?;
    let tool_calls: Option<Vec<ToolCall>> = tool_calls
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| Error::decode(format!("invalid tool_calls JSON: {e}")))
        })
        .transpose()?;
    let input_tokens: Option<i64> = row.try_get("input_tokens")?;
    let output_tokens: Option<i64> = row.try_get("output_tokens")?;

    Ok(Message::from_parts(
        parse_id(&id)?,
        parse_instant(&created_at)?,
        MessageRole::parse(&role)?,
        row.try_get("content")?,
        tool_calls,
        row.try_get("tool_call_id")?,
        input_tokens.map(|v| v as u32),
        output_tokens.map(|v| v as u32),
    ))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let message_ids: String = row.try_get("message_ids")?;
    let message_ids: Vec<Uuid> = serde_json::from_str(&message_ids)
        .map_err(|e| Error::decode(format!("invalid message_ids JSON: {e}")))?;
    Ok(Conversation::from_parts(
        parse_id(&id)?,
        parse_instant(&created_at)?,
        message_ids,
    ))
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let system_prompt_id: String = row.try_get("system_prompt_id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let conversation_id: String = row.try_get("conversation_id")?;
    let metadata: String = row.try_get("metadata")?;
    let model_config: String = row.try_get("model_config")?;

    Ok(Agent::from_parts(
        parse_id(&id)?,
        parse_instant(&created_at)?,
        row.try_get("name")?,
        parse_id(&system_prompt_id)?,
        parent_id.as_deref().map(parse_id).transpose()?,
        parse_id(&conversation_id)?,
        row.try_get("model")?,
        parse_json_map(&metadata, "metadata")?,
        parse_json_map(&model_config, "model_config")?,
    ))
}

// ============================================================================
// STORE
// ============================================================================

/// Unified cache and durable persistence for agents.
///
/// See the [module docs](self) for the layering. Cloneable handles are not
/// provided; share a store with `Arc<Store>` if needed — all methods take
/// `&self`.
pub struct Store {
    pool: Option<SqlitePool>,
    cache: Mutex<AssetCache>,
    llm: LlmClient,
}

impl Store {
    /// Connect to SQLite at `dsn` (e.g. `sqlite:agents.db`) with default
    /// pool settings, creating the file and schema as needed.
    pub async fn connect(dsn: &str) -> Result<Self> {
        Self::connect_with(StoreConfig::new(dsn)).await
    }

    /// Connect with explicit pool configuration.
    pub async fn connect_with(config: StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.dsn)?
            .create_if_missing(true)
            // ON DELETE SET NULL on agents.parent_id depends on this.
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(config.idle_timeout)
            .connect_with(options)
            .await?;

        let store = Self {
            pool: Some(pool),
            cache: Mutex::new(AssetCache::Bounded(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("non-zero capacity"),
            ))),
            llm: LlmClient::new(Arc::new(HttpChatProvider::from_config(
                &LlmConfig::from_env(),
            ))),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a store with no durable backing.
    ///
    /// Assets live in the (pinned, never-evicting) cache until deleted or
    /// the store is dropped. Database-only operations such as
    /// [`gc`](Store::gc) are no-ops.
    pub fn in_memory() -> Self {
        Self {
            pool: None,
            cache: Mutex::new(AssetCache::Pinned(HashMap::new())),
            llm: LlmClient::new(Arc::new(HttpChatProvider::from_config(
                &LlmConfig::from_env(),
            ))),
        }
    }

    /// Replace the chat provider used by [`advance`](Store::advance).
    ///
    /// The default provider comes from [`LlmConfig::from_env`]; swap in a
    /// custom [`ChatProvider`] for other backends or for tests.
    pub fn with_chat_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.llm = LlmClient::new(provider);
        self
    }

    pub(crate) fn llm(&self) -> &LlmClient {
        &self.llm
    }

    /// Create the tables and indexes if they do not exist. Idempotent;
    /// no-op for the memory store.
    pub async fn init_schema(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::raw_sql(SCHEMA).execute(pool).await?;
        }
        Ok(())
    }

    /// Close the underlying connection pool (if any).
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    // -- Cache operations ---------------------------------------------------

    fn cached(&self, id: &Uuid) -> Option<CachedAsset> {
        self.cache.lock().expect("cache lock").get(id)
    }

    pub(crate) fn cache_asset(&self, asset: CachedAsset) {
        self.cache.lock().expect("cache lock").insert(asset);
    }

    fn evict(&self, id: &Uuid) {
        self.cache.lock().expect("cache lock").remove(id);
    }

    /// Drop every cached entry. Reads fall through to the database
    /// afterwards; the memory store loses everything, so this is mostly a
    /// testing aid for the relational-backed store.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("cache lock").clear();
    }

    // -- Load operations (cache, then database) -----------------------------

    pub(crate) async fn get_system_prompt(&self, id: Uuid) -> Result<Option<SystemPrompt>> {
        if let Some(CachedAsset::Prompt(p)) = self.cached(&id) {
            return Ok(Some(p));
        }
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        let row = sqlx::query("SELECT id, created_at, content FROM system_prompts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        match row {
            Some(row) => {
                let prompt = prompt_from_row(&row)?;
                self.cache_asset(CachedAsset::Prompt(prompt.clone()));
                Ok(Some(prompt))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        if let Some(CachedAsset::Conversation(c)) = self.cached(&id) {
            return Ok(Some(c));
        }
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        let row = sqlx::query("SELECT id, created_at, message_ids FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        match row {
            Some(row) => {
                let conversation = conversation_from_row(&row)?;
                self.cache_asset(CachedAsset::Conversation(conversation.clone()));
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    /// Load messages by id, cache-first, preserving input order.
    ///
    /// Any id that resolves neither from cache nor storage is a
    /// [`Error::MessageNotFound`].
    pub(crate) async fn get_messages(&self, ids: &[Uuid]) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<Uuid, Message> = HashMap::new();
        let mut to_load: Vec<Uuid> = Vec::new();

        for id in ids {
            match self.cached(id) {
                Some(CachedAsset::Message(m)) => {
                    by_id.insert(*id, m);
                }
                _ => to_load.push(*id),
            }
        }

        if let (false, Some(pool)) = (to_load.is_empty(), &self.pool) {
            let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
                "SELECT id, created_at, role, content, tool_calls, tool_call_id, \
                 input_tokens, output_tokens FROM messages WHERE id IN (",
            );
            let mut sep = qb.separated(", ");
            for id in &to_load {
                sep.push_bind(id.to_string());
            }
            qb.push(")");

            let rows = qb.build().fetch_all(pool).await?;
            for row in rows {
                let message = message_from_row(&row)?;
                self.cache_asset(CachedAsset::Message(message.clone()));
                by_id.insert(message.id, message);
            }
        }

        ids.iter()
            .map(|id| by_id.get(id).cloned().ok_or(Error::MessageNotFound(*id)))
            .collect()
    }

    pub(crate) async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        if let Some(CachedAsset::Agent(a)) = self.cached(&id) {
            return Ok(Some(a));
        }
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        match row {
            Some(row) => {
                let agent = agent_from_row(&row)?;
                self.cache_asset(CachedAsset::Agent(agent.clone()));
                Ok(Some(agent))
            }
            None => Ok(None),
        }
    }

    // -- Save operations ----------------------------------------------------

    async fn save_one(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        asset: &CachedAsset,
    ) -> Result<()> {
        match asset {
            CachedAsset::Prompt(p) => {
                sqlx::query(
                    "INSERT INTO system_prompts (id, created_at, content) VALUES (?, ?, ?) \
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(p.id.to_string())
                .bind(format_instant(p.created_at))
                .bind(&p.content)
                .execute(&mut **tx)
                .await?;
            }
            CachedAsset::Message(m) => {
                let tool_calls = m
                    .tool_calls
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                sqlx::query(
                    "INSERT INTO messages (id, created_at, role, content, tool_calls, \
                     tool_call_id, input_tokens, output_tokens) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO NOTHING",
                )
                .bind(m.id.to_string())
                .bind(format_instant(m.created_at))
                .bind(m.role.as_str())
                .bind(&m.content)
                .bind(tool_calls)
                .bind(&m.tool_call_id)
                .bind(m.input_tokens.map(|v| v as i64))
                .bind(m.output_tokens.map(|v| v as i64))
                .execute(&mut **tx)
                .await?;
            }
            CachedAsset::Conversation(c) => {
                sqlx::query(
                    "INSERT INTO conversations (id, created_at, message_ids) VALUES (?, ?, ?) \
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(c.id.to_string())
                .bind(format_instant(c.created_at))
                .bind(serde_json::to_string(&c.message_ids)?)
                .execute(&mut **tx)
                .await?;
            }
            CachedAsset::Agent(a) => {
                sqlx::query(
                    "INSERT INTO agents (id, created_at, name, system_prompt_id, parent_id, \
                     conversation_id, model, metadata, model_config) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO NOTHING",
                )
                .bind(a.id.to_string())
                .bind(format_instant(a.created_at))
                .bind(&a.name)
                .bind(a.system_prompt_id.to_string())
                .bind(a.parent_id.map(|id| id.to_string()))
                .bind(a.conversation_id.to_string())
                .bind(&a.model)
                .bind(serde_json::to_string(&a.metadata)?)
                .bind(serde_json::to_string(&a.model_config)?)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    /// Cascade-save an agent and its cached dependencies in one
    /// transaction.
    ///
    /// Dependencies are resolved from the cache: the system prompt, the
    /// conversation, and every cached message of that conversation are
    /// written before the agent row (foreign-key order). Assets absent
    /// from the cache are assumed to be persisted already. Every written
    /// asset is (re-)cached.
    pub(crate) async fn save_agent_cascade(&self, agent: &Agent) -> Result<()> {
        let mut batch: Vec<CachedAsset> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();

        {
            let mut cache = self.cache.lock().expect("cache lock");
            if let Some(CachedAsset::Prompt(p)) = cache.get(&agent.system_prompt_id) {
                if seen.insert(p.id) {
                    batch.push(CachedAsset::Prompt(p));
                }
            }
            if let Some(CachedAsset::Conversation(conv)) = cache.get(&agent.conversation_id) {
                // Messages first, then the conversation that references them.
                for message_id in &conv.message_ids {
                    if let Some(CachedAsset::Message(m)) = cache.get(message_id) {
                        if seen.insert(m.id) {
                            batch.push(CachedAsset::Message(m));
                        }
                    }
                }
                if seen.insert(conv.id) {
                    batch.push(CachedAsset::Conversation(conv));
                }
            }
        }
        batch.push(CachedAsset::Agent(agent.clone()));

        if let Some(pool) = &self.pool {
            let mut tx = pool.begin().await?;
            for asset in &batch {
                Self::save_one(&mut tx, asset).await?;
            }
            tx.commit().await?;
        }

        tracing::debug!(agent = %agent.id, assets = batch.len(), "cascade saved");

        for asset in batch {
            self.cache_asset(asset);
        }
        Ok(())
    }

    // -- Public API ---------------------------------------------------------

    /// Create a new agent with a fresh system prompt and an empty
    /// conversation, committed in one transaction.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when name, prompt content, or model is empty
    /// after trimming.
    pub async fn create_agent(&self, spec: AgentSpec) -> Result<Agent> {
        let prompt = SystemPrompt::new(spec.system_prompt)?;
        let conversation = Conversation::new();
        let agent = Agent::create(
            spec.name,
            &prompt,
            &conversation,
            spec.model,
            spec.metadata,
            spec.model_config,
        )?;

        // Cache first: the cascade save pulls dependencies from the cache.
        self.cache_asset(CachedAsset::Prompt(prompt));
        self.cache_asset(CachedAsset::Conversation(conversation));
        self.save_agent_cascade(&agent).await?;

        tracing::info!(agent = %agent.id, name = %agent.name, model = %agent.model, "agent created");
        Ok(agent)
    }

    /// Load an agent by id, cache-first.
    pub async fn load_agent(&self, id: Uuid) -> Result<Agent> {
        self.get_agent(id).await?.ok_or(Error::AgentNotFound(id))
    }

    /// Load several agents in one batch, preserving input order.
    ///
    /// # Errors
    ///
    /// [`Error::AgentNotFound`] for the first id that cannot be resolved.
    pub async fn load_agents(&self, ids: &[Uuid]) -> Result<Vec<Agent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<Uuid, Agent> = HashMap::new();
        let mut to_load: Vec<Uuid> = Vec::new();

        for id in ids {
            match self.cached(id) {
                Some(CachedAsset::Agent(a)) => {
                    by_id.insert(*id, a);
                }
                _ => to_load.push(*id),
            }
        }

        if let (false, Some(pool)) = (to_load.is_empty(), &self.pool) {
            let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
                sqlx::QueryBuilder::new(format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id IN ("));
            let mut sep = qb.separated(", ");
            for id in &to_load {
                sep.push_bind(id.to_string());
            }
            qb.push(")");

            let rows = qb.build().fetch_all(pool).await?;
            for row in rows {
                let agent = agent_from_row(&row)?;
                self.cache_asset(CachedAsset::Agent(agent.clone()));
                by_id.insert(agent.id, agent);
            }
        }

        ids.iter()
            .map(|id| by_id.get(id).cloned().ok_or(Error::AgentNotFound(*id)))
            .collect()
    }

    /// List agents newest-first with pagination and an optional
    /// case-insensitive substring filter on the name.
    pub async fn list_agents(
        &self,
        limit: u32,
        offset: u32,
        name: Option<&str>,
    ) -> Result<Vec<Agent>> {
        let Some(pool) = &self.pool else {
            let mut agents = self.filtered_cached_agents(name);
            agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            return Ok(agents
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect());
        };

        let rows = match name {
            // SQLite LIKE is case-insensitive for ASCII.
            Some(name) => {
                sqlx::query(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE name LIKE ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(format!("%{name}%"))
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(pool)
                .await?
            }
        };

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            let agent = agent_from_row(&row)?;
            self.cache_asset(CachedAsset::Agent(agent.clone()));
            agents.push(agent);
        }
        Ok(agents)
    }

    /// Count agents, optionally filtered like [`list_agents`](Store::list_agents).
    pub async fn count_agents(&self, name: Option<&str>) -> Result<u64> {
        let Some(pool) = &self.pool else {
            return Ok(self.filtered_cached_agents(name).len() as u64);
        };

        let count: i64 = match name {
            Some(name) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM agents WHERE name LIKE ?")
                    .bind(format!("%{name}%"))
                    .fetch_one(pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM agents")
                    .fetch_one(pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    /// Find agents by exact, case-sensitive name, newest first.
    pub async fn find_by_name(&self, name: &str) -> Result<Vec<Agent>> {
        let Some(pool) = &self.pool else {
            let mut agents: Vec<Agent> = self
                .cache
                .lock()
                .expect("cache lock")
                .agents()
                .into_iter()
                .filter(|a| a.name == name)
                .collect();
            agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            return Ok(agents);
        };

        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE name = ? ORDER BY created_at DESC"
        ))
        .bind(name)
        .fetch_all(pool)
        .await?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            let agent = agent_from_row(&row)?;
            self.cache_asset(CachedAsset::Agent(agent.clone()));
            agents.push(agent);
        }
        Ok(agents)
    }

    fn filtered_cached_agents(&self, name: Option<&str>) -> Vec<Agent> {
        let agents = self.cache.lock().expect("cache lock").agents();
        match name {
            Some(name) => {
                let needle = name.to_lowercase();
                agents
                    .into_iter()
                    .filter(|a| a.name.to_lowercase().contains(&needle))
                    .collect()
            }
            None => agents,
        }
    }

    /// Delete an agent row and evict it from the cache.
    ///
    /// Descendants keep existing; their stored `parent_id` becomes null
    /// via `ON DELETE SET NULL`. Handles already materialized in memory
    /// are not rewritten — reload to observe the change. Shared assets
    /// (prompt, conversation, messages) stay until [`gc`](Store::gc).
    pub async fn delete(&self, agent: &Agent) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(agent.id.to_string())
                .execute(pool)
                .await?;
        }
        self.evict(&agent.id);
        tracing::info!(agent = %agent.id, "agent deleted");
        Ok(())
    }

    /// Garbage-collect orphaned assets in one transaction.
    ///
    /// Deletes, in order: system prompts not referenced by any agent,
    /// conversations not referenced by any agent, and messages not
    /// reachable from any remaining conversation. Safe to call anytime;
    /// no-op for the memory store.
    pub async fn gc(&self) -> Result<GcCounts> {
        let Some(pool) = &self.pool else {
            return Ok(GcCounts::default());
        };

        let mut tx = pool.begin().await?;

        let system_prompts = sqlx::query(
            "DELETE FROM system_prompts \
             WHERE id NOT IN (SELECT system_prompt_id FROM agents)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let conversations = sqlx::query(
            "DELETE FROM conversations \
             WHERE id NOT IN (SELECT conversation_id FROM agents)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let messages = sqlx::query(
            "DELETE FROM messages WHERE id NOT IN (\
                 SELECT j.value FROM conversations AS c, json_each(c.message_ids) AS j\
             )",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let counts = GcCounts {
            system_prompts,
            conversations,
            messages,
        };
        tracing::info!(?counts, "gc finished");
        Ok(counts)
    }

    /// Root-to-current chain of ancestors for `agent`.
    ///
    /// On the relational backing this is a single recursive query; the
    /// memory store walks `parent_id` iteratively. A non-null ancestor
    /// reference that cannot be resolved is [`Error::AgentNotFound`] with
    /// the missing id.
    pub async fn lineage(&self, agent: &Agent) -> Result<Vec<Agent>> {
        let Some(pool) = &self.pool else {
            let mut lineage = vec![agent.clone()];
            let mut current = agent.clone();
            while let Some(parent_id) = current.parent_id {
                let parent = self
                    .get_agent(parent_id)
                    .await?
                    .ok_or(Error::AgentNotFound(parent_id))?;
                lineage.push(parent.clone());
                current = parent;
            }
            lineage.reverse();
            return Ok(lineage);
        };

        let rows = sqlx::query(&format!(
            "WITH RECURSIVE lineage AS (\
                 SELECT {AGENT_COLUMNS} FROM agents WHERE id = ? \
                 UNION ALL \
                 SELECT a.id, a.created_at, a.name, a.system_prompt_id, a.parent_id, \
                        a.conversation_id, a.model, a.metadata, a.model_config \
                 FROM agents a INNER JOIN lineage l ON a.id = l.parent_id\
             ) SELECT * FROM lineage"
        ))
        .bind(agent.id.to_string())
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            return Err(Error::AgentNotFound(agent.id));
        }

        // Rows come back child-first; reverse for root-first.
        let mut lineage = Vec::with_capacity(rows.len());
        for row in rows {
            let ancestor = agent_from_row(&row)?;
            self.cache_asset(CachedAsset::Agent(ancestor.clone()));
            lineage.push(ancestor);
        }
        lineage.reverse();

        // The walk must terminate at a root. A non-null parent here means
        // the referenced ancestor row is gone (stale handle).
        if let Some(missing) = lineage[0].parent_id {
            return Err(Error::AgentNotFound(missing));
        }
        Ok(lineage)
    }

    /// Clone an agent as a *sibling*: fresh id and timestamp, same parent,
    /// same conversation, prompt, model, metadata, and model config.
    ///
    /// Use this to branch: advance the original and the clone
    /// independently and their conversations diverge from the shared
    /// prefix.
    pub async fn clone_agent(&self, agent: &Agent) -> Result<Agent> {
        let clone = Agent::from_parts(
            new_id(),
            now_utc(),
            agent.name.clone(),
            agent.system_prompt_id,
            agent.parent_id,
            agent.conversation_id,
            agent.model.clone(),
            agent.metadata.clone(),
            agent.model_config.clone(),
        );
        self.save_agent_cascade(&clone).await?;
        tracing::info!(source = %agent.id, clone = %clone.id, "agent cloned");
        Ok(clone)
    }

    /// Derive a new agent with `metadata` replaced and everything else
    /// (including `model_config`) inherited. The new agent is a *child*:
    /// its `parent_id` is `agent.id`, so metadata changes are part of the
    /// lineage.
    pub async fn update_metadata(
        &self,
        agent: &Agent,
        metadata: Map<String, Value>,
    ) -> Result<Agent> {
        let updated = Agent::from_parts(
            new_id(),
            now_utc(),
            agent.name.clone(),
            agent.system_prompt_id,
            Some(agent.id),
            agent.conversation_id,
            agent.model.clone(),
            metadata,
            agent.model_config.clone(),
        );
        self.save_agent_cascade(&updated).await?;
        Ok(updated)
    }

    /// The agent's conversation asset.
    pub async fn conversation(&self, agent: &Agent) -> Result<Conversation> {
        self.get_conversation(agent.conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(agent.conversation_id))
    }

    /// All messages of the agent's conversation, in transcript order.
    pub async fn messages(&self, agent: &Agent) -> Result<Vec<Message>> {
        let conversation = self
            .get_conversation(agent.conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(agent.conversation_id))?;
        self.get_messages(&conversation.message_ids).await
    }

    /// Token usage summed over the assistant messages of the agent's
    /// conversation.
    pub async fn token_usage(&self, agent: &Agent) -> Result<TokenUsage> {
        let messages = self.messages(agent).await?;
        let mut usage = TokenUsage::default();
        for message in &messages {
            if message.role == MessageRole::Assistant {
                usage.input_tokens += u64::from(message.input_tokens.unwrap_or(0));
                usage.output_tokens += u64::from(message.output_tokens.unwrap_or(0));
            }
        }
        Ok(usage)
    }
}
