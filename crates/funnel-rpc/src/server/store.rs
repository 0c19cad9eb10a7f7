//! SQLite-backed state store behind the RPC surface.
//!
//! Owns tenants, leads, conversations, messages and CTAs. The worker side
//! never opens this database; every mutation below maps 1:1 to an RPC route.

use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use funnel_core::config::{FollowupBucket, ROLLING_SUMMARY_MAX_CHARS};
use funnel_core::types::{
    Conversation, ConversationMode, Cta, IntentLevel, Message, MessageOrigin, Sentiment, Stage,
    Tenant,
};

use crate::types::{
    ConversationContext, ConversationPatch, IncomingMessage, IncomingOutcome, OutgoingMessage,
    ResetStats,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{what} not found")]
    NotFound { what: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct ConversationStore {
    db: Mutex<Connection>,
}

impl ConversationStore {
    pub fn open(path: &str) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // ── tenants ──────────────────────────────────────────────────────────────

    /// Tenants are provisioned outside the core; this exists for operations
    /// tooling and tests.
    pub fn create_tenant(
        &self,
        name: &str,
        phone_number_id: &str,
        access_token: &str,
        persona: &str,
    ) -> Result<Tenant> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO tenants (name, phone_number_id, access_token, persona, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![name, phone_number_id, access_token, persona, now],
        )?;
        let id = db.last_insert_rowid();
        info!(tenant_id = id, %name, "tenant created");
        Ok(Tenant {
            id,
            name: name.to_string(),
            phone_number_id: phone_number_id.to_string(),
            access_token: access_token.to_string(),
            persona: persona.to_string(),
            created_at: now,
        })
    }

    pub fn tenant_by_phone_number_id(&self, pnid: &str) -> Result<Tenant> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, name, phone_number_id, access_token, persona, created_at
             FROM tenants WHERE phone_number_id = ?1",
            [pnid],
            row_to_tenant,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: format!("tenant with phone_number_id {pnid}"),
        })
    }

    pub fn tenant_by_id(&self, id: i64) -> Result<Tenant> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, name, phone_number_id, access_token, persona, created_at
             FROM tenants WHERE id = ?1",
            [id],
            row_to_tenant,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: format!("tenant {id}"),
        })
    }

    pub fn create_cta(
        &self,
        tenant_id: i64,
        name: &str,
        description: &str,
        link: &str,
    ) -> Result<Cta> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO ctas (tenant_id, name, description, link) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![tenant_id, name, description, link],
        )?;
        Ok(Cta {
            id: db.last_insert_rowid(),
            tenant_id,
            name: name.to_string(),
            description: description.to_string(),
            link: link.to_string(),
        })
    }

    // ── conversations ────────────────────────────────────────────────────────

    /// Resolve (tenant, phone) to a conversation, creating the lead and the
    /// conversation on first contact.
    pub fn conversation_by_phone(&self, tenant_id: i64, phone: &str) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();

        let lead_id: i64 = match db
            .query_row(
                "SELECT id FROM leads WHERE tenant_id = ?1 AND phone = ?2",
                rusqlite::params![tenant_id, phone],
                |row| row.get(0),
            )
            .optional()?
        {
            Some(id) => id,
            None => {
                db.execute(
                    "INSERT INTO leads (tenant_id, phone, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![tenant_id, phone, now],
                )?;
                let id = db.last_insert_rowid();
                info!(tenant_id, lead_id = id, %phone, "lead created");
                id
            }
        };

        if let Some(conv) = db
            .query_row(
                &format!("{CONVERSATION_COLUMNS} WHERE lead_id = ?1"),
                [lead_id],
                row_to_conversation,
            )
            .optional()?
        {
            return Ok(conv);
        }

        db.execute(
            "INSERT INTO conversations
             (tenant_id, lead_id, mode, stage, intent_level, user_sentiment,
              rolling_summary, followup_count_24h, total_nudges,
              needs_human_attention, created_at, updated_at)
             VALUES (?1, ?2, 'bot', 'greeting', 'unknown', 'neutral', '', 0, 0, 0, ?3, ?3)",
            rusqlite::params![tenant_id, lead_id, now],
        )?;
        let id = db.last_insert_rowid();
        info!(tenant_id, conversation_id = id, "conversation created");
        db.query_row(
            &format!("{CONVERSATION_COLUMNS} WHERE id = ?1"),
            [id],
            row_to_conversation,
        )
        .map_err(Into::into)
    }

    pub fn get_conversation(&self, id: i64) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("{CONVERSATION_COLUMNS} WHERE id = ?1"),
            [id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: format!("conversation {id}"),
        })
    }

    pub fn patch_conversation(&self, id: i64, patch: &ConversationPatch) -> Result<Conversation> {
        {
            let db = self.db.lock().unwrap();
            let now = chrono::Utc::now().to_rfc3339();
            let mut sets: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(stage) = patch.stage {
                sets.push(format!("stage = ?{}", params.len() + 1));
                params.push(Box::new(stage.as_str().to_string()));
            }
            if let Some(intent) = patch.intent_level {
                sets.push(format!("intent_level = ?{}", params.len() + 1));
                params.push(Box::new(intent.as_str().to_string()));
            }
            if let Some(sentiment) = patch.user_sentiment {
                sets.push(format!("user_sentiment = ?{}", params.len() + 1));
                params.push(Box::new(sentiment.as_str().to_string()));
            }
            if let Some(mode) = patch.mode {
                sets.push(format!("mode = ?{}", params.len() + 1));
                params.push(Box::new(mode.as_str().to_string()));
            }
            if let Some(ref summary) = patch.rolling_summary {
                let mut s = summary.clone();
                if s.len() > ROLLING_SUMMARY_MAX_CHARS {
                    s.truncate(ROLLING_SUMMARY_MAX_CHARS);
                }
                sets.push(format!("rolling_summary = ?{}", params.len() + 1));
                params.push(Box::new(s));
            }
            if let Some(attention) = patch.needs_human_attention {
                sets.push(format!("needs_human_attention = ?{}", params.len() + 1));
                params.push(Box::new(attention as i64));
            }
            if let Some(cta) = patch.active_cta_id {
                sets.push(format!("active_cta_id = ?{}", params.len() + 1));
                params.push(Box::new(cta));
            }

            if !sets.is_empty() {
                sets.push(format!("updated_at = ?{}", params.len() + 1));
                params.push(Box::new(now));
                params.push(Box::new(id));
                let sql = format!(
                    "UPDATE conversations SET {} WHERE id = ?{}",
                    sets.join(", "),
                    params.len()
                );
                let n = db.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
                if n == 0 {
                    return Err(StoreError::NotFound {
                        what: format!("conversation {id}"),
                    });
                }
                debug!(conversation_id = id, fields = sets.len() - 1, "conversation patched");
            }
        }
        self.get_conversation(id)
    }

    pub fn context(&self, id: i64, last_messages: u32) -> Result<ConversationContext> {
        let conversation = self.get_conversation(id)?;
        let tenant = self.tenant_by_id(conversation.tenant_id)?;
        let db = self.db.lock().unwrap();

        let lead_phone: String = db
            .query_row(
                "SELECT phone FROM leads WHERE id = ?1",
                [conversation.lead_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                what: format!("lead {}", conversation.lead_id),
            })?;

        let mut stmt = db.prepare_cached(
            "SELECT id, conversation_id, origin, content, provider_message_id, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut messages: Vec<Message> = stmt
            .query_map(rusqlite::params![id, last_messages], row_to_message)?
            .collect::<rusqlite::Result<_>>()?;
        messages.reverse(); // oldest first

        let mut stmt = db.prepare_cached(
            "SELECT id, tenant_id, name, description, link FROM ctas WHERE tenant_id = ?1",
        )?;
        let ctas: Vec<Cta> = stmt
            .query_map([conversation.tenant_id], |row| {
                Ok(Cta {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    link: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(ConversationContext {
            conversation,
            tenant_name: tenant.name,
            tenant_persona: tenant.persona,
            lead_phone,
            messages,
            ctas,
        })
    }

    // ── messages ─────────────────────────────────────────────────────────────

    /// Idempotent on provider_message_id: redelivered queue entries write
    /// nothing and report `duplicate = true`.
    pub fn insert_incoming(&self, msg: &IncomingMessage) -> Result<IncomingOutcome> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "INSERT OR IGNORE INTO messages
             (conversation_id, origin, content, provider_message_id, created_at)
             VALUES (?1, 'lead', ?2, ?3, ?4)",
            rusqlite::params![msg.conversation_id, msg.content, msg.provider_message_id, now],
        )?;
        if n == 0 {
            debug!(
                conversation_id = msg.conversation_id,
                provider_message_id = %msg.provider_message_id,
                "duplicate inbound message ignored"
            );
            return Ok(IncomingOutcome {
                message_id: None,
                duplicate: true,
            });
        }
        let message_id = db.last_insert_rowid();
        db.execute(
            "UPDATE conversations SET last_user_message_at = ?1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, msg.conversation_id],
        )?;
        Ok(IncomingOutcome {
            message_id: Some(message_id),
            duplicate: false,
        })
    }

    pub fn insert_outgoing(&self, msg: &OutgoingMessage) -> Result<Message> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO messages (conversation_id, origin, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![msg.conversation_id, msg.origin.as_str(), msg.content, now],
        )?;
        let id = db.last_insert_rowid();
        if msg.origin != MessageOrigin::Lead {
            db.execute(
                "UPDATE conversations SET last_bot_message_at = ?1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, msg.conversation_id],
            )?;
        }
        Ok(Message {
            id,
            conversation_id: msg.conversation_id,
            origin: msg.origin,
            content: msg.content.clone(),
            provider_message_id: None,
            created_at: now,
        })
    }

    // ── follow-ups ───────────────────────────────────────────────────────────

    /// Conversations whose last bot message falls inside one of the buckets
    /// and whose prior follow-up count equals the bucket's requirement.
    ///
    /// HUMAN-mode, terminal-stage and flagged conversations never match, and
    /// only conversations where the bot spoke last are considered. The 24 h
    /// counter semantics are read-side: every bucket closes well inside 24 h,
    /// so the stored counter is compared as-is and nothing is ever zeroed.
    pub fn due_followups(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        buckets: &[FollowupBucket],
    ) -> Result<Vec<Conversation>> {
        if buckets.is_empty() {
            return Ok(Vec::new());
        }
        let bucket_clauses: Vec<String> = buckets
            .iter()
            .map(|b| {
                format!(
                    "(elapsed_minutes BETWEEN {} AND {} AND followup_count_24h = {})",
                    b.min_minutes, b.max_minutes, b.required_prior
                )
            })
            .collect();
        // c.* matches the table column order row_to_conversation expects;
        // the trailing elapsed_minutes column is ignored by the mapper.
        let sql = format!(
            "SELECT * FROM (
                SELECT c.*,
                       (julianday(?1) - julianday(c.last_bot_message_at)) * 1440.0
                           AS elapsed_minutes
                FROM conversations c
                WHERE c.mode = 'bot'
                  AND c.stage NOT IN ('closed', 'lost', 'ghosted')
                  AND c.needs_human_attention = 0
                  AND c.last_bot_message_at IS NOT NULL
                  AND (c.last_user_message_at IS NULL
                       OR c.last_user_message_at <= c.last_bot_message_at)
            ) WHERE {}",
            bucket_clauses.join(" OR ")
        );

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let rows: Vec<Conversation> = stmt
            .query_map([now.to_rfc3339()], row_to_conversation)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    /// Atomic server-side increment — the only way the nudge counters move.
    pub fn increment_nudge(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations
             SET followup_count_24h = followup_count_24h + 1,
                 total_nudges = total_nudges + 1,
                 updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![chrono::Utc::now().to_rfc3339(), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("conversation {id}"),
            });
        }
        Ok(())
    }

    // ── admin ────────────────────────────────────────────────────────────────

    pub fn reset_state(&self) -> Result<ResetStats> {
        let db = self.db.lock().unwrap();
        let messages_deleted = db.execute("DELETE FROM messages", [])?;
        let conversations_deleted = db.execute("DELETE FROM conversations", [])?;
        let leads_deleted = db.execute("DELETE FROM leads", [])?;
        info!(
            conversations_deleted,
            messages_deleted, leads_deleted, "state reset"
        );
        Ok(ResetStats {
            conversations_deleted,
            messages_deleted,
            leads_deleted,
        })
    }
}

const CONVERSATION_COLUMNS: &str = "SELECT id, tenant_id, lead_id, mode, stage, intent_level,
        user_sentiment, rolling_summary, last_user_message_at, last_bot_message_at,
        followup_count_24h, total_nudges, needs_human_attention, active_cta_id,
        created_at, updated_at
 FROM conversations";

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        phone_number_id: row.get(2)?,
        access_token: row.get(3)?,
        persona: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let mode: String = row.get(3)?;
    let stage: String = row.get(4)?;
    let intent: String = row.get(5)?;
    let sentiment: String = row.get(6)?;
    Ok(Conversation {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        lead_id: row.get(2)?,
        mode: mode.parse().unwrap_or(ConversationMode::Bot),
        stage: stage.parse().unwrap_or(Stage::Greeting),
        intent_level: intent.parse().unwrap_or(IntentLevel::Unknown),
        user_sentiment: sentiment.parse().unwrap_or(Sentiment::Neutral),
        rolling_summary: row.get(7)?,
        last_user_message_at: row.get(8)?,
        last_bot_message_at: row.get(9)?,
        followup_count_24h: row.get(10)?,
        total_nudges: row.get(11)?,
        needs_human_attention: row.get::<_, i64>(12)? != 0,
        active_cta_id: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let origin: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        origin: origin.parse().unwrap_or(MessageOrigin::Lead),
        content: row.get(3)?,
        provider_message_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenants (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            name             TEXT NOT NULL,
            phone_number_id  TEXT NOT NULL UNIQUE,
            access_token     TEXT NOT NULL,
            persona          TEXT NOT NULL DEFAULT '',
            created_at       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS leads (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id   INTEGER NOT NULL,
            phone       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(tenant_id, phone)
        );
        CREATE TABLE IF NOT EXISTS conversations (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id              INTEGER NOT NULL,
            lead_id                INTEGER NOT NULL UNIQUE,
            mode                   TEXT NOT NULL DEFAULT 'bot',
            stage                  TEXT NOT NULL DEFAULT 'greeting',
            intent_level           TEXT NOT NULL DEFAULT 'unknown',
            user_sentiment         TEXT NOT NULL DEFAULT 'neutral',
            rolling_summary        TEXT NOT NULL DEFAULT '',
            last_user_message_at   TEXT,
            last_bot_message_at    TEXT,
            followup_count_24h     INTEGER NOT NULL DEFAULT 0,
            total_nudges           INTEGER NOT NULL DEFAULT 0,
            needs_human_attention  INTEGER NOT NULL DEFAULT 0,
            active_cta_id          INTEGER,
            created_at             TEXT NOT NULL,
            updated_at             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_tenant
            ON conversations(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_conversations_last_bot
            ON conversations(last_bot_message_at);
        CREATE TABLE IF NOT EXISTS messages (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id       INTEGER NOT NULL,
            origin                TEXT NOT NULL,
            content               TEXT NOT NULL,
            provider_message_id   TEXT UNIQUE,
            created_at            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, id);
        CREATE TABLE IF NOT EXISTS ctas (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id   INTEGER NOT NULL,
            name        TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            link        TEXT NOT NULL DEFAULT ''
        );",
    )?;
    Ok(())
}
