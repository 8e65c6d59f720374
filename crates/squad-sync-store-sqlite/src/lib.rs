#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use squad_sync_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ActorId, ChangeFeed, EngineConfig, EntityKind,
    FeedCursor, Notification, OptionId, OptionTally, Record, RecordBody, RecordDraft, RecordId,
    RecordSink, RecordSource, ScopeId, ScopeKey, ScopeSnapshot, StableId, SubscriptionId,
    SyncError,
};

const SQUAD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SQUAD_V1: &str = r"
CREATE TABLE IF NOT EXISTS engine_configs (
  config_version INTEGER PRIMARY KEY,
  config_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  kind TEXT NOT NULL CHECK (kind IN ('reaction', 'comment', 'vote')),
  scope_id TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  payload TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_scope_seq
  ON records(kind, scope_id, record_seq);
CREATE UNIQUE INDEX IF NOT EXISTS idx_records_single_choice
  ON records(kind, scope_id, actor_id, payload)
  WHERE kind IN ('reaction', 'vote');

CREATE TRIGGER IF NOT EXISTS trg_records_no_update
BEFORE UPDATE ON records
BEGIN
  SELECT RAISE(FAIL, 'records are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_records_votes_no_delete
BEFORE DELETE ON records
WHEN OLD.kind = 'vote'
BEGIN
  SELECT RAISE(FAIL, 'votes are append-only');
END;

CREATE TABLE IF NOT EXISTS vote_options (
  option_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  option_id TEXT NOT NULL UNIQUE,
  event_id TEXT NOT NULL,
  label TEXT NOT NULL,
  vote_count INTEGER NOT NULL DEFAULT 0 CHECK (vote_count >= 0)
);

CREATE INDEX IF NOT EXISTS idx_vote_options_event
  ON vote_options(event_id, option_seq);

CREATE TABLE IF NOT EXISTS feed_log (
  feed_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL CHECK (kind IN ('reaction', 'comment', 'vote')),
  scope_id TEXT NOT NULL,
  op TEXT NOT NULL CHECK (op IN ('created', 'deleted', 'tally_changed')),
  payload_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_feed_log_no_update
BEFORE UPDATE ON feed_log
BEGIN
  SELECT RAISE(FAIL, 'feed_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_feed_log_no_delete
BEFORE DELETE ON feed_log
BEGIN
  SELECT RAISE(FAIL, 'feed_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_feed_log_scope_seq
  ON feed_log(kind, scope_id, feed_seq);
";

/// Authoritative record store with an append-only change feed.
pub struct SqliteSquadStore {
    conn: Connection,
    config: EngineConfig,
    subscriptions: BTreeMap<u64, FeedSubscription>,
    next_subscription: u64,
}

#[derive(Debug, Clone)]
struct FeedSubscription {
    scope: ScopeKey,
    cursor: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FeedEntry {
    pub feed_seq: i64,
    pub recorded_at: String,
    pub notification: Notification,
}

impl SqliteSquadStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            config: EngineConfig::v1(),
            subscriptions: BTreeMap::new(),
            next_subscription: 1,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SQUAD_V1)
            .context("failed to apply squad schema")?;

        let now = format_rfc3339(now_utc()).context("failed to format timestamp")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SQUAD_MIGRATION_VERSION, now],
            )
            .context("failed to register squad schema migration")?;

        let default_config =
            serde_json::to_string(&EngineConfig::v1()).context("failed to serialize config")?;
        let now = format_rfc3339(now_utc()).context("failed to format timestamp")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO engine_configs(config_version, config_json, created_at)
                 VALUES (?1, ?2, ?3)",
                params![i64::from(EngineConfig::v1().config_version), default_config, now],
            )
            .context("failed to seed default engine config")?;

        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates, persists and activates `config`.
    pub fn set_config(&mut self, config: EngineConfig) -> Result<()> {
        self.upsert_config(&config)?;
        self.config = config;
        Ok(())
    }

    /// Activates the highest stored config version, if any.
    pub fn load_config(&mut self) -> Result<&EngineConfig> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM engine_configs ORDER BY config_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read engine config")?;

        if let Some(json) = stored {
            let value: Value = serde_json::from_str(&json).context("invalid stored config JSON")?;
            self.config = EngineConfig::from_json(&value)
                .context("failed to parse stored config")?;
        }
        Ok(&self.config)
    }

    pub fn upsert_config(&self, config: &EngineConfig) -> Result<()> {
        config
            .validate()
            .context("invalid engine configuration")?;

        let payload = serde_json::to_string(config).context("failed to serialize config")?;
        let now = format_rfc3339(now_utc()).context("failed to format timestamp")?;

        self.conn
            .execute(
                "INSERT INTO engine_configs(config_version, config_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(config_version) DO UPDATE SET
                   config_json = excluded.config_json,
                   created_at = excluded.created_at",
                params![i64::from(config.config_version), payload, now],
            )
            .context("failed to upsert engine config")?;

        Ok(())
    }

    /// Adds a voting option and announces it with a zero tally.
    pub fn add_option(&mut self, event_id: &ScopeId, label: &str) -> Result<OptionTally> {
        let label = label.trim();
        if label.is_empty() {
            return Err(anyhow!("option label MUST be non-empty"));
        }
        let tally = OptionTally {
            id: OptionId::generate(),
            event_id: event_id.clone(),
            label: label.to_string(),
            vote_count: 0,
        };

        let tx = self
            .conn
            .transaction()
            .context("failed to start option transaction")?;
        tx.execute(
            "INSERT INTO vote_options(option_id, event_id, label, vote_count)
             VALUES (?1, ?2, ?3, 0)",
            params![tally.id.to_string(), event_id.as_str(), tally.label],
        )
        .context("failed to insert vote option")?;
        append_feed(
            &tx,
            &Notification::TallyChanged {
                tally: tally.clone(),
            },
        )?;
        tx.commit().context("failed to commit option transaction")?;

        Ok(tally)
    }

    pub fn list_options(&self, event_id: &ScopeId) -> Result<Vec<OptionTally>> {
        list_options(&self.conn, event_id)
    }

    pub fn list_records(&self, scope: &ScopeKey) -> Result<Vec<Record>> {
        list_records(&self.conn, scope)
    }

    pub fn get_record(&self, id: StableId) -> Result<Option<Record>> {
        find_record(&self.conn, id)
    }

    /// Stores a draft, bumping the option counter for votes.
    ///
    /// The record, the counter update and their feed entries commit together.
    pub fn append_record(&mut self, draft: &RecordDraft) -> Result<Record> {
        let record = draft
            .clone()
            .into_record(RecordId::Stable(StableId::generate()));
        let created_at = format_rfc3339(record.base.created_at)
            .context("failed to format record timestamp")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start record transaction")?;

        tx.execute(
            "INSERT INTO records(record_id, kind, scope_id, actor_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.base.id.to_string(),
                record.kind().as_str(),
                record.base.scope_id.as_str(),
                record.base.actor_id.as_str(),
                record.body.payload_text(),
                created_at,
            ],
        )
        .context("failed to insert record")?;
        append_feed(
            &tx,
            &Notification::Created {
                record: record.clone(),
            },
        )?;

        if let RecordBody::Vote { option_id } = &record.body {
            let updated = tx
                .execute(
                    "UPDATE vote_options SET vote_count = vote_count + 1
                     WHERE option_id = ?1 AND event_id = ?2",
                    params![option_id.to_string(), record.base.scope_id.as_str()],
                )
                .context("failed to bump vote count")?;
            if updated != 1 {
                return Err(anyhow!(
                    "vote option {option_id} does not belong to {}",
                    record.base.scope_id
                ));
            }
            let tally = find_option(&tx, *option_id)?
                .ok_or_else(|| anyhow!("vote option {option_id} vanished during write"))?;
            append_feed(&tx, &Notification::TallyChanged { tally })?;
        }

        tx.commit().context("failed to commit record transaction")?;
        Ok(record)
    }

    /// Deletes a record, returning it. Absent ids produce no feed entry.
    pub fn remove_record(&mut self, id: StableId) -> Result<Option<Record>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start delete transaction")?;

        let Some(record) = find_record(&tx, id)? else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM records WHERE record_id = ?1",
            params![id.to_string()],
        )
        .context("failed to delete record")?;
        append_feed(
            &tx,
            &Notification::Deleted {
                kind: record.kind(),
                scope_id: record.base.scope_id.clone(),
                id,
            },
        )?;

        tx.commit().context("failed to commit delete transaction")?;
        Ok(Some(record))
    }

    pub fn latest_feed_seq(&self) -> Result<i64> {
        latest_feed_seq(&self.conn)
    }

    /// Feed entries across all scopes with `feed_seq > after_seq`.
    pub fn feed_since(&self, after_seq: i64, limit: usize) -> Result<Vec<FeedEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT feed_seq, recorded_at, payload_json
             FROM feed_log
             WHERE feed_seq > ?1
             ORDER BY feed_seq ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_seq, limit_to_sql(limit)], parse_feed_row)?;
        collect_rows(rows)
    }

    pub fn feed_for_scope(
        &self,
        scope: &ScopeKey,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<FeedEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT feed_seq, recorded_at, payload_json
             FROM feed_log
             WHERE kind = ?1 AND scope_id = ?2 AND feed_seq > ?3
             ORDER BY feed_seq ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                scope.kind.as_str(),
                scope.scope_id.as_str(),
                after_seq,
                limit_to_sql(limit)
            ],
            parse_feed_row,
        )?;
        collect_rows(rows)
    }

    fn snapshot(&mut self, scope: &ScopeKey) -> Result<ScopeSnapshot> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start fetch transaction")?;
        let records = list_records(&tx, scope)?;
        let tallies = if scope.kind == EntityKind::Vote {
            list_options(&tx, &scope.scope_id)?
        } else {
            Vec::new()
        };
        let cursor = latest_feed_seq(&tx)?;
        tx.commit().context("failed to finish fetch transaction")?;

        Ok(ScopeSnapshot {
            records,
            tallies,
            cursor: Some(FeedCursor(cursor)),
        })
    }

    fn check_draft(&self, draft: &RecordDraft) -> Result<(), SyncError> {
        let transient = |err: anyhow::Error| SyncError::TransientWrite(format!("{err:#}"));

        if let RecordBody::Vote { option_id } = &draft.body {
            let option = find_option(&self.conn, *option_id).map_err(transient)?;
            if option.map_or(true, |option| option.event_id != draft.scope_id) {
                return Err(SyncError::Validation(format!(
                    "unknown vote option {option_id} for event {}",
                    draft.scope_id
                )));
            }
        }

        if draft.body.kind() != EntityKind::Comment {
            let held: Option<i64> = self
                .conn
                .query_row(
                    "SELECT record_seq FROM records
                     WHERE kind = ?1 AND scope_id = ?2 AND actor_id = ?3 AND payload = ?4",
                    params![
                        draft.body.kind().as_str(),
                        draft.scope_id.as_str(),
                        draft.actor_id.as_str(),
                        draft.body.payload_text()
                    ],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| transient(err.into()))?;
            if held.is_some() {
                return Err(SyncError::Validation(format!(
                    "{} already holds {} in {}",
                    draft.actor_id,
                    draft.body.payload_text(),
                    draft.scope_key()
                )));
            }
        }

        Ok(())
    }
}

impl RecordSource for SqliteSquadStore {
    fn fetch(&mut self, scope: &ScopeKey) -> Result<ScopeSnapshot, SyncError> {
        self.snapshot(scope)
            .map_err(|err| SyncError::Fetch(format!("{err:#}")))
    }
}

impl RecordSink for SqliteSquadStore {
    fn write(&mut self, draft: &RecordDraft) -> Result<Record, SyncError> {
        let body = self.config.normalize_body(draft.body.clone())?;
        let draft = RecordDraft {
            body,
            ..draft.clone()
        };
        self.check_draft(&draft)?;
        let record = self
            .append_record(&draft)
            .map_err(|err| SyncError::TransientWrite(format!("{err:#}")))?;
        tracing::debug!(scope = %record.scope_key(), id = %record.id(), "record written");
        Ok(record)
    }

    fn delete(&mut self, id: StableId) -> Result<(), SyncError> {
        let existing = find_record(&self.conn, id)
            .map_err(|err| SyncError::TransientWrite(format!("{err:#}")))?;
        if existing.is_some_and(|record| record.kind() == EntityKind::Vote) {
            return Err(SyncError::Validation(
                "votes are append-only and cannot be removed".to_string(),
            ));
        }
        self.remove_record(id)
            .map(|_| ())
            .map_err(|err| SyncError::TransientWrite(format!("{err:#}")))
    }
}

impl ChangeFeed for SqliteSquadStore {
    fn subscribe(
        &mut self,
        scope: &ScopeKey,
        after: Option<FeedCursor>,
    ) -> Result<SubscriptionId, SyncError> {
        let cursor = match after {
            Some(FeedCursor(seq)) => seq,
            None => latest_feed_seq(&self.conn)
                .map_err(|err| SyncError::Subscription(format!("{err:#}")))?,
        };
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscriptions.insert(
            id,
            FeedSubscription {
                scope: scope.clone(),
                cursor,
            },
        );
        tracing::debug!(%scope, subscription = id, cursor, "feed subscription opened");
        Ok(SubscriptionId(id))
    }

    fn poll(&mut self, subscription: SubscriptionId) -> Result<Vec<Notification>, SyncError> {
        let state = self
            .subscriptions
            .get(&subscription.0)
            .cloned()
            .ok_or_else(|| {
                SyncError::Subscription(format!("unknown subscription {}", subscription.0))
            })?;
        let entries = self
            .feed_for_scope(&state.scope, state.cursor, self.config.feed_poll_limit)
            .map_err(|err| SyncError::Subscription(format!("{err:#}")))?;

        if let (Some(last), Some(tracked)) =
            (entries.last(), self.subscriptions.get_mut(&subscription.0))
        {
            tracked.cursor = last.feed_seq;
        }
        Ok(entries.into_iter().map(|entry| entry.notification).collect())
    }

    fn close(&mut self, subscription: SubscriptionId) {
        self.subscriptions.remove(&subscription.0);
    }
}

fn append_feed(conn: &Connection, notification: &Notification) -> Result<i64> {
    let scope = notification.scope_key();
    let payload =
        serde_json::to_string(notification).context("failed to serialize feed notification")?;
    let now = format_rfc3339(now_utc()).context("failed to format timestamp")?;
    conn.execute(
        "INSERT INTO feed_log(kind, scope_id, op, payload_json, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            scope.kind.as_str(),
            scope.scope_id.as_str(),
            notification.op_name(),
            payload,
            now
        ],
    )
    .context("failed to append feed entry")?;
    Ok(conn.last_insert_rowid())
}

fn latest_feed_seq(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(feed_seq), 0) FROM feed_log", [], |row| {
        row.get(0)
    })
    .context("failed to read latest feed sequence")
}

fn list_records(conn: &Connection, scope: &ScopeKey) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(
        "SELECT record_id, kind, scope_id, actor_id, payload, created_at
         FROM records
         WHERE kind = ?1 AND scope_id = ?2
         ORDER BY record_seq ASC",
    )?;
    let rows = stmt.query_map(
        params![scope.kind.as_str(), scope.scope_id.as_str()],
        parse_record_row,
    )?;
    collect_rows(rows)
}

fn find_record(conn: &Connection, id: StableId) -> Result<Option<Record>> {
    conn.query_row(
        "SELECT record_id, kind, scope_id, actor_id, payload, created_at
         FROM records
         WHERE record_id = ?1",
        params![id.to_string()],
        parse_record_row,
    )
    .optional()
    .context("failed to read record")
}

fn list_options(conn: &Connection, event_id: &ScopeId) -> Result<Vec<OptionTally>> {
    let mut stmt = conn.prepare(
        "SELECT option_id, event_id, label, vote_count
         FROM vote_options
         WHERE event_id = ?1
         ORDER BY option_seq ASC",
    )?;
    let rows = stmt.query_map(params![event_id.as_str()], parse_option_row)?;
    collect_rows(rows)
}

fn find_option(conn: &Connection, id: OptionId) -> Result<Option<OptionTally>> {
    conn.query_row(
        "SELECT option_id, event_id, label, vote_count
         FROM vote_options
         WHERE option_id = ?1",
        params![id.to_string()],
        parse_option_row,
    )
    .optional()
    .context("failed to read vote option")
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(index: usize, err: SyncError) -> rusqlite::Error {
    invalid_column(index, rusqlite::types::Type::Text, err.to_string())
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let id_raw: String = row.get(0)?;
    let kind_raw: String = row.get(1)?;
    let scope_raw: String = row.get(2)?;
    let actor_raw: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let created_at_raw: String = row.get(5)?;

    let kind = EntityKind::parse(&kind_raw).ok_or_else(|| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid kind: {kind_raw}"),
        )
    })?;
    let body = RecordBody::from_parts(kind, &payload).map_err(|err| to_sql_error(4, err))?;
    let draft = RecordDraft {
        scope_id: ScopeId::new(scope_raw).map_err(|err| to_sql_error(2, err))?,
        actor_id: ActorId::new(actor_raw).map_err(|err| to_sql_error(3, err))?,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(5, err))?,
        body,
    };
    let id = StableId::parse(&id_raw).map_err(|err| to_sql_error(0, err))?;

    Ok(draft.into_record(RecordId::Stable(id)))
}

fn parse_option_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OptionTally> {
    let id_raw: String = row.get(0)?;
    let event_raw: String = row.get(1)?;
    let label: String = row.get(2)?;
    let vote_count_i64: i64 = row.get(3)?;

    let vote_count = u32::try_from(vote_count_i64).map_err(|_| {
        invalid_column(
            3,
            rusqlite::types::Type::Integer,
            format!("invalid vote_count: {vote_count_i64}"),
        )
    })?;

    Ok(OptionTally {
        id: OptionId::parse(&id_raw).map_err(|err| to_sql_error(0, err))?,
        event_id: ScopeId::new(event_raw).map_err(|err| to_sql_error(1, err))?,
        label,
        vote_count,
    })
}

fn parse_feed_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedEntry> {
    let payload_json: String = row.get(2)?;
    let notification = serde_json::from_str(&payload_json).map_err(|err| {
        invalid_column(
            2,
            rusqlite::types::Type::Text,
            format!("invalid feed payload: {err}"),
        )
    })?;

    Ok(FeedEntry {
        feed_seq: row.get(0)?,
        recorded_at: row.get(1)?,
        notification,
    })
}

fn limit_to_sql(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
