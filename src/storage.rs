use crate::api::models::{
    ChipPair, Connection, ConnectionStatus, Message, Prompt, RunStatus, Usage,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection as DbConnection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA: &str = r#"
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS connections (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        status TEXT NOT NULL,
        phone TEXT NOT NULL,
        instance_name TEXT NOT NULL,
        qr_code TEXT,
        profile_name TEXT,
        ai_model TEXT,
        last_active TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS chip_pairs (
        id TEXT PRIMARY KEY,
        first_chip_id TEXT NOT NULL REFERENCES connections(id),
        second_chip_id TEXT NOT NULL REFERENCES connections(id),
        is_active INTEGER NOT NULL,
        messages_count INTEGER NOT NULL DEFAULT 0,
        last_activity TEXT NOT NULL,
        status TEXT NOT NULL,
        use_instance_prompt INTEGER NOT NULL DEFAULT 0,
        instance_prompt TEXT,
        CHECK (first_chip_id <> second_chip_id)
    );
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        pair_id TEXT NOT NULL,
        from_chip_id TEXT NOT NULL,
        from_chip_name TEXT NOT NULL,
        to_chip_id TEXT NOT NULL,
        to_chip_name TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        model TEXT NOT NULL,
        usage_json TEXT,
        gateway_message_id TEXT
    );
    CREATE INDEX IF NOT EXISTS messages_by_pair ON messages(pair_id);
    CREATE TABLE IF NOT EXISTS prompts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        content TEXT NOT NULL,
        category TEXT NOT NULL,
        is_global INTEGER NOT NULL DEFAULT 0
    );
"#;

const PAIR_SELECT: &str = r#"
    SELECT p.id, p.first_chip_id, c1.name, p.second_chip_id, c2.name,
           p.is_active, p.messages_count, p.last_activity, p.status,
           p.use_instance_prompt, p.instance_prompt
    FROM chip_pairs p
    JOIN connections c1 ON c1.id = p.first_chip_id
    JOIN connections c2 ON c2.id = p.second_chip_id
"#;

const CONNECTION_SELECT: &str = r#"
    SELECT id, name, status, phone, instance_name, qr_code, profile_name, last_active, ai_model,
           (SELECT COUNT(*) FROM messages m WHERE m.from_chip_id = connections.id)
    FROM connections
"#;

const MESSAGE_COLUMNS: &str = "id, pair_id, from_chip_id, from_chip_name, to_chip_id, to_chip_name, \
     content, timestamp, model, usage_json, gateway_message_id";

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn bad_column(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown {what} '{raw}'").into())
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<Connection> {
    let status: String = row.get(2)?;
    let sent: i64 = row.get(9)?;
    Ok(Connection {
        id: row.get(0)?,
        name: row.get(1)?,
        status: ConnectionStatus::parse(&status).ok_or_else(|| bad_column(2, "status", &status))?,
        phone: row.get(3)?,
        instance_name: row.get(4)?,
        qr_code: row.get(5)?,
        profile_name: row.get(6)?,
        ai_model: row.get(8)?,
        conversations_count: sent.max(0) as u64,
        last_active: row.get(7)?,
    })
}

fn pair_from_row(row: &Row<'_>) -> rusqlite::Result<ChipPair> {
    let status: String = row.get(8)?;
    let count: i64 = row.get(6)?;
    Ok(ChipPair {
        id: row.get(0)?,
        first_chip_id: row.get(1)?,
        first_chip_name: row.get(2)?,
        second_chip_id: row.get(3)?,
        second_chip_name: row.get(4)?,
        is_active: row.get(5)?,
        messages_count: count.max(0) as u64,
        last_activity: row.get(7)?,
        status: RunStatus::parse(&status).ok_or_else(|| bad_column(8, "run status", &status))?,
        use_instance_prompt: row.get(9)?,
        instance_prompt: row.get(10)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let usage_json: Option<String> = row.get(9)?;
    let usage = usage_json.and_then(|raw| serde_json::from_str::<Usage>(&raw).ok());
    Ok(Message {
        id: row.get(0)?,
        pair_id: row.get(1)?,
        from_chip_id: row.get(2)?,
        from_chip_name: row.get(3)?,
        to_chip_id: row.get(4)?,
        to_chip_name: row.get(5)?,
        content: row.get(6)?,
        timestamp: row.get(7)?,
        model: row.get(8)?,
        usage,
        gateway_message_id: row.get(10)?,
    })
}

fn prompt_from_row(row: &Row<'_>) -> rusqlite::Result<Prompt> {
    Ok(Prompt {
        id: row.get(0)?,
        name: row.get(1)?,
        content: row.get(2)?,
        category: row.get(3)?,
        is_global: row.get(4)?,
    })
}

/// SQLite-backed store. Each call opens its own connection, so the handle is
/// cheap to clone and share between the registries and the scheduler.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        ensure_dir(&store.path)?;
        store.open_conn()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    fn open_conn(&self) -> Result<DbConnection> {
        let conn = DbConnection::open(&self.path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    // Connections

    pub fn insert_connection(&self, c: &Connection) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
            INSERT INTO connections (id, name, status, phone, instance_name, qr_code, profile_name,
                                     last_active, ai_model)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                c.id,
                c.name,
                c.status.as_str(),
                c.phone,
                c.instance_name,
                c.qr_code,
                c.profile_name,
                c.last_active,
                c.ai_model
            ],
        )?;
        Ok(())
    }

    pub fn update_connection(&self, c: &Connection) -> Result<()> {
        let conn = self.open_conn()?;
        let changed = conn.execute(
            r#"
            UPDATE connections SET
                name = ?2, status = ?3, phone = ?4, instance_name = ?5,
                qr_code = ?6, profile_name = ?7, last_active = ?8, ai_model = ?9
            WHERE id = ?1
            "#,
            params![
                c.id,
                c.name,
                c.status.as_str(),
                c.phone,
                c.instance_name,
                c.qr_code,
                c.profile_name,
                c.last_active,
                c.ai_model
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("connection {}", c.id)));
        }
        Ok(())
    }

    pub fn delete_connection(&self, id: &str) -> Result<bool> {
        let conn = self.open_conn()?;
        Ok(conn.execute("DELETE FROM connections WHERE id = ?1", params![id])? > 0)
    }

    pub fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(&format!("{CONNECTION_SELECT} WHERE id = ?1"))?;
        Ok(stmt.query_row(params![id], connection_from_row).optional()?)
    }

    pub fn list_connections(&self) -> Result<Vec<Connection>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(&format!("{CONNECTION_SELECT} ORDER BY name ASC"))?;
        let rows = stmt.query_map([], connection_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Case-insensitive, optionally ignoring one row (the one being renamed).
    pub fn connection_name_taken(&self, name: &str, except_id: Option<&str>) -> Result<bool> {
        let conn = self.open_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM connections WHERE name = ?1 COLLATE NOCASE AND id <> ?2",
            params![name.trim(), except_id.unwrap_or("")],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Pairs

    pub fn insert_pair(&self, p: &ChipPair) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
            INSERT INTO chip_pairs (id, first_chip_id, second_chip_id, is_active, messages_count,
                                    last_activity, status, use_instance_prompt, instance_prompt)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                p.id,
                p.first_chip_id,
                p.second_chip_id,
                p.is_active,
                p.messages_count as i64,
                p.last_activity,
                p.status.as_str(),
                p.use_instance_prompt,
                p.instance_prompt
            ],
        )?;
        Ok(())
    }

    /// Writes the operator-controlled fields; counters are owned by [`Store::record_turn`].
    pub fn update_pair_settings(&self, p: &ChipPair) -> Result<()> {
        let conn = self.open_conn()?;
        let changed = conn.execute(
            r#"
            UPDATE chip_pairs SET
                is_active = ?2, status = ?3, use_instance_prompt = ?4, instance_prompt = ?5
            WHERE id = ?1
            "#,
            params![
                p.id,
                p.is_active,
                p.status.as_str(),
                p.use_instance_prompt,
                p.instance_prompt
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("pair {}", p.id)));
        }
        Ok(())
    }

    pub fn set_pair_status(&self, id: &str, status: RunStatus) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "UPDATE chip_pairs SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_pair(&self, id: &str) -> Result<bool> {
        let conn = self.open_conn()?;
        Ok(conn.execute("DELETE FROM chip_pairs WHERE id = ?1", params![id])? > 0)
    }

    pub fn get_pair(&self, id: &str) -> Result<Option<ChipPair>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(&format!("{PAIR_SELECT} WHERE p.id = ?1"))?;
        Ok(stmt.query_row(params![id], pair_from_row).optional()?)
    }

    pub fn list_pairs(&self) -> Result<Vec<ChipPair>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(&format!("{PAIR_SELECT} ORDER BY p.rowid ASC"))?;
        let rows = stmt.query_map([], pair_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Whether the two chips are already paired, in either order.
    pub fn pair_exists_between(&self, a: &str, b: &str) -> Result<bool> {
        let conn = self.open_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chip_pairs
             WHERE (first_chip_id = ?1 AND second_chip_id = ?2)
                OR (first_chip_id = ?2 AND second_chip_id = ?1)",
            params![a, b],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn pairs_referencing(&self, connection_id: &str) -> Result<usize> {
        let conn = self.open_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chip_pairs WHERE first_chip_id = ?1 OR second_chip_id = ?1",
            params![connection_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // Messages

    /// Appends the message and bumps its pair's counter in one transaction.
    pub fn record_turn(&self, m: &Message) -> Result<()> {
        let usage = m.usage.as_ref().map(serde_json::to_string).transpose()?;
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                m.id,
                m.pair_id,
                m.from_chip_id,
                m.from_chip_name,
                m.to_chip_id,
                m.to_chip_name,
                m.content,
                m.timestamp,
                m.model,
                usage,
                m.gateway_message_id
            ],
        )?;
        let changed = tx.execute(
            "UPDATE chip_pairs SET messages_count = messages_count + 1, last_activity = ?2 WHERE id = ?1",
            params![m.pair_id, m.timestamp],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("pair {}", m.pair_id)));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn last_sender(&self, pair_id: &str) -> Result<Option<String>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            "SELECT from_chip_id FROM messages WHERE pair_id = ?1 ORDER BY rowid DESC LIMIT 1",
        )?;
        Ok(stmt.query_row(params![pair_id], |row| row.get(0)).optional()?)
    }

    /// The latest `limit` messages of a pair, oldest first.
    pub fn recent_messages(&self, pair_id: &str, limit: usize) -> Result<Vec<Message>> {
        let mut out = self.query_messages(pair_id, Some(limit))?;
        out.reverse();
        Ok(out)
    }

    /// Every message of a pair, newest first.
    pub fn pair_messages(&self, pair_id: &str) -> Result<Vec<Message>> {
        self.query_messages(pair_id, None)
    }

    fn query_messages(&self, pair_id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE pair_id = ?1 ORDER BY rowid DESC LIMIT ?2"
        ))?;
        let lim = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![pair_id, lim], message_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_messages(&self, since: Option<DateTime<Utc>>) -> Result<u64> {
        let conn = self.open_conn()?;
        let count: i64 = match since {
            Some(ts) => conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE timestamp >= ?1",
                params![ts],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?,
        };
        Ok(count.max(0) as u64)
    }

    // Prompts

    pub fn insert_prompt(&self, p: &Prompt) -> Result<()> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        if p.is_global {
            tx.execute("UPDATE prompts SET is_global = 0", [])?;
        }
        tx.execute(
            "INSERT INTO prompts (id, name, content, category, is_global) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![p.id, p.name, p.content, p.category, p.is_global],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, content, category, is_global FROM prompts ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map([], prompt_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// At most one prompt carries the global flag.
    pub fn set_global_prompt(&self, id: &str) -> Result<()> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE prompts SET is_global = 0", [])?;
        let changed = tx.execute("UPDATE prompts SET is_global = 1 WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("prompt {id}")));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_prompt(&self, id: &str) -> Result<bool> {
        let conn = self.open_conn()?;
        Ok(conn.execute("DELETE FROM prompts WHERE id = ?1", params![id])? > 0)
    }

    pub fn global_prompt(&self) -> Result<Option<Prompt>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, content, category, is_global FROM prompts WHERE is_global = 1 LIMIT 1",
        )?;
        Ok(stmt.query_row([], prompt_from_row).optional()?)
    }
}
