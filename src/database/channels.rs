//! Notification channel records

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Database, DatabaseResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: i64,
    pub name: String,
    /// Transport type ("discord", "slack", "telegram", "pushover", "webhook").
    pub channel_type: String,
    /// Opaque per-type configuration blob.
    pub config: serde_json::Value,
    pub enabled: bool,
}

impl Database {
    pub async fn insert_channel(
        &self,
        name: &str,
        channel_type: &str,
        config: &serde_json::Value,
        enabled: bool,
    ) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO notification_channels (name, type, config, enabled) VALUES (?1,?2,?3,?4)",
            params![name, channel_type, config.to_string(), enabled as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_channel(&self, id: i64) -> DatabaseResult<Option<ChannelRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                "SELECT id, name, type, config, enabled FROM notification_channels WHERE id = ?1",
                [id],
                row_to_channel,
            )
            .optional()?;
        Ok(raw)
    }

    pub async fn list_channels(&self, only_enabled: bool) -> DatabaseResult<Vec<ChannelRecord>> {
        let conn = self.conn().await;
        let sql = format!(
            "SELECT id, name, type, config, enabled FROM notification_channels{} ORDER BY id",
            if only_enabled { " WHERE enabled = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_channel)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn delete_channel(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute("DELETE FROM notification_channels WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRecord> {
    let config: String = row.get(3)?;
    Ok(ChannelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_type: row.get(2)?,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        enabled: row.get::<_, i64>(4)? != 0,
    })
}
