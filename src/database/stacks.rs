//! Stack and template records

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{ts_from_db, ts_to_db, Database, DatabaseResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRecord {
    pub name: String,
    pub compose_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub content: String,
    pub is_builtin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    pub async fn insert_stack(&self, name: &str, compose_path: &str) -> DatabaseResult<()> {
        let now = ts_to_db(Utc::now());
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO stacks (name, compose_path, created_at, updated_at) VALUES (?1,?2,?3,?3)",
            params![name, compose_path, now],
        )?;
        Ok(())
    }

    pub async fn get_stack(&self, name: &str) -> DatabaseResult<Option<StackRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT name, compose_path, created_at, updated_at FROM stacks WHERE name = ?1",
            [name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?
        .map(|raw| {
            Ok(StackRecord {
                name: raw.0,
                compose_path: raw.1,
                created_at: ts_from_db(&raw.2)?,
                updated_at: ts_from_db(&raw.3)?,
            })
        })
        .transpose()
    }

    pub async fn list_stacks(&self) -> DatabaseResult<Vec<StackRecord>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT name, compose_path, created_at, updated_at FROM stacks ORDER BY name",
        )?;
        let raws = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter()
            .map(|raw| {
                Ok(StackRecord {
                    name: raw.0,
                    compose_path: raw.1,
                    created_at: ts_from_db(&raw.2)?,
                    updated_at: ts_from_db(&raw.3)?,
                })
            })
            .collect()
    }

    /// Rename a stack record. The caller renames the compose file after
    /// this commits, and compensates by renaming back if the filesystem
    /// step fails.
    pub async fn rename_stack(
        &self,
        old_name: &str,
        new_name: &str,
        new_path: &str,
    ) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute(
            "UPDATE stacks SET name = ?2, compose_path = ?3, updated_at = ?4 WHERE name = ?1",
            params![old_name, new_name, new_path, ts_to_db(Utc::now())],
        )?;
        Ok(n > 0)
    }

    pub async fn delete_stack(&self, name: &str) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute("DELETE FROM stacks WHERE name = ?1", [name])?;
        Ok(n > 0)
    }

    // --- templates ---

    pub async fn insert_template(
        &self,
        name: &str,
        description: &str,
        content: &str,
        is_builtin: bool,
    ) -> DatabaseResult<i64> {
        let now = ts_to_db(Utc::now());
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO templates (name, description, content, is_builtin, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?5)",
            params![name, description, content, is_builtin as i64, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_template(&self, id: i64) -> DatabaseResult<Option<TemplateRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            &format!("{TEMPLATE_SELECT} WHERE id = ?1"),
            [id],
            row_to_template_raw,
        )
        .optional()?
        .map(raw_to_template)
        .transpose()
    }

    pub async fn get_template_by_name(&self, name: &str) -> DatabaseResult<Option<TemplateRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            &format!("{TEMPLATE_SELECT} WHERE name = ?1"),
            [name],
            row_to_template_raw,
        )
        .optional()?
        .map(raw_to_template)
        .transpose()
    }

    pub async fn list_templates(&self) -> DatabaseResult<Vec<TemplateRecord>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(&format!("{TEMPLATE_SELECT} ORDER BY name"))?;
        let raws = stmt
            .query_map([], row_to_template_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(raw_to_template).collect()
    }

    pub async fn update_template(
        &self,
        id: i64,
        description: &str,
        content: &str,
    ) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute(
            "UPDATE templates SET description = ?2, content = ?3, updated_at = ?4 \
             WHERE id = ?1 AND is_builtin = 0",
            params![id, description, content, ts_to_db(Utc::now())],
        )?;
        Ok(n > 0)
    }

    pub async fn delete_template(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute(
            "DELETE FROM templates WHERE id = ?1 AND is_builtin = 0",
            [id],
        )?;
        Ok(n > 0)
    }
}

const TEMPLATE_SELECT: &str =
    "SELECT id, name, description, content, is_builtin, created_at, updated_at FROM templates";

type RawTemplate = (i64, String, String, String, i64, String, String);

fn row_to_template_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTemplate> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn raw_to_template(raw: RawTemplate) -> DatabaseResult<TemplateRecord> {
    Ok(TemplateRecord {
        id: raw.0,
        name: raw.1,
        description: raw.2,
        content: raw.3,
        is_builtin: raw.4 != 0,
        created_at: ts_from_db(&raw.5)?,
        updated_at: ts_from_db(&raw.6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_stack_rename() {
        let db = seeded().await;
        db.insert_stack("web", "stacks/web/docker-compose.yml")
            .await
            .unwrap();
        assert!(db
            .rename_stack("web", "frontend", "stacks/frontend/docker-compose.yml")
            .await
            .unwrap());
        assert!(db.get_stack("web").await.unwrap().is_none());
        assert!(db.get_stack("frontend").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_builtin_template_protected() {
        let db = seeded().await;
        let id = db
            .insert_template("nginx", "builtin nginx", "services: {}", true)
            .await
            .unwrap();
        assert!(!db.update_template(id, "edited", "x").await.unwrap());
        assert!(!db.delete_template(id).await.unwrap());
        assert!(db.get_template(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_template_name_unique() {
        let db = seeded().await;
        db.insert_template("web", "", "a", false).await.unwrap();
        assert!(db.insert_template("web", "", "b", false).await.is_err());
    }
}
