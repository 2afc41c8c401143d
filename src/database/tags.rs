//! Tags and tag assignments
//!
//! Assignments are owned by the tag but addressed by subject; the first
//! assignment in `order_index` order is the subject's primary tag.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Database, DatabaseError, DatabaseResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagAssignment {
    pub id: i64,
    pub tag_id: i64,
    pub tag_name: String,
    pub subject_type: String,
    pub subject_id: String,
    pub order_index: i64,
    pub provenance: String,
}

impl Database {
    pub async fn create_tag(&self, name: &str, color: &str) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO tags (name, color, kind) VALUES (?1, ?2, 'user')",
            params![name, color],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_tag_by_name(&self, name: &str) -> DatabaseResult<Option<TagRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT id, name, color, kind FROM tags WHERE name = ?1",
            [name],
            |row| {
                Ok(TagRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    color: row.get(2)?,
                    kind: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn assign_tag(
        &self,
        tag_id: i64,
        subject_type: &str,
        subject_id: &str,
        order_index: i64,
        provenance: &str,
    ) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO tag_assignments (tag_id, subject_type, subject_id, order_index, provenance) \
             VALUES (?1,?2,?3,?4,?5)",
            params![tag_id, subject_type, subject_id, order_index, provenance],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn assignments_for_subject(
        &self,
        subject_type: &str,
        subject_id: &str,
    ) -> DatabaseResult<Vec<TagAssignment>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.tag_id, t.name, a.subject_type, a.subject_id, a.order_index, a.provenance \
             FROM tag_assignments a JOIN tags t ON t.id = a.tag_id \
             WHERE a.subject_type = ?1 AND a.subject_id = ?2 \
             ORDER BY a.order_index, a.id",
        )?;
        let rows = stmt
            .query_map(params![subject_type, subject_id], row_to_assignment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Effective user tag names for a container, in user-defined order.
    pub async fn tag_names_for_container(&self, composite_key: &str) -> DatabaseResult<Vec<String>> {
        Ok(self
            .assignments_for_subject("container", composite_key)
            .await?
            .into_iter()
            .map(|a| a.tag_name)
            .collect())
    }

    pub async fn remove_assignment(&self, assignment_id: i64) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute("DELETE FROM tag_assignments WHERE id = ?1", [assignment_id])?;
        Ok(n > 0)
    }

    /// Move a container's tag assignments to a new composite key after an
    /// update recreated it.
    ///
    /// Two shapes, decided by whether the new key already carries
    /// assignments (container-discovery reattachment got there first):
    /// - new key already populated: drop the orphaned old-key rows;
    /// - otherwise: UPDATE old-key rows in place. A constraint violation
    ///   on `tag_assignments` here means reattachment raced the UPDATE —
    ///   treat it as success and fall back to deleting the old rows.
    pub async fn migrate_tag_assignments(
        &self,
        old_key: &str,
        new_key: &str,
    ) -> DatabaseResult<usize> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;

        let existing_on_new: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tag_assignments \
             WHERE subject_type = 'container' AND subject_id = ?1",
            [new_key],
            |row| row.get(0),
        )?;

        let migrated = if existing_on_new > 0 {
            tx.execute(
                "DELETE FROM tag_assignments \
                 WHERE subject_type = 'container' AND subject_id = ?1",
                [old_key],
            )?;
            existing_on_new as usize
        } else {
            let update = tx.execute(
                "UPDATE tag_assignments SET subject_id = ?2 \
                 WHERE subject_type = 'container' AND subject_id = ?1",
                params![old_key, new_key],
            );
            match update {
                Ok(n) => n,
                Err(e) => {
                    let db_err: DatabaseError = e.into();
                    if matches!(&db_err, DatabaseError::Integrity(msg) if msg.contains("tag_assignments"))
                    {
                        // Reattachment won the race; the new key is
                        // already tagged. Clear the leftovers instead.
                        tx.execute(
                            "DELETE FROM tag_assignments \
                             WHERE subject_type = 'container' AND subject_id = ?1",
                            [old_key],
                        )?;
                        0
                    } else {
                        return Err(db_err);
                    }
                }
            }
        };

        tx.commit()?;
        Ok(migrated)
    }
}

fn row_to_assignment(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagAssignment> {
    Ok(TagAssignment {
        id: row.get(0)?,
        tag_id: row.get(1)?,
        tag_name: row.get(2)?,
        subject_type: row.get(3)?,
        subject_id: row.get(4)?,
        order_index: row.get(5)?,
        provenance: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_assignment_order_defines_primary() {
        let db = seeded().await;
        let prod = db.create_tag("prod", "#f00").await.unwrap();
        let web = db.create_tag("web", "#0f0").await.unwrap();

        db.assign_tag(web, "container", "h1:abc123def456", 1, "user")
            .await
            .unwrap();
        db.assign_tag(prod, "container", "h1:abc123def456", 0, "user")
            .await
            .unwrap();

        let names = db
            .tag_names_for_container("h1:abc123def456")
            .await
            .unwrap();
        assert_eq!(names, vec!["prod".to_string(), "web".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_assignment_rejected() {
        let db = seeded().await;
        let tag = db.create_tag("prod", "#f00").await.unwrap();
        db.assign_tag(tag, "container", "h1:abc123def456", 0, "user")
            .await
            .unwrap();
        let err = db
            .assign_tag(tag, "container", "h1:abc123def456", 1, "user")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_migrate_updates_old_rows() {
        let db = seeded().await;
        let tag = db.create_tag("prod", "#f00").await.unwrap();
        db.assign_tag(tag, "container", "h1:aaa111bbb222", 0, "user")
            .await
            .unwrap();

        db.migrate_tag_assignments("h1:aaa111bbb222", "h1:ccc333ddd444")
            .await
            .unwrap();

        assert!(db
            .assignments_for_subject("container", "h1:aaa111bbb222")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            db.assignments_for_subject("container", "h1:ccc333ddd444")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_migrate_prefers_reattached_rows() {
        let db = seeded().await;
        let tag = db.create_tag("prod", "#f00").await.unwrap();
        // Old key has stale rows; discovery already re-tagged the new key.
        db.assign_tag(tag, "container", "h1:aaa111bbb222", 0, "user")
            .await
            .unwrap();
        db.assign_tag(tag, "container", "h1:ccc333ddd444", 0, "user")
            .await
            .unwrap();

        db.migrate_tag_assignments("h1:aaa111bbb222", "h1:ccc333ddd444")
            .await
            .unwrap();

        assert!(db
            .assignments_for_subject("container", "h1:aaa111bbb222")
            .await
            .unwrap()
            .is_empty());
        let kept = db
            .assignments_for_subject("container", "h1:ccc333ddd444")
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_tag_delete_cascades_assignments() {
        let db = seeded().await;
        let tag = db.create_tag("prod", "#f00").await.unwrap();
        db.assign_tag(tag, "host", "h1", 0, "user").await.unwrap();

        let conn = db.conn().await;
        conn.execute("DELETE FROM tags WHERE id = ?1", [tag]).unwrap();
        drop(conn);

        assert!(db
            .assignments_for_subject("host", "h1")
            .await
            .unwrap()
            .is_empty());
    }
}
