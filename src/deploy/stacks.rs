//! Stack storage: compose files on disk, records in the database
//!
//! The database is the source of truth; filesystem operations follow it
//! and compensate on failure (rename writes the DB first, then moves the
//! file, and un-renames the DB row if the move fails).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::database::{Database, StackRecord};
use crate::error::{DockMonError, Result};

pub struct StackService {
    db: Arc<Database>,
    directory: PathBuf,
}

impl StackService {
    pub fn new(db: Arc<Database>, directory: PathBuf) -> Self {
        Self { db, directory }
    }

    fn compose_path(&self, name: &str) -> PathBuf {
        self.directory.join(name).join("docker-compose.yml")
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DockMonError::Validation(format!(
                "invalid stack name '{name}': use letters, digits, '-' and '_'"
            )));
        }
        Ok(())
    }

    pub async fn create(&self, name: &str, content: &str) -> Result<StackRecord> {
        Self::validate_name(name)?;
        super::validator::validate_compose(content)
            .map_err(|e| DockMonError::Validation(e.to_string()))?;

        if self.db.get_stack(name).await.map_err(internal)?.is_some() {
            return Err(DockMonError::Conflict(format!("stack '{name}' already exists")));
        }

        let path = self.compose_path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DockMonError::Internal(e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?;

        self.db
            .insert_stack(name, &path.to_string_lossy())
            .await
            .map_err(internal)?;

        info!(stack = name, "stack created");
        self.db
            .get_stack(name)
            .await
            .map_err(internal)?
            .ok_or_else(|| DockMonError::Internal("stack vanished after insert".into()))
    }

    pub async fn list(&self) -> Result<Vec<StackRecord>> {
        self.db.list_stacks().await.map_err(internal)
    }

    /// Record plus file content.
    pub async fn get(&self, name: &str) -> Result<(StackRecord, String)> {
        let record = self
            .db
            .get_stack(name)
            .await
            .map_err(internal)?
            .ok_or_else(|| DockMonError::NotFound(format!("stack '{name}'")))?;
        let content = tokio::fs::read_to_string(&record.compose_path)
            .await
            .unwrap_or_default();
        Ok((record, content))
    }

    pub async fn update(&self, name: &str, content: &str) -> Result<()> {
        super::validator::validate_compose(content)
            .map_err(|e| DockMonError::Validation(e.to_string()))?;
        let record = self
            .db
            .get_stack(name)
            .await
            .map_err(internal)?
            .ok_or_else(|| DockMonError::NotFound(format!("stack '{name}'")))?;
        tokio::fs::write(&record.compose_path, content)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Rename: database first, filesystem second. A filesystem failure
    /// rolls the database change back so the two never diverge.
    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        Self::validate_name(new_name)?;

        let record = self
            .db
            .get_stack(old_name)
            .await
            .map_err(internal)?
            .ok_or_else(|| DockMonError::NotFound(format!("stack '{old_name}'")))?;
        if self
            .db
            .get_stack(new_name)
            .await
            .map_err(internal)?
            .is_some()
        {
            return Err(DockMonError::Conflict(format!(
                "stack '{new_name}' already exists"
            )));
        }

        let new_path = self.compose_path(new_name);

        self.db
            .rename_stack(old_name, new_name, &new_path.to_string_lossy())
            .await
            .map_err(internal)?;

        let old_dir = Path::new(&record.compose_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.directory.join(old_name));
        let new_dir = new_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.directory.join(new_name));

        if let Err(e) = tokio::fs::rename(&old_dir, &new_dir).await {
            // Compensate: put the database row back.
            error!(stack = old_name, "filesystem rename failed, compensating: {e}");
            if let Err(undo) = self
                .db
                .rename_stack(new_name, old_name, &record.compose_path)
                .await
            {
                error!(stack = old_name, "compensating rename failed: {undo}");
            }
            return Err(DockMonError::Internal(format!("rename failed: {e}")));
        }

        info!(old = old_name, new = new_name, "stack renamed");
        Ok(())
    }

    /// Delete is blocked while any deployment references the stack; the
    /// error cites the count and the filesystem is left untouched.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let record = self
            .db
            .get_stack(name)
            .await
            .map_err(internal)?
            .ok_or_else(|| DockMonError::NotFound(format!("stack '{name}'")))?;

        let references = self
            .db
            .count_deployments_for_stack(name)
            .await
            .map_err(internal)?;
        if references > 0 {
            return Err(DockMonError::Validation(format!(
                "cannot delete stack '{name}': referenced by {references} deployments"
            )));
        }

        self.db.delete_stack(name).await.map_err(internal)?;

        if let Some(dir) = Path::new(&record.compose_path).parent() {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                warn!(stack = name, "stack directory removal failed: {e}");
            }
        }

        info!(stack = name, "stack deleted");
        Ok(())
    }

    pub async fn copy(&self, source: &str, target: &str) -> Result<StackRecord> {
        let (_, content) = self.get(source).await?;
        self.create(target, &content).await
    }
}

fn internal(e: crate::database::DatabaseError) -> DockMonError {
    DockMonError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;
    use crate::database::deployment_fixtures::deployment;

    const COMPOSE: &str = "version: '3'\nservices:\n  web:\n    image: nginx:latest\n";

    async fn service() -> (StackService, Arc<Database>, tempfile::TempDir) {
        let db = Arc::new(seeded().await);
        let dir = tempfile::tempdir().unwrap();
        (
            StackService::new(db.clone(), dir.path().to_path_buf()),
            db,
            dir,
        )
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let (service, _db, _dir) = service().await;
        service.create("web", COMPOSE).await.unwrap();

        let (record, content) = service.get("web").await.unwrap();
        assert_eq!(record.name, "web");
        assert_eq!(content, COMPOSE);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names_and_duplicates() {
        let (service, _db, _dir) = service().await;
        assert!(matches!(
            service.create("../escape", COMPOSE).await,
            Err(DockMonError::Validation(_))
        ));

        service.create("web", COMPOSE).await.unwrap();
        assert!(matches!(
            service.create("web", COMPOSE).await,
            Err(DockMonError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_create_validates_compose() {
        let (service, _db, _dir) = service().await;
        assert!(matches!(
            service.create("web", "version: '3'\nservices: {}\n").await,
            Err(DockMonError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_db_and_fs() {
        let (service, _db, dir) = service().await;
        service.create("web", COMPOSE).await.unwrap();
        service.rename("web", "frontend").await.unwrap();

        assert!(service.get("web").await.is_err());
        let (_, content) = service.get("frontend").await.unwrap();
        assert_eq!(content, COMPOSE);
        assert!(dir.path().join("frontend/docker-compose.yml").exists());
        assert!(!dir.path().join("web").exists());
    }

    #[tokio::test]
    async fn test_delete_blocked_by_deployments() {
        let (service, db, dir) = service().await;
        service.create("web", COMPOSE).await.unwrap();

        let mut d1 = deployment("h1", "aaa111bbb222", "one");
        d1.stack_name = Some("web".into());
        db.insert_deployment(&d1).await.unwrap();
        let mut d2 = deployment("h1", "ccc333ddd444", "two");
        d2.stack_name = Some("web".into());
        db.insert_deployment(&d2).await.unwrap();

        let err = service.delete("web").await.unwrap_err();
        assert!(matches!(
            &err,
            DockMonError::Validation(msg) if msg.contains("2 deployments")
        ));
        // Files stay untouched.
        assert!(dir.path().join("web/docker-compose.yml").exists());
    }

    #[tokio::test]
    async fn test_delete_removes_files() {
        let (service, _db, dir) = service().await;
        service.create("web", COMPOSE).await.unwrap();
        service.delete("web").await.unwrap();
        assert!(!dir.path().join("web").exists());
        assert!(service.get("web").await.is_err());
    }

    #[tokio::test]
    async fn test_copy() {
        let (service, _db, _dir) = service().await;
        service.create("web", COMPOSE).await.unwrap();
        service.copy("web", "web-staging").await.unwrap();

        let (_, content) = service.get("web-staging").await.unwrap();
        assert_eq!(content, COMPOSE);
    }
}
