//! Deployment templates with variable substitution
//!
//! Templates are compose definitions with `${VAR_NAME}` placeholders.
//! Built-in templates ship with the daemon and cannot be modified or
//! deleted.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::database::{Database, TemplateRecord};
use crate::error::{DockMonError, Result};

/// Placeholder names: `[A-Z_][A-Z0-9_]*`, wrapped in `${}`.
fn variable_pattern() -> Regex {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("pattern compiles")
}

/// Substitute `${VAR}` placeholders. Unknown variables error rather
/// than silently surviving into a deployed definition.
pub fn render_template(content: &str, variables: &HashMap<String, String>) -> Result<String> {
    let pattern = variable_pattern();
    let mut missing = Vec::new();

    let rendered = pattern.replace_all(content, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(DockMonError::Validation(format!(
            "missing template variables: {}",
            missing.join(", ")
        )));
    }

    Ok(rendered.into_owned())
}

/// Variable names referenced by a template, for UI prompting.
pub fn template_variables(content: &str) -> Vec<String> {
    let pattern = variable_pattern();
    let mut names: Vec<String> = pattern
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

pub struct TemplateService {
    db: Arc<Database>,
}

impl TemplateService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn create(&self, name: &str, description: &str, content: &str) -> Result<i64> {
        self.db
            .insert_template(name, description, content, false)
            .await
            .map_err(|e| match e {
                crate::database::DatabaseError::Integrity(_) => {
                    DockMonError::Conflict(format!("template '{name}' already exists"))
                }
                other => DockMonError::Internal(other.to_string()),
            })
    }

    pub async fn list(&self) -> Result<Vec<TemplateRecord>> {
        self.db
            .list_templates()
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))
    }

    pub async fn get(&self, id: i64) -> Result<TemplateRecord> {
        self.db
            .get_template(id)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?
            .ok_or_else(|| DockMonError::NotFound(format!("template {id}")))
    }

    pub async fn update(&self, id: i64, description: &str, content: &str) -> Result<()> {
        let template = self.get(id).await?;
        if template.is_builtin {
            return Err(DockMonError::Forbidden(
                "built-in templates cannot be modified".into(),
            ));
        }
        if !self
            .db
            .update_template(id, description, content)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?
        {
            return Err(DockMonError::NotFound(format!("template {id}")));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let template = self.get(id).await?;
        if template.is_builtin {
            return Err(DockMonError::Forbidden(
                "built-in templates cannot be deleted".into(),
            ));
        }
        self.db
            .delete_template(id)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Save a finished deployment's definition as a reusable template.
    /// Missing deployment is 404; an existing template name is 409.
    pub async fn save_deployment_as(
        &self,
        deployment_id: &str,
        template_name: &str,
        description: &str,
    ) -> Result<i64> {
        let deployment = self
            .db
            .get_deployment(deployment_id)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?
            .ok_or_else(|| DockMonError::NotFound(format!("deployment {deployment_id}")))?;

        if self
            .db
            .get_template_by_name(template_name)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?
            .is_some()
        {
            return Err(DockMonError::Conflict(format!(
                "template '{template_name}' already exists"
            )));
        }

        self.create(template_name, description, &deployment.definition)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::deployment_fixtures::deployment;
    use crate::database::test_support::seeded;

    #[test]
    fn test_render_substitutes_variables() {
        let content = "image: nginx:${NGINX_VERSION}\nport: ${PORT}\n";
        let vars = HashMap::from([
            ("NGINX_VERSION".to_string(), "1.25".to_string()),
            ("PORT".to_string(), "8080".to_string()),
        ]);
        assert_eq!(
            render_template(content, &vars).unwrap(),
            "image: nginx:1.25\nport: 8080\n"
        );
    }

    #[test]
    fn test_render_missing_variable_errors() {
        let err = render_template("image: ${MISSING}", &HashMap::new()).unwrap_err();
        assert!(matches!(
            err,
            DockMonError::Validation(msg) if msg.contains("MISSING")
        ));
    }

    #[test]
    fn test_lowercase_not_a_variable() {
        // ${not_var} does not match the variable grammar and passes
        // through untouched.
        let rendered = render_template("x: ${not_var}", &HashMap::new()).unwrap();
        assert_eq!(rendered, "x: ${not_var}");
    }

    #[test]
    fn test_template_variables_deduped_sorted() {
        let content = "${B_VAR} ${A_VAR} ${B_VAR}";
        assert_eq!(template_variables(content), vec!["A_VAR", "B_VAR"]);
    }

    #[tokio::test]
    async fn test_builtin_protected() {
        let db = Arc::new(seeded().await);
        let id = db
            .insert_template("nginx", "builtin", "services: {}", true)
            .await
            .unwrap();
        let service = TemplateService::new(db);

        assert!(matches!(
            service.update(id, "x", "y").await,
            Err(DockMonError::Forbidden(_))
        ));
        assert!(matches!(
            service.delete(id).await,
            Err(DockMonError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_save_deployment_as_template() {
        let db = Arc::new(seeded().await);
        db.insert_deployment(&deployment("h1", "aaa111bbb222", "web"))
            .await
            .unwrap();
        let service = TemplateService::new(db.clone());

        let id = service
            .save_deployment_as("h1:aaa111bbb222", "web-template", "from web")
            .await
            .unwrap();
        let template = service.get(id).await.unwrap();
        assert!(template.content.contains("nginx"));

        // Duplicate name is a conflict.
        assert!(matches!(
            service
                .save_deployment_as("h1:aaa111bbb222", "web-template", "again")
                .await,
            Err(DockMonError::Conflict(_))
        ));

        // Missing deployment is not found.
        assert!(matches!(
            service
                .save_deployment_as("h1:ffffffffffff", "other", "x")
                .await,
            Err(DockMonError::NotFound(_))
        ));
    }
}
