//! Workflow definition registry, stored as JSONB keyed by `(name, version)`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{DefinitionRef, RegisteredDefinition, WorkflowDefinition};

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: Uuid,
    definition: serde_json::Value,
    registered_at: DateTime<Utc>,
}

impl DefinitionRow {
    fn try_into_registered(self) -> Result<RegisteredDefinition> {
        Ok(RegisteredDefinition {
            id: self.id,
            definition: serde_json::from_value(self.definition)?,
            registered_at: self.registered_at,
        })
    }
}

impl super::Db {
    /// Insert a definition unless `(name, version)` exists. Identical content
    /// is a no-op returning the stored record.
    pub(crate) async fn insert_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<RegisteredDefinition> {
        let body = serde_json::to_value(def)?;
        let inserted: Option<DefinitionRow> = sqlx::query_as(
            "INSERT INTO workflow_definitions (id, name, version, definition)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name, version) DO NOTHING
             RETURNING id, definition, registered_at",
        )
        .bind(Uuid::new_v4())
        .bind(&def.name)
        .bind(&def.version)
        .bind(&body)
        .fetch_optional(self.pool())
        .await?;

        if let Some(row) = inserted {
            return row.try_into_registered();
        }

        let existing = self
            .fetch_definition(&DefinitionRef::version(&def.name, &def.version))
            .await?;
        if existing.definition == *def {
            Ok(existing)
        } else {
            Err(Error::VersionConflict {
                name: def.name.clone(),
                version: def.version.clone(),
            })
        }
    }

    pub(crate) async fn fetch_definition(&self, r: &DefinitionRef) -> Result<RegisteredDefinition> {
        let row: Option<DefinitionRow> = match r {
            DefinitionRef::Id(id) => {
                sqlx::query_as(
                    "SELECT id, definition, registered_at FROM workflow_definitions WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(self.pool())
                .await?
            }
            DefinitionRef::Name(name) => {
                sqlx::query_as(
                    "SELECT id, definition, registered_at FROM workflow_definitions
                     WHERE name = $1 ORDER BY registered_at DESC LIMIT 1",
                )
                .bind(name)
                .fetch_optional(self.pool())
                .await?
            }
            DefinitionRef::Version { name, version } => {
                sqlx::query_as(
                    "SELECT id, definition, registered_at FROM workflow_definitions
                     WHERE name = $1 AND version = $2",
                )
                .bind(name)
                .bind(version)
                .fetch_optional(self.pool())
                .await?
            }
        };

        row.ok_or_else(|| Error::NotFound(format!("workflow definition {r}")))?
            .try_into_registered()
    }

    pub(crate) async fn fetch_definitions(&self) -> Result<Vec<RegisteredDefinition>> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(
            "SELECT id, definition, registered_at FROM workflow_definitions
             ORDER BY registered_at ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(DefinitionRow::try_into_registered)
            .collect()
    }
}
