//! PostgreSQL store — selected when `DATABASE_URL` is set.
//!
//! DESIGN
//! ======
//! Tile coordinates are unbounded, so they are keyed by their decimal text.
//! Actions and regions are stored as JSONB in their wire shape. A tile's chain
//! is its revision rows ordered by id; retiring a revision deletes its row
//! and image.
//!
//! Transactions map one-to-one onto a `sqlx::Transaction`; dropping it
//! without commit rolls back on the server.

use async_trait::async_trait;
use sqlx::postgres::Postgres;
use sqlx::{PgPool, Transaction};
use uuid::Uuid;

use super::{CanvasStore, ChainEntry, StoreError, StoreTransaction, plan_rebuild, split_chain};
use crate::geometry::{Region, TileLocation};
use crate::model::{
    ActionId, ActionKind, ActionRecord, RevisionId, TileHistory, TileImage, Update, Usage, User, UserId,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn tile_key(location: &TileLocation) -> (String, String) {
    (location.column.to_string(), location.row.to_string())
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

type UserRow = (Uuid, Option<i64>, Option<i64>, i64, i64, i64, i64);
type ActionRow = (i64, Uuid, serde_json::Value, Option<i64>, Option<i64>, bool, serde_json::Value);

fn user_from_row(row: UserRow) -> User {
    let (id, first, last, brush, eraser, undo, redo) = row;
    User {
        id: UserId(id),
        first_action_id: first.map(ActionId),
        last_action_id: last.map(ActionId),
        usage: Usage { brush: count(brush), eraser: count(eraser), undo: count(undo), redo: count(redo) },
    }
}

fn action_from_row(row: ActionRow) -> Result<ActionRecord, StoreError> {
    let (id, user_id, action, previous, next, undone, region) = row;
    Ok(ActionRecord {
        id: ActionId(id),
        user_id: UserId(user_id),
        action: serde_json::from_value(action)?,
        previous_action_id: previous.map(ActionId),
        next_action_id: next.map(ActionId),
        undone,
        region: serde_json::from_value(region)?,
    })
}

async fn load_chain<'e, E>(executor: E, location: &TileLocation) -> Result<Vec<ChainEntry>, StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let (column, row) = tile_key(location);
    let rows = sqlx::query_as::<_, (i64, Option<i64>, bool)>(
        "SELECT id, action_id, image IS NOT NULL
         FROM revisions
         WHERE tile_column = $1 AND tile_row = $2
         ORDER BY id",
    )
    .bind(column)
    .bind(row)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, action_id, rendered)| ChainEntry {
            revision_id: RevisionId(id),
            action_id: action_id.map(ActionId),
            rendered,
        })
        .collect())
}

#[async_trait]
impl CanvasStore for PgStore {
    async fn create_user(&self) -> Result<UserId, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO canvas_users (id) VALUES ($1)")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(UserId(id))
    }

    async fn get_user(&self, user_id: UserId) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, first_action_id, last_action_id, usage_brush, usage_eraser, usage_undo, usage_redo
             FROM canvas_users
             WHERE id = $1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(user_from_row).ok_or(StoreError::UserNotFound(user_id))
    }

    async fn new_action_id(&self) -> Result<ActionId, StoreError> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('action_ids')")
            .fetch_one(&self.pool)
            .await?;
        Ok(ActionId(id))
    }

    async fn get_action(&self, action_id: ActionId) -> Result<ActionRecord, StoreError> {
        let row = sqlx::query_as::<_, ActionRow>(
            "SELECT id, user_id, action, previous_action_id, next_action_id, undone, region
             FROM actions
             WHERE id = $1",
        )
        .bind(action_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(action_from_row).transpose()?.ok_or(StoreError::ActionNotFound(action_id))
    }

    async fn tile_history(&self, location: &TileLocation) -> Result<TileHistory, StoreError> {
        split_chain(&load_chain(&self.pool, location).await?)
    }

    async fn revision_image(
        &self,
        location: &TileLocation,
        revision_id: RevisionId,
    ) -> Result<Option<TileImage>, StoreError> {
        let (column, row) = tile_key(location);
        let image: Option<Option<Vec<u8>>> = sqlx::query_scalar(
            "SELECT image FROM revisions WHERE id = $1 AND tile_column = $2 AND tile_row = $3",
        )
        .bind(revision_id.0)
        .bind(column)
        .bind(row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(image.flatten().map(TileImage))
    }

    async fn set_revision_image(
        &self,
        location: &TileLocation,
        revision_id: RevisionId,
        image: TileImage,
    ) -> Result<(), StoreError> {
        let (column, row) = tile_key(location);
        let result = sqlx::query(
            "UPDATE revisions SET image = $4
             WHERE id = $1 AND tile_column = $2 AND tile_row = $3",
        )
        .bind(revision_id.0)
        .bind(column)
        .bind(row)
        .bind(image.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RevisionNotFound { location: location.clone(), revision_id });
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(PgTransaction { tx: self.pool.begin().await? }))
    }
}

// =============================================================================
// TRANSACTION
// =============================================================================

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn update_user(&mut self, sql: &str, user_id: UserId, value: Option<i64>) -> Result<(), StoreError> {
        let result = sqlx::query(sql)
            .bind(user_id.0)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn create_action(&mut self, record: &ActionRecord) -> Result<(), StoreError> {
        let action = serde_json::to_value(&record.action)?;
        let region = serde_json::to_value(&record.region)?;
        sqlx::query(
            "INSERT INTO actions (id, user_id, action, previous_action_id, next_action_id, undone, region)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id.0)
        .bind(record.user_id.0)
        .bind(action)
        .bind(record.previous_action_id.map(|id| id.0))
        .bind(record.next_action_id.map(|id| id.0))
        .bind(record.undone)
        .bind(region)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_next_action_id(&mut self, action_id: ActionId, next: ActionId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE actions SET next_action_id = $2 WHERE id = $1")
            .bind(action_id.0)
            .bind(next.0)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound(action_id));
        }
        Ok(())
    }

    async fn set_undone(&mut self, action_id: ActionId, undone: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE actions SET undone = $2 WHERE id = $1")
            .bind(action_id.0)
            .bind(undone)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound(action_id));
        }
        Ok(())
    }

    async fn set_first_action_id(&mut self, user_id: UserId, action_id: ActionId) -> Result<(), StoreError> {
        self.update_user("UPDATE canvas_users SET first_action_id = $2 WHERE id = $1", user_id, Some(action_id.0))
            .await
    }

    async fn set_last_action_id(&mut self, user_id: UserId, action_id: Option<ActionId>) -> Result<(), StoreError> {
        self.update_user("UPDATE canvas_users SET last_action_id = $2 WHERE id = $1", user_id, action_id.map(|id| id.0))
            .await
    }

    async fn increment_usage(&mut self, user_id: UserId, kind: ActionKind) -> Result<(), StoreError> {
        // The column name comes from a closed enum, never from input.
        let sql = format!("UPDATE canvas_users SET usage_{0} = usage_{0} + 1 WHERE id = $1", kind.as_str());
        let result = sqlx::query(&sql).bind(user_id.0).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn append_action(&mut self, region: &Region, action_id: ActionId) -> Result<(), StoreError> {
        for location in region {
            let (column, row) = tile_key(location);
            let known: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM revisions WHERE tile_column = $1 AND tile_row = $2)",
            )
            .bind(&column)
            .bind(&row)
            .fetch_one(&mut *self.tx)
            .await?;

            if !known {
                sqlx::query("INSERT INTO revisions (tile_column, tile_row, action_id, image) VALUES ($1, $2, NULL, $3)")
                    .bind(&column)
                    .bind(&row)
                    .bind(Vec::<u8>::new())
                    .execute(&mut *self.tx)
                    .await?;
            }

            sqlx::query("INSERT INTO tile_actions (tile_column, tile_row, action_id) VALUES ($1, $2, $3)")
                .bind(&column)
                .bind(&row)
                .bind(action_id.0)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn update_history_for_region(
        &mut self,
        region: &Region,
        action_id: ActionId,
    ) -> Result<Vec<Update>, StoreError> {
        let mut updates = Vec::new();
        for location in region {
            let (column, row) = tile_key(location);
            let actions = sqlx::query_as::<_, (i64, bool)>(
                "SELECT ta.action_id, a.undone
                 FROM tile_actions ta
                 JOIN actions a ON a.id = ta.action_id
                 WHERE ta.tile_column = $1 AND ta.tile_row = $2
                 ORDER BY ta.position",
            )
            .bind(&column)
            .bind(&row)
            .fetch_all(&mut *self.tx)
            .await?;
            let ids: Vec<ActionId> = actions.iter().map(|(id, _)| ActionId(*id)).collect();

            let chain = load_chain(&mut *self.tx, location).await?;
            let plan = plan_rebuild(location, &chain, &ids, action_id)?;

            let retired: Vec<i64> = chain[plan.keep..].iter().map(|entry| entry.revision_id.0).collect();
            if !retired.is_empty() {
                sqlx::query("DELETE FROM revisions WHERE id = ANY($1)")
                    .bind(&retired)
                    .execute(&mut *self.tx)
                    .await?;
            }

            for (id, undone) in &actions[plan.start..] {
                if *undone {
                    continue;
                }
                sqlx::query("INSERT INTO revisions (tile_column, tile_row, action_id) VALUES ($1, $2, $3)")
                    .bind(&column)
                    .bind(&row)
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await?;
            }

            if let Some(revision_id) = plan.moved_back {
                updates.push(Update::Rendered { location: location.clone(), revision_id });
            }
        }
        Ok(updates)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "postgres_test.rs"]
mod tests;
