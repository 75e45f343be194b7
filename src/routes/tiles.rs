//! Tile image route.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use num_bigint::BigInt;
use tracing::error;

use crate::geometry::TileLocation;
use crate::model::RevisionId;
use crate::state::AppState;
use crate::store::StoreError;

/// `GET /tiles/:column/:row/:revision` — rendered image of one tile revision.
///
/// Revisions never change once rendered, so successful responses are cacheable
/// indefinitely.
pub async fn get_tile(
    State(state): State<AppState>,
    Path((column, row, revision)): Path<(String, String, i64)>,
) -> Result<Response, StatusCode> {
    let column: BigInt = column.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let row: BigInt = row.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let location = TileLocation::new(column, row);

    let image = match state.store.revision_image(&location, RevisionId(revision)).await {
        Ok(Some(image)) => image,
        Ok(None) | Err(StoreError::RevisionNotFound { .. }) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(%location, revision, error = %e, "tile image read failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    Ok((
        [(CONTENT_TYPE, state.deltas.content_type()), (CACHE_CONTROL, "public, max-age=31536000, immutable")],
        image.0,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::geometry::Point;
    use crate::model::{Action, Stroke};
    use crate::services::delta::VectorDeltas;
    use crate::services::history::send_action;
    use crate::state::test_helpers::{self, wait_for_idle_renders};
    use crate::store::MemoryStore;
    use crate::store::memory::FaultPoint;

    async fn fetch(state: &AppState, column: &str, row: &str, revision: i64) -> Result<Response, StatusCode> {
        get_tile(State(state.clone()), Path((column.to_owned(), row.to_owned(), revision))).await
    }

    #[tokio::test]
    async fn rendered_revision_is_served() {
        let state = test_helpers::test_app_state();
        let user = state.store.create_user().await.unwrap();
        let stroke = Stroke { points: vec![Point::new(-5, -5)], width: 1, opacity: 0.5, color: None };
        send_action(&state, user, Action::Eraser(stroke)).await.unwrap();
        wait_for_idle_renders(&state, Duration::from_secs(2)).await;

        let location = TileLocation::new(-1, -1);
        let history = state.store.tile_history(&location).await.unwrap();
        let revision = history.base_revision_id.unwrap();

        let response = fetch(&state, "-1", "-1", revision.0).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let image = state.store.revision_image(&location, revision).await.unwrap().unwrap();
        assert_eq!(VectorDeltas::layers(&image).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_revision_is_not_found() {
        let state = test_helpers::test_app_state();
        assert_eq!(fetch(&state, "0", "0", 42).await.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_coordinates_are_rejected() {
        let state = test_helpers::test_app_state();
        assert_eq!(fetch(&state, "zero", "0", 1).await.unwrap_err(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn store_failure_is_internal_error() {
        let store = MemoryStore::new();
        let state = test_helpers::test_app_state_with_store(store.clone());
        store.fail_next(FaultPoint::RevisionImage, 1);
        assert_eq!(fetch(&state, "0", "0", 1).await.unwrap_err(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
