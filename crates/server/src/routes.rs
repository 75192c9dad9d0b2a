//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::state::AppState;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the application router.
///
/// All recognized routes and parameters in one place:
///
/// - `GET /sp/status`: system/SP status placeholder.
/// - `GET /sp/eligible_pieces`: what the authenticated SP may reserve
///   right now (`limit`, `tenant`, `include-sourceless`).
/// - `GET /sp/pending_proposals`: outstanding reservations and recent
///   failures.
/// - `GET /sp/piece_manifest`: segment manifest for a reserved aggregate
///   (`proposal` UUID required).
/// - `POST /sp/invoke`: the sole mutating call (`call=reserve_piece`).
pub fn create_router(state: AppState) -> Router {
    let sp_routes = Router::new()
        .route("/sp/status", get(handlers::sp_status))
        .route("/sp/eligible_pieces", get(handlers::eligible_pieces))
        .route("/sp/pending_proposals", get(handlers::pending_proposals))
        .route("/sp/piece_manifest", get(handlers::piece_manifest))
        .route(
            "/sp/invoke",
            post(handlers::invoke).get(handlers::invalid_route),
        );

    Router::new()
        .merge(sp_routes)
        .fallback(handlers::invalid_route)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
