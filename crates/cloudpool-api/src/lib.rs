//! cloudpool-api: REST management API for a machine pool.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/pool` | Fresh pool snapshot |
//! | GET | `/api/v1/pool/size` | Desired, allocated, active and effective size |
//! | POST | `/api/v1/pool/size` | Set the desired size |
//! | GET | `/api/v1/pool/metadata` | Pool identifier and supported API versions |
//! | GET | `/api/v1/pool/terminations` | Scheduled terminations not yet executed |
//! | POST | `/api/v1/pool/{id}/terminate` | Terminate a member now |
//! | POST | `/api/v1/pool/{id}/attach` | Adopt an external machine |
//! | POST | `/api/v1/pool/{id}/detach` | Release a member |
//! | POST | `/api/v1/pool/{id}/serviceState` | Set a member's service state |
//! | POST | `/api/v1/pool/{id}/tags` | Add tags |
//! | DELETE | `/api/v1/pool/{id}/tags` | Remove tags |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use cloudpool_engine::PoolController;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<PoolController>,
}

/// Build the API router for one pool.
pub fn build_router(controller: Arc<PoolController>) -> Router {
    let api_state = ApiState { controller };

    let api_routes = Router::new()
        .route("/pool", get(handlers::get_pool))
        .route("/pool/size", get(handlers::get_pool_size).post(handlers::set_desired_size))
        .route("/pool/metadata", get(handlers::get_pool_metadata))
        .route("/pool/terminations", get(handlers::pending_terminations))
        .route("/pool/{id}/terminate", post(handlers::terminate_machine))
        .route("/pool/{id}/attach", post(handlers::attach_machine))
        .route("/pool/{id}/detach", post(handlers::detach_machine))
        .route("/pool/{id}/serviceState", post(handlers::set_service_state))
        .route("/pool/{id}/tags", post(handlers::tag_machine).delete(handlers::untag_machine))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
