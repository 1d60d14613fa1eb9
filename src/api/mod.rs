pub mod routes;

pub use routes::{create_router, terminate_on_stale, ApiResponse, AppState};
