use axum::Router;

use crate::{entity::EntityKind, state::AppState};

mod dto;
pub mod handlers;
pub mod reader;
pub mod services;

pub use reader::CachedReader;
pub use services::EntityService;

pub fn router() -> Router<AppState> {
    EntityKind::ALL
        .into_iter()
        .fold(Router::new(), |router, kind| {
            router.nest(&format!("/{}", kind.partition()), handlers::kind_routes(kind))
        })
}
