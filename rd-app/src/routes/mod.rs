pub mod conversations;
pub mod error;
pub mod health;
pub mod notifications;
pub mod whatsapp;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(conversations::router())
        .merge(notifications::router())
        .merge(whatsapp::router())
}
