//! HTTP API handlers for kinmate-cs

pub mod health;
pub mod sse;
pub mod turns;
pub mod users;

pub use health::health_routes;
pub use sse::event_stream;
pub use turns::turn_routes;
pub use users::user_routes;
