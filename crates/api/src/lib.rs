//! REST surface for webhook endpoints and delivery history.

pub mod middleware;
pub mod routes;
pub mod state;
