//! HTTP access to the site's REST API.

mod client;

pub use client::{ApiClient, ApiResponse, JsonSource};
