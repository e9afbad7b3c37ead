//! HTTP handlers, grouped by surface.

pub mod auth;
pub mod labels;
pub mod pages;
pub mod posts;
pub mod social;
pub mod sync;
