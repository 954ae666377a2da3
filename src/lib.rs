//! Creator demographics estimation
//!
//! Estimates the apparent age and gender of short-video creators from their
//! recent video thumbnails. Usernames are fetched concurrently, their images
//! batched for a shared age/gender model, and the per-image predictions reduced
//! to one verdict per username.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
