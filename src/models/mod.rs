// src/models/mod.rs
pub mod auth;
pub mod chat;
pub mod quota;
