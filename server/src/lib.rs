pub mod api;
pub mod auth;
pub mod config;
pub mod housekeeping;
pub mod voice;
pub mod webhook;
pub mod ws;
