pub mod api;
pub mod auth;
pub mod config;
pub mod gate;
pub mod models;
pub mod site;
pub mod storage;
