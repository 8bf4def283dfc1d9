mod access_log_middleware;
pub mod app_server;
pub mod controllers;
pub mod cookies;
pub mod error;
pub mod models;
