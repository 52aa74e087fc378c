pub mod api;
pub mod cdr;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod oncall;
pub mod phone;
pub mod routes;
pub mod schema;
pub mod state;
pub mod stores;
pub mod voicemail;
pub mod workers;
