pub mod callback_api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod install;
pub mod mcp;
pub mod pending;
pub mod registry;
pub mod reply;
pub mod service;
