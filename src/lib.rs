//! Library crate for live-quiz-back, exposing modules for the server, the team
//! client and the documentation generator.

pub mod client;
pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
