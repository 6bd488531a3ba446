//! Rendezvous and relay service for Goop squared (spec.md §4.3, §4.4):
//! presence fan-out, SQLite-backed peer persistence across replicas, and a
//! circuit-relay host.

pub mod config;
pub mod db;
pub mod identity_key;
pub mod model;
pub mod msgid;
pub mod presence_gate;
pub mod rate_limit;
pub mod relay_host;
pub mod server;
pub mod state;
pub mod templates;
pub mod web;
