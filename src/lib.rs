//! Hearth - a backend for exploring Home Assistant entity history.
//!
//! # Overview
//!
//! Hearth sits between a charting frontend and a Home Assistant instance. It
//! fetches raw state history over the HA REST API, normalizes it into
//! chart-ready parallel series (numeric, climate, or text), and serves it
//! over a JSON API. Histories can be exported as self-contained documents
//! and re-imported later for fully offline exploration, including attribute
//! drill-down against the snapshot.
//!
//! # Trust model
//!
//! The HA API token never leaves the server: the frontend only ever talks to
//! Hearth. A whitelist/blacklist filter controls which entities are visible,
//! and an IP ban gate locks out sources of repeated failed logins.
//!
//! # Modules
//!
//! - [`model`]: wire types, the chart payload, export/import documents
//! - [`normalize`]: raw history records to chart-ready series
//! - [`ha`]: Home Assistant REST client
//! - [`import_cache`]: in-memory import sessions
//! - [`auth`]: IP bans, login throttling, credential storage
//! - [`config`]: YAML configuration and the entity filter
//! - [`api`]: HTTP routes and handlers

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod ha;
pub mod import_cache;
pub mod model;
pub mod normalize;
