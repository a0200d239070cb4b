pub mod checksum;
pub mod conflict;
pub mod config;
pub mod control;
pub mod logging;
pub mod path_normalizer;
pub mod reconciler;
pub mod remote;
pub mod shadow_db;
pub mod sync_loop;
pub mod telemetry;
