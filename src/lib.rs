#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]

//! # xxtc-hub
//!
//! Cloud control hub: brokers real-time control traffic between headless
//! devices and human-driven controllers over WebSocket, fans out commands,
//! correlates asynchronous responses, tunnels HTTP through device streams,
//! moves large files over a one-shot token side-channel, relays WebRTC media
//! through an embedded TURN service, and keeps itself updated.

pub mod activity;
pub mod broker;
pub mod config;
pub mod groups;
pub mod http_proxy;
pub mod registry;
pub mod routes;
pub mod signer;
pub mod state;
pub mod supervisor;
pub mod transfer;
pub mod turn;
pub mod updater;
pub mod util;
pub mod ws;

pub use activity::ActivityLog;
pub use config::Config;
pub use registry::Registry;
pub use signer::Signer;
pub use state::AppState;
