//! imbued - a local daemon that gates access to secrets and hydrates shell
//! environments.
//!
//! The daemon listens on a Unix socket and answers one [`protocol::Command`]
//! per connection. Secrets are scoped by `.imbued` files discovered from the
//! caller's working directory, served by pluggable [`secrets`] backends, and
//! only handed to processes holding a short-lived grant from the
//! [`auth::Authenticator`]. Every authentication and access attempt is
//! appended to an audit log ([`tracking`]).

pub mod auth;
pub mod cleaner;
pub mod client;
pub mod config;
pub mod handlers;
pub mod platform;
pub mod protocol;
pub mod secrets;
pub mod server;
pub mod tracking;

