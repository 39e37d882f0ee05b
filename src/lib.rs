//! keygate — library crate shared by the server binary and integration tests.
//!
//! Keys are issued by [`issuer::Issuer`], validated and bound by
//! [`binding::BindingEngine`], managed through [`admin::AdminOps`] and purged
//! by [`jobs::sweeper::ExpirySweeper`]. All of them work through a
//! [`store::KeyStore`].

pub mod admin;
pub mod api;
pub mod binding;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod issuer;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod notification;
pub mod store;
