//! External module release controller.
//!
//! Decides which version of every externally supplied module is live,
//! records that decision on the release records and keeps the on-disk
//! module tree in line with it.
//!
//! ## Architecture
//!
//! - **Reconciler**: drives releases through their phases and activates the
//!   desired version on disk
//! - **Preflight**: repairs drift between records and the tree at startup
//! - **Restart coordinator**: turns bursts of tree changes into one restart
//! - **Documentation sync**: pushes deployed documentation to every builder
//!
//! The pure decision logic (predictor, phases, update policy gate) lives in
//! `extmod-reconcile`.

pub mod config;
pub mod controller;
pub mod docs;
pub mod downloader;
pub mod fs;
pub mod model;
pub mod preflight;
pub mod queue;
pub mod reconciler;
pub mod restart;
pub mod store;
pub mod validator;

pub use config::Config;
pub use controller::{Controller, ControllerError};
pub use reconciler::{ReconcileError, ReconcilerConfig, ReleaseReconciler};
pub use store::{MemoryStore, Store, StoreError, Stores};
