//! Storage Provisioner
//!
//! A level-triggered Kubernetes controller that turns `Storage` objects into
//! PersistentVolumeClaims and, once a claim is bound, into VolumeAttachments
//! on the requested node.
//!
//! # Architecture
//!
//! ```text
//! Storage ──▶ StorageReconciler ──▶ PersistentVolumeClaim ──▶ ClaimReconciler ──▶ VolumeAttachment
//! ```
//!
//! Reconcilers read from caches and write through narrow ports, so the same
//! logic runs against the API server or the in-memory adapters.
//!
//! # Modules
//!
//! - [`adapters`] - Kubernetes and in-memory implementations of the ports
//! - [`config`] - Controller configuration
//! - [`controller`] - Reconcilers, queue keys and the worker runtime
//! - [`crd`] - The `Storage` custom resource
//! - [`domain`] - Ports and domain events
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`queue`] - Rate-limited work queue

pub mod adapters;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod queue;

// Re-export commonly used types
pub use config::ProvisionerConfig;
pub use controller::{ClaimReconciler, Controller, ControllerBuilder, QueueKey, StorageReconciler};
pub use crd::{Storage, StorageSpec, StorageStatus};
pub use error::{Error, Result};
pub use queue::RateLimitingQueue;
