//! GeoPDF Conversion Worker Library
//!
//! Accepts GeoJSON documents, records a durable job for each one, and
//! converts them to PDF on a pool of workers with bounded retries,
//! per-attempt timeouts and an exclusive scratch directory per attempt.
//!
//! ## Module Overview
//!
//! - `job`: job record, statuses, failure kinds and transitions
//! - `validate`: submission parsing and GeoJSON structure checks
//! - `gateway`: submission entry point and status/cancel queries
//! - `store`: job record storage with compare-and-swap updates (Redis or memory)
//! - `queue`: intake of job ids for workers (Redis or memory)
//! - `executor`: worker pool, retry policy and attempt timeouts
//! - `workspace`: per-attempt scratch directories
//! - `converter`: GeoJSON to PDF conversion through GDAL's `ogr2ogr`
//! - `artifact`: durable storage of finished PDFs
//! - `reconcile`: startup recovery after a crash
//! - `http`: axum routes over the gateway
//! - `config`: environment configuration
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geopdf_worker::{
//!     artifact::ArtifactStore,
//!     converter::Ogr2OgrConverter,
//!     executor::{Executor, ExecutorSettings},
//!     gateway::SubmissionGateway,
//!     queue::MemoryJobQueue,
//!     store::{JobLedger, MemoryJobStore},
//!     workspace::{CleanupPolicy, WorkspaceManager},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let ledger = JobLedger::new(Arc::new(MemoryJobStore::new()));
//!     let queue = Arc::new(MemoryJobQueue::new());
//!     let gateway = SubmissionGateway::new(ledger.clone(), queue.clone());
//!
//!     let handle = gateway
//!         .submit(serde_json::json!({
//!             "geojson": {"type": "Point", "coordinates": [4.9, 52.4]},
//!             "outputFilename": "map.pdf"
//!         }))
//!         .await
//!         .unwrap();
//!
//!     let executor = Executor::new(
//!         ledger,
//!         queue,
//!         Arc::new(Ogr2OgrConverter::new("ogr2ogr")),
//!         WorkspaceManager::new("/tmp/geopdf-scratch", CleanupPolicy::default()),
//!         ArtifactStore::new("/tmp/geopdf-artifacts"),
//!         ExecutorSettings::default(),
//!     );
//!     executor.process(&handle.job_id).await.unwrap();
//!
//!     let view = gateway.status(&handle.job_id).await.unwrap();
//!     println!("{view:?}");
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod converter;
pub mod executor;
pub mod gateway;
pub mod http;
pub mod job;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub mod validate;
pub mod workspace;
