//! This crate provides the siibra API, an HTTP service over the siibra atlas engine. It serves
//! atlases, parcellations, brain regions, reference spaces, parcellation maps and multimodal
//! features as versioned JSON.
//!
//! A single binary runs in one of three roles:
//!
//! * `all` serves HTTP and runs every operation in-process.
//! * `server` serves HTTP and sends operations to workers through a Redis-backed task queue.
//! * `worker` runs operations from the task queue.
//!
//! Responses are cached, compressed, in Redis or on disk. Every operation can also return its own
//! source code when asked for `text/x-sapi-python`.
//!
//! The siibra API is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of JSON request and response data.
//! * [redis] carries the task queue and the response cache.
//! * [Prometheus](prometheus) collects metrics, exposed on `/metrics`.

pub mod app;
pub mod app_state;
pub mod cache;
pub mod cli;
pub mod compression;
pub mod data_handlers;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod introspect;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod resource_manager;
pub mod role;
pub mod server;
pub mod task_queue;
#[cfg(test)]
pub mod test_utils;
pub mod timers;
pub mod tracing;
pub mod validated_query;
pub mod worker;
