//! HTTP delivery vehicle for the conveyor engine: task-queue endpoints,
//! read-only status RPCs, and a loopback queue for single-process use.

pub mod http;
pub mod queue;
