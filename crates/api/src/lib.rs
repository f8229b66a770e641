//! HTTP API: configuration, server wiring, routes and the demo handler.

pub mod app;
pub mod config;
pub mod demo;

use chunkline_infra::HandlerRegistry;

/// Handlers shipped with the binary.
pub fn default_handlers() -> HandlerRegistry {
    HandlerRegistry::new().with(demo::RANGE_HANDLER, demo::RangeHandler::new())
}
