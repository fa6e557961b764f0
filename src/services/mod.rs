/// Admin service for batch and game lifecycle operations.
pub mod admin_service;
/// Lobby placement, readiness and timeouts.
pub mod admission;
/// OpenAPI documentation generation.
pub mod documentation;
/// Change feed supervision and mutation writer.
pub mod feed;
/// Health check service.
pub mod health_service;
/// Pending mutation buffer.
pub mod mutations;
/// Batch, game, round and stage lifecycle driver.
pub mod orchestrator;
/// Participant registration, readiness and submissions.
pub mod participant_service;
/// In-process index of the experiment hierarchy.
pub mod registry;
/// Server-Sent Events message generation.
pub mod sse_events;
/// Server-Sent Events broadcasting service.
pub mod sse_service;
/// At-most-once lifecycle hooks.
pub mod triggers;
