/// Backend collaborator trait: change feed, batched commits and conditional writes.
pub mod backend;
/// In-memory backend used in development and tests.
pub mod memory;
/// Mutation input types sent to the backend.
pub mod models;
/// Backend error type.
pub mod storage;
