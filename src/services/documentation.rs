use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Cohort Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::admin_stream,
        crate::routes::admin::create_batch,
        crate::routes::admin::get_batch,
        crate::routes::admin::add_game,
        crate::routes::admin::start_batch,
        crate::routes::admin::cancel_batch,
        crate::routes::admin::fail_batch,
        crate::routes::admin::get_game,
        crate::routes::admin::add_round,
        crate::routes::admin::pause_game,
        crate::routes::admin::resume_game,
        crate::routes::admin::assign_player,
        crate::routes::admin::add_stage,
        crate::routes::participant::register,
        crate::routes::participant::session,
        crate::routes::participant::close_session,
        crate::routes::participant::ready,
        crate::routes::participant::submit,
        crate::routes::participant::extend_wait,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::sse::Handshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::TransitionEvent,
            crate::dto::admin::CreateBatchRequest,
            crate::dto::admin::AddGameRequest,
            crate::dto::admin::AddRoundRequest,
            crate::dto::admin::AddStageRequest,
            crate::dto::admin::AssignPlayerRequest,
            crate::dto::admin::CreatedResponse,
            crate::dto::admin::ActionResponse,
            crate::dto::admin::BatchSummary,
            crate::dto::admin::GameSummary,
            crate::dto::participant::RegistrationResponse,
            crate::dto::participant::RegistrationStatus,
            crate::dto::participant::ReadyResponse,
            crate::dto::participant::ReadyStatus,
            crate::dto::participant::ExtendWaitResponse,
            crate::dto::participant::SessionResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "admin", description = "Batch, game, round and stage lifecycle control"),
        (name = "participants", description = "Registration, lobby readiness and stage submission"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_lifecycle_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/admin/batches/{id}/cancel"));
        assert!(doc.paths.paths.contains_key("/players/{id}/submit"));
    }
}
