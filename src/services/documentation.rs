use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the live quiz backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::hub::ws_handler,
        crate::routes::sessions::list_sessions,
        crate::routes::sessions::create_session,
        crate::routes::sessions::get_session,
        crate::routes::sessions::delete_session,
        crate::routes::sessions::activate_session,
        crate::routes::sessions::pause_session,
        crate::routes::sessions::complete_session,
        crate::routes::live::get_snapshot,
        crate::routes::live::load_snapshot,
        crate::routes::live::launch_question,
        crate::routes::live::stop_question,
        crate::routes::live::arm,
        crate::routes::live::disarm,
        crate::routes::live::resolve,
        crate::routes::live::buzz,
        crate::routes::live::reveal,
        crate::routes::live::set_excluded,
        crate::routes::live::set_leaderboard,
        crate::routes::live::reset_all,
        crate::routes::live::start_timer,
        crate::routes::live::stop_timer,
        crate::routes::live::reset_timer,
        crate::routes::live::submit_answer,
        crate::routes::live::grade_answer,
        crate::routes::teams::create_team,
        crate::routes::teams::adjust_score,
        crate::routes::teams::kick_team,
        crate::routes::teams::connect_device,
        crate::routes::teams::disconnect_device,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::envelope::Envelope,
            crate::dto::session::SessionSnapshot,
            crate::dto::session::SessionSummary,
            crate::dto::session::SessionDetail,
            crate::dto::team::TeamSummary,
            crate::state::game::GameState,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "hub", description = "Private channel hub for devices and mirrors"),
        (name = "sessions", description = "Session lifecycle"),
        (name = "live", description = "Control-room commands on the live session"),
        (name = "teams", description = "Roster and device slots"),
    )
)]
pub struct ApiDoc;
