/// Answer submission and operator grading.
pub mod answer_service;
/// Authority loop consuming client events from the session channels.
pub mod authority;
/// Buzzer arbitration on top of the write gate.
pub mod buzzer_service;
/// OpenAPI documentation generation.
pub mod documentation;
/// Game-level bus events published on the session channel.
pub mod event_bus;
/// Health check service.
pub mod health_service;
/// WebSocket bridge between remote devices and the private hub.
pub mod hub_socket;
/// Heartbeat handling and the offline sweeper.
pub mod presence_service;
/// Session lifecycle: create, activate, pause, complete, delete.
pub mod session_service;
/// Command application and snapshot publishing for the live session.
pub mod state_service;
/// Storage connection supervisor toggling degraded mode.
pub mod storage_supervisor;
/// Roster management and device slots.
pub mod team_service;
/// Countdown control and tick broadcasting.
pub mod timer_service;
/// Channel transports: private hub and hosted realtime backend.
pub mod transport;

#[cfg(test)]
pub mod testing;
