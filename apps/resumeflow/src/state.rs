use crate::config::Config;
use crate::pipeline::Orchestrator;
use crate::sessions::SessionStore;
use crate::tasks::TaskTracker;

/// Shared application state injected into all route handlers via Axum extractors.
/// Every handle is built once in `main`; nothing is global.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub tracker: TaskTracker,
    pub sessions: SessionStore,
    pub config: Config,
}
