//! Shared application state for the axum router (spec.md §4.9).

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::persistence::PersistenceLayer;
use crate::reporter::Reporter;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PersistenceLayer>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub reporter: Arc<Reporter>,
}
