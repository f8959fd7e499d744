use std::sync::Arc;

use crate::intake::worker::IntakeSender;
use crate::intake::Intake;

#[derive(Clone)]
pub struct AppState {
    /// Queue drained by the intake workers.
    pub events: IntakeSender,
    pub intake: Arc<Intake>,
}
