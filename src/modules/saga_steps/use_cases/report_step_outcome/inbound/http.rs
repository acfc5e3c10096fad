use axum::{
    Json, extract::State, extract::rejection::JsonRejection, http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::modules::saga_steps::core::outcome::StepOutcome;
use crate::modules::saga_steps::use_cases::report_step_outcome::handler::{
    ApplicationError, ReportStepOutcome,
};
use crate::shell::state::AppState;

#[derive(Deserialize)]
pub struct ReportStepOutcomeBody {
    pub saga_id: String,
    pub step: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Serialize)]
pub struct ReportStepOutcomeResponse {
    pub event_id: String,
}

pub async fn handle(
    State(state): State<AppState>,
    body: Result<Json<ReportStepOutcomeBody>, JsonRejection>,
) -> impl IntoResponse {
    let Json(body) = match body {
        Ok(b) => b,
        Err(_) => return StatusCode::UNPROCESSABLE_ENTITY.into_response(),
    };

    let command = ReportStepOutcome {
        saga_id: body.saga_id,
        step: body.step,
        outcome: body.outcome,
    };

    match state.report_handler.handle(command).await {
        Ok(event_id) => (
            StatusCode::ACCEPTED,
            Json(ReportStepOutcomeResponse { event_id }),
        )
            .into_response(),
        Err(ApplicationError::Outcome(_)) => StatusCode::UNPROCESSABLE_ENTITY.into_response(),
        Err(ApplicationError::Publish(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
