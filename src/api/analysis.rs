use std::collections::BTreeSet;

use axum::{extract::State, routing::post, Json, Router};

use crate::api::errors::ApiError;
use crate::api::guards::{require_course_role, CurrentUser};
use crate::api::{ok, ApiResult};
use crate::core::state::AppState;
use crate::db::types::CourseRole;
use crate::grading::analysis::{individual_analysis, pairwise_analysis, split_submission_id};
use crate::jobs::JobOptions;
use crate::models::user::ServerUser;
use crate::schemas::submission::{AnalysisRequest, IndividualAnalysisResponse, PairwiseAnalysisResponse};

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/individual", post(individual)).route("/pairwise", post(pairwise))
}

/// Graders of every course the submissions belong to may analyze them.
async fn authorize(state: &AppState, user: &ServerUser, submissions: &[String]) -> Result<(), ApiError> {
    let mut courses = BTreeSet::new();
    for full_id in submissions {
        let Some((course_id, ..)) = split_submission_id(full_id) else {
            return Err(ApiError::bad_request("-070", format!("Malformed submission id: '{full_id}'.")));
        };
        courses.insert(course_id.to_string());
    }

    for course_id in &courses {
        require_course_role(state, user, course_id, CourseRole::Grader).await?;
    }
    Ok(())
}

fn job_options(payload: &AnalysisRequest) -> JobOptions {
    JobOptions {
        wait_for_completion: payload.wait_for_completion,
        dry_run: payload.dry_run,
        overwrite_records: payload.overwrite_records,
        ..JobOptions::default()
    }
}

async fn individual(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<AnalysisRequest>,
) -> ApiResult<IndividualAnalysisResponse> {
    authorize(&state, &user, &payload.submissions).await?;
    let options = job_options(&payload);

    let output = individual_analysis(&state, state.shutdown(), payload.submissions, options).await?;

    ok(IndividualAnalysisResponse {
        complete: output.remaining == 0 && !output.canceled,
        pending: output.remaining,
        results: output.results.into_values().collect(),
        work_errors: output.work_errors,
    })
}

async fn pairwise(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<AnalysisRequest>,
) -> ApiResult<PairwiseAnalysisResponse> {
    authorize(&state, &user, &payload.submissions).await?;
    let options = job_options(&payload);

    let output = pairwise_analysis(&state, state.shutdown(), &payload.submissions, options).await?;

    ok(PairwiseAnalysisResponse {
        complete: output.remaining == 0 && !output.canceled,
        pending: output.remaining,
        results: output.results.into_values().collect(),
        work_errors: output.work_errors.into_iter().map(|(key, err)| (key.to_string(), err)).collect(),
    })
}
