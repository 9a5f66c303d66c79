use axum::extract::Query;
use axum::http::StatusCode;
use axum::{routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backtrack::TimeoutPolicy;
use crate::data::{ScheduleInput, ScheduleOutcome, Strategy};
use crate::engine::Scheduler;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Deserialize)]
struct SolveParams {
    strategy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OptimalParams {
    timeout_ms: Option<u64>,
    keep_partial: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ExactParams {
    timeout_ms: Option<u64>,
    chunk_size: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveResponse {
    #[serde(flatten)]
    outcome: ScheduleOutcome,
    fairness_score: f64,
    csv: String,
}

type HandlerError = (StatusCode, String);

fn bad_request(e: String) -> HandlerError {
    (StatusCode::BAD_REQUEST, e)
}

fn build_scheduler(input: ScheduleInput) -> Result<Scheduler, HandlerError> {
    let ScheduleInput {
        volunteers,
        shifts,
        current_assignments,
    } = input;
    let mut sched = Scheduler::new(volunteers, shifts).map_err(bad_request)?;
    sched.prefill(&current_assignments);
    Ok(sched)
}

fn respond(sched: &Scheduler, outcome: ScheduleOutcome) -> Json<SolveResponse> {
    Json(SolveResponse {
        fairness_score: sched.fairness_score(),
        csv: sched.export_csv(),
        outcome,
    })
}

async fn solve_handler(
    Query(params): Query<SolveParams>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<SolveResponse>, HandlerError> {
    let strategy = match params.strategy {
        Some(name) => Strategy::parse(&name).map_err(bad_request)?,
        None => Strategy::default(),
    };
    let mut sched = build_scheduler(input)?;
    let outcome = sched.assign(strategy);
    Ok(respond(&sched, outcome))
}

async fn solve_optimal_handler(
    Query(params): Query<OptimalParams>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<SolveResponse>, HandlerError> {
    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    let policy = if params.keep_partial.unwrap_or(false) {
        TimeoutPolicy::KeepBestPartial
    } else {
        TimeoutPolicy::DiscardPartial
    };
    let mut sched = build_scheduler(input)?;
    let outcome = sched.assign_optimal(timeout, policy);
    Ok(respond(&sched, outcome))
}

async fn solve_exact_handler(
    Query(params): Query<ExactParams>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<SolveResponse>, HandlerError> {
    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    let mut sched = build_scheduler(input)?;
    let outcome = match params.chunk_size {
        Some(chunk_size) => sched
            .assign_exact_chunked(chunk_size, timeout)
            .map_err(bad_request)?,
        None => sched.assign_exact(timeout).map_err(bad_request)?,
    };
    Ok(respond(&sched, outcome))
}

pub async fn run_server() {
    let app = Router::new()
        .route("/v1/schedule/solve", post(solve_handler))
        .route("/v1/schedule/solve_optimal", post(solve_optimal_handler))
        .route("/v1/schedule/solve_exact", post(solve_exact_handler));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
        .await
        .unwrap();

    println!("Server running at http://{}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
