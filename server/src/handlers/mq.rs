use axum::extract::{Query, State};
use common::mq::{JobberStatus, ReconcileDiff};
use serde::{Deserialize, Serialize};

use crate::handlers::{Envelope, ErrorResponse};
use crate::state::AppState;

const ALL: &str = "all";
const STATUS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

type ControlResult<T> = Result<Envelope<T>, ErrorResponse>;

#[derive(Debug, Deserialize)]
pub struct NameQuery {
    pub name: Option<String>,
}

impl NameQuery {
    fn required(self) -> Result<String, ErrorResponse> {
        self.name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ErrorResponse::missing_param("name"))
    }
}

/// One row of the status listing
#[derive(Debug, Serialize)]
pub struct StatusRow {
    pub name: String,
    pub queue_name: String,
    pub status: &'static str,
    pub status_time: String,
}

impl From<JobberStatus> for StatusRow {
    fn from(status: JobberStatus) -> Self {
        let status_time = status
            .status_time()
            .map(|time| time.format(STATUS_TIME_FORMAT).to_string())
            .unwrap_or_default();

        Self {
            status: status.state.as_str(),
            name: status.name,
            queue_name: status.queue,
            status_time,
        }
    }
}

pub async fn status(State(state): State<AppState>) -> Envelope<Vec<StatusRow>> {
    let rows = state
        .registry()
        .statuses()
        .into_iter()
        .map(StatusRow::from)
        .collect();
    Envelope::success(rows)
}

#[tracing::instrument(skip(state))]
pub async fn start(
    State(state): State<AppState>,
    Query(query): Query<NameQuery>,
) -> ControlResult<String> {
    let name = query.required()?;
    if name == ALL {
        state.registry().start_all().await?;
        return Ok(Envelope::success("All started.".to_string()));
    }

    state.registry().start(&name).await?;
    Ok(Envelope::success(format!("{} started.", name)))
}

#[tracing::instrument(skip(state))]
pub async fn stop(
    State(state): State<AppState>,
    Query(query): Query<NameQuery>,
) -> ControlResult<String> {
    let name = query.required()?;
    if name == ALL {
        state.registry().stop_all().await;
        return Ok(Envelope::success("All stopped.".to_string()));
    }

    state.registry().stop(&name).await?;
    Ok(Envelope::success(format!("{} stopped", name)))
}

#[tracing::instrument(skip(state))]
pub async fn restart(
    State(state): State<AppState>,
    Query(query): Query<NameQuery>,
) -> ControlResult<String> {
    let name = query.required()?;
    if name == ALL {
        state.registry().restart_all().await?;
        return Ok(Envelope::success("All restarted.".to_string()));
    }

    state.registry().restart(&name).await?;
    Ok(Envelope::success(format!("{} restarted", name)))
}

#[tracing::instrument(skip(state))]
pub async fn remove(
    State(state): State<AppState>,
    Query(query): Query<NameQuery>,
) -> ControlResult<String> {
    let name = query.required()?;
    state.registry().remove(&name).await?;
    Ok(Envelope::success(format!("Jobber {} removed", name)))
}

#[tracing::instrument(skip(state))]
pub async fn reread(State(state): State<AppState>) -> ControlResult<ReconcileDiff> {
    let diff = state.registry().reread().await?;
    Ok(Envelope::success(diff))
}

#[tracing::instrument(skip(state))]
pub async fn update(State(state): State<AppState>) -> ControlResult<&'static str> {
    state.registry().update().await?;
    Ok(Envelope::success(""))
}
