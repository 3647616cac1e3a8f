use serde::Serialize;
use std::time::Duration;

use super::request::{Mode, RebalanceRequest};
use crate::error::RebalanceError;
use crate::graph::{ChannelId, Route};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptError {
    pub kind: String,
    pub message: String,
}

impl From<&RebalanceError> for AttemptError {
    fn from(err: &RebalanceError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceAttempt {
    pub id: String,
    pub request_id: String,
    pub mode: Mode,
    pub amount_msat: u64,
    pub out_scid: Option<String>,
    pub in_scid: Option<String>,
    pub route: Vec<ChannelId>,
    pub fee_msat: u64,
    pub tries: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,
    pub created_at: i64,
}

impl RebalanceAttempt {
    pub fn succeeded(
        request: &RebalanceRequest,
        index: usize,
        route: &Route,
        fee_msat: u64,
        tries: u32,
    ) -> Self {
        Self {
            id: attempt_id(request, index),
            request_id: request.id.clone(),
            mode: request.mode(),
            amount_msat: route.amount_msat,
            out_scid: route.out_scid().map(str::to_string),
            in_scid: route.in_scid().map(str::to_string),
            route: route.channel_ids(),
            fee_msat,
            tries,
            success: true,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// `route` is the last route tried, if the failure happened after a lookup.
    pub fn failed(
        request: &RebalanceRequest,
        index: usize,
        amount_msat: u64,
        route: Option<&Route>,
        tries: u32,
        err: &RebalanceError,
    ) -> Self {
        let (out_scid, in_scid) = match (route, &request.target) {
            (Some(r), _) => (r.out_scid().map(str::to_string), r.in_scid().map(str::to_string)),
            (None, super::request::Target::Circular { out_scid, in_scid }) => {
                (Some(out_scid.clone()), Some(in_scid.clone()))
            }
            (None, super::request::Target::Pull { in_scid, .. }) => (None, Some(in_scid.clone())),
            (None, super::request::Target::Push { out_scid, .. }) => (Some(out_scid.clone()), None),
        };
        Self {
            id: attempt_id(request, index),
            request_id: request.id.clone(),
            mode: request.mode(),
            amount_msat,
            out_scid,
            in_scid,
            route: route.map(|r| r.channel_ids()).unwrap_or_default(),
            fee_msat: 0,
            tries,
            success: false,
            error: Some(AttemptError::from(err)),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

fn attempt_id(request: &RebalanceRequest, index: usize) -> String {
    format!("{}-{}", request.id, index)
}

/// Parse the stored `scid/dir,scid/dir` route form.
pub fn parse_route(s: &str) -> Vec<ChannelId> {
    s.split(',')
        .filter_map(|part| {
            let (scid, dir) = part.rsplit_once('/')?;
            let direction = dir.parse::<u8>().ok()?;
            Some(ChannelId::new(scid, direction))
        })
        .collect()
}

pub fn describe_route(route: &[ChannelId]) -> String {
    route
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Success,
    Partial,
    Failure,
}

/// Aggregate outcome of a request. Always produced, even when nothing moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceSummary {
    pub request_id: String,
    pub mode: Mode,
    pub status: SummaryStatus,
    pub target_msat: u64,
    pub moved_msat: u64,
    pub chunks_attempted: usize,
    pub chunks_succeeded: usize,
    pub fee_msat: u64,
    pub fee_ppm: u64,
    pub elapsed_ms: u64,
    pub attempts: Vec<RebalanceAttempt>,
}

impl RebalanceSummary {
    pub fn from_attempts(
        request: &RebalanceRequest,
        attempts: Vec<RebalanceAttempt>,
        elapsed: Duration,
    ) -> Self {
        let succeeded: Vec<&RebalanceAttempt> = attempts.iter().filter(|a| a.success).collect();
        let moved_msat: u64 = succeeded.iter().map(|a| a.amount_msat).sum();
        let fee_msat: u64 = succeeded.iter().map(|a| a.fee_msat).sum();
        let fee_ppm = if moved_msat == 0 {
            0
        } else {
            (fee_msat as u128 * 1_000_000 / moved_msat as u128) as u64
        };
        let status = if succeeded.len() == attempts.len() && !attempts.is_empty() {
            SummaryStatus::Success
        } else if succeeded.is_empty() {
            SummaryStatus::Failure
        } else {
            SummaryStatus::Partial
        };
        let chunks_succeeded = succeeded.len();

        Self {
            request_id: request.id.clone(),
            mode: request.mode(),
            status,
            target_msat: request.amount_msat,
            moved_msat,
            chunks_attempted: attempts.len(),
            chunks_succeeded,
            fee_msat,
            fee_ppm,
            elapsed_ms: elapsed.as_millis() as u64,
            attempts,
        }
    }
}
