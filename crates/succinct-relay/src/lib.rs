//! succinct-relay — HTTP relay that accepts fragment uploads from team
//! leaders and reassembles them into team events.
//!
//! ```text
//! GET  /succinct/api/v1/ack/{team}             404 until the first fragment, then "<last seq>"
//! POST /succinct/api/v1/uploadFragment/{team}  body = fragment, answers "<last seq>"
//! ```
//!
//! Fragments are held in memory and accepted strictly in order; anything
//! else is answered with the current last sequence so the uploader rewinds.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use dashmap::DashMap;

use succinct_core::wire::FragmentHeader;
use succinct_core::{PeerId, TeamEvent, WireError};
use succinct_services::relay::API_PREFIX;
use succinct_services::Reassembler;

#[derive(Default)]
struct TeamLog {
    fragments: Vec<Bytes>,
    reassembler: Reassembler,
    /// Learned from the team's CreateTeam event.
    epoch: i64,
    events: Vec<TeamEvent>,
}

impl TeamLog {
    fn last_seq(&self) -> i64 {
        self.fragments.len() as i64 - 1
    }

    fn accept(&mut self, team: &PeerId, fragment: Bytes) -> Result<(), WireError> {
        let messages = self.reassembler.push(&fragment)?;
        self.fragments.push(fragment);
        for (kind, body) in messages {
            match TeamEvent::decode(kind, &body, self.epoch) {
                Ok(event) => {
                    if let TeamEvent::CreateTeam { epoch, .. } = &event {
                        self.epoch = *epoch;
                    }
                    tracing::info!(%team, ?event, "team event");
                    self.events.push(event);
                }
                Err(e) => tracing::warn!(%team, ?kind, error = %e, "undecodable message"),
            }
        }
        Ok(())
    }
}

/// Why an upload was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum Rejected {
    Malformed,
    WrongTeam,
}

#[derive(Clone, Default)]
pub struct RelayState {
    teams: Arc<DashMap<PeerId, TeamLog>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last stored sequence, `None` until the team's first fragment.
    pub fn last_seq(&self, team: &PeerId) -> Option<i64> {
        self.teams
            .get(team)
            .map(|log| log.last_seq())
            .filter(|&seq| seq >= 0)
    }

    /// Store `fragment` if it is the next in `team`'s sequence. Returns the
    /// last stored sequence, -1 when nothing is stored.
    pub fn upload(&self, team: PeerId, fragment: Bytes) -> Result<i64, Rejected> {
        let header = FragmentHeader::parse(&fragment).map_err(|_| Rejected::Malformed)?;
        if header.team_id() != team {
            return Err(Rejected::WrongTeam);
        }

        let mut log = self.teams.entry(team).or_default();
        let seq = header.seq();
        if i64::from(seq) == log.last_seq() + 1 {
            log.accept(&team, fragment)
                .map_err(|_| Rejected::Malformed)?;
            tracing::debug!(%team, seq, "fragment stored");
        } else {
            tracing::debug!(%team, seq, last = log.last_seq(), "out-of-order fragment ignored");
        }
        Ok(log.last_seq())
    }

    /// Every event reassembled for `team` so far.
    pub fn events(&self, team: &PeerId) -> Vec<TeamEvent> {
        self.teams
            .get(team)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/ack/{{team}}"), get(get_ack))
        .route(&format!("{API_PREFIX}/uploadFragment/{{team}}"), post(upload_fragment))
        .with_state(state)
}

fn parse_team(team: &str) -> Result<PeerId, Response> {
    team.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "malformed team id").into_response())
}

async fn get_ack(State(state): State<RelayState>, Path(team): Path<String>) -> Response {
    let team = match parse_team(&team) {
        Ok(team) => team,
        Err(resp) => return resp,
    };
    match state.last_seq(&team) {
        Some(seq) => (StatusCode::OK, seq.to_string()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn upload_fragment(
    State(state): State<RelayState>,
    Path(team): Path<String>,
    body: Bytes,
) -> Response {
    let team = match parse_team(&team) {
        Ok(team) => team,
        Err(resp) => return resp,
    };
    match state.upload(team, body) {
        Ok(seq) => (StatusCode::OK, seq.to_string()).into_response(),
        Err(Rejected::Malformed) => (StatusCode::BAD_REQUEST, "malformed fragment").into_response(),
        Err(Rejected::WrongTeam) => {
            (StatusCode::BAD_REQUEST, "fragment belongs to another team").into_response()
        }
    }
}
