//! The message queue: scheduler, assembler, fragment log and transports
//! owned together by the single queue worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use succinct_core::{PeerId, Team, WireError};

use crate::ack;
use crate::assembler::{FragmentAssembler, SCRATCH_FILE};
use crate::fragment_log::{FragmentLog, SENDING};
use crate::relay::RelayClient;
use crate::scheduler::SourceScheduler;
use crate::store::{RecordStore, StoreError};
use crate::transport::{SendStatus, Transport, TransportRegistry};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("fragment scratch {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fragment scratch {path} is corrupt: position {position} exceeds {max}")]
    CorruptScratch {
        path: PathBuf,
        position: u32,
        max: usize,
    },

    #[error("ack {seq} outside the fragment log (next seq {next})")]
    AckOutOfRange { seq: i64, next: u32 },

    #[error("acked fragment {0} not found in the log")]
    AckNotFound(i64),

    #[error("no transports registered")]
    NoTransports,

    #[error("transport MTU {0} is too small")]
    MtuTooSmall(u32),

    #[error("message of {0} bytes does not fit a length field")]
    MessageTooLarge(usize),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct MessageQueue {
    team: Team,
    team_id: PeerId,
    assembler: FragmentAssembler,
    fragments: FragmentLog,
    scheduler: SourceScheduler,
    transports: TransportRegistry,
}

impl MessageQueue {
    /// Build the queue for the store's team. Returns `None` unless `me` leads
    /// the team; only the leader forwards the team's records.
    pub fn open(
        store: Arc<dyn RecordStore>,
        scratch_dir: &Path,
        me: PeerId,
        transports: Vec<Box<dyn Transport>>,
    ) -> Result<Option<Self>, QueueError> {
        let team_id = store.team_id();
        let Some(team) = store.last_record::<Team>(team_id)? else {
            tracing::debug!(team = %team_id, "no team record, queue not started");
            return Ok(None);
        };
        if team.leader != me {
            tracing::debug!(team = %team_id, leader = %team.leader, "not the leader, queue not started");
            return Ok(None);
        }

        let transports = TransportRegistry::new(transports)?;
        let fragments = FragmentLog::open(store.clone())?;
        let assembler = FragmentAssembler::open(
            scratch_dir.join(SCRATCH_FILE),
            team_id,
            transports.mtu() as usize,
            fragments.next_seq(),
        )?;
        let scheduler = SourceScheduler::open(store, team.epoch)?;
        tracing::info!(
            team = %team_id,
            mtu = transports.mtu(),
            next_seq = assembler.next_seq(),
            "message queue started"
        );

        Ok(Some(Self {
            team,
            team_id,
            assembler,
            fragments,
            scheduler,
            transports,
        }))
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    pub fn team_id(&self) -> PeerId {
        self.team_id
    }

    pub fn mtu(&self) -> u32 {
        self.transports.mtu()
    }

    pub fn scheduler(&self) -> &SourceScheduler {
        &self.scheduler
    }

    pub fn fragments_mut(&mut self) -> &mut FragmentLog {
        &mut self.fragments
    }

    /// Anything to send: an unsent fragment, an open fragment, or a pending
    /// source record.
    pub fn has_pending(&mut self) -> Result<bool, QueueError> {
        Ok(self.fragments.has_after(SENDING)?
            || !self.assembler.is_empty()
            || self.scheduler.has_pending()?)
    }

    /// Run one scheduling pass. Returns whether a fragment was sealed.
    pub fn next_message(&mut self) -> Result<bool, QueueError> {
        self.scheduler
            .next_message(&mut self.assembler, &mut self.fragments)
    }

    pub fn ack_up_to(&mut self, seq: i64) -> Result<usize, QueueError> {
        ack::ack_up_to(&mut self.fragments, seq)
    }

    /// Enroll newly published members. Returns whether anyone was enrolled.
    pub fn watch_members(&mut self) -> Result<bool, QueueError> {
        Ok(self.scheduler.watch_members()?)
    }

    /// Drain the fragment log through the local transports, producing new
    /// fragments as the log runs out.
    pub fn send_next_fragment(&mut self) -> Result<(), QueueError> {
        if !self.has_pending()? {
            return Ok(());
        }
        match self.transports.check_available() {
            SendStatus::Success => {}
            status => {
                tracing::debug!(?status, "no transport available");
                return Ok(());
            }
        }

        self.fragments.cursor().reset(SENDING)?;
        loop {
            if !self.fragments.cursor().next()?
                && !(self.next_message()? && self.fragments.cursor().next()?)
            {
                self.transports.done();
                break;
            }
            let Some(fragment) = self.fragments.current()? else {
                break;
            };
            if self.transports.try_send(&fragment) != SendStatus::Success {
                // keep this fragment as the next to offer
                break;
            }
        }
        self.fragments.cursor().commit_mark()?;
        Ok(())
    }

    /// One wake of the queue worker: the relay path first, then local
    /// transports.
    pub async fn wake(&mut self, relay: Option<&RelayClient>) -> Result<(), QueueError> {
        if let Some(relay) = relay {
            relay.send_pass(self).await?;
        }
        self.send_next_fragment()
    }
}
