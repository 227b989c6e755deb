//! Per-conversation actor: buffers qualifying messages and decides when to dispatch.
//!
//! A new message restarts the quiet period, but a cycle never waits longer than
//! `max_wait` after its first buffered message. While a dispatch is in flight,
//! new messages are only buffered; a fresh quiet period starts once it finishes.

use crate::agent::dispatch::DispatchPipeline;
use crate::config::DebounceConfig;
use crate::{ConversationId, InboundMessage};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// Held for the whole of a dispatch. Outlives the actor, so a respawned actor
/// for the same conversation waits for a dispatch its predecessor started.
pub type DispatchLane = Arc<Mutex<()>>;

/// Input to a conversation actor.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// A qualifying message to buffer.
    Message(InboundMessage),
    /// Dispatch as soon as nothing is in flight, even with an empty buffer.
    Retry,
}

/// Signals the actor when a dispatch task ends, including by panic.
struct DispatchGuard(mpsc::Sender<()>);

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub struct ConversationChannel {
    pub id: ConversationId,
    pipeline: Arc<DispatchPipeline>,
    debounce: DebounceConfig,
    inbox: mpsc::Receiver<ConversationEvent>,
    lane: DispatchLane,
    /// Messages not yet handed to a dispatch, in arrival order.
    pending: Vec<InboundMessage>,
    /// When the first message of the current cycle was buffered.
    cycle_started: Option<Instant>,
    dispatch_deadline: Option<Instant>,
    in_flight: bool,
    retry_requested: bool,
    done_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
}

impl ConversationChannel {
    pub fn new(
        id: ConversationId,
        pipeline: Arc<DispatchPipeline>,
        debounce: DebounceConfig,
        inbox: mpsc::Receiver<ConversationEvent>,
        lane: DispatchLane,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel(1);
        Self {
            id,
            pipeline,
            debounce,
            inbox,
            lane,
            pending: Vec::new(),
            cycle_started: None,
            dispatch_deadline: None,
            in_flight: false,
            retry_requested: false,
            done_tx,
            done_rx,
        }
    }

    /// Run until the inbox closes. Whatever is still buffered then is dropped.
    pub async fn run(mut self) {
        tracing::debug!(conversation_id = self.id, "conversation channel started");

        loop {
            let sleep_duration = self
                .dispatch_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            let timer_armed = self.dispatch_deadline.is_some() && !self.in_flight;

            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(ConversationEvent::Message(message)) => self.buffer(message),
                    Some(ConversationEvent::Retry) => self.request_retry(),
                    None => break,
                },
                Some(()) = self.done_rx.recv(), if self.in_flight => {
                    self.dispatch_finished();
                }
                _ = tokio::time::sleep(sleep_duration), if timer_armed => {
                    self.dispatch();
                }
            }
        }

        if !self.pending.is_empty() {
            tracing::debug!(
                conversation_id = self.id,
                dropped = self.pending.len(),
                "conversation channel stopped with buffered messages"
            );
        }
    }

    fn buffer(&mut self, message: InboundMessage) {
        tracing::trace!(conversation_id = self.id, message_id = message.id, "buffering message");
        self.pending.push(message);
        let now = Instant::now();
        let cycle_started = *self.cycle_started.get_or_insert(now);
        if !self.in_flight {
            self.arm_timer(now, cycle_started);
        }
    }

    fn request_retry(&mut self) {
        self.retry_requested = true;
        if !self.in_flight {
            self.dispatch_deadline = Some(Instant::now());
        }
    }

    /// Restart the quiet period, capped at `max_wait` from the cycle start.
    fn arm_timer(&mut self, now: Instant, cycle_started: Instant) {
        let quiet = now + self.debounce.quiet_period();
        let cap = cycle_started + self.debounce.max_wait();
        self.dispatch_deadline = Some(quiet.min(cap));
    }

    fn dispatch(&mut self) {
        self.dispatch_deadline = None;
        self.cycle_started = None;
        let forced = std::mem::take(&mut self.retry_requested);
        if self.pending.is_empty() && !forced {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        tracing::debug!(conversation_id = self.id, batch = batch.len(), forced, "dispatching");

        self.in_flight = true;
        let guard = DispatchGuard(self.done_tx.clone());
        let pipeline = self.pipeline.clone();
        let lane = self.lane.clone();
        let id = self.id;
        tokio::spawn(async move {
            let _guard = guard;
            let _lane = lane.lock_owned().await;
            pipeline.run_turn(id, batch).await;
        });
    }

    fn dispatch_finished(&mut self) {
        self.in_flight = false;
        let now = Instant::now();
        if self.retry_requested {
            self.dispatch_deadline = Some(now);
        } else if !self.pending.is_empty() {
            self.cycle_started = Some(now);
            self.arm_timer(now, now);
        }
    }
}
