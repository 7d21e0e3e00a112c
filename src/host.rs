//! The hosting side: a long-poll accept loop that negotiates every incoming
//! petition concurrently and exposes finished channels through an ordered,
//! asynchronously consumed queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::relay::CandidateRelay;
use crate::session::{self, DEFAULT_OPEN_TIMEOUT};
use crate::signaling::Signaling;
use crate::signaling::retry::poll_once;
use crate::transport::Channel;

/// The queue only ever needs to close a channel it is retiring and to tell
/// two handles to the same channel apart.
#[async_trait]
pub(crate) trait QueueChannel: Clone + Send + Sync + 'static {
    async fn close(&self);

    fn is_same(&self, other: &Self) -> bool;
}

#[async_trait]
impl QueueChannel for Channel {
    async fn close(&self) {
        Channel::close(self).await;
    }

    fn is_same(&self, other: &Self) -> bool {
        self.same_channel(other)
    }
}

struct QueueState<C> {
    entries: VecDeque<(String, C)>,
    /// Last channel delivered or queued per display name; a new arrival for
    /// a present name supersedes the old channel.
    live: HashMap<String, C>,
    stopped: bool,
}

enum Arrival<C> {
    Fresh,
    Replaces(C),
    Rejected,
}

/// FIFO of finished channels plus a wake-one-waiter notification.
pub(crate) struct ChannelQueue<C> {
    state: Mutex<QueueState<C>>,
    notify: Notify,
}

impl<C: QueueChannel> ChannelQueue<C> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                live: HashMap::new(),
                stopped: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends a finished channel, retiring any previous channel for the
    /// same display name first: the old channel is closed and its close
    /// handlers given a tick to run before the new entry becomes visible.
    /// A delivery that is itself superseded while closing its predecessor
    /// loses: its channel is closed instead of enqueued, as after `stop`.
    pub(crate) async fn deliver(&self, user: String, channel: C) {
        let arrival = {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                Arrival::Rejected
            } else {
                if let Some(stale) = state.entries.iter().position(|(name, _)| name == &user) {
                    state.entries.remove(stale);
                }
                match state.live.insert(user.clone(), channel.clone()) {
                    Some(old) => Arrival::Replaces(old),
                    None => Arrival::Fresh,
                }
            }
        };

        match arrival {
            Arrival::Rejected => {
                channel.close().await;
                return;
            }
            Arrival::Replaces(old) => {
                debug!(target: "host", user = %user, "superseding stale channel");
                old.close().await;
                tokio::task::yield_now().await;
            }
            Arrival::Fresh => {}
        }

        let rejected = {
            let mut state = self.state.lock().unwrap();
            // A concurrent delivery for the same name may have taken over the
            // live slot while this one was suspended closing its predecessor.
            let still_live = state
                .live
                .get(&user)
                .is_some_and(|current| current.is_same(&channel));
            if state.stopped || !still_live {
                true
            } else {
                state.entries.push_back((user, channel.clone()));
                self.notify.notify_one();
                false
            }
        };
        if rejected {
            channel.close().await;
        }
    }

    /// Head of the queue, suspending until an entry arrives. `None` once
    /// the queue has been stopped and drained.
    pub(crate) async fn next(&self) -> Option<(String, C)> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(entry) = state.entries.pop_front() {
                    return Some(entry);
                }
                if state.stopped {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks the queue stopped, closes everything still queued, and wakes
    /// all waiters so they observe shutdown.
    pub(crate) async fn stop(&self) {
        let drained: Vec<(String, C)> = {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
            state.live.clear();
            state.entries.drain(..).collect()
        };
        for (_, channel) in drained {
            channel.close().await;
        }
        self.notify.notify_waiters();
    }
}

/// A hosted room: accepts joiners for as long as it listens.
pub struct Host {
    room: String,
    id: String,
    queue: Arc<ChannelQueue<Channel>>,
    listening: Arc<AtomicBool>,
    listen_task: tokio::task::JoinHandle<()>,
}

impl Host {
    /// Starts accepting joiners for `room` with the default negotiation
    /// timeout.
    pub fn open(signaling: Arc<dyn Signaling>, room: impl Into<String>) -> Self {
        Self::open_with_timeout(signaling, room, DEFAULT_OPEN_TIMEOUT)
    }

    pub fn open_with_timeout(
        signaling: Arc<dyn Signaling>,
        room: impl Into<String>,
        open_timeout: Duration,
    ) -> Self {
        let room = room.into();
        let id = Uuid::new_v4().to_string();
        let relay = CandidateRelay::new(id.clone(), signaling.clone());
        let queue = Arc::new(ChannelQueue::new());
        let listening = Arc::new(AtomicBool::new(true));
        let listen_task = tokio::spawn(listen(
            signaling,
            relay,
            room.clone(),
            id.clone(),
            queue.clone(),
            listening.clone(),
            open_timeout,
        ));
        Self {
            room,
            id,
            queue,
            listening,
            listen_task,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Identity this host signals under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next finished `(display name, channel)` pair in negotiation
    /// completion order; suspends while none is ready, `None` after `stop`.
    pub async fn next_channel(&self) -> Option<(String, Channel)> {
        self.queue.next().await
    }

    /// Stops listening and closes every unconsumed channel. Sessions still
    /// negotiating complete on their own; their channels are closed on
    /// arrival instead of delivered.
    pub async fn stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.queue.stop().await;
        info!(target: "host", room = %self.room, "stopped hosting");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.listen_task.abort();
    }
}

async fn listen(
    signaling: Arc<dyn Signaling>,
    relay: Arc<CandidateRelay>,
    room: String,
    id: String,
    queue: Arc<ChannelQueue<Channel>>,
    listening: Arc<AtomicBool>,
    open_timeout: Duration,
) {
    info!(target: "host", room = %room, "listening for petitions");
    while listening.load(Ordering::SeqCst) {
        let Some(petition) = poll_once(signaling.poll_petition(&room, &id)).await else {
            continue;
        };
        debug!(target: "host", user = %petition.user, petitioner = %petition.id, "petition received");

        // Negotiated off the loop so further petitions are polled while
        // this one is still mid-exchange.
        let signaling = signaling.clone();
        let relay = relay.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            match session::respond(&signaling, &relay, petition, open_timeout).await {
                Ok((user, channel)) => queue.deliver(user, channel).await,
                Err(err) => debug!(target: "host", error = %err, "negotiation attempt failed"),
            }
        });
    }
    debug!(target: "host", room = %room, "accept loop exited");
}
