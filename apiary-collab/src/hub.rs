//! The coordinator task.
//!
//! ```text
//! connection ─┐                       ┌──────────────────────┐
//! connection ─┼── mpsc<Command> ────► │ hub task             │
//! connection ─┘                       │   Session            │
//!                                     │     Coordinator      │
//!      cleanup tick ────────────────► │     Roster           │
//!                                     └──────────┬───────────┘
//!                                                │ Outbound (audience, frame)
//!                                                ▼
//!                                         BroadcastGroup
//! ```
//!
//! All core state lives in one [`Session`] owned by one task, so inbound
//! calls are applied one at a time in arrival order. Connection tasks only
//! ever talk to it through a [`CoordinatorHandle`].

use std::sync::Arc;
use std::time::Duration;

use apiary_core::{ActorId, CleanupReport, Coordinator, CoreError, ExportFormat};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::broadcast::{Audience, BroadcastGroup};
use crate::protocol::{CollectionSummary, Event, ExecutionSummary, Frame, Request};
use crate::roster::Roster;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("coordinator task has stopped")]
    Closed,
}

/// An event frame and who should see it.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub audience: Audience,
    pub frame: Frame,
}

/// Collects the events produced by one inbound call.
///
/// The request's correlation id is only echoed on frames its sender will
/// receive.
struct Replies<'a> {
    actor: &'a str,
    correlation: u64,
    out: Vec<Outbound>,
}

impl<'a> Replies<'a> {
    fn new(actor: &'a str, correlation: u64) -> Self {
        Self {
            actor,
            correlation,
            out: Vec::new(),
        }
    }

    fn push(&mut self, audience: Audience, event: Event) {
        let correlation = if audience.includes(self.actor) {
            self.correlation
        } else {
            0
        };
        self.out.push(Outbound {
            audience,
            frame: Frame::event(self.actor, correlation, event),
        });
    }

    fn reply(&mut self, event: Event) {
        self.push(Audience::Only(self.actor.to_string()), event);
    }

    fn everyone(&mut self, event: Event) {
        self.push(Audience::Everyone, event);
    }

    fn others(&mut self, event: Event) {
        self.push(Audience::EveryoneBut(self.actor.to_string()), event);
    }

    fn error(&mut self, request: &str, err: CoreError) {
        log::debug!("{} failed for {}: {err}", request, self.actor);
        self.reply(Event::Error {
            message: err.to_string(),
        });
    }
}

/// Coordinator plus the participant roster: everything the hub owns.
pub struct Session {
    coordinator: Coordinator,
    roster: Roster,
}

impl Session {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            roster: Roster::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn connect(&mut self, actor: &str) -> Vec<Outbound> {
        let user = self.roster.join(actor, self.coordinator.now());
        log::info!("{} ({actor}) connected, {} online", user.name, self.roster.len());

        let mut replies = Replies::new(actor, 0);
        replies.reply(Event::Welcome {
            actor: actor.to_string(),
            online: self.roster.online(),
        });
        replies.others(Event::UserJoined {
            user,
            online: self.roster.online(),
        });
        replies.out
    }

    /// Remove `actor` from the roster and drop their uncommitted operations.
    pub fn disconnect(&mut self, actor: &str) -> Vec<Outbound> {
        let mut replies = Replies::new(actor, 0);
        let Some(user) = self.roster.leave(actor) else {
            return replies.out;
        };
        let dropped = self.coordinator.acknowledge(actor);
        log::info!(
            "{} ({actor}) disconnected, {dropped} pending operation(s) dropped",
            user.name
        );
        replies.everyone(Event::UserLeft {
            user,
            online: self.roster.online(),
        });
        replies.out
    }

    pub fn cleanup(&mut self) -> CleanupReport {
        self.coordinator.cleanup_now()
    }

    /// Apply one inbound call and return the events it produced.
    pub fn handle(&mut self, actor: &str, correlation: u64, request: Request) -> Vec<Outbound> {
        let name = request.name();
        log::debug!("{name} from {actor} (correlation {correlation})");
        self.roster.touch(actor, self.coordinator.now());

        let mut replies = Replies::new(actor, correlation);
        let c = &mut self.coordinator;

        match request {
            Request::SetUserName { name: new_name } => match self.roster.rename(actor, &new_name) {
                Some(old_name) => replies.everyone(Event::UserNameChanged {
                    actor: actor.to_string(),
                    old_name,
                    new_name: new_name.trim().to_string(),
                    online: self.roster.online(),
                }),
                None => replies.error(
                    name,
                    CoreError::InvalidArgument("name must not be blank".into()),
                ),
            },
            Request::GetOnlineUsers => replies.reply(Event::OnlineUsers {
                users: self.roster.online(),
            }),
            Request::Ping => replies.reply(Event::Pong { timestamp: c.now() }),

            Request::SubmitOperation { kind } => match c.submit_operation(kind, actor) {
                Ok(operation) => replies.everyone(Event::OperationCommitted { operation }),
                Err(e) => replies.error(name, e),
            },
            Request::ProposeOperation { kind } => {
                let operation = c.propose_operation(kind, actor);
                replies.everyone(Event::OperationProposed { operation });
            }
            Request::SubmitProposed { id } => match c.submit_proposed(&id, actor) {
                Ok(operation) => replies.everyone(Event::OperationCommitted { operation }),
                Err(e) => replies.error(name, e),
            },
            Request::Acknowledge => {
                let dropped = c.acknowledge(actor) as u64;
                replies.reply(Event::Acknowledged { dropped });
            }
            Request::RecentOperations { limit } => replies.reply(Event::RecentOperations {
                operations: c.recent_operations(limit as usize),
            }),

            Request::AcquireLock { resource, ttl_ms } => {
                match c.acquire_lock(&resource, actor, ttl_ms.map(Duration::from_millis)) {
                    Ok(Ok(grant)) => replies.everyone(Event::LockGranted { grant }),
                    Ok(Err(denied)) => replies.reply(Event::LockDenied { denied }),
                    Err(e) => replies.error(name, e),
                }
            }
            Request::ReleaseLock { resource } => {
                if c.release_lock(&resource, actor) {
                    replies.everyone(Event::LockReleased {
                        resource,
                        holder: actor.to_string(),
                    });
                } else {
                    replies.reply(Event::LockNotHeld { resource });
                }
            }

            Request::MergeVersions { base, incoming } => replies.reply(Event::Merged {
                record: c.merge_versions(&base, &incoming, actor),
            }),

            Request::RecordExecution {
                request,
                response,
                extra,
            } => match c.save_history_entry(request, response, actor, extra) {
                Ok(entry) => {
                    let summary = ExecutionSummary {
                        history_id: entry.id,
                        method: entry.request.method.clone(),
                        url: entry.request.url.clone(),
                        status: entry.response.status,
                        user_name: self.roster.name_of(actor),
                        timestamp: entry.timestamp,
                    };
                    replies.reply(Event::HistorySaved { entry });
                    replies.others(Event::RequestExecuted { summary });
                }
                Err(e) => replies.error(name, e),
            },
            Request::UserHistory { limit } => replies.reply(Event::History {
                entries: c.user_history(actor, limit as usize),
            }),
            Request::AllHistory { limit } => replies.reply(Event::History {
                entries: c.all_history(limit as usize),
            }),
            Request::Replay { history_id } => match c.replay(&history_id, actor) {
                Ok(request) => replies.reply(Event::ReplayReady {
                    history_id,
                    request,
                }),
                Err(e) => replies.error(name, e),
            },

            Request::CreateBundle {
                name: bundle_name,
                history_ids,
                description,
            } => match c.bundle(&bundle_name, &history_ids, actor, description.as_deref()) {
                Ok(bundle) => replies.reply(Event::BundleCreated { bundle }),
                Err(e) => replies.error(name, e),
            },
            Request::ExportBundle { bundle_id } => {
                match c.export_bundle(&bundle_id, ExportFormat::Json) {
                    Ok(exported) => replies.reply(Event::BundleExported { exported }),
                    Err(e) => replies.error(name, e),
                }
            }
            Request::ImportBundle { payload } => match c.import_bundle(&payload, actor) {
                Ok(bundle) => replies.reply(Event::BundleImported { bundle }),
                Err(e) => replies.error(name, e),
            },

            Request::CreateCollection {
                name: collection_name,
                description,
            } => match c.create_collection(&collection_name, &description, actor) {
                Ok(collection) => {
                    let summary = CollectionSummary {
                        id: collection.id,
                        name: collection.name.clone(),
                        description: collection.description.clone(),
                        created_by: self.roster.name_of(actor),
                        created_at: collection.created_at,
                    };
                    replies.reply(Event::CollectionCreated { collection });
                    replies.others(Event::NewCollectionAvailable { summary });
                }
                Err(e) => replies.error(name, e),
            },
            Request::JoinCollection { collection_id } => {
                match c.join_collection(&collection_id, actor) {
                    Ok(collection) => {
                        let others: Vec<ActorId> = collection
                            .collaborators
                            .iter()
                            .filter(|id| id.as_str() != actor)
                            .cloned()
                            .collect();
                        replies.reply(Event::CollectionJoined { collection });
                        if !others.is_empty() {
                            replies.push(
                                Audience::Actors(others),
                                Event::CollaboratorJoined {
                                    collection_id,
                                    actor: actor.to_string(),
                                    name: self.roster.name_of(actor),
                                },
                            );
                        }
                    }
                    Err(e) => replies.error(name, e),
                }
            }
            Request::AddRequestToCollection {
                collection_id,
                request,
            } => match c.add_request_to_collection(&collection_id, request, actor) {
                Ok((entry, collaborators)) => replies.push(
                    Audience::Actors(collaborators),
                    Event::RequestAddedToCollection {
                        collection_id,
                        entry,
                        added_by: self.roster.name_of(actor),
                    },
                ),
                Err(e) => replies.error(name, e),
            },
            Request::GetCollections => replies.reply(Event::Collections {
                collections: c.collections_for(actor),
            }),
        }

        replies.out
    }
}

enum Command {
    Connect {
        actor: ActorId,
    },
    Disconnect {
        actor: ActorId,
    },
    Request {
        actor: ActorId,
        correlation: u64,
        request: Request,
        reply: Option<oneshot::Sender<Vec<Frame>>>,
    },
    Cleanup {
        reply: oneshot::Sender<CleanupReport>,
    },
}

/// Cloneable sender side of the coordinator queue.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn connect(&self, actor: &str) -> Result<(), HubError> {
        self.send(Command::Connect {
            actor: actor.to_string(),
        })
        .await
    }

    pub async fn disconnect(&self, actor: &str) -> Result<(), HubError> {
        self.send(Command::Disconnect {
            actor: actor.to_string(),
        })
        .await
    }

    /// Queue a request; its events reach participants through the broadcast.
    pub async fn submit(
        &self,
        actor: &str,
        correlation: u64,
        request: Request,
    ) -> Result<(), HubError> {
        self.send(Command::Request {
            actor: actor.to_string(),
            correlation,
            request,
            reply: None,
        })
        .await
    }

    /// Apply a request and wait for the frames addressed to `actor`.
    ///
    /// The frames are also published like any other.
    pub async fn call(&self, actor: &str, request: Request) -> Result<Vec<Frame>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Request {
            actor: actor.to_string(),
            correlation: 0,
            request,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Run a maintenance pass now.
    pub async fn cleanup(&self) -> Result<CleanupReport, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cleanup { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// Hub task settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub cleanup_interval: Duration,
}

/// Start the coordinator task.
///
/// The task ends once every [`CoordinatorHandle`] has been dropped.
pub fn spawn_hub(
    session: Session,
    broadcast: Arc<BroadcastGroup>,
    config: HubConfig,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let task = tokio::spawn(run_hub(session, broadcast, rx, config.cleanup_interval));
    (CoordinatorHandle { tx }, task)
}

async fn run_hub(
    mut session: Session,
    broadcast: Arc<BroadcastGroup>,
    mut rx: mpsc::Receiver<Command>,
    cleanup_interval: Duration,
) {
    let period = cleanup_interval.max(Duration::from_secs(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log::info!("Coordinator task started (cleanup every {}s)", period.as_secs());

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Connect { actor } => {
                        publish(&broadcast, session.connect(&actor));
                    }
                    Command::Disconnect { actor } => {
                        publish(&broadcast, session.disconnect(&actor));
                    }
                    Command::Request { actor, correlation, request, reply } => {
                        let out = session.handle(&actor, correlation, request);
                        if let Some(reply) = reply {
                            let mine = out
                                .iter()
                                .filter(|o| o.audience.includes(&actor))
                                .map(|o| o.frame.clone())
                                .collect();
                            let _ = reply.send(mine);
                        }
                        publish(&broadcast, out);
                    }
                    Command::Cleanup { reply } => {
                        let _ = reply.send(session.cleanup());
                    }
                }
            }

            _ = ticker.tick() => {
                session.cleanup();
            }
        }
    }

    log::info!("Coordinator task stopped");
}

fn publish(broadcast: &BroadcastGroup, out: Vec<Outbound>) {
    for Outbound { audience, frame } in out {
        if let Err(e) = broadcast.publish(audience, &frame) {
            log::warn!("Dropping undeliverable event for {}: {e}", frame.actor);
        }
    }
}
