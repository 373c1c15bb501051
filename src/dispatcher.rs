//! Command correlation: ids, the pending-command table, and timeouts.
//!
//! Every outbound command gets the next id from a monotonically increasing
//! counter and a pending entry holding a oneshot sender. The entry is
//! settled at most once: by a matching response, by a timeout, or by a
//! bulk rejection when the process goes away. Whichever removes the entry
//! from the table first wins; the others find nothing to settle. A caller
//! that stops waiting drops its [`Ticket`], which removes the entry too.
//!
//! The id counter can be shared between dispatchers so that ids stay
//! unique across process restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::OutboundCommand;

/// Default per-command timeout. Bulk history retrieval can legitimately take this long.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors settling a single command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process is not in the `Ready` state.
    #[error("automation process is not available")]
    ProcessUnavailable,

    /// No response arrived within the timeout.
    #[error("command '{command}' (id {id}) timed out after {}s", .timeout.as_secs())]
    CommandTimeout {
        /// Correlation id.
        id: String,
        /// Command name.
        command: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The process exited (or was shut down) while the command was pending.
    #[error("automation process terminated: {0}")]
    ProcessCrashed(String),

    /// Writing the command to the process failed.
    #[error("failed to write command: {0}")]
    Io(#[from] std::io::Error),

    /// The command could not be encoded.
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

type Settlement = Result<serde_json::Value, CommandError>;

/// A command awaiting its response.
struct PendingCommand {
    command: String,
    sent_at: Instant,
    sender: oneshot::Sender<Settlement>,
}

// Manual Debug impl because oneshot::Sender carries no useful Debug output.
impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("command", &self.command)
            .field("sent_at", &self.sent_at)
            .finish_non_exhaustive()
    }
}

/// Pending entries plus the closed flag set by [`Dispatcher::reject_all`].
#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, PendingCommand>,
    closed: bool,
}

type SharedTable = Mutex<Table>;

fn lock_table(table: &SharedTable) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`Dispatcher::register`]; redeemed with [`Dispatcher::wait`].
///
/// Dropping an unsettled ticket removes its pending entry.
#[derive(Debug)]
pub struct Ticket {
    /// Correlation id assigned to the command.
    pub id: String,
    command: String,
    receiver: oneshot::Receiver<Settlement>,
    table: Weak<SharedTable>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        if lock_table(&table).entries.remove(&self.id).is_some() {
            debug!(id = %self.id, command = %self.command, "caller stopped waiting; pending entry removed");
        }
    }
}

/// Pending-command table with id allocation and timeouts.
#[derive(Debug)]
pub struct Dispatcher {
    next_id: Arc<AtomicU64>,
    pending: Arc<SharedTable>,
    timeout: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl Dispatcher {
    /// Create a dispatcher with the given per-command timeout and its own ids starting at 1.
    pub fn new(timeout: Duration) -> Self {
        Self::with_ids(timeout, Arc::new(AtomicU64::new(1)))
    }

    /// Create a dispatcher that draws ids from a shared counter.
    pub fn with_ids(timeout: Duration, next_id: Arc<AtomicU64>) -> Self {
        Self {
            next_id,
            pending: Arc::new(Mutex::new(Table::default())),
            timeout,
        }
    }

    /// Per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate an id, encode the command line, and register it as pending.
    ///
    /// The entry is registered before the caller writes the line, so a
    /// response can never arrive for an id the table does not know yet.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Encode`] if the params cannot be serialized,
    /// and [`CommandError::ProcessUnavailable`] once the dispatcher has been
    /// closed by [`Dispatcher::reject_all`].
    pub fn register(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<(Ticket, Vec<u8>), CommandError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let line = OutboundCommand {
            id: &id,
            command,
            params,
        }
        .to_line()?;

        let (sender, receiver) = oneshot::channel();
        {
            let mut table = self.lock();
            if table.closed {
                debug!(id = %id, command, "dispatcher closed; command refused");
                return Err(CommandError::ProcessUnavailable);
            }
            table.entries.insert(
                id.clone(),
                PendingCommand {
                    command: command.to_owned(),
                    sent_at: Instant::now(),
                    sender,
                },
            );
        }
        debug!(id = %id, command, "command registered");

        Ok((
            Ticket {
                id,
                command: command.to_owned(),
                receiver,
                table: Arc::downgrade(&self.pending),
            },
            line,
        ))
    }

    /// Wait for the ticket's settlement, bounded by the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::CommandTimeout`] when no response arrives in
    /// time, or whatever error the entry was rejected with.
    pub async fn wait(&self, mut ticket: Ticket) -> Settlement {
        let settled = tokio::time::timeout(self.timeout, &mut ticket.receiver).await;
        match settled {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(CommandError::ProcessUnavailable),
            Err(_) => {
                if self.take(&ticket.id).is_some() {
                    warn!(id = %ticket.id, command = %ticket.command, timeout = ?self.timeout, "command timed out");
                    return Err(CommandError::CommandTimeout {
                        id: ticket.id.clone(),
                        command: ticket.command.clone(),
                        timeout: self.timeout,
                    });
                }
                // Settled between the deadline and the removal; the value is in flight.
                (&mut ticket.receiver)
                    .await
                    .unwrap_or(Err(CommandError::ProcessUnavailable))
            }
        }
    }

    /// Settle the command with `id` successfully.
    ///
    /// Returns `false` if no such command is pending (late or unknown
    /// responses are logged and discarded).
    pub fn resolve(&self, id: &str, payload: serde_json::Value) -> bool {
        let Some(entry) = self.take(id) else {
            warn!(id, "discarding response for unknown or expired command");
            return false;
        };
        debug!(id, command = %entry.command, elapsed = ?entry.sent_at.elapsed(), "command settled");
        if entry.sender.send(Ok(payload)).is_err() {
            debug!(id, "caller stopped waiting before the response arrived");
        }
        true
    }

    /// Remove a pending command without settling it (used when the write fails).
    pub fn abandon(&self, id: &str) -> bool {
        self.take(id).is_some()
    }

    /// Reject every pending command with an error built by `make` and close
    /// the dispatcher to new registrations.
    ///
    /// Returns how many commands were rejected.
    pub fn reject_all(&self, make: impl Fn() -> CommandError) -> usize {
        let drained: Vec<(String, PendingCommand)> = {
            let mut table = self.lock();
            table.closed = true;
            table.entries.drain().collect()
        };
        let count = drained.len();
        for (id, entry) in drained {
            debug!(id = %id, command = %entry.command, "rejecting pending command");
            // A closed receiver means the caller already gave up.
            let _ = entry.sender.send(Err(make()));
        }
        count
    }

    /// Number of commands awaiting settlement.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether [`Dispatcher::reject_all`] has closed this dispatcher.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn take(&self, id: &str) -> Option<PendingCommand> {
        self.lock().entries.remove(id)
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        lock_table(&self.pending)
    }
}
