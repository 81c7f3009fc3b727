//! Outbound Command Queue
//!
//! Serializes every write to the device. The transport cannot pipeline
//! writes, so exactly one command is outstanding at a time and the queue only
//! advances when the transport confirms the previous write.

use crate::domain::settings::WriteFailurePolicy;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::Command;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Starts a transport write. Completion is reported back through
/// [`CommandQueue::on_send_confirmed`].
pub trait CommandSink {
    fn send(&mut self, command: &Command);
}

struct InFlight {
    command: Command,
    attempts: u32,
}

pub struct CommandQueue<S: CommandSink> {
    pending: VecDeque<Command>,
    in_flight: Option<InFlight>,
    sink: S,
    failure_policy: WriteFailurePolicy,
}

impl<S: CommandSink> CommandQueue<S> {
    pub fn new(sink: S, failure_policy: WriteFailurePolicy) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            sink,
            failure_policy,
        }
    }

    /// Append a command, dispatching it right away when the line is idle
    pub fn enqueue(&mut self, command: Command) {
        self.pending.push_back(command);
        if self.in_flight.is_none() {
            self.dispatch();
        }
    }

    pub fn enqueue_all(&mut self, commands: impl IntoIterator<Item = Command>) {
        for command in commands {
            self.enqueue(command);
        }
    }

    /// The transport finished the outstanding write
    pub fn on_send_confirmed(&mut self, result: Result<(), TransportError>) {
        let Some(mut in_flight) = self.in_flight.take() else {
            debug!("Send confirmation with nothing in flight, ignoring");
            return;
        };

        if let Err(e) = result {
            match self.failure_policy {
                WriteFailurePolicy::Retry { max_attempts } if in_flight.attempts < max_attempts => {
                    warn!(
                        "Write of {:?} failed ({}), retrying (attempt {}/{})",
                        in_flight.command,
                        e,
                        in_flight.attempts + 1,
                        max_attempts
                    );
                    in_flight.attempts += 1;
                    self.sink.send(&in_flight.command);
                    self.in_flight = Some(in_flight);
                    return;
                }
                _ => warn!("Write of {:?} failed ({}), dropping it", in_flight.command, e),
            }
        }

        self.dispatch();
    }

    /// Drop everything not yet confirmed
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} queued commands", self.pending.len());
        }
        self.pending.clear();
        self.in_flight = None;
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn dispatch(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(command) = self.pending.pop_front() {
            self.sink.send(&command);
            self.in_flight = Some(InFlight {
                command,
                attempts: 1,
            });
        }
    }
}

/// Sink that only records what was sent; handy in tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub sent: Vec<Command>,
}

impl CommandSink for RecordingSink {
    fn send(&mut self, command: &Command) {
        self.sent.push(command.clone());
    }
}
