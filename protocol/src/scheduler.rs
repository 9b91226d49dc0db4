//! Outbound command queue.
//!
//! Commands are sent strictly in FIFO order with at most one command in flight.
//! Commands that expect a response stay at the head of the queue until the
//! response arrives or the receive timeout expires.
//! While the link is still initializing, timed out commands are retried up to
//! [`Timing::max_retries`] times before initialization is marked as failed.

use crate::frame::{Command, CommandType};
use alloc::collections::VecDeque;
use log::{debug, error, warn};

/// Initialization state of the link.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
pub enum InitState {
    /// Waiting for the MCU to become ready and answer the product query.
    AwaitingEnablePin,
    /// The product query was answered.
    Done,
}

/// Timing parameters of the scheduler, in milliseconds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Timing {
    /// Minimum delay between two transmitted commands.
    pub command_delay: u64,
    /// Time after which a partial frame or an expected response is given up.
    pub receive_timeout: u64,
    /// Number of response timeouts tolerated during initialization.
    pub max_retries: u8,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_delay: 10,
            receive_timeout: 300,
            max_retries: 5,
        }
    }
}

/// Single-in-flight command scheduler.
#[derive(Debug)]
pub struct Scheduler {
    timing: Timing,
    queue: VecDeque<Command>,
    awaiting: Option<CommandType>,
    last_tx: Option<u64>,
    retries: u8,
    init_state: InitState,
    init_failed: bool,
}

impl Scheduler {
    /// Constructs an idle scheduler.
    #[must_use]
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            queue: VecDeque::new(),
            awaiting: None,
            last_tx: None,
            retries: 0,
            init_state: InitState::AwaitingEnablePin,
            init_failed: false,
        }
    }

    /// Appends a command to the queue.
    pub fn enqueue(&mut self, cmd: Command) {
        self.queue.push_back(cmd);
    }

    /// Returns the number of queued commands, including one awaiting its response.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the command type whose response is currently awaited.
    #[must_use]
    pub fn awaiting(&self) -> Option<CommandType> {
        self.awaiting
    }

    /// Returns the initialization state.
    #[must_use]
    pub fn init_state(&self) -> InitState {
        self.init_state
    }

    /// Returns whether initialization ran out of retries.
    ///
    /// The flag is sticky; the scheduler never retries initialization on its own.
    #[must_use]
    pub fn init_failed(&self) -> bool {
        self.init_failed
    }

    /// Marks initialization as done.
    ///
    /// Returns whether the state changed.
    pub fn complete_init(&mut self) -> bool {
        if self.init_state == InitState::AwaitingEnablePin {
            self.init_state = InitState::Done;

            true
        } else {
            false
        }
    }

    /// Matches a received command code against the awaited response.
    ///
    /// On a match the head of the queue is completed and `true` is returned.
    pub fn handle_response(&mut self, command: u8) -> bool {
        match self.awaiting {
            Some(kind) if kind as u8 == command => {
                self.awaiting = None;
                self.queue.pop_front();
                self.retries = 0;

                true
            }
            _ => false,
        }
    }

    /// Gives up on an awaited response after the receive timeout.
    ///
    /// During initialization the command stays queued and is retransmitted,
    /// until the retry budget is used up. Afterwards it is dropped immediately.
    pub fn expire(&mut self, now: u64) {
        let (Some(kind), Some(at)) = (self.awaiting, self.last_tx) else {
            return;
        };

        if now.saturating_sub(at) <= self.timing.receive_timeout {
            return;
        }

        self.awaiting = None;

        if self.init_state == InitState::Done {
            warn!("No response to {kind}, dropping command");
            self.queue.pop_front();

            return;
        }

        self.retries += 1;

        if self.retries >= self.timing.max_retries {
            error!("Initialization failed at init state {}", self.init_state);
            self.init_failed = true;
            self.queue.pop_front();
            self.retries = 0;
        } else {
            debug!(
                "No response to {kind}, retry {}/{}",
                self.retries, self.timing.max_retries
            );
        }
    }

    /// Returns the next command to transmit at time `now`, if any.
    ///
    /// Nothing is sent while a response is awaited, while a frame is being
    /// received (`rx_idle` is `false`), or before the command delay has elapsed.
    pub fn next(&mut self, now: u64, rx_idle: bool) -> Option<Command> {
        if self.awaiting.is_some() || !rx_idle {
            return None;
        }

        if let Some(at) = self.last_tx {
            if now.saturating_sub(at) < self.timing.command_delay {
                return None;
            }
        }

        let head = self.queue.front()?;
        let cmd = if head.kind.expects_response() {
            self.awaiting = Some(head.kind);

            head.clone()
        } else {
            self.queue.pop_front()?
        };

        self.last_tx = Some(now);

        Some(cmd)
    }
}
