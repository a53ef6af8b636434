//! One-shot completion handles coupling sends to awaitable results.
//!
//! The selector thread resolves a completion exactly once; callers on any
//! other thread block in [`Completion::wait`]. Whichever terminal call
//! arrives first wins and later terminal calls are silent no-ops, so the
//! channel can fail or cancel a batch of completions on close without
//! tracking which ones already resolved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::protocol::Packet;

use super::ChannelError;

/// Terminal outcome observed by an awaiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("request failed: {0}")]
    Failed(#[source] ChannelError),
    #[error("request was cancelled")]
    Cancelled,
    #[error("timed out waiting for the result")]
    TimedOut,
}

#[derive(Debug, Clone)]
enum Outcome {
    Success,
    Failed(ChannelError),
    Cancelled,
}

#[derive(Debug, Default)]
struct State {
    result: Option<Packet>,
    outcome: Option<Outcome>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    done: Condvar,
}

/// A cloneable handle to a one-shot result slot.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the result the next successful completion will carry. Ignored
    /// once a terminal state is set.
    pub fn set_result(&self, packet: Packet) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            state.result = Some(packet);
        }
    }

    /// Resolve successfully with whatever result was attached.
    pub fn complete(&self) {
        self.finish(Outcome::Success);
    }

    /// Attach `packet` as the result and resolve successfully.
    pub fn succeed(&self, packet: Packet) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            state.result = Some(packet);
            state.outcome = Some(Outcome::Success);
            self.inner.done.notify_all();
        }
    }

    /// Resolve with a failure cause.
    pub fn fail(&self, cause: ChannelError) {
        self.finish(Outcome::Failed(cause));
    }

    /// Resolve as cancelled.
    pub fn cancel(&self) {
        self.finish(Outcome::Cancelled);
    }

    fn finish(&self, outcome: Outcome) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            state.outcome = Some(outcome);
            self.inner.done.notify_all();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// Block until the completion resolves or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<Option<Packet>, CompletionError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            match &state.outcome {
                Some(Outcome::Success) => return Ok(state.result.clone()),
                Some(Outcome::Failed(cause)) => {
                    return Err(CompletionError::Failed(cause.clone()))
                }
                Some(Outcome::Cancelled) => return Err(CompletionError::Cancelled),
                None => {}
            }
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return Err(CompletionError::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnAck, ConnectReturnCode};
    use std::thread;

    fn short() -> Duration {
        Duration::from_millis(50)
    }

    #[test]
    fn success_carries_attached_result() {
        let completion = Completion::new();
        completion.set_result(ConnAck::new(ConnectReturnCode::Accepted).into());
        completion.complete();

        let result = completion.wait(short()).unwrap().unwrap();
        assert!(matches!(result, Packet::ConnAck(_)));
    }

    #[test]
    fn success_without_result_is_none() {
        let completion = Completion::new();
        completion.complete();
        assert!(completion.wait(short()).unwrap().is_none());
    }

    #[test]
    fn first_terminal_call_wins() {
        let completion = Completion::new();
        completion.fail(ChannelError::Closed);
        completion.complete();
        completion.cancel();

        assert_eq!(
            completion.wait(short()).unwrap_err(),
            CompletionError::Failed(ChannelError::Closed)
        );
    }

    #[test]
    fn cancel_is_distinct_from_failure() {
        let completion = Completion::new();
        completion.cancel();
        assert_eq!(completion.wait(short()).unwrap_err(), CompletionError::Cancelled);
    }

    #[test]
    fn set_result_after_terminal_is_ignored() {
        let completion = Completion::new();
        completion.complete();
        completion.set_result(ConnAck::new(ConnectReturnCode::Accepted).into());
        assert!(completion.wait(short()).unwrap().is_none());
    }

    #[test]
    fn wait_times_out() {
        let completion = Completion::new();
        assert_eq!(
            completion.wait(Duration::from_millis(20)).unwrap_err(),
            CompletionError::TimedOut
        );
        assert!(!completion.is_resolved());
    }

    #[test]
    fn resolves_across_threads() {
        let completion = Completion::new();
        let remote = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.succeed(ConnAck::new(ConnectReturnCode::Accepted).into());
        });

        let result = completion.wait(Duration::from_secs(2)).unwrap();
        assert!(result.is_some());
        handle.join().unwrap();
    }
}
