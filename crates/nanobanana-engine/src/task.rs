//! Async Task Runner: one worker thread per request, bridged to a
//! cooperative host loop through an mpsc channel.

use std::fmt;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nanobanana_contracts::request::EditRequest;

use crate::error::{EditError, Result};
use crate::payload;
use crate::response::ImageBytes;
use crate::transport::{CancelFlag, Transport};

pub const PROGRESS_PAYLOAD_READY: u8 = 10;
pub const PROGRESS_RESPONSE_RECEIVED: u8 = 90;

const WORKER_THREAD_NAME: &str = "nanobanana-edit";

pub enum TaskMessage {
    Progress(u8),
    Result(ImageBytes),
    Error(EditError),
    Canceled,
}

impl fmt::Debug for TaskMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress(percent) => write!(f, "Progress({percent})"),
            Self::Result(image) => write!(f, "Result({} bytes)", image.bytes.len()),
            Self::Error(err) => write!(f, "Error({err})"),
            Self::Canceled => f.write_str("Canceled"),
        }
    }
}

/// A validated request ready to run, on a worker or inline.
#[derive(Clone)]
pub struct EditJob {
    request: EditRequest,
    api_key: String,
    transport: Arc<dyn Transport>,
}

impl EditJob {
    /// Checks the API key and the base image; nothing is sent on failure.
    pub fn new(
        request: EditRequest,
        api_key: Option<&str>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(EditError::MissingApiKey)?
            .to_string();
        payload::validate(&request)?;
        Ok(Self {
            request,
            api_key,
            transport,
        })
    }

    pub fn request(&self) -> &EditRequest {
        &self.request
    }

    /// Emits zero or more `Progress` messages, then exactly one terminal
    /// message. A cancel observed after the call returns discards the image.
    pub fn run(&self, cancel: &CancelFlag, emit: &mut dyn FnMut(TaskMessage)) {
        let payload = match payload::build(&self.request) {
            Ok(payload) => payload,
            Err(err) => return emit(TaskMessage::Error(err)),
        };
        if cancel.is_cancelled() {
            return emit(TaskMessage::Canceled);
        }
        emit(TaskMessage::Progress(PROGRESS_PAYLOAD_READY));

        let result = self.transport.send(&payload, &self.api_key, cancel);
        if cancel.is_cancelled() {
            tracing::debug!("edit canceled; discarding response");
            return emit(TaskMessage::Canceled);
        }
        match result.into_outcome() {
            Some(Ok(image)) => {
                emit(TaskMessage::Progress(PROGRESS_RESPONSE_RECEIVED));
                emit(TaskMessage::Result(image));
            }
            Some(Err(err)) => emit(TaskMessage::Error(err)),
            None => emit(TaskMessage::Canceled),
        }
    }

    /// Runs on the calling thread and returns the terminal outcome.
    pub fn run_inline(&self) -> TaskOutcome {
        let mut outcome = TaskOutcome::Failed(EditError::WorkerLost);
        self.run(&CancelFlag::new(), &mut |message| {
            if let Some(terminal) = TaskOutcome::from_message(message) {
                outcome = terminal;
            }
        });
        outcome
    }

    /// Starts the worker thread with a fresh flag and channel.
    pub fn spawn(self) -> Result<TaskPoller> {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                self.run(&worker_cancel, &mut |message| {
                    let _ = tx.send(message);
                });
            })
            .map_err(EditError::WorkerSpawn)?;

        let mut poller = TaskPoller::from_receiver(rx, cancel);
        poller.handle = Some(handle);
        Ok(poller)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Completed(ImageBytes),
    Failed(EditError),
    Canceled,
}

impl TaskOutcome {
    fn from_message(message: TaskMessage) -> Option<Self> {
        match message {
            TaskMessage::Progress(_) => None,
            TaskMessage::Result(image) => Some(Self::Completed(image)),
            TaskMessage::Error(err) => Some(Self::Failed(err)),
            TaskMessage::Canceled => Some(Self::Canceled),
        }
    }

    fn state(&self) -> TaskState {
        match self {
            Self::Completed(_) => TaskState::Completed,
            Self::Failed(_) => TaskState::Failed,
            Self::Canceled => TaskState::Canceled,
        }
    }
}

#[derive(Debug)]
pub enum Tick {
    /// Nothing to do: never started, or the terminal message was consumed.
    Idle,
    /// Still running; `progress` is the newest value drained this tick.
    Pending { progress: Option<u8> },
    Finished(TaskOutcome),
}

/// Consumer side of a task. Call [`TaskPoller::tick`] from the host loop.
#[derive(Debug)]
pub struct TaskPoller {
    rx: Option<Receiver<TaskMessage>>,
    cancel: CancelFlag,
    handle: Option<JoinHandle<()>>,
    state: TaskState,
    progress: u8,
}

impl Default for TaskPoller {
    fn default() -> Self {
        Self::idle()
    }
}

impl TaskPoller {
    pub fn idle() -> Self {
        Self {
            rx: None,
            cancel: CancelFlag::new(),
            handle: None,
            state: TaskState::Idle,
            progress: 0,
        }
    }

    /// Running poller over an existing channel; no thread is involved.
    pub fn from_receiver(rx: Receiver<TaskMessage>, cancel: CancelFlag) -> Self {
        Self {
            rx: Some(rx),
            cancel,
            handle: None,
            state: TaskState::Running,
            progress: 0,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Asks the worker to stop. An in-flight attempt still runs to completion.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Sets the cancel flag and stops listening right away. The worker's
    /// remaining messages are dropped unread.
    pub fn abandon(&mut self) -> Tick {
        if self.state != TaskState::Running {
            return Tick::Idle;
        }
        self.cancel.cancel();
        self.finish(TaskOutcome::Canceled)
    }

    /// Drains every queued message without blocking. Stops at the first
    /// terminal message; anything after it is never read.
    pub fn tick(&mut self) -> Tick {
        let mut latest = None;
        loop {
            let received = match self.rx.as_ref() {
                Some(rx) => rx.try_recv(),
                None => return Tick::Idle,
            };
            match received {
                Ok(TaskMessage::Progress(percent)) => {
                    self.progress = percent.min(100);
                    latest = Some(self.progress);
                }
                Ok(message) => {
                    if let Some(outcome) = TaskOutcome::from_message(message) {
                        return self.finish(outcome);
                    }
                }
                Err(TryRecvError::Empty) => return Tick::Pending { progress: latest },
                Err(TryRecvError::Disconnected) => {
                    return self.finish(TaskOutcome::Failed(EditError::WorkerLost));
                }
            }
        }
    }

    fn finish(&mut self, outcome: TaskOutcome) -> Tick {
        self.rx = None;
        self.state = outcome.state();
        if matches!(outcome, TaskOutcome::Completed(_)) {
            self.progress = 100;
        }
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        Tick::Finished(outcome)
    }
}
