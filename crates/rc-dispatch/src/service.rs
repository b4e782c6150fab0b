//! Service front: a tokio task owning the dispatcher.
//!
//! The task is the control sequence. It multiplexes host commands with
//! background completions, so every callback and observer notification runs
//! on it. [`DispatcherHandle`] turns the callback-based entry points into
//! async calls.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use rc_core::{ContentType, FilterMatchResult, FrameId, ResponseHeaders, SubscriptionSnapshot, Url};

use crate::dispatcher::ClassificationDispatcher;
use crate::error::DispatchError;
use crate::observer::ClassificationObserver;

enum Command {
    Popup {
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
        reply: oneshot::Sender<FilterMatchResult>,
    },
    Request {
        snapshot: SubscriptionSnapshot,
        url: Url,
        content_type: ContentType,
        frame: FrameId,
        reply: oneshot::Sender<FilterMatchResult>,
    },
    SocketUpgrade {
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
        reply: oneshot::Sender<FilterMatchResult>,
    },
    Response {
        snapshot: SubscriptionSnapshot,
        url: Url,
        content_type: ContentType,
        frame: FrameId,
        headers: ResponseHeaders,
        reply: oneshot::Sender<FilterMatchResult>,
    },
    MainDocument {
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
    },
    Rewrite {
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
        reply: oneshot::Sender<Option<Url>>,
    },
    AddObserver(Arc<dyn ClassificationObserver>),
    RemoveObserver(Arc<dyn ClassificationObserver>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Owns a [`ClassificationDispatcher`] on its own task.
pub struct DispatcherService {
    dispatcher: ClassificationDispatcher,
    commands: mpsc::Receiver<Command>,
    flush_waiters: Vec<oneshot::Sender<()>>,
}

impl DispatcherService {
    /// Move `dispatcher` onto a new task. The returned join handle resolves
    /// once the service has stopped.
    pub fn spawn(
        dispatcher: ClassificationDispatcher,
        command_buffer: usize,
    ) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(command_buffer.max(1));
        let service = Self {
            dispatcher,
            commands: rx,
            flush_waiters: Vec::new(),
        };
        let task = tokio::spawn(service.run());
        (DispatcherHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        info!("dispatcher service started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(finished) = self.dispatcher.next_finished(),
                    if self.dispatcher.in_flight() > 0 =>
                {
                    self.dispatcher.complete(finished);
                }
            }
            if self.dispatcher.in_flight() == 0 {
                for waiter in self.flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
        info!(
            "dispatcher service stopped with {} evaluations in flight",
            self.dispatcher.in_flight()
        );
    }

    fn handle(&mut self, command: Command) {
        let dispatcher = &mut self.dispatcher;
        match command {
            Command::Popup {
                snapshot,
                url,
                frame,
                reply,
            } => {
                let result = dispatcher.evaluate_popup(snapshot, &url, frame);
                let _ = reply.send(result);
            }
            Command::Request {
                snapshot,
                url,
                content_type,
                frame,
                reply,
            } => dispatcher.evaluate_request(snapshot, url, content_type, frame, reply_with(reply)),
            Command::SocketUpgrade {
                snapshot,
                url,
                frame,
                reply,
            } => dispatcher.evaluate_request_for_socket_upgrade(
                snapshot,
                url,
                frame,
                reply_with(reply),
            ),
            Command::Response {
                snapshot,
                url,
                content_type,
                frame,
                headers,
                reply,
            } => dispatcher.evaluate_response(
                snapshot,
                url,
                content_type,
                frame,
                headers,
                reply_with(reply),
            ),
            Command::MainDocument { snapshot, url, frame } => {
                dispatcher.check_main_document_allowed(snapshot, url, frame)
            }
            Command::Rewrite {
                snapshot,
                url,
                frame,
                reply,
            } => dispatcher.evaluate_rewrite(snapshot, url, frame, reply_with(reply)),
            Command::AddObserver(observer) => dispatcher.add_observer(observer),
            Command::RemoveObserver(observer) => dispatcher.remove_observer(&observer),
            Command::Flush(reply) => self.flush_waiters.push(reply),
            Command::Shutdown => debug!("shutdown handled by the service loop"),
        }
    }
}

/// Callback forwarding its argument to a waiting caller. A caller that gave
/// up waiting is not an error.
fn reply_with<T: Send + 'static>(reply: oneshot::Sender<T>) -> impl FnOnce(T) + Send + 'static {
    move |value| {
        let _ = reply.send(value);
    }
}

/// Cloneable async front of a [`DispatcherService`].
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    pub async fn evaluate_popup(
        &self,
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
    ) -> Result<FilterMatchResult, DispatchError> {
        self.call(|reply| Command::Popup {
            snapshot,
            url,
            frame,
            reply,
        })
        .await
    }

    pub async fn evaluate_request(
        &self,
        snapshot: SubscriptionSnapshot,
        url: Url,
        content_type: ContentType,
        frame: FrameId,
    ) -> Result<FilterMatchResult, DispatchError> {
        self.call(|reply| Command::Request {
            snapshot,
            url,
            content_type,
            frame,
            reply,
        })
        .await
    }

    pub async fn evaluate_request_for_socket_upgrade(
        &self,
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
    ) -> Result<FilterMatchResult, DispatchError> {
        self.call(|reply| Command::SocketUpgrade {
            snapshot,
            url,
            frame,
            reply,
        })
        .await
    }

    pub async fn evaluate_response(
        &self,
        snapshot: SubscriptionSnapshot,
        url: Url,
        content_type: ContentType,
        frame: FrameId,
        headers: ResponseHeaders,
    ) -> Result<FilterMatchResult, DispatchError> {
        self.call(|reply| Command::Response {
            snapshot,
            url,
            content_type,
            frame,
            headers,
            reply,
        })
        .await
    }

    /// Returns once the check is enqueued; the outcome is only visible to
    /// observers.
    pub async fn check_main_document_allowed(
        &self,
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
    ) -> Result<(), DispatchError> {
        self.send(Command::MainDocument { snapshot, url, frame }).await
    }

    pub async fn evaluate_rewrite(
        &self,
        snapshot: SubscriptionSnapshot,
        url: Url,
        frame: FrameId,
    ) -> Result<Option<Url>, DispatchError> {
        self.call(|reply| Command::Rewrite {
            snapshot,
            url,
            frame,
            reply,
        })
        .await
    }

    /// Register `observer` with the service. The service keeps only a weak
    /// reference, so the caller must hold on to the observer for as long as
    /// it wants to be notified.
    pub async fn add_observer(
        &self,
        observer: Arc<dyn ClassificationObserver>,
    ) -> Result<(), DispatchError> {
        self.send(Command::AddObserver(observer)).await
    }

    pub async fn remove_observer(
        &self,
        observer: Arc<dyn ClassificationObserver>,
    ) -> Result<(), DispatchError> {
        self.send(Command::RemoveObserver(observer)).await
    }

    /// Resolves once no evaluation is in flight, so every outcome of
    /// earlier calls (including document checks) has been delivered.
    pub async fn flush(&self) -> Result<(), DispatchError> {
        self.call(Command::Flush).await
    }

    /// Stop the service. Evaluations still in flight are dropped and their
    /// callers see [`DispatchError::Closed`].
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<(), DispatchError> {
        self.commands.send(command).await.map_err(|_| DispatchError::Closed)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| DispatchError::Closed)
    }
}
