//! Live subscription dispatcher.
//!
//! Events are taken from the client stream one at a time and run through the
//! pipeline in arrival order. Cancellation is only observed between events,
//! so a record is either emitted whole or not at all.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::client::{EventKind, InboundEvent, MessengerClient};
use crate::error::{ClientError, RetrievalError};
use crate::output::Emitter;
use crate::pipeline::{Pipeline, Verdict};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionScope {
    Chat(i64),
    /// Incoming new messages, edits and button presses in private chats.
    AllPrivate,
    All,
}

impl SubscriptionScope {
    pub fn admits(&self, event: &InboundEvent) -> bool {
        match self {
            SubscriptionScope::Chat(chat_id) => event.chat_id == *chat_id,
            SubscriptionScope::AllPrivate => {
                event.is_private && !(event.kind == EventKind::NewMessage && event.outgoing)
            }
            SubscriptionScope::All => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    Connected,
    Listening,
    Stopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenSummary {
    pub received: u64,
    pub out_of_scope: u64,
    pub rejected: u64,
    pub emitted: u64,
}

pub struct Dispatcher {
    scope: SubscriptionScope,
    pipeline: Pipeline,
    state: ListenState,
}

impl Dispatcher {
    pub fn new(scope: SubscriptionScope, pipeline: Pipeline) -> Self {
        Self {
            scope,
            pipeline,
            state: ListenState::Idle,
        }
    }

    pub fn state(&self) -> ListenState {
        self.state
    }

    /// Listens until `cancel` fires or the subscription fails. The client
    /// must already be connected.
    pub async fn run<C: MessengerClient + ?Sized>(
        &mut self,
        client: &mut C,
        emitter: &mut Emitter,
        cancel: CancellationToken,
    ) -> Result<ListenSummary, RetrievalError> {
        self.state = ListenState::Connected;
        let mut summary = ListenSummary::default();

        let mut events = match client.subscribe(&self.scope).await {
            Ok(events) => events,
            Err(error) => {
                self.state = ListenState::Stopped;
                return Err(RetrievalError::Subscription(error));
            }
        };
        self.state = ListenState::Listening;
        tracing::info!(scope = ?self.scope, "listening");

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("cancellation requested");
                    break Ok(());
                }
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    summary.received += 1;
                    if let Err(error) = self.dispatch(event, emitter, &mut summary).await {
                        break Err(error);
                    }
                }
                Some(Err(error)) => break Err(RetrievalError::Subscription(error)),
                None => break Err(RetrievalError::Subscription(ClientError::StreamClosed)),
            }
        };

        drop(events);
        self.state = ListenState::Stopped;
        tracing::info!(
            received = summary.received,
            out_of_scope = summary.out_of_scope,
            rejected = summary.rejected,
            emitted = summary.emitted,
            "listener stopped"
        );
        outcome.map(|()| summary)
    }

    async fn dispatch(
        &self,
        event: InboundEvent,
        emitter: &mut Emitter,
        summary: &mut ListenSummary,
    ) -> Result<(), RetrievalError> {
        if !self.scope.admits(&event) {
            summary.out_of_scope += 1;
            tracing::debug!(chat = event.chat_id, kind = ?event.kind, "event outside scope");
            return Ok(());
        }

        let record = match event.kind {
            EventKind::CallbackQuery => self.pipeline.process_unfiltered(&event.payload),
            EventKind::NewMessage | EventKind::MessageEdited => match self.pipeline.process(&event.payload) {
                Verdict::Emit(record) => record,
                Verdict::Rejected => {
                    summary.rejected += 1;
                    return Ok(());
                }
            },
        };

        tracing::debug!(chat = event.chat_id, kind = ?event.kind, "emitting event");
        emitter.emit(&record).await?;
        summary.emitted += 1;
        Ok(())
    }
}

/// Cancels `token` on SIGINT or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => tracing::info!("shutdown signal received"),
            Err(error) => tracing::warn!(%error, "failed to listen for shutdown signals"),
        }
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
