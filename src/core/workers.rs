//! Stage workers that sit at the edges of the pipeline: the ingress
//! contract and relay, persistence into the document store, and chat.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{DocumentStore, LanguageModel};
use crate::domain::Event;

use super::queues::{Consumer, Producer, QueueError};
use super::shutdown::ShutdownListener;

/// Documents fetched as chat context
const CHAT_CONTEXT_LIMIT: usize = 20;

/// Errors raised when handing events to the pipeline
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Event has an empty type")]
    EmptyType,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Entry point for decoded events
#[derive(Debug, Clone)]
pub struct Ingress {
    queue: Producer<Event>,
}

impl Ingress {
    pub fn new(queue: Producer<Event>) -> Self {
        Self { queue }
    }

    /// Enqueue one event, waiting while the ingress queue is full
    pub async fn deliver(&self, event: Event) -> Result<(), IngressError> {
        if event.event_type.trim().is_empty() {
            return Err(IngressError::EmptyType);
        }
        self.queue.send(event).await?;
        Ok(())
    }
}

/// Move events from the ingress queue onto the pipeline queue
#[instrument(name = "relay", skip_all)]
pub async fn run_relay(
    mut input: Consumer<Event>,
    output: Producer<Event>,
    mut shutdown: ShutdownListener,
) {
    info!("Relay started");

    let mut relayed = 0usize;
    while let Some(event) = input.next(&mut shutdown).await {
        if let Err(e) = output.send(event).await {
            error!(error = %e, "Pipeline queue unavailable, stopping relay");
            break;
        }
        relayed += 1;
    }

    info!(relayed, "Relay stopped");
}

/// Persist every event under its type
#[instrument(name = "persistence", skip(input, store, shutdown))]
pub async fn run_persistence(
    stage: &'static str,
    mut input: Consumer<Event>,
    store: Arc<dyn DocumentStore>,
    mut shutdown: ShutdownListener,
) {
    info!(store = store.name(), "Persistence started");

    let mut stored = 0usize;
    while let Some(event) = input.next(&mut shutdown).await {
        match store.insert_document(&event.event_type, &event.payload).await {
            Ok(()) => {
                stored += 1;
                debug!(event_type = %event.event_type, "Stored event");
            }
            Err(e) => error!(event_type = %event.event_type, error = %e, "Failed to store event"),
        }
    }

    info!(stored, "Persistence stopped");
}

/// A parsed chat request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub question: String,
    /// Collection searched for context; all of them when absent
    pub collection: Option<String>,
}

impl ChatRequest {
    /// Read `question` (or `message`) and `collection` from a chat event
    pub fn from_event(event: &Event) -> Option<Self> {
        let question = event
            .str_field("question")
            .or_else(|| event.str_field("message"))
            .map(str::trim)
            .filter(|q| !q.is_empty())?;

        Some(Self {
            question: question.to_string(),
            collection: event.str_field("collection").map(str::to_string),
        })
    }
}

/// The `model` service: answers chat events from stored context
pub struct ChatWorker {
    store: Arc<dyn DocumentStore>,
    model: Option<Arc<dyn LanguageModel>>,
}

impl ChatWorker {
    pub fn new(store: Arc<dyn DocumentStore>, model: Option<Arc<dyn LanguageModel>>) -> Self {
        Self { store, model }
    }

    /// Answer one chat event; `None` when it cannot be answered
    pub async fn handle(&self, event: &Event) -> Option<String> {
        let Some(request) = ChatRequest::from_event(event) else {
            warn!("Chat event without a question, dropping");
            return None;
        };
        let Some(ref model) = self.model else {
            warn!(question = %request.question, "No model configured, dropping chat event");
            return None;
        };

        let context = match request.collection {
            Some(ref collection) => match self
                .store
                .query(collection, &request.question, CHAT_CONTEXT_LIMIT)
                .await
            {
                Ok(documents) => documents,
                Err(e) => {
                    warn!(
                        collection = %collection,
                        error = %e,
                        "Context query failed, answering without context"
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        match model.answer(&request.question, &context).await {
            Ok(answer) => {
                info!(
                    question = %request.question,
                    context = context.len(),
                    answer = %answer,
                    "Chat answered"
                );
                Some(answer)
            }
            Err(e) => {
                error!(question = %request.question, error = %e, "Model failed to answer");
                None
            }
        }
    }

    #[instrument(name = "chat", skip_all)]
    pub async fn run(self, mut input: Consumer<Event>, mut shutdown: ShutdownListener) {
        let model = self.model.as_ref().map(|m| m.name()).unwrap_or("none");
        info!(model, "Chat service started");

        while let Some(event) = input.next(&mut shutdown).await {
            self.handle(&event).await;
        }

        info!("Chat service stopped");
    }
}
