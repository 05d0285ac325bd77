//! Event emission strategies
//!
//! [`IncrementalSink`] forwards events as they happen (streaming mode).
//! [`BufferedSink`] holds everything until the terminal event (batched mode).

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::events::BridgeEvent;

#[async_trait]
pub(crate) trait EventSink: Send {
    async fn emit(&mut self, event: BridgeEvent);

    /// Captured print output
    async fn text(&mut self, chunk: String);

    /// Close any open text message before a step boundary
    async fn end_text(&mut self);

    /// Flush and emit the terminal event
    async fn finish(&mut self, terminal: BridgeEvent);
}

fn message_id() -> String {
    format!("out_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) struct IncrementalSink {
    tx: mpsc::Sender<BridgeEvent>,
    open_text: Option<String>,
}

impl IncrementalSink {
    pub(crate) fn new(tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self {
            tx,
            open_text: None,
        }
    }

    async fn send(&self, event: BridgeEvent) {
        // The consumer may stop listening; the execution still runs to completion
        let _ = self.tx.send(event).await;
    }
}

#[async_trait]
impl EventSink for IncrementalSink {
    async fn emit(&mut self, event: BridgeEvent) {
        self.send(event).await;
    }

    async fn text(&mut self, chunk: String) {
        let id = match &self.open_text {
            Some(id) => id.clone(),
            None => {
                let id = message_id();
                self.send(BridgeEvent::TextStart {
                    message_id: id.clone(),
                })
                .await;
                self.open_text = Some(id.clone());
                id
            }
        };
        self.send(BridgeEvent::TextContent {
            message_id: id,
            delta: chunk,
        })
        .await;
    }

    async fn end_text(&mut self) {
        if let Some(id) = self.open_text.take() {
            self.send(BridgeEvent::TextEnd { message_id: id }).await;
        }
    }

    async fn finish(&mut self, terminal: BridgeEvent) {
        self.end_text().await;
        self.send(terminal).await;
    }
}

pub(crate) struct BufferedSink {
    tx: mpsc::Sender<BridgeEvent>,
    events: Vec<BridgeEvent>,
    output: String,
}

impl BufferedSink {
    pub(crate) fn new(tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self {
            tx,
            events: Vec::new(),
            output: String::new(),
        }
    }
}

#[async_trait]
impl EventSink for BufferedSink {
    async fn emit(&mut self, event: BridgeEvent) {
        self.events.push(event);
    }

    async fn text(&mut self, chunk: String) {
        self.output.push_str(&chunk);
    }

    async fn end_text(&mut self) {}

    async fn finish(&mut self, terminal: BridgeEvent) {
        let mut events = std::mem::take(&mut self.events);
        if !self.output.is_empty() {
            let id = message_id();
            events.push(BridgeEvent::TextStart {
                message_id: id.clone(),
            });
            events.push(BridgeEvent::TextContent {
                message_id: id.clone(),
                delta: std::mem::take(&mut self.output),
            });
            events.push(BridgeEvent::TextEnd { message_id: id });
        }
        events.push(terminal);
        for event in events {
            if self.tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn drain(mut rx: mpsc::Receiver<BridgeEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
        }
        names
    }

    fn finished() -> BridgeEvent {
        BridgeEvent::RunFinished {
            run_id: "r".into(),
            result: json!(null),
        }
    }

    #[tokio::test]
    async fn test_incremental_opens_and_closes_text_around_steps() {
        let (tx, rx) = mpsc::channel(32);
        let mut sink = IncrementalSink::new(tx);
        sink.text("a".into()).await;
        sink.text("b".into()).await;
        sink.end_text().await;
        sink.emit(BridgeEvent::StepStarted {
            step_name: "f".into(),
        })
        .await;
        sink.text("c".into()).await;
        sink.finish(finished()).await;
        drop(sink);

        assert_eq!(
            drain(rx).await,
            vec![
                "text_start",
                "text_content",
                "text_content",
                "text_end",
                "step_started",
                "text_start",
                "text_content",
                "text_end",
                "run_finished",
            ]
        );
    }

    #[tokio::test]
    async fn test_buffered_emits_single_text_triple_before_terminal() {
        let (tx, rx) = mpsc::channel(32);
        let mut sink = BufferedSink::new(tx);
        sink.emit(BridgeEvent::RunStarted { run_id: "r".into() })
            .await;
        sink.text("a".into()).await;
        sink.end_text().await;
        sink.text("b".into()).await;
        sink.finish(finished()).await;
        drop(sink);

        assert_eq!(
            drain(rx).await,
            vec![
                "run_started",
                "text_start",
                "text_content",
                "text_end",
                "run_finished"
            ]
        );
    }
}
