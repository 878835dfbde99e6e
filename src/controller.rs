// The collection controller shall:
// - Init: validate the configuration, open the dataset and install the
//   interrupt handler
// - Discovering: list the connected nodes once; none is fatal
// - Subscribing: per selected node, subscribe MAC, RLC, PDCP, GTP in that
//   order, then the throughput model when enabled
// - Collecting: sleep on an idle tick, woken early by every row and by the
//   interrupt, until the stop condition holds
// - Draining: cancel every successful subscription
// - Closed: close the dataset and report what was collected
// Failures after Init are logged and absorbed; only startup failures
// are returned.

use crate::assembler::RowAssembler;
use crate::config::CollectorConfig;
use crate::control_plane::{ControlPlane, NodeDescriptor, SubscriptionDefinition};
use crate::dataset_writer::DatasetWriter;
use crate::discovery::{discover, select_nodes};
use crate::error::CollectorError;
use crate::measurement::ServiceModel;
use crate::record_buffer::RecordBuffer;
use crate::stop::{spawn_signal_listener, StopReason, StopSignal};
use crate::subscriber::{ModelCounts, StreamSubscriber, SubscriptionHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    Discovering,
    Subscribing,
    Collecting,
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct CollectionSummary {
    pub output: PathBuf,
    pub rows_written: u64,
    pub rows_discarded: u64,
    pub stop_reason: StopReason,
    pub subscriptions: Vec<SubscriptionHandle>,
    pub reports: Vec<ModelCounts>,
    pub elapsed: Duration,
}

impl CollectionSummary {
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.iter().filter(|h| h.is_active()).count()
    }

    pub fn log(&self) {
        tracing::info!(
            rows = self.rows_written,
            active_subscriptions = self.active_subscriptions(),
            discarded = self.rows_discarded,
            reason = %self.stop_reason,
            elapsed = ?self.elapsed,
            output = %self.output.display(),
            "Collection finished"
        );
        for handle in &self.subscriptions {
            tracing::info!(node = %handle.node, model = %handle.model, status = %handle.status, "Subscription");
        }
        for counts in &self.reports {
            tracing::info!(
                model = %counts.model,
                received = counts.received,
                empty = counts.empty,
                "Reports"
            );
        }
    }
}

pub struct CollectionController {
    control_plane: Arc<dyn ControlPlane>,
    config: CollectorConfig,
    stop: StopSignal,
    state: ControllerState,
    install_signal_handler: bool,
}

impl CollectionController {
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: CollectorConfig) -> Self {
        CollectionController {
            control_plane,
            config,
            stop: StopSignal::new(),
            state: ControllerState::Init,
            install_signal_handler: true,
        }
    }

    /// Leave SIGINT/SIGTERM alone; the caller interrupts through
    /// `stop_signal`.
    #[cfg(test)]
    pub fn without_signal_handler(mut self) -> Self {
        self.install_signal_handler = false;
        self
    }

    #[cfg(test)]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    fn transition(&mut self, next: ControllerState) {
        tracing::debug!(from = ?self.state, to = ?next, "Controller state");
        self.state = next;
    }

    pub async fn run(&mut self) -> Result<CollectionSummary, CollectorError> {
        self.transition(ControllerState::Init);
        let started = Instant::now();
        self.config.validate()?;

        let writer = Arc::new(DatasetWriter::open(
            &self.config.output,
            self.config.schema,
            self.config.writer_options(),
        )?);
        tracing::info!(
            output = %self.config.output.display(),
            schema = ?self.config.schema,
            target = self.config.target_samples,
            "Dataset opened"
        );

        let listener = self
            .install_signal_handler
            .then(|| spawn_signal_listener(self.stop.clone()));

        let result = self.collect(&writer, started).await;
        if let Some(listener) = listener {
            listener.abort();
        }

        if result.is_err() {
            if let Err(e) = writer.close() {
                tracing::warn!(error = %e, "Failed to close dataset");
            }
            self.transition(ControllerState::Closed);
        }
        result
    }

    async fn collect(
        &mut self,
        writer: &Arc<DatasetWriter>,
        started: Instant,
    ) -> Result<CollectionSummary, CollectorError> {
        self.transition(ControllerState::Discovering);
        let nodes = discover(self.control_plane.as_ref()).await?;
        let selected = select_nodes(&nodes, &self.config.node_types);
        if selected.is_empty() {
            tracing::warn!(
                wanted = ?self.config.node_types,
                "No connected node of the configured types, nothing will be collected"
            );
        }

        self.transition(ControllerState::Subscribing);
        let buffer = Arc::new(RecordBuffer::new());
        let assembler = Arc::new(RowAssembler::new(
            Arc::clone(&buffer),
            Arc::clone(writer),
            self.config.primary,
            self.stop.clone(),
            self.config.progress_every,
        ));
        let subscriber = StreamSubscriber::new(Arc::clone(&self.control_plane), buffer, assembler);
        let handles = self.subscribe_all(&subscriber, &selected).await;
        let active = handles.iter().filter(|h| h.is_active()).count();
        if active == 0 {
            tracing::warn!("No subscription succeeded");
        } else {
            tracing::info!(active, requested = handles.len(), "Subscriptions in place");
        }

        self.transition(ControllerState::Collecting);
        let reason = self.wait_for_stop(writer).await;
        // Rows still in flight from here on are discarded.
        self.stop.interrupt();
        tracing::info!(reason = %reason, samples = writer.sample_count(), "Stopping collection");

        self.transition(ControllerState::Draining);
        let cancelled = subscriber
            .unsubscribe_all(&handles, self.config.unsubscribe_timeout)
            .await;
        tracing::debug!(cancelled, "Subscriptions cancelled");

        self.transition(ControllerState::Closed);
        let (rows_written, rows_discarded) = match writer.close() {
            Ok(summary) => (summary.rows, summary.discarded),
            Err(e) => {
                tracing::error!(error = %e, "Failed to close dataset");
                (writer.sample_count(), writer.discarded_count())
            }
        };

        Ok(CollectionSummary {
            output: self.config.output.clone(),
            rows_written,
            rows_discarded,
            stop_reason: reason,
            subscriptions: handles,
            reports: subscriber.counters().snapshot(),
            elapsed: started.elapsed(),
        })
    }

    async fn subscribe_all(
        &self,
        subscriber: &StreamSubscriber,
        nodes: &[NodeDescriptor],
    ) -> Vec<SubscriptionHandle> {
        let kpm = self.config.kpm_subscription();
        let mut handles = Vec::new();
        for node in nodes {
            for model in ServiceModel::LAYER_STATS {
                if self.stop.is_interrupted() {
                    return handles;
                }
                let definition = SubscriptionDefinition::Interval(self.config.interval);
                handles.push(subscriber.subscribe(node, model, definition).await);
            }
            if let Some(kpm) = &kpm {
                if self.stop.is_interrupted() {
                    return handles;
                }
                let definition = SubscriptionDefinition::Kpm(kpm.clone());
                handles.push(subscriber.subscribe(node, ServiceModel::Kpm, definition).await);
            }
        }
        handles
    }

    async fn wait_for_stop(&self, writer: &DatasetWriter) -> StopReason {
        let condition = self.config.stop_condition();
        let collecting_since = Instant::now();
        let mut tick = time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            if let Some(reason) = condition.evaluate(
                writer.sample_count(),
                collecting_since.elapsed(),
                self.stop.is_interrupted(),
            ) {
                return reason;
            }
            tokio::select! {
                _ = self.stop.woken() => {}
                _ = tick.tick() => {}
            }
        }
    }
}
