//! The `dispatch` sub-command: drive one flow instance to completion
//! against the in-memory broker/storage, looping wakeups until `TERMINAL`.
//!
//! There is no real worker runtime attached here, so every submitted leaf
//! task is completed instantly between wakeups via
//! [`broker::InMemoryBroker::complete_all_pending`] — good enough to watch
//! a flow definition actually run end to end without standing up Celery.

use std::sync::Arc;

use serde_json::Value;

use broker::{BrokerAdapter, InMemoryBroker, InMemoryStorage, StorageAdapter};
use dispatch::{Dispatcher, DispatcherOutcome, DispatcherPayload, EngineDeps};
use fdr::{FlowRegistry, NodeName, TaskId};
use trace::{RingSink, TraceSink};

use crate::error::CliError;

pub async fn run(
    registry: FlowRegistry,
    flow_name: &str,
    node_args: Value,
    selective: Option<dispatch::Selective>,
) -> Result<(), CliError> {
    let broker = Arc::new(InMemoryBroker::new());
    let storage = Arc::new(InMemoryStorage::new());
    let sink = Arc::new(RingSink::new(4096));

    let broker_handle: Arc<dyn BrokerAdapter> = broker.clone();
    let storage_handle: Arc<dyn StorageAdapter> = storage.clone();
    let trace_handle: Arc<dyn TraceSink> = sink.clone();
    let deps = EngineDeps::new(registry, broker_handle, storage_handle, trace_handle);
    let dispatcher = Dispatcher::new(deps);

    let dispatcher_id = "cli-dispatch";
    let mut payload = DispatcherPayload::fresh(flow_name, node_args, selective, None);
    let mut printed = 0;

    loop {
        let outcome = dispatcher.wakeup(dispatcher_id, payload).await?;

        let events = sink.drain();
        for event in events.iter().skip(printed) {
            println!("[{:?}] flow={}", event.event, event.flow_info.flow_name);
        }
        printed = events.len();

        match outcome {
            DispatcherOutcome::Success { finished_nodes } => {
                println!("flow '{flow_name}' finished successfully:");
                print_finished(&finished_nodes);
                return Ok(());
            }
            DispatcherOutcome::FlowFailed { body } => {
                eprintln!("flow '{flow_name}' failed: {body}");
                std::process::exit(1);
            }
            DispatcherOutcome::Rescheduled { task_id } => {
                broker.complete_all_pending().await;
                payload = reload_payload(&broker, &task_id).await?;
            }
        }
    }
}

async fn reload_payload(broker: &InMemoryBroker, task_id: &TaskId) -> Result<DispatcherPayload, CliError> {
    let raw = broker
        .payload_of(task_id)
        .await
        .expect("dispatcher just rescheduled this exact task id");
    Ok(serde_json::from_value(raw)?)
}

fn print_finished(finished_nodes: &std::collections::BTreeMap<NodeName, Vec<TaskId>>) {
    for (node, ids) in finished_nodes {
        println!("  {node}: {} task(s)", ids.len());
    }
}
