// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Posts controller events as core/v1 Events.
//!
//! Recording only queues the event; a background task creates it in the
//! namespace of the involved object. Failures are logged and dropped.

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use kube::api::{Api, PostParams};
use slog::{warn, Logger};
use snapshot_api_types::{ObjectMeta, Time};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use virt_snapshot::events::{EventRecorder, EventType};

pub const COMPONENT: &str = "snapshot-controller";

pub struct KubeRecorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl KubeRecorder {
    /// Creates the recorder along with the task delivering its events. The
    /// task exits once the recorder is dropped.
    pub fn spawn(client: kube::Client, log: &Logger) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let log = log.new(slog::o!("component" => "event-recorder"));
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let namespace =
                    event.metadata.namespace.clone().unwrap_or_default();
                let api: Api<Event> =
                    Api::namespaced(client.clone(), &namespace);
                if let Err(e) = api.create(&PostParams::default(), &event).await
                {
                    warn!(log, "failed to record event";
                        "reason" => event.reason.as_deref().unwrap_or_default(),
                        "error" => %e);
                }
            }
        });
        (KubeRecorder { tx }, task)
    }
}

impl EventRecorder for KubeRecorder {
    fn event(
        &self,
        object: ObjectReference,
        event_type: EventType,
        reason: &'static str,
        message: String,
    ) {
        // A closed channel means we are shutting down.
        let _ = self.tx.send(build_event(object, event_type, reason, message));
    }
}

fn build_event(
    object: ObjectReference,
    event_type: EventType,
    reason: &str,
    message: String,
) -> Event {
    let now = Time(Utc::now());
    let name = object.name.clone().unwrap_or_default();
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}.")),
            namespace: object.namespace.clone(),
            ..Default::default()
        },
        involved_object: object,
        type_: Some(event_type.as_str().to_string()),
        reason: Some(reason.to_string()),
        message: Some(message),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        source: Some(EventSource {
            component: Some(COMPONENT.to_string()),
            ..Default::default()
        }),
        reporting_component: Some(COMPONENT.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_land_next_to_their_object() {
        let object = ObjectReference {
            kind: Some("VirtualMachineRestore".into()),
            namespace: Some("ns".into()),
            name: Some("restore".into()),
            ..Default::default()
        };
        let event = build_event(
            object.clone(),
            EventType::Warning,
            "VirtualMachineRestoreError",
            "boom".into(),
        );
        assert_eq!(event.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(event.metadata.generate_name.as_deref(), Some("restore."));
        assert_eq!(event.involved_object, object);
        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.message.as_deref(), Some("boom"));
        assert_eq!(
            event.source.and_then(|s| s.component).as_deref(),
            Some(COMPONENT)
        );
    }
}
