#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateWaiting, ContainerStatus, Event, ObjectReference, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kalert_controller::{AlertHandler, EventHandler, PodHandler, ReconcileError};
use kalert_core::{AlertPayload, ResolvedObject};
use kalert_notify::{Notifier, NotifyError};

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<AlertPayload>>,
    fail: bool,
}

impl Recorder {
    fn failing() -> Self { Self { fail: true, ..Default::default() } }
    fn sent(&self) -> Vec<AlertPayload> { self.sent.lock().unwrap().clone() }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, payload: &AlertPayload) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(payload.clone());
        if self.fail {
            return Err(NotifyError::Status { status: 500, body: "boom".into() });
        }
        Ok(())
    }
}

fn event(type_: &str) -> Event {
    Event {
        metadata: ObjectMeta {
            namespace: Some("namespace".into()),
            name: Some("name.17a1".into()),
            ..Default::default()
        },
        type_: Some(type_.into()),
        reason: Some("reason".into()),
        message: Some("message".into()),
        involved_object: ObjectReference {
            kind: Some("kind".into()),
            namespace: Some("namespace".into()),
            name: Some("name".into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pod(status: PodStatus) -> Pod {
    Pod {
        metadata: ObjectMeta { namespace: Some("ns".into()), name: Some("a".into()), ..Default::default() },
        status: Some(status),
        ..Default::default()
    }
}

fn waiting_container(reason: &str, message: Option<&str>) -> ContainerStatus {
    ContainerStatus {
        name: "app".into(),
        state: Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.into()),
                message: message.map(str::to_string),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn normal_event_is_ignored() {
    let rec = Arc::new(Recorder::default());
    let h = EventHandler::new(rec.clone());
    h.handle(&event("Normal").into()).await.unwrap();
    assert!(rec.sent().is_empty());
}

#[tokio::test]
async fn warning_event_is_delivered() {
    let rec = Arc::new(Recorder::default());
    let h = EventHandler::new(rec.clone());
    h.handle(&event("Warning").into()).await.unwrap();
    assert_eq!(
        rec.sent(),
        vec![AlertPayload {
            kind: "kind".into(),
            namespace: "namespace".into(),
            name: "name".into(),
            error: "reason message".into(),
        }]
    );
}

#[tokio::test]
async fn wrong_object_type_is_a_type_mismatch() {
    let rec = Arc::new(Recorder::default());
    let err = EventHandler::new(rec.clone())
        .handle(&ResolvedObject::Pod(Pod::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::TypeMismatch { expected: "Event", found: "Pod" }));
    assert!(err.is_permanent());

    let err = PodHandler::new(rec.clone()).handle(&event("Warning").into()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::TypeMismatch { expected: "Pod", found: "Event" }));
    assert!(rec.sent().is_empty());
}

#[tokio::test]
async fn notifier_failure_surfaces_as_retryable_delivery_error() {
    let rec = Arc::new(Recorder::failing());
    let err = EventHandler::new(rec.clone()).handle(&event("Warning").into()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Delivery(NotifyError::Status { status: 500, .. })));
    assert!(!err.is_permanent());
    assert_eq!(rec.sent().len(), 1);
}

#[tokio::test]
async fn evicted_pod_alerts_once() {
    let rec = Arc::new(Recorder::default());
    let h = PodHandler::new(rec.clone());
    let p = pod(PodStatus {
        phase: Some("Failed".into()),
        reason: Some("Evicted".into()),
        message: Some("pod evicted by node".into()),
        ..Default::default()
    });
    h.handle(&p.into()).await.unwrap();
    assert_eq!(
        rec.sent(),
        vec![AlertPayload {
            kind: "Pod".into(),
            namespace: "ns".into(),
            name: "a".into(),
            error: "Evicted pod evicted by node".into(),
        }]
    );
}

#[tokio::test]
async fn running_pod_has_no_side_effect_however_often_handled() {
    let rec = Arc::new(Recorder::default());
    let h = PodHandler::new(rec.clone());
    let obj: ResolvedObject = pod(PodStatus {
        phase: Some("Running".into()),
        container_statuses: Some(vec![ContainerStatus { name: "app".into(), ..Default::default() }]),
        ..Default::default()
    })
    .into();
    for _ in 0..3 {
        h.handle(&obj).await.unwrap();
    }
    assert!(rec.sent().is_empty());
}

#[tokio::test]
async fn crash_looping_container_alerts() {
    let rec = Arc::new(Recorder::default());
    let p = pod(PodStatus {
        phase: Some("Running".into()),
        container_statuses: Some(vec![waiting_container(
            "CrashLoopBackOff",
            Some("back-off 5m0s restarting failed container"),
        )]),
        ..Default::default()
    });
    PodHandler::new(rec.clone()).handle(&p.into()).await.unwrap();
    let sent = rec.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].error, "CrashLoopBackOff back-off 5m0s restarting failed container");
}

#[test]
fn pending_pod_waiting_on_image_pull_alerts_but_container_creating_does_not() {
    let creating = pod(PodStatus {
        phase: Some("Pending".into()),
        container_statuses: Some(vec![waiting_container("ContainerCreating", None)]),
        ..Default::default()
    });
    assert_eq!(PodHandler::alert_for(&creating), None);

    let pulling = pod(PodStatus {
        phase: Some("Pending".into()),
        init_container_statuses: Some(vec![waiting_container("ImagePullBackOff", None)]),
        ..Default::default()
    });
    assert_eq!(PodHandler::alert_for(&pulling).map(|p| p.error).as_deref(), Some("ImagePullBackOff"));
}

#[test]
fn unknown_phase_without_reason_uses_phase() {
    let p = pod(PodStatus { phase: Some("Unknown".into()), ..Default::default() });
    assert_eq!(PodHandler::alert_for(&p).map(|p| p.error).as_deref(), Some("Unknown"));
}
