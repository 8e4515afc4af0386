//! Pod fixtures shared by the watcher tests.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};

use super::policy::{EssentialContainers, WatcherPolicy};
use crate::tasks::labels::LABEL_JOB_UUID;

pub const JOB_UUID: &str = "0190f3e4-2a7c-7b3e-9d7a-1f2e3d4c5b6a";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
}

pub fn essential_policy(grace_seconds: u64) -> WatcherPolicy {
    WatcherPolicy::new(
        Duration::from_secs(grace_seconds),
        EssentialContainers::new(["agent", "copy-agent", "checkout"], Some(r"^container-\d+$"))
            .unwrap(),
    )
}

/// Build a pod. `containers` pairs a name with its waiting reason, `None` meaning running.
pub fn pod(
    name: &str,
    started_seconds_ago: Option<i64>,
    job_uuid: Option<&str>,
    containers: &[(&str, Option<&str>)],
) -> Pod {
    let statuses: Vec<Value> = containers
        .iter()
        .map(|(container, reason)| {
            let state = match reason {
                Some(reason) => json!({ "waiting": { "reason": reason } }),
                None => json!({ "running": {} }),
            };
            json!({
                "name": container,
                "image": format!("{container}:latest"),
                "imageID": "",
                "ready": reason.is_none(),
                "restartCount": 0,
                "state": state
            })
        })
        .collect();

    let mut status = json!({ "phase": "Pending", "containerStatuses": statuses });
    if let Some(seconds) = started_seconds_ago {
        let started = now() - TimeDelta::seconds(seconds);
        status["startTime"] = json!(started.to_rfc3339_opts(SecondsFormat::Secs, true));
    }

    let mut metadata = json!({ "name": name, "namespace": "buildkite" });
    if let Some(uuid) = job_uuid {
        metadata["labels"] = json!({ LABEL_JOB_UUID: uuid });
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata,
        "status": status
    }))
    .unwrap()
}
