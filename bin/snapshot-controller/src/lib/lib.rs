// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the VM snapshot and restore controllers against a live cluster.

use std::sync::Arc;

use slog::{info, Logger};
use snapshot_api_types::csi::{VolumeSnapshot, VolumeSnapshotClass};
use snapshot_controller_config::Config;
use tokio_util::sync::CancellationToken;
use virt_snapshot::clock::SystemClock;
use virt_snapshot::dynamic_informer::{DynamicInformers, VolumeSnapshotProvider};
use virt_snapshot::informer::Informers;
use virt_snapshot::restore::RestoreController;
use virt_snapshot::snapshot::SnapshotController;
use virt_snapshot::Context;

pub mod client;
pub mod recorder;
pub mod watch;

use client::KubeClient;
use recorder::KubeRecorder;
use watch::KubeWatch;

/// Runs both controllers until `cancel` fires.
pub async fn run(
    kube_client: kube::Client,
    config: &Config,
    cancel: CancellationToken,
    log: &Logger,
) {
    let informers = Arc::new(Informers::new());
    let (recorder, recorder_task) = KubeRecorder::spawn(kube_client.clone(), log);
    let ctx = Context {
        client: Arc::new(KubeClient::new(kube_client.clone())),
        informers: Arc::clone(&informers),
        recorder: Arc::new(recorder),
        clock: Arc::new(SystemClock),
    };

    let dynamic = Arc::new(DynamicInformers::new(
        Arc::new(KubeWatch::<VolumeSnapshot>::new(kube_client.clone(), log)),
        Arc::new(KubeWatch::<VolumeSnapshotClass>::new(kube_client.clone(), log)),
        log,
    ));

    // Handlers must be registered before the watches start delivering.
    let snapshots = SnapshotController::new(
        ctx.clone(),
        Arc::clone(&dynamic),
        config.snapshot.retry_interval(),
        log,
    );
    let restores = RestoreController::new(
        ctx,
        Arc::clone(&dynamic) as Arc<dyn VolumeSnapshotProvider>,
        config.restore.retry_interval(),
        log,
    );

    let mut tasks =
        watch::spawn_watches(&kube_client, &informers, &cancel, log);
    tasks.push(watch::spawn_resync(
        Arc::clone(&informers),
        config.resync_period(),
        cancel.clone(),
    ));

    info!(log, "starting controllers";
        "snapshot_threadiness" => config.snapshot.threadiness,
        "restore_threadiness" => config.restore.threadiness);

    tokio::join!(
        snapshots.run(config.snapshot.threadiness, cancel.clone()),
        restores.run(config.restore.threadiness, cancel.clone()),
    );

    futures::future::join_all(tasks).await;
    recorder_task.abort();
    info!(log, "controllers stopped");
}
