//! End-to-end runs of the controller loop.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use extmod_controller::model::Lease;
use extmod_controller::restart::{RestartError, RestartSignal};
use extmod_controller::{Config, Controller, ControllerError, Store, Stores};
use extmod_reconcile::{Phase, PolicyMode};
use tokio::sync::watch;

fn config(h: &Harness) -> Config {
    Config {
        modules_dir: Some(h.tree.root().to_path_buf()),
        workers: 2,
        restart_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

fn controller(h: &Harness) -> Controller {
    Controller::new(config(h), h.stores())
        .with_downloaders(Arc::new(h.downloads.clone()))
        .with_docs_builder(h.docs.clone())
        .with_restart_signal(h.signal.clone())
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_disabled_without_modules_dir() {
    let (_tx, rx) = watch::channel(false);
    let controller = Controller::new(Config::default(), Stores::in_memory());

    controller.run(rx).await.unwrap();
}

#[tokio::test]
async fn test_release_is_deployed_and_docs_follow_new_builder() {
    let h = Harness::new().await;
    h.add_policy("auto", PolicyMode::Auto).await;
    h.add_release("foo", "1.0.0", 910, None, Some("auto")).await;

    let controller = controller(&h);
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(async move { controller.run(rx).await });
    let h = &h;

    eventually(move || async move { h.phase("foo-v1.0.0").await == Some(Phase::Deployed) })
        .await;
    assert_eq!(h.link("910-foo"), Some(PathBuf::from("../foo/v1.0.0")));
    eventually(move || async move { !h.signal.reasons.lock().unwrap().is_empty() }).await;

    h.leases
        .create(Lease::docs_builder("builder-a", Some("10.0.0.1:8081")))
        .await
        .unwrap();
    eventually(move || async move { !h.docs.builds.lock().unwrap().is_empty() }).await;
    assert_eq!(h.docs.sent.lock().unwrap()[0].1, "foo");

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_preflight_runs_before_workers() {
    let h = Harness::new().await;
    h.add_release("foo", "1.0.0", 910, Some(Phase::Deployed), Some("auto"))
        .await;

    let controller = controller(&h);
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(async move { controller.run(rx).await });
    let h = &h;

    eventually(move || async move { h.link("910-foo").is_some() }).await;
    eventually(move || async move {
        h.signal
            .reasons
            .lock()
            .unwrap()
            .iter()
            .any(|r| r == "one of modules is not enabled")
    })
    .await;

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

struct PanickingSignal;

impl RestartSignal for PanickingSignal {
    fn signal(&self, _reason: &str) -> Result<(), RestartError> {
        panic!("signal delivery crashed");
    }
}

#[tokio::test]
async fn test_crashed_restart_coordinator_fails_the_run() {
    let h = Harness::new().await;
    h.add_release("foo", "1.0.0", 910, Some(Phase::Deployed), Some("auto"))
        .await;

    let controller = controller(&h).with_restart_signal(Arc::new(PanickingSignal));
    let (_shutdown, rx) = watch::channel(false);

    let result = tokio::time::timeout(Duration::from_secs(5), controller.run(rx))
        .await
        .unwrap();

    assert!(matches!(result, Err(ControllerError::Task(_))));
}
