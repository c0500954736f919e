use std::sync::Arc;
use std::time::{Duration, Instant};

use rkhls::{CommandSpec, EventHooks, JobKey, WorkerError, WorkerRegistry, WorkerState};

use crate::common::{ShellFactory, key, registry, wait_terminated};

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_spawns_once() {
    let root = tempfile::tempdir().unwrap();
    let factory = ShellFactory::new("sleep 300");
    let registry = registry(root.path(), &factory);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create(&key("rtsp://cam1")) })
        })
        .collect();
    let mut workers = Vec::new();
    for handle in handles {
        workers.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(factory.spawns(), 1);
    assert_eq!(registry.len(), 1);
    assert!(workers.iter().all(|w| Arc::ptr_eq(w, &workers[0])));

    workers[0].stop();
    wait_terminated(&workers[0]).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_spawn_failure_is_not_registered() {
    let root = tempfile::tempdir().unwrap();
    let factory = |_: &JobKey| -> Result<CommandSpec, WorkerError> {
        Ok(CommandSpec::new("/nonexistent/transcoder").arg("--hls"))
    };
    let registry = WorkerRegistry::new(root.path(), Arc::new(factory));
    let key = key("rtsp://cam1");

    let err = registry.get_or_create(&key).unwrap_err();
    assert!(matches!(err, WorkerError::Spawn { .. }));
    assert!(!registry.contains(&key));
    assert!(!root.path().join(key.dir_name()).exists());
}

#[tokio::test]
async fn test_exited_job_is_deregistered() {
    let root = tempfile::tempdir().unwrap();
    let factory = ShellFactory::new("exit 0");
    let registry = registry(root.path(), &factory);
    let key = key("rtsp://cam1");

    let worker = registry.get_or_create(&key).unwrap();
    assert!(registry.contains(&key));
    wait_terminated(&worker).await;

    assert!(!registry.contains(&key));
    assert!(registry.get(&key).is_none());
    assert!(!worker.work_dir().exists());
}

#[tokio::test]
async fn test_stopping_job_is_returned() {
    let root = tempfile::tempdir().unwrap();
    let factory = ShellFactory::new("sleep 300");
    let registry = registry(root.path(), &factory);
    let key = key("rtsp://cam1");

    let first = registry.get_or_create(&key).unwrap();
    first.stop();
    assert_eq!(first.state(), WorkerState::Stopping);
    let again = registry.get_or_create(&key).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(factory.spawns(), 1);

    wait_terminated(&first).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_new_job_after_termination() {
    let root = tempfile::tempdir().unwrap();
    let factory = ShellFactory::new("sleep 300");
    let registry = registry(root.path(), &factory);
    let key = key("rtsp://cam1");

    let first = registry.get_or_create(&key).unwrap();
    first.stop();
    wait_terminated(&first).await;

    let second = registry.get_or_create(&key).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.state(), WorkerState::Running);
    assert_eq!(first.state(), WorkerState::Terminated);
    assert_eq!(factory.spawns(), 2);
    assert!(second.work_dir().is_dir());

    second.stop();
    wait_terminated(&second).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_jobs() {
    let root = tempfile::tempdir().unwrap();
    let factory = ShellFactory::new("sleep 300");
    let registry = registry(root.path(), &factory);

    let cam1 = registry.get_or_create(&key("rtsp://cam1")).unwrap();
    let cam2 = registry.get_or_create(&key("rtsp://cam2")).unwrap();
    let nvidia = registry
        .get_or_create(&JobKey::new("nvidia", "rtsp://cam1"))
        .unwrap();
    assert_eq!(registry.len(), 3);
    assert_ne!(cam1.work_dir(), cam2.work_dir());
    assert_ne!(cam1.work_dir(), nvidia.work_dir());

    let mut keys: Vec<_> = registry.snapshot().iter().map(|w| w.key().clone()).collect();
    keys.sort();
    assert_eq!(keys[0], key("rtsp://cam1"));

    for worker in [&cam1, &cam2, &nvidia] {
        worker.stop();
    }
    for worker in [&cam1, &cam2, &nvidia] {
        wait_terminated(worker).await;
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_similar_profiles_do_not_share_work_dir() {
    let root = tempfile::tempdir().unwrap();
    let factory = ShellFactory::new("sleep 300");
    let registry = registry(root.path(), &factory);

    let dotted = registry
        .get_or_create(&JobKey::new("cam.hd", "rtsp://cam1"))
        .unwrap();
    let underscored = registry
        .get_or_create(&JobKey::new("cam_hd", "rtsp://cam1"))
        .unwrap();
    assert_ne!(dotted.work_dir(), underscored.work_dir());
    assert!(dotted.work_dir().is_dir());

    dotted.stop();
    wait_terminated(&dotted).await;
    assert_eq!(underscored.state(), WorkerState::Running);
    assert!(underscored.work_dir().is_dir());

    underscored.stop();
    wait_terminated(&underscored).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_start_does_not_block_other_keys() {
    let root = tempfile::tempdir().unwrap();
    let factory = ShellFactory::new("sleep 300");
    let registry = WorkerRegistry::builder(root.path(), Arc::new(factory.clone()))
        .hooks(|key| {
            if key.source() == "rtsp://slow" {
                EventHooks::new().on_start(|| std::thread::sleep(Duration::from_secs(2)))
            } else {
                EventHooks::new()
            }
        })
        .build();

    let slow = {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || registry.get_or_create(&key("rtsp://slow")))
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let begun = Instant::now();
    let fast = registry.get_or_create(&key("rtsp://fast")).unwrap();
    assert!(registry.contains(&key("rtsp://fast")));
    assert!(begun.elapsed() < Duration::from_secs(1));

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(factory.spawns(), 2);

    for worker in [&slow, &fast] {
        worker.stop();
    }
    for worker in [&slow, &fast] {
        wait_terminated(worker).await;
    }
    assert!(registry.is_empty());
}
