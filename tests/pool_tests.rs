//! End-to-end pool tests with the real worker runtime over in-memory pipes.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pool_supervisor::supervisor::WorkerState;
use pool_supervisor::transport::{
    attach, report_exit, Transport, TransportEvent, WorkerChannel, WorkerExit,
};
use pool_supervisor::{
    EntryTarget, MemoryTransport, RequestError, Supervisor, Worker, WorkerError, WorkerId,
    WorkerOptions,
};
use test_harness::{
    dummy_target, fast_config, memory_transport, provide_test_capabilities, wait_for_stats,
};

const WAIT: Duration = Duration::from_secs(5);

fn start_pool() -> Supervisor {
    Supervisor::with_transport(fast_config(), memory_transport()).unwrap()
}

#[tokio::test]
async fn test_echo_round_trips_any_json_value() {
    let supervisor = start_pool();
    supervisor.cluster(dummy_target(), Some(2)).await.unwrap();

    let values = vec![
        Value::Null,
        json!(true),
        json!(-17),
        json!(3.5),
        json!("text with \"quotes\"\nand a newline"),
        json!([1, "two", [3]]),
        json!({"nested": {"list": [null, false], "n": 1}}),
    ];
    for value in values {
        let result = supervisor.request("echo", vec![value.clone()]).await;
        assert_eq!(result, Ok(value));
    }
}

#[tokio::test]
async fn test_four_workers_square_one_hundred_requests() {
    let supervisor = start_pool();
    let ids = supervisor.cluster(dummy_target(), Some(4)).await.unwrap();
    assert_eq!(ids.len(), 4);
    let ready = wait_for_stats(&supervisor, WAIT, |s| {
        s.workers
            .iter()
            .all(|w| w.capabilities.iter().any(|c| c == "square"))
    })
    .await;
    assert!(ready.workers.iter().all(|w| w.state == WorkerState::Active));

    let completions: Vec<_> = (0..100i64)
        .map(|i| (i, supervisor.request("square", vec![json!(i)])))
        .collect();
    for (i, completion) in completions {
        assert_eq!(completion.await, Ok(json!(i * i)), "square({i})");
    }

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.workers.len(), 4);
    assert_eq!(stats.completed(), 100);
    assert!(stats.workers.iter().all(|w| w.in_flight == 0));
    assert!(stats.workers.iter().all(|w| w.state == WorkerState::Active));
    assert!(
        stats.workers.iter().filter(|w| w.completed > 0).count() > 1,
        "work was not spread: {stats:?}"
    );
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_handler_error_does_not_affect_other_requests() {
    let supervisor = start_pool();
    supervisor.cluster(dummy_target(), Some(1)).await.unwrap();

    let failing = supervisor.request("fail", vec![]);
    let fine = supervisor.request("square", vec![json!(9)]);

    match failing.await {
        Err(RequestError::Rejected(err)) => assert_eq!(err.message, "refused"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(fine.await, Ok(json!(81)));

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.workers.len(), 1);
    assert_eq!(stats.workers[0].completed, 2);
}

#[tokio::test]
async fn test_requests_before_cluster_wait_in_backlog() {
    let supervisor = start_pool();

    let early: Vec<_> = (0..10i64)
        .map(|i| (i, supervisor.request("square", vec![json!(i)])))
        .collect();
    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.backlog, 10);

    supervisor.cluster(dummy_target(), Some(2)).await.unwrap();
    for (i, completion) in early {
        assert_eq!(completion.await, Ok(json!(i * i)));
    }
}

#[tokio::test]
async fn test_crashed_worker_work_completes_on_replacement() {
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&starts);
    let transport = MemoryTransport::new(move |mut worker: Worker| {
        let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            provide_test_capabilities(&mut worker);
            if first {
                // Die while the slow requests are still running.
                tokio::select! {
                    result = worker.run() => result,
                    _ = tokio::time::sleep(Duration::from_millis(150)) => {
                        Err(WorkerError::Io(std::io::Error::other("simulated crash")))
                    }
                }
            } else {
                worker.run().await
            }
        }
    });
    let supervisor = Supervisor::with_transport(fast_config(), transport).unwrap();
    let ids = supervisor.cluster(dummy_target(), Some(1)).await.unwrap();

    let completions: Vec<_> = (0..3)
        .map(|i| (i, supervisor.request("slow", vec![json!(i)])))
        .collect();
    for (i, completion) in completions {
        let result = tokio::time::timeout(WAIT, completion).await.unwrap();
        assert_eq!(result, Ok(json!(i)));
    }

    assert_eq!(starts.load(Ordering::SeqCst), 2);
    let stats = wait_for_stats(&supervisor, WAIT, |s| {
        s.workers.len() == 1 && s.workers[0].completed == 3
    })
    .await;
    assert_eq!(stats.workers.len(), 1, "pool back to its original size");
    assert_ne!(stats.workers[0].id, ids[0]);
    assert_eq!(stats.workers[0].completed, 3);
    assert_eq!(stats.workers[0].in_flight, 0);
}

/// In-memory transport that strips heartbeats from the first worker's input,
/// so that worker runs its normal loop until its liveness countdown expires.
#[derive(Clone, Default)]
struct MutedFirstTransport {
    started: Arc<AtomicUsize>,
    timed_out: Arc<Mutex<Vec<WorkerId>>>,
}

impl Transport for MutedFirstTransport {
    fn spawn(
        &self,
        worker: WorkerId,
        _target: &EntryTarget,
        env: &[(String, String)],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> pool_supervisor::Result<WorkerChannel> {
        let muted = self.started.fetch_add(1, Ordering::SeqCst) == 0;
        let (controller_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (controller_read, controller_write) = tokio::io::split(controller_io);
        let (worker_read, worker_write) = tokio::io::split(worker_io);

        let mut filter = None;
        let input: Box<dyn AsyncRead + Send + Unpin> = if muted {
            let (mut filtered, filtered_rx) = tokio::io::duplex(64 * 1024);
            filter = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(worker_read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains("\"heartbeat\"") {
                        continue;
                    }
                    if filtered.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }));
            Box::new(filtered_rx)
        } else {
            Box::new(worker_read)
        };

        let kill = CancellationToken::new();
        let (outbound, reader_task) = attach(
            worker,
            controller_read,
            controller_write,
            events.clone(),
            kill.clone(),
        );

        let mut runtime = Worker::new(input, worker_write, WorkerOptions::from_vars(env.to_vec()));
        provide_test_capabilities(&mut runtime);

        let timed_out = Arc::clone(&self.timed_out);
        let watch_kill = kill.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                biased;
                result = runtime.run() => match result {
                    Ok(()) => WorkerExit::new(Some(0), "worker finished"),
                    Err(e) => {
                        if matches!(e, WorkerError::LivenessTimeout(_)) {
                            timed_out.lock().unwrap().push(worker);
                        }
                        WorkerExit::new(Some(1), e.to_string())
                    }
                },
                _ = watch_kill.cancelled() => WorkerExit::killed(),
            };
            if let Some(filter) = filter {
                filter.abort();
            }
            report_exit(worker, reader_task, exit, &events).await;
        });

        Ok(WorkerChannel::new(worker, None, outbound, kill))
    }
}

#[tokio::test]
async fn test_worker_that_stops_hearing_heartbeats_is_replaced() {
    let transport = MutedFirstTransport::default();
    let timed_out = Arc::clone(&transport.timed_out);
    let supervisor = Supervisor::with_transport(fast_config(), transport).unwrap();
    supervisor.cluster(dummy_target(), Some(1)).await.unwrap();

    // The muted worker still serves dispatches until its countdown runs out.
    let result = tokio::time::timeout(WAIT, supervisor.request("square", vec![json!(12)]))
        .await
        .unwrap();
    assert_eq!(result, Ok(json!(144)));

    let stats = wait_for_stats(&supervisor, WAIT, |s| {
        s.workers.len() == 1
            && s.workers[0].id == 2
            && s.workers[0].state == WorkerState::Active
    })
    .await;
    assert_eq!(stats.workers[0].id, 2, "muted worker was not replaced: {stats:?}");
    assert_eq!(*timed_out.lock().unwrap(), vec![1]);

    // The replacement hears its heartbeats and outlives several timeouts.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let result = tokio::time::timeout(WAIT, supervisor.request("square", vec![json!(5)]))
        .await
        .unwrap();
    assert_eq!(result, Ok(json!(25)));
    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.workers.len(), 1);
    assert_eq!(stats.workers[0].id, 2);
    assert_eq!(*timed_out.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_worker_logs_are_forwarded() {
    let transport = MemoryTransport::new(|mut worker: Worker| async move {
        let logger = worker.logger();
        worker
            .provide("log", move |args: Vec<Value>| {
                let logger = logger.clone();
                async move {
                    logger.info(format!("handling {}", args.len()));
                    Ok::<_, pool_supervisor::HandlerError>(json!("logged"))
                }
            })
            .unwrap();
        worker.run().await
    });
    let supervisor = Supervisor::with_transport(fast_config(), transport).unwrap();
    supervisor.cluster(dummy_target(), Some(1)).await.unwrap();

    assert_eq!(
        supervisor.request("log", vec![json!(1)]).await,
        Ok(json!("logged"))
    );
}

#[tokio::test]
async fn test_shutdown_kills_memory_workers() {
    let supervisor = start_pool();
    supervisor.cluster(dummy_target(), Some(2)).await.unwrap();

    let slow = supervisor.request("slow", vec![json!(1)]);
    supervisor.shutdown().await.unwrap();
    assert_eq!(slow.await, Err(RequestError::Abandoned));
}
