//! Whole-runtime sessions that cross every context boundary at once.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use tether_buffer::ElementType;
use tether_runtime::calls::{demo_calls, COMPUTE_SUM, MAKE_BUFFER};
use tether_runtime::{CallArg, CallValue, Runtime, RuntimeConfig};
use tether_taskq::{MemorySource, QueueError, StreamRequest, TaskClient};

fn config() -> RuntimeConfig {
    RuntimeConfig {
        memory_bytes: 4 << 20,
        thread_stack_size: 32 * 1024,
        idle_wait: Duration::from_millis(50),
        strict_ledger: true,
        ..RuntimeConfig::default()
    }
}

fn read_to_end(client: &TaskClient, url: &str) -> Result<Vec<u8>, QueueError> {
    let id = client.stream_new(&StreamRequest::get(url))?;
    let mut buf = [0u8; 5];
    let mut body = Vec::new();
    loop {
        match client.stream_read(id, &mut buf)? {
            0 => return Ok(body),
            n => body.extend_from_slice(&buf[..n]),
        }
    }
}

fn sum_of(values: Vec<CallValue>) -> String {
    match values.as_slice() {
        [CallValue::Str(s)] => s.clone(),
        other => panic!("expected one string, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn independent_runtimes_share_nothing() {
    let a = Runtime::start(config(), demo_calls(), Arc::new(MemorySource::new())).unwrap();
    let b = Runtime::start(config(), demo_calls(), Arc::new(MemorySource::new())).unwrap();
    assert!(!a.memory().same_region(b.memory()));

    let from_a = a.host().call_module(MAKE_BUFFER, vec![]).await.unwrap();
    let from_b = b.host().call_module(MAKE_BUFFER, vec![]).await.unwrap();
    let (Some(buf_a), Some(buf_b)) = (from_a[0].as_buffer(), from_b[0].as_buffer()) else {
        panic!("makeBuffer returns a buffer");
    };
    let handle_a = buf_a.descriptor().ref_handle().unwrap();
    let handle_b = buf_b.descriptor().ref_handle().unwrap();
    assert!(!buf_a.same_buffer(buf_b));

    drop(from_a);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.module().arc_count(handle_a).is_some() {
        assert!(tokio::time::Instant::now() < deadline, "runtime a never released");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(b.module().arc_count(handle_b), Some(1));
    assert_eq!(buf_b.to_vec().unwrap(), (1..=8).collect::<Vec<u8>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_blocked_reader_does_not_stall_module_calls() {
    let source = MemorySource::new();
    let feed = source.insert_live("mem://live");
    let rt = Runtime::start(config(), demo_calls(), Arc::new(source)).unwrap();
    let client = rt.task_client().clone().with_timeout(Duration::from_secs(10));

    let reader = tokio::task::spawn_blocking(move || read_to_end(&client, "mem://live"));

    // The reader is parked inside the task worker; the module keeps answering.
    for _ in 0..5 {
        let data = rt
            .host()
            .create_buffer(&[2, 4, 6], ElementType::U8)
            .await
            .unwrap();
        let sum = rt
            .host()
            .call_module(COMPUTE_SUM, vec![data.into()])
            .await
            .unwrap();
        assert_eq!(sum_of(sum), "12");
    }
    assert!(!reader.is_finished());

    feed.send(b"first ".to_vec());
    feed.send(b"second".to_vec());
    drop(feed);
    let body = reader.await.unwrap().unwrap();
    assert_eq!(body, b"first second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_threads_stream_while_workers_call_the_module() {
    let source = MemorySource::new();
    source.insert("mem://config", vec![b"threads=".to_vec(), b"4".to_vec()]);
    let rt = Runtime::start(config(), demo_calls(), Arc::new(source)).unwrap();
    let module = rt.module().clone();
    let worker = rt.connect_worker().unwrap();
    let worker_thread = rt
        .main_thread()
        .allocate_for_spawn()
        .unwrap()
        .initialize_on_new_thread(module.clone(), module.new_instance())
        .unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..4 {
        let tx = tx.clone();
        let client = rt.task_client().clone().with_timeout(Duration::from_secs(10));
        let ctx_ptr = module
            .register_function(move |_| {
                tx.send(read_to_end(&client, "mem://config")).unwrap();
            })
            .unwrap();
        worker.spawner.spawn(&worker_thread, ctx_ptr).await.unwrap();
    }
    drop(tx);

    let sums = sum_repeatedly(&worker).await;
    assert!(sums.iter().all(|s| s == "55"));

    assert_eq!(rt.join_threads(), 0);
    let bodies: Vec<_> = rx.iter().map(Result::unwrap).collect();
    assert_eq!(bodies.len(), 4);
    assert!(bodies.iter().all(|b| b == b"threads=4"));
    rt.shutdown();
}

async fn sum_repeatedly(worker: &tether_runtime::WorkerContext) -> Vec<String> {
    let mut sums = Vec::new();
    for _ in 0..4 {
        let values = worker
            .client
            .call_module(COMPUTE_SUM, vec![CallArg::bytes((1..=10).collect::<Vec<u8>>())])
            .await
            .unwrap();
        sums.push(sum_of(values));
    }
    sums
}
