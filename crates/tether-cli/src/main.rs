use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tether_buffer::ElementType;
use tether_mem::ModuleInstance;
use tether_runtime::calls::{demo_calls, ARRAY_MULTIPLY, COMPUTE_SUM, MAKE_BUFFER};
use tether_runtime::{CallArg, CallValue, Runtime, RuntimeConfig};
use tether_taskq::{MemorySource, StreamRequest, StreamSource};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_STREAM_URL: &str = "mem://demo";

#[derive(Debug, Parser)]
#[command(
    name = "tether",
    version,
    about = "Run a demo session against an in-process module: calls, buffers, a stream and threads."
)]
struct Args {
    /// Log filter (tracing-subscriber EnvFilter syntax). Defaults to `RUST_LOG`, then `info`.
    ///
    /// Environment variable: `TETHER_LOG_LEVEL`.
    #[arg(long, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Stream to read through the task worker. `http(s)://` URLs need the `http` feature.
    #[arg(long, value_name = "URL", default_value = DEMO_STREAM_URL)]
    stream_url: String,

    /// Threads to spawn from a worker context.
    #[arg(long, default_value_t = 2)]
    threads: u32,

    /// Shared memory size in bytes (overrides `TETHER_MEMORY_BYTES`).
    #[arg(long, value_name = "BYTES")]
    memory_bytes: Option<usize>,

    /// Stack size of spawned threads in bytes (overrides `TETHER_THREAD_STACK_SIZE`).
    #[arg(long, value_name = "BYTES")]
    thread_stack_size: Option<u32>,
}

fn init_logging(log_level: Option<&str>) -> anyhow::Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn stream_source(url: &str) -> anyhow::Result<Arc<dyn StreamSource>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        #[cfg(feature = "http")]
        return Ok(Arc::new(tether_taskq::source::HttpSource::new()));
        #[cfg(not(feature = "http"))]
        bail!("{url}: built without the `http` feature");
    }
    let source = MemorySource::new();
    source.insert(
        DEMO_STREAM_URL,
        vec![
            b"bytes written by the task worker, ".to_vec(),
            b"read by a blocking context".to_vec(),
        ],
    );
    Ok(Arc::new(source))
}

fn expect_str(values: &[CallValue], call: &str) -> anyhow::Result<String> {
    match values {
        [CallValue::Str(s)] => Ok(s.clone()),
        other => bail!("{call} returned {other:?}, expected one string"),
    }
}

fn expect_buffer(values: &[CallValue], call: &str) -> anyhow::Result<Vec<u8>> {
    match values {
        [CallValue::Buffer(buffer)] => Ok(buffer.to_vec()?),
        other => bail!("{call} returned {other:?}, expected one buffer"),
    }
}

async fn buffers(rt: &Runtime) -> anyhow::Result<()> {
    let host = rt.host();
    let data: Vec<u8> = (1..=10).collect();

    let sum = host.call_module(COMPUTE_SUM, vec![CallArg::bytes(data.clone())]);
    let exclusive = host.create_buffer(&data, ElementType::U8);
    let (sum, exclusive) = tokio::join!(sum, exclusive);
    println!("computeSum(1..=10) = {}", expect_str(&sum?, COMPUTE_SUM)?);

    let exclusive = exclusive?;
    let sum = host
        .call_module(COMPUTE_SUM, vec![exclusive.clone().into()])
        .await?;
    println!(
        "computeSum(exclusive buffer) = {} (transferred: {})",
        expect_str(&sum, COMPUTE_SUM)?,
        exclusive.is_transferred()
    );

    let shared = host.call_module(MAKE_BUFFER, vec![]).await?;
    let [CallValue::Buffer(shared)] = shared.as_slice() else {
        bail!("{MAKE_BUFFER} returned {shared:?}, expected one buffer");
    };
    let scaled = host
        .call_module(
            ARRAY_MULTIPLY,
            vec![CallArg::from("3"), shared.clone().into()],
        )
        .await?;
    println!(
        "arrayMultiply(3, {:?}) = {:?}",
        shared.to_vec()?,
        expect_buffer(&scaled, ARRAY_MULTIPLY)?
    );
    Ok(())
}

async fn stream(rt: &Runtime, url: String) -> anyhow::Result<()> {
    let client = rt.task_client().clone().with_timeout(Duration::from_secs(30));
    let body = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let id = client
            .stream_new(&StreamRequest::get(url.as_str()))
            .with_context(|| format!("opening {url}"))?;
        let mut buf = vec![0u8; 16];
        let mut body = Vec::new();
        loop {
            let n = client.stream_read(id, &mut buf)?;
            if n == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&buf[..n]);
        }
    })
    .await??;
    println!(
        "stream: {} bytes: {}",
        body.len(),
        String::from_utf8_lossy(&body)
    );
    Ok(())
}

async fn threads(rt: &Runtime, count: u32) -> anyhow::Result<()> {
    let worker = rt.connect_worker()?;
    let module = rt.module().clone();
    let worker_thread = rt
        .main_thread()
        .allocate_for_spawn()?
        .initialize_on_new_thread(module.clone(), module.new_instance())?;

    let (tx, rx) = mpsc::channel();
    for index in 0..count {
        let tx = tx.clone();
        let ctx_ptr = module.register_function(move |instance| {
            if tx
                .send((index, instance.tls_base(), instance.stack_pointer()))
                .is_err()
            {
                tracing::debug!(index, "thread report dropped; session already finished");
            }
        })?;
        worker.spawner.spawn(&worker_thread, ctx_ptr).await?;
    }
    drop(tx);

    let panicked = tokio::task::block_in_place(|| rt.join_threads());
    if panicked > 0 {
        bail!("{panicked} spawned threads panicked");
    }
    let mut ran: Vec<_> = rx.iter().collect();
    ran.sort_unstable();
    for (index, tls_base, stack_pointer) in &ran {
        info!(index, ?tls_base, stack_pointer, "thread ran");
    }
    println!("threads: {} of {count} ran", ran.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    let mut config = RuntimeConfig::from_env()?;
    if let Some(bytes) = args.memory_bytes {
        config.memory_bytes = bytes;
    }
    if let Some(bytes) = args.thread_stack_size {
        config.thread_stack_size = bytes;
    }
    config.validate()?;

    let rt = Runtime::start(config, demo_calls(), stream_source(&args.stream_url)?)?;
    buffers(&rt).await?;
    stream(&rt, args.stream_url).await?;
    threads(&rt, args.threads).await?;
    tokio::task::block_in_place(|| rt.shutdown());
    Ok(())
}
