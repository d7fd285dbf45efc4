use std::sync::Arc;
use std::time::Duration;

use tether_ipc::channel::{HANDLER_PANIC, NO_RECEIVER_FOR_TOPIC};
use tether_ipc::{
    Channel, ChannelError, LinkedTransport, Payload, Relay, RemoteError, Transferable,
    TransportError, WireBuilder, WireParser,
};
use tokio::sync::Notify;

fn numbers(values: &[u32]) -> Payload {
    let mut b = WireBuilder::new();
    b.push_u32(values.len() as u32);
    for v in values {
        b.push_u32(*v);
    }
    Payload::new(b.finish())
}

fn single(value: u32) -> Payload {
    let mut b = WireBuilder::new();
    b.push_u32(value);
    Payload::new(b.finish())
}

fn read_single(payload: &Payload) -> u32 {
    WireParser::new(&payload.data).unwrap().read_u32().unwrap()
}

fn compute_sum(payload: Payload) -> Result<Payload, RemoteError> {
    let mut p = WireParser::new(&payload.data).map_err(|e| RemoteError::from_error("DecodeError", &e))?;
    let count = p
        .read_u32()
        .map_err(|e| RemoteError::from_error("DecodeError", &e))?;
    let mut sum = 0u32;
    for _ in 0..count {
        sum += p
            .read_u32()
            .map_err(|e| RemoteError::from_error("DecodeError", &e))?;
    }
    Ok(single(sum))
}

fn pair() -> (Channel, Channel) {
    let (a, b) = LinkedTransport::pair();
    (
        Channel::connect(Arc::new(a)).unwrap(),
        Channel::connect(Arc::new(b)).unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interleaved_calls_resolve_to_their_own_results() {
    let (client, server) = pair();
    let gate = Arc::new(Notify::new());
    server.receive_sync("computeSum", compute_sum).unwrap();
    let release = gate.clone();
    server
        .receive("slow", move |payload| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok(payload)
            }
        })
        .unwrap();

    let slow = client.send("slow", single(7));
    let first = client.send("computeSum", numbers(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
    let second = client.send("computeSum", numbers(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));

    assert_eq!(read_single(&first.await.unwrap()), 55);
    assert_eq!(read_single(&second.await.unwrap()), 55);
    assert_eq!(client.pending_calls(), 1);

    gate.notify_one();
    assert_eq!(read_single(&slow.await.unwrap()), 7);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn duplicate_receiver_is_rejected_before_anything_is_sent() {
    let (a, _b) = LinkedTransport::pair();
    let channel = Channel::new().unwrap();
    channel.receive_sync("computeSum", compute_sum).unwrap();
    assert_eq!(
        channel.receive_sync("computeSum", compute_sum),
        Err(ChannelError::DuplicateReceiver("computeSum".into()))
    );
    channel.attach(Arc::new(a.clone())).unwrap();
    assert_eq!(a.queued(), 0);
}

#[tokio::test]
async fn remote_errors_keep_name_message_and_trace() {
    let (client, server) = pair();
    server
        .receive_sync("fail", |_| {
            Err(RemoteError::new("RangeError", "index out of range").with_trace("at fail"))
        })
        .unwrap();

    match client.send("fail", Payload::empty()).await {
        Err(ChannelError::Remote(err)) => {
            assert_eq!(err.name, "RangeError");
            assert_eq!(err.message, "index out of range");
            assert_eq!(err.trace.as_deref(), Some("at fail"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn unknown_topic_gets_an_error_response() {
    let (client, _server) = pair();
    match client.send("missing", Payload::empty()).await {
        Err(ChannelError::Remote(err)) => {
            assert_eq!(err.name, NO_RECEIVER_FOR_TOPIC);
            assert!(err.message.contains("missing"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn handler_panics_become_error_responses() {
    let (client, server) = pair();
    server
        .receive_sync("boom", |_| panic!("handler exploded"))
        .unwrap();
    match client.send("boom", Payload::empty()).await {
        Err(ChannelError::Remote(err)) => {
            assert_eq!(err.name, HANDLER_PANIC);
            assert_eq!(err.message, "handler exploded");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // The server keeps serving.
    server.receive_sync("ok", |p| Ok(p)).unwrap();
    assert_eq!(read_single(&client.send("ok", single(1)).await.unwrap()), 1);
}

#[tokio::test]
async fn second_channel_on_one_endpoint_fails() {
    let (a, _b) = LinkedTransport::pair();
    let _first = Channel::connect(Arc::new(a.clone())).unwrap();
    assert_eq!(
        Channel::connect(Arc::new(a)).err(),
        Some(ChannelError::Transport(TransportError::AlreadyAttached))
    );
}

#[tokio::test]
async fn requests_sent_before_the_server_attaches_are_served() {
    let (a, b) = LinkedTransport::pair();
    let client = Channel::connect(Arc::new(a)).unwrap();
    let response = client.send("computeSum", numbers(&[20, 22]));

    let server = Channel::new().unwrap();
    server.receive_sync("computeSum", compute_sum).unwrap();
    server.attach(Arc::new(b)).unwrap();

    assert_eq!(read_single(&response.await.unwrap()), 42);
}

#[tokio::test]
async fn closing_fails_pending_calls() {
    let (client, server) = pair();
    server
        .receive("never", |_| futures_pending())
        .unwrap();

    let call = client.send("never", Payload::empty());
    client.close();
    assert_eq!(call.await.err(), Some(ChannelError::Disconnected));
    assert_eq!(
        client.send("never", Payload::empty()).await.err(),
        Some(ChannelError::Disconnected)
    );
}

#[tokio::test]
async fn try_send_reports_requests_that_were_never_posted() {
    let (client, server) = pair();
    server.receive_sync("echo", Ok).unwrap();

    let posted = client.try_send("echo", Payload::new(vec![7])).unwrap();
    assert_eq!(posted.await.unwrap().data, vec![7]);

    assert_eq!(client.ensure_open(), Ok(()));
    client.close();
    assert_eq!(client.ensure_open(), Err(ChannelError::Disconnected));
    assert_eq!(
        client.try_send("echo", Payload::empty()).err(),
        Some(ChannelError::Disconnected)
    );
}

async fn futures_pending() -> Result<Payload, RemoteError> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(Payload::empty())
}

#[tokio::test]
async fn transferables_travel_with_the_response() {
    let (client, server) = pair();
    server
        .receive_sync("take", |payload| {
            Ok(Payload::new(Vec::new()).with_transfer(vec![Transferable::Bytes(payload.data)]))
        })
        .unwrap();

    let response = client.send("take", Payload::new(vec![1, 2, 3])).await.unwrap();
    match response.transfer.as_slice() {
        [Transferable::Bytes(bytes)] => assert_eq!(bytes, &[1, 2, 3]),
        other => panic!("unexpected transfer list: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_forwards_calls_and_errors_over_a_second_hop() {
    // worker <-> mid <-> main
    let (main_side, mid_up) = pair();
    let (mid_down, worker) = pair();

    main_side.receive_sync("computeSum", compute_sum).unwrap();
    main_side
        .receive_sync("fail", |_| Err(RemoteError::new("MainOnly", "refused")))
        .unwrap();

    let relay = Relay::new(mid_up);
    relay.forward_all(&mid_down, &["computeSum", "fail"]).unwrap();

    let sum = worker.send("computeSum", numbers(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
    assert_eq!(read_single(&sum.await.unwrap()), 55);

    match worker.send("fail", Payload::empty()).await {
        Err(ChannelError::Remote(err)) => {
            assert_eq!(err.name, "MainOnly");
            assert_eq!(err.message, "refused");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn channels_need_a_runtime() {
    assert_eq!(Channel::new().err(), Some(ChannelError::NoRuntime));
}
