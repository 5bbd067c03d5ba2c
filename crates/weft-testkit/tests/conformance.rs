//! End-to-end behavior of a caller and adapter joined over a transport.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use weft_core::{
    CallArg, Envelope, MemTransport, Message, RpcCaller, RpcError, ServiceProxy, Transport,
    TransferExtractFormat, Value,
};
use weft_testkit::{
    connected_pair, demo_registry, init_test_tracing, spied_pair, spied_pair_with_format,
    wait_until,
};

#[tokio::test]
async fn echo_resolves_with_its_argument() {
    init_test_tracing();
    let (caller, _adapter) = connected_pair(demo_registry());
    let result = caller
        .call("echo", vec![Value::Str("hi".into()).into()])
        .await;
    assert_eq!(result.unwrap(), Value::Str("hi".into()));
}

#[tokio::test]
async fn resolve_travels_exactly_once() {
    let (caller, _adapter, caller_log, adapter_log) = spied_pair(demo_registry());
    let result = caller.call("echo", vec![Value::Int(1).into()]).await;
    assert_eq!(result.unwrap(), Value::Int(1));

    assert_eq!(caller_log.sent_of_kind("CALL"), 1);
    assert_eq!(adapter_log.sent_of_kind("RESOLVE"), 1);
    assert_eq!(adapter_log.sent_of_kind("NEXT"), 0);
}

#[tokio::test]
async fn streaming_reply_arrives_in_order() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let handle = caller.call("count", vec![Value::Int(3).into()]);

    // The handle buffers from call time; subscribing late loses nothing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let values: Vec<_> = handle
        .into_subscription()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(
        values,
        vec![Value::Int(1), Value::Int(2), Value::Int(3)]
    );
}

#[tokio::test]
async fn await_yields_the_last_value_of_a_stream() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let result = caller.call("count", vec![Value::Int(3).into()]).await;
    assert_eq!(result.unwrap(), Value::Int(3));
}

#[tokio::test]
async fn first_yields_the_first_value_of_a_stream() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let first = caller
        .call("count", vec![Value::Int(3).into()])
        .first()
        .await;
    assert_eq!(first.unwrap(), Value::Int(1));
}

#[tokio::test]
async fn remote_failure_carries_message_and_stack() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let err = caller.call("fail", vec![]).await.unwrap_err();
    assert_eq!(err.message(), "boom");
    assert_eq!(err.to_string(), "(remote) boom");
    assert_eq!(err.remote_stack(), Some("demo_registry::fail"));
}

#[tokio::test]
async fn unknown_method_fails_the_call() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let err = caller.call("frobnicate", vec![]).await.unwrap_err();
    assert_eq!(err.message(), "unknown method `frobnicate`");
}

#[tokio::test]
async fn destroy_fails_pending_calls() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let pending = caller.call("never", vec![]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    caller.destroy();
    assert!(caller.is_destroyed());
    assert_eq!(pending.await.unwrap_err(), RpcError::Destroyed);
}

#[tokio::test]
async fn calls_after_destroy_fail_locally() {
    let (caller, _adapter, caller_log, _adapter_log) = spied_pair(demo_registry());
    caller.destroy();

    let err = caller.call("echo", vec![Value::Int(1).into()]).await;
    assert_eq!(err.unwrap_err(), RpcError::Destroyed);
    assert_eq!(caller_log.sent_of_kind("CALL"), 0);
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let (caller, adapter) = connected_pair(demo_registry());
    caller.destroy();
    caller.destroy();
    adapter.destroy();
    adapter.destroy();
}

#[tokio::test]
async fn channel_ids_never_collide() {
    let (caller, _adapter, caller_log, _adapter_log) = spied_pair(demo_registry());

    // Calls with streamed arguments allocate ids for both roles from the
    // same counter.
    let args = || {
        vec![
            CallArg::Stream(tokio_stream::iter([Ok(Value::Int(1))]).boxed()),
            CallArg::Stream(tokio_stream::iter([Ok(Value::Int(2))]).boxed()),
        ]
    };
    let a = caller.call("sum", args());
    let b = caller.call("sum", args());
    assert_ne!(a.channel_id(), b.channel_id());
    let _ = a.await;
    let _ = b.await;

    let mut ids = Vec::new();
    for env in caller_log.sent() {
        if let Message::Call {
            channel_id,
            stream_args,
            ..
        } = &env.message
        {
            ids.push(*channel_id);
            if let Some(positions) = stream_args {
                ids.extend(positions.values().copied());
            }
        }
    }
    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(ids.len(), 6, "two calls with two streamed args each");
    assert_eq!(deduped.len(), ids.len());
}

#[tokio::test]
async fn streamed_argument_reaches_the_handler() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let values = tokio_stream::iter([Ok(Value::Int(1)), Ok(Value::Int(2)), Ok(Value::Int(3))]);
    let result = caller
        .call("sum", vec![CallArg::Stream(values.boxed())])
        .await;
    assert_eq!(result.unwrap(), Value::Int(6));
}

#[tokio::test]
async fn mixed_plain_and_streamed_arguments() {
    let (caller, _adapter, caller_log, _adapter_log) = spied_pair(demo_registry());
    let values = tokio_stream::iter([Ok(Value::Int(10)), Ok(Value::Int(20))]);
    let result = caller
        .call("sum", vec![CallArg::Stream(values.boxed())])
        .await;
    assert_eq!(result.unwrap(), Value::Int(30));

    // The streamed position travels as a placeholder plus an announcement.
    let call = caller_log
        .sent()
        .into_iter()
        .find_map(|env| match env.message {
            Message::Call {
                args, stream_args, ..
            } => Some((args, stream_args)),
            _ => None,
        })
        .expect("a CALL was sent");
    assert_eq!(call.0, vec![Value::Null]);
    let positions = call.1.expect("stream args announced");
    assert_eq!(positions.len(), 1);
    assert!(positions.contains_key(&0));
}

#[tokio::test]
async fn dropping_the_last_consumer_sends_close() {
    let (caller, _adapter, caller_log, _adapter_log) = spied_pair(demo_registry());
    let handle = caller.call("ticks", vec![]);
    let channel_id = handle.channel_id();

    let mut sub = handle.into_subscription();
    assert_eq!(sub.next().await.unwrap().unwrap(), Value::Int(0));
    drop(sub);

    wait_until("CLOSE for the call channel", || {
        caller_log.sent().iter().any(|env| {
            matches!(env.message, Message::Close { channel_id: id } if id == channel_id)
        })
    })
    .await;
}

#[tokio::test]
async fn handler_dropping_a_stream_argument_sends_close() {
    let (caller, _adapter, _caller_log, adapter_log) = spied_pair(demo_registry());
    let endless = futures_util::stream::pending();
    let result = caller
        .call("ignore_stream", vec![CallArg::Stream(endless.boxed())])
        .await;
    assert_eq!(result.unwrap(), Value::Null);

    wait_until("CLOSE for the argument channel", || {
        adapter_log.sent_of_kind("CLOSE") >= 1
    })
    .await;
}

#[tokio::test]
async fn trailing_close_after_settle_is_harmless() {
    let (caller, _adapter, caller_log, _adapter_log) = spied_pair(demo_registry());

    let result = caller.call("echo", vec![Value::Int(1).into()]).await;
    assert_eq!(result.unwrap(), Value::Int(1));
    wait_until("CLOSE after the call settled", || {
        caller_log.sent_of_kind("CLOSE") >= 1
    })
    .await;

    // The peer treats it as an unknown channel and the session keeps working.
    let again = caller.call("echo", vec![Value::Int(2).into()]).await;
    assert_eq!(again.unwrap(), Value::Int(2));
}

#[tokio::test]
async fn messages_for_unknown_channels_are_ignored() {
    let (a, b) = MemTransport::pair();
    let caller = RpcCaller::bind(a);

    // Noise for channels that were never opened.
    b.send(Envelope::new(Message::Resolve {
        channel_id: 999,
        data: Value::Int(1),
    }))
    .await
    .unwrap();
    b.send(Envelope::new(Message::Next {
        channel_id: 998,
        data: Value::Int(2),
    }))
    .await
    .unwrap();
    b.send(Envelope::new(Message::Complete { channel_id: 997 }))
        .await
        .unwrap();

    // Answer the next real call by hand.
    let handle = caller.call("echo", vec![Value::Int(5).into()]);
    let answered = tokio::spawn(async move {
        loop {
            let env = b.recv().await.unwrap();
            if let Message::Call { channel_id, args, .. } = env.message {
                b.send(Envelope::new(Message::Resolve {
                    channel_id,
                    data: args.into_iter().next().unwrap_or(Value::Null),
                }))
                .await
                .unwrap();
                return;
            }
        }
    });

    assert_eq!(handle.await.unwrap(), Value::Int(5));
    answered.await.unwrap();
}

#[tokio::test]
async fn proxy_memoizes_its_stubs() {
    let (caller, _adapter) = connected_pair(demo_registry());
    let proxy = ServiceProxy::new(caller, &["echo", "count"]);

    let a = proxy.method("echo").unwrap();
    let b = proxy.method("echo").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(proxy.method("frobnicate").is_none());

    let result = a.call(vec![Value::Int(9).into()]).await;
    assert_eq!(result.unwrap(), Value::Int(9));
    assert_eq!(b.name(), "echo");
}

#[tokio::test]
async fn transfer_format_extracts_a_trailing_movable_list() {
    let (caller, _adapter, caller_log, _adapter_log) =
        spied_pair_with_format(demo_registry(), Arc::new(TransferExtractFormat));

    let blob = Value::Bytes(bytes::Bytes::from_static(b"payload"));
    let result = caller
        .call(
            "echo",
            vec![
                Value::Int(1).into(),
                Value::List(vec![blob.clone(), Value::Str("straggler".into())]).into(),
            ],
        )
        .await;
    // The trailing list was extracted, so echo sees only the first argument.
    assert_eq!(result.unwrap(), Value::Int(1));

    let call = caller_log
        .sent()
        .into_iter()
        .find(|env| matches!(env.message, Message::Call { .. }))
        .expect("a CALL was sent");
    let Message::Call { args, .. } = &call.message else {
        unreachable!()
    };
    assert_eq!(args, &vec![Value::Int(1)]);
    assert_eq!(call.movables, vec![blob, Value::Str("straggler".into())]);
}

#[tokio::test]
async fn concurrent_calls_interleave_without_crosstalk() {
    let (caller, _adapter) = connected_pair(demo_registry());

    let slow = caller.call("count", vec![Value::Int(50).into()]);
    let fast = caller.call("echo", vec![Value::Str("quick".into()).into()]);

    assert_eq!(fast.await.unwrap(), Value::Str("quick".into()));
    assert_eq!(slow.await.unwrap(), Value::Int(50));
}
