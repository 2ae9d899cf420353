mod common;

use common::*;
use logbus_rpc::client::{ClientConfig, StreamSubscriber};
use logbus_rpc::inproc::LogBus;
use logbus_rpc::server::{ServerConfig, StreamSink};
use logbus_rpc::RpcError;
use rstest::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Decodes JSON integers and records the terminal signal.
struct CollectingSubscriber {
    values: Mutex<Vec<i64>>,
    terminal: Mutex<Option<Result<(), RpcError>>>,
    done: Notify,
}

impl CollectingSubscriber {
    fn new() -> Arc<Self> {
        Arc::new(Self { values: Mutex::new(Vec::new()), terminal: Mutex::new(None), done: Notify::new() })
    }

    fn values(&self) -> Vec<i64> {
        self.values.lock().unwrap().clone()
    }

    fn terminal(&self) -> Option<Result<(), RpcError>> {
        self.terminal.lock().unwrap().clone()
    }
}

impl StreamSubscriber for CollectingSubscriber {
    fn on_next(&self, payload: &[u8]) {
        let value: i64 = serde_json::from_slice(payload).expect("decode stream value");
        self.values.lock().unwrap().push(value);
    }

    fn on_error(&self, err: RpcError) {
        *self.terminal.lock().unwrap() = Some(Err(err));
        self.done.notify_one();
    }

    fn on_complete(&self) {
        *self.terminal.lock().unwrap() = Some(Ok(()));
        self.done.notify_one();
    }
}

fn register_numbers(server: &logbus_rpc::server::RpcServer<logbus_rpc_codec::JsonSerializer>) {
    server
        .register_streaming("numbers", |payload: Vec<u8>, sink: StreamSink| async move {
            let n: i64 = serde_json::from_slice(&payload)
                .map_err(|_| RpcError::Serialization("bad stream request".to_string()))?;
            for value in 1..=n {
                sink.on_next(&serde_json::to_vec(&value).expect("encode")).await;
            }
            sink.on_complete().await;
            Ok(())
        })
        .expect("register");
}

#[rstest]
fn test_server_streaming(runner: TestRunner) {
    runner.block_on(async move {
        let bus = LogBus::new();
        let server = new_server(&bus, ServerConfig::default());
        register_numbers(&server);
        server.start().expect("start");

        let client = connect(&bus, client_builder(ClientConfig::default()));
        let subscriber = CollectingSubscriber::new();
        let handle = client
            .stream("numbers", "range", b"5", subscriber.clone())
            .await
            .expect("stream request");
        assert!(handle.is_active());

        tokio::time::timeout(Duration::from_secs(5), subscriber.done.notified())
            .await
            .expect("stream completes");
        let values = subscriber.values();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(values.iter().sum::<i64>(), 15);
        assert_eq!(subscriber.terminal(), Some(Ok(())));
        assert!(!handle.is_active());

        client.close();
        server.close().await;
    });
}

#[rstest]
fn test_stream_error_is_terminal(runner: TestRunner) {
    runner.block_on(async move {
        let bus = LogBus::new();
        let server = new_server(&bus, ServerConfig::default());
        server
            .register_streaming("flaky", |_payload: Vec<u8>, sink: StreamSink| async move {
                sink.on_next(&serde_json::to_vec(&1i64).expect("encode")).await;
                sink.on_next(&serde_json::to_vec(&2i64).expect("encode")).await;
                sink.on_error(RpcError::Handler("stream broke".to_string())).await;
                // past the terminal: silently dropped by the sink
                sink.on_next(&serde_json::to_vec(&3i64).expect("encode")).await;
                sink.on_complete().await;
                Ok(())
            })
            .expect("register");
        server.start().expect("start");

        let client = connect(&bus, client_builder(ClientConfig::default()));
        let subscriber = CollectingSubscriber::new();
        client.stream("flaky", "_", b"0", subscriber.clone()).await.expect("stream request");

        tokio::time::timeout(Duration::from_secs(5), subscriber.done.notified())
            .await
            .expect("stream errors");
        // give any stray frame time to arrive before asserting silence
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(subscriber.values(), vec![1, 2]);
        assert_eq!(
            subscriber.terminal(),
            Some(Err(RpcError::Handler("stream broke".to_string())))
        );

        client.close();
        server.close().await;
    });
}

#[rstest]
fn test_streaming_handler_error_result(runner: TestRunner) {
    runner.block_on(async move {
        let bus = LogBus::new();
        let server = new_server(&bus, ServerConfig::default());
        server
            .register_streaming("doomed", |_payload: Vec<u8>, _sink: StreamSink| async move {
                Err(RpcError::Handler("gave up early".to_string()))
            })
            .expect("register");
        server.start().expect("start");

        let client = connect(&bus, client_builder(ClientConfig::default()));
        let subscriber = CollectingSubscriber::new();
        client.stream("doomed", "_", b"0", subscriber.clone()).await.expect("stream request");

        tokio::time::timeout(Duration::from_secs(5), subscriber.done.notified())
            .await
            .expect("terminal error");
        assert!(subscriber.values().is_empty());
        assert!(matches!(subscriber.terminal(), Some(Err(RpcError::Handler(_)))));

        client.close();
        server.close().await;
    });
}

#[rstest]
fn test_stream_cancel_is_local(runner: TestRunner) {
    runner.block_on(async move {
        let bus = LogBus::new();
        let server = new_server(&bus, ServerConfig::default());
        server
            .register_streaming("ticker", |_payload: Vec<u8>, sink: StreamSink| async move {
                for value in 1..=20i64 {
                    sink.on_next(&serde_json::to_vec(&value).expect("encode")).await;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                sink.on_complete().await;
                Ok(())
            })
            .expect("register");
        server.start().expect("start");

        let client = connect(&bus, client_builder(ClientConfig::default()));
        let subscriber = CollectingSubscriber::new();
        let handle =
            client.stream("ticker", "_", b"0", subscriber.clone()).await.expect("stream request");

        while subscriber.values().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.cancel();
        assert!(!handle.is_active());
        let seen_at_cancel = subscriber.values().len();

        tokio::time::sleep(Duration::from_millis(300)).await;
        // nothing further was delivered and no terminal signal was raised
        assert!(subscriber.values().len() <= seen_at_cancel + 1);
        assert_eq!(subscriber.terminal(), None);

        client.close();
        server.close().await;
    });
}

#[rstest]
fn test_unary_and_streaming_share_a_connection(runner: TestRunner) {
    runner.block_on(async move {
        let bus = LogBus::new();
        let server = new_server(&bus, ServerConfig::default());
        server.register("echo", |payload: Vec<u8>| async move { Ok(payload) }).expect("register");
        register_numbers(&server);
        server.start().expect("start");

        let client = connect(&bus, client_builder(ClientConfig::default()));
        let subscriber = CollectingSubscriber::new();
        client.stream("numbers", "range", b"3", subscriber.clone()).await.expect("stream request");
        let reply = client.call("echo", "_", b"interleaved").await.expect("echo call");
        assert_eq!(reply, b"interleaved");

        tokio::time::timeout(Duration::from_secs(5), subscriber.done.notified())
            .await
            .expect("stream completes");
        assert_eq!(subscriber.values(), vec![1, 2, 3]);

        client.close();
        server.close().await;
    });
}
