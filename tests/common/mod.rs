use captains_log::*;
use logbus_rpc::client::{ClientBuilder, ClientConfig, RpcClient};
use logbus_rpc::inproc::LogBus;
use logbus_rpc::metrics::MonitoringService;
use logbus_rpc::server::{RpcServer, ServerConfig};
use logbus_rpc::ChannelConfig;
use logbus_rpc_codec::JsonSerializer;
use rstest::fixture;
use std::future::Future;
use std::sync::Arc;

pub const REQ_STREAM: i32 = 1001;
pub const RESP_STREAM: i32 = 1002;

pub struct TestRunner {
    rt: tokio::runtime::Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/logbus_rpc_test.log", Level::Trace)
            .test()
            .build()
            .expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(8)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub fn request_channel() -> ChannelConfig {
    ChannelConfig::ipc(REQ_STREAM)
}

pub fn response_channel() -> ChannelConfig {
    ChannelConfig::ipc(RESP_STREAM)
}

pub fn new_server(bus: &LogBus, config: ServerConfig) -> RpcServer<JsonSerializer> {
    RpcServer::new(
        config,
        Box::new(bus.add_subscription(&request_channel())),
        Arc::new(bus.add_publication(&response_channel())),
        JsonSerializer::default(),
        Arc::new(MonitoringService::new()),
    )
    .expect("server")
}

pub fn client_builder(config: ClientConfig) -> ClientBuilder<JsonSerializer> {
    ClientBuilder::new(config, JsonSerializer::default())
}

pub fn connect(
    bus: &LogBus, builder: ClientBuilder<JsonSerializer>,
) -> RpcClient<JsonSerializer> {
    builder
        .build(
            Arc::new(bus.add_publication(&request_channel())),
            Box::new(bus.add_subscription(&response_channel())),
        )
        .expect("client")
}
