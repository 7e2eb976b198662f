//! Common fixtures for driver integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stratafs_core::{FsId, Handle, ObjectRef, ServerRequest};
use stratafs_server::{
    ClientRequest, DriverStats, ObjectStore, Server, ServerConfig, ServerResponse,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const FS: FsId = FsId::new(1);

/// Config with fast ticks for quick tests
pub fn fast_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server_name = "test".to_string();
    config.driver.poll_interval_ms = 2;
    config.driver.timer_interval_ms = 20;
    config.driver.perf_interval_ms = 5;
    config
}

pub fn obj(handle: Handle) -> ObjectRef {
    ObjectRef::new(handle, FS)
}

/// A server running on its own task, driven through its channels
pub struct TestServer {
    requests: Option<mpsc::Sender<ClientRequest>>,
    responses: mpsc::UnboundedReceiver<ServerResponse>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<stratafs_server::ServerResult<DriverStats>>,
    next_tag: u64,
}

impl TestServer {
    pub fn start() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self::launch(Server::new(config).expect("server config"))
    }

    /// Runs against a caller-supplied object store
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self::launch(Server::with_store(fast_config(), store).expect("server config"))
    }

    fn launch(server: Server) -> Self {
        let (req_tx, req_rx) = mpsc::channel(64);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(req_rx, resp_tx, stop_rx));
        Self {
            requests: Some(req_tx),
            responses: resp_rx,
            stop: stop_tx,
            handle,
            next_tag: 1,
        }
    }

    /// Sends a request without waiting; returns its tag
    pub async fn send(&mut self, request: ServerRequest) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.requests
            .as_ref()
            .expect("server still accepting")
            .send(ClientRequest { tag, request })
            .await
            .expect("server running");
        tag
    }

    /// Next response, failing the test after a second
    pub async fn recv(&mut self) -> ServerResponse {
        tokio::time::timeout(Duration::from_secs(1), self.responses.recv())
            .await
            .expect("response in time")
            .expect("response channel open")
    }

    /// Sends a request and waits for its response
    pub async fn call(&mut self, request: ServerRequest) -> ServerResponse {
        let tag = self.send(request).await;
        let resp = self.recv().await;
        assert_eq!(resp.tag, tag);
        resp
    }

    /// Signals shutdown and waits for the driver to drain
    pub async fn shutdown(self) -> DriverStats {
        let _ = self.stop.send(true);
        tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("driver stopped in time")
            .expect("driver task")
            .expect("driver result")
    }

    /// Closes the request channel and waits for the driver to drain
    pub async fn close(mut self) -> (DriverStats, Vec<ServerResponse>) {
        self.requests.take();
        let stats = tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("driver stopped in time")
            .expect("driver task")
            .expect("driver result");
        let mut rest = Vec::new();
        while let Ok(resp) = self.responses.try_recv() {
            rest.push(resp);
        }
        (stats, rest)
    }
}
