//! Dispatcher gRPC endpoint.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use super::{ControlService, Result, WorkerService};
use crate::proto::dispatch_control_server::DispatchControlServer;
use crate::proto::dispatch_worker_server::DispatchWorkerServer;

pub struct DispatchServer {
    listener: TcpListener,
    worker: WorkerService,
    control: Option<ControlService>,
}

impl DispatchServer {
    pub async fn bind(addr: &str, worker: WorkerService) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            worker,
            control: None,
        })
    }

    /// Also serve the control plane on this listener.
    pub fn with_control(mut self, control: ControlService) -> Self {
        self.control = Some(control);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `signal` resolves, then drain in-flight calls.
    ///
    /// Parked pops and pending HTTP dispatches only finish once the queue is
    /// closed and the HTTP trigger released; `signal` must do that before it
    /// resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            control = self.control.is_some(),
            "Dispatch endpoint listening"
        );

        Server::builder()
            .add_service(DispatchWorkerServer::new(self.worker))
            .add_optional_service(self.control.map(DispatchControlServer::new))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), signal)
            .await?;

        info!(addr = %addr, "Dispatch endpoint stopped");
        Ok(())
    }
}
