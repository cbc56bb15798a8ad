use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::ServerConfig;
use crate::grpc::job_service::JobWorkerService;
use crate::manager::JobManager;
use crate::proto::job_worker_server::JobWorkerServer;
use crate::tls::TlsMaterial;

pub struct GrpcServer {
    config: ServerConfig,
    tls: TlsMaterial,
    manager: Arc<JobManager>,
}

impl GrpcServer {
    pub fn new(config: ServerConfig, tls: TlsMaterial, manager: Arc<JobManager>) -> Self {
        Self {
            config,
            tls,
            manager,
        }
    }

    /// Serve until `shutdown` fires. Clients must present a certificate
    /// signed by the configured CA.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let service =
            JobWorkerService::new(self.manager, shutdown.clone(), self.config.test_mode);

        tracing::info!(%addr, test_mode = self.config.test_mode, "starting jobworker gRPC server");

        Server::builder()
            .tls_config(self.tls.server_tls_config())?
            .add_service(JobWorkerServer::new(service))
            .serve_with_shutdown(addr, shutdown.cancelled())
            .await
    }
}
