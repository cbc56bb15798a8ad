use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::grpc::auth::AuthHandler;
use crate::manager::{JobInfo, JobManager, JobOptions, JobStatus};
use crate::proto::job_worker_server::JobWorker;
use crate::proto::{
    JobRequest, JobResponse, JobStatus as ProtoJobStatus, StartJobRequest, StreamJobResponse,
};

/// gRPC surface over the job manager. Every call is authenticated by the
/// mTLS transport; Start records the caller as the job's owner and the
/// other operations require that same client certificate.
pub struct JobWorkerService {
    manager: Arc<JobManager>,
    auth: AuthHandler,
    shutdown: CancellationToken,
    test_mode: bool,
}

impl JobWorkerService {
    pub fn new(manager: Arc<JobManager>, shutdown: CancellationToken, test_mode: bool) -> Self {
        Self {
            manager,
            auth: AuthHandler::new(),
            shutdown,
            test_mode,
        }
    }

    fn job_options(&self) -> JobOptions {
        if self.test_mode {
            JobOptions::unconfined()
        } else {
            JobOptions::default()
        }
    }
}

#[tonic::async_trait]
impl JobWorker for JobWorkerService {
    async fn start_job(
        &self,
        request: Request<StartJobRequest>,
    ) -> Result<Response<JobResponse>, Status> {
        let owner = AuthHandler::client_identity(&request)?;
        let req = request.into_inner();

        if req.command.trim().is_empty() {
            return Err(Status::invalid_argument("command cannot be empty"));
        }

        let info = self
            .manager
            .start_job(&self.shutdown, &req.command, &req.arguments, self.job_options())
            .await
            .map_err(Status::from)?;

        self.auth.register_owner(info.job_id(), owner).await;

        Ok(Response::new(job_response(&info)))
    }

    async fn stop_job(&self, request: Request<JobRequest>) -> Result<Response<JobResponse>, Status> {
        self.auth
            .check_owner(&request, &request.get_ref().job_id)
            .await?;

        let info = self
            .manager
            .stop_job(&request.get_ref().job_id)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(job_response(&info)))
    }

    async fn query_job(
        &self,
        request: Request<JobRequest>,
    ) -> Result<Response<JobResponse>, Status> {
        self.auth
            .check_owner(&request, &request.get_ref().job_id)
            .await?;

        let info = self
            .manager
            .query_job(&request.get_ref().job_id)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(job_response(&info)))
    }

    type StreamJobStream = ReceiverStream<Result<StreamJobResponse, Status>>;

    async fn stream_job(
        &self,
        request: Request<JobRequest>,
    ) -> Result<Response<Self::StreamJobStream>, Status> {
        self.auth
            .check_owner(&request, &request.get_ref().job_id)
            .await?;

        let job_id = request.into_inner().job_id;
        let mut blocks = self.manager.stream_job(&job_id).await.map_err(Status::from)?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(block) = blocks.recv().await {
                if tx.send(Ok(StreamJobResponse { message: block })).await.is_err() {
                    tracing::debug!(%job_id, "stream client disconnected");
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn job_response(info: &JobInfo) -> JobResponse {
    JobResponse {
        job_id: info.job_id().to_string(),
        pid: info.pid(),
        exit_code: info.exit_code(),
        status: status_to_proto(info.status()) as i32,
    }
}

fn status_to_proto(status: JobStatus) -> ProtoJobStatus {
    match status {
        JobStatus::Init => ProtoJobStatus::Init,
        JobStatus::Scheduled => ProtoJobStatus::Scheduled,
        JobStatus::FailedToStart => ProtoJobStatus::FailedToStart,
        JobStatus::Running => ProtoJobStatus::Running,
        JobStatus::Stopped => ProtoJobStatus::Stopped,
    }
}
