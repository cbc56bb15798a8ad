pub mod auth;
pub mod job_service;
pub mod server;

pub use server::GrpcServer;
