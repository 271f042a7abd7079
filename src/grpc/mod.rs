//! gRPC surface: the inbound service, its server and the peer client.

mod client;
mod convert;
mod server;
mod service;

pub use client::{GrpcConnector, GrpcPeerClient};
pub use server::GrpcServer;
pub use service::RateLimitServiceImpl;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("ringlimit.v1");
}

// Re-export commonly used types
pub use proto::{
    rate_limit_service_client::RateLimitServiceClient,
    rate_limit_service_server::RateLimitServiceServer,
};
