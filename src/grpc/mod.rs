pub mod client_service;
pub mod cluster_service;
pub mod server;

pub use server::GrpcServer;
