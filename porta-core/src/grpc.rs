//! # Tonic-backed invoker
//!
//! The stock [`crate::invoker::GrpcInvoker`] implementation: a generic
//! wrapper over a `tonic` service (usually a [`tonic::transport::Channel`])
//! carrying [`prost_reflect::DynamicMessage`] values through a custom codec,
//! so no generated client code is required.

pub mod channel;
pub mod codec;

pub use channel::ChannelInvoker;
pub use codec::DynamicCodec;
