pub mod consumer;
pub mod ingress;
