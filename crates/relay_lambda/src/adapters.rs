pub mod aws;
pub mod invoke;
pub mod object_store;
pub mod sqs_queue;
