//! Cloud-provider adapters. All durable controller state lives behind
//! these interfaces: instance tags in EC2, registration secrets and the
//! runner-group cache in SSM, retry messages in SQS.

mod ec2;
mod error_codes;
mod ports;
mod sqs;
mod ssm;

pub use ec2::*;
pub use error_codes::*;
pub use ports::*;
pub use sqs::*;
pub use ssm::*;
