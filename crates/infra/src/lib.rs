//! Infrastructure layer: stores, work queue transport, dispatcher, config.

pub mod config;
pub mod deletion_queue;
pub mod dispatcher;
pub mod jobs;
pub mod page;
pub mod pg;
pub mod work_queue;

mod integration_tests;
