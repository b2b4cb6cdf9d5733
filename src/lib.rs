pub mod api;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod humanize;
pub mod ledger;
pub mod observability;
pub mod packager;
pub mod queue;
pub mod quota;
pub mod storage;
pub mod submission;
pub mod validator;
pub mod verifier;
