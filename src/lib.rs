#![forbid(unsafe_code)]

pub mod archive_store;
pub mod archiver;
pub mod cli;
pub mod crawl;
pub mod formats;
pub mod inspect;
pub mod ledger;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod platform;
pub mod resolve;
pub mod retry;
pub mod target_list;
pub mod view;
