//! HTTP Archive data model and persistence

pub mod codec;
mod model;
pub mod parse;

pub use model::{
    Cache, Content, Cookie, Creator, Entry, Har, Header, Log, Page, PageTimings, PostData,
    QueryParam, Request, Response, Timings,
};

/// HAR format version written by this crate
pub const HAR_VERSION: &str = "1.2";
