pub mod aoi;
pub mod app;
pub mod catalog_index;
pub mod config;
pub mod copernicus;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod graph;
pub mod lock;
pub mod metadata;
pub mod object_store;
pub mod output;
pub mod pipeline;
pub mod retry;
