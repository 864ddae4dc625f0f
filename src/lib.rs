#![forbid(unsafe_code)]

//! Resilient media downloading around yt-dlp: format selection, retries with
//! backoff, batch pacing, a completion archive, ffmpeg provisioning,
//! transcoding and tagging.

pub mod archive;
pub mod config;
pub mod error;
pub mod fetch;
pub mod formats;
pub mod job;
pub mod pacing;
pub mod provision;
pub mod retry;
pub mod tagger;
pub mod template;
pub mod transcode;
