//! Segmented HLS download engine.
//!
//! ```text
//! ┌──────────────────┐   variant / segments / key   ┌───────────────────┐
//! │  Media Playlist  ├─────────────────────────────►│                   │
//! └──────────────────┘                              │                   │
//!                                                   │  JobOrchestrator  │
//! ┌──────────────────┐   segment 0..N (bounded)     │                   │
//! │   Worker Pool    │◄─────────────────────────────┤  [single writer]  │
//! │ fetch ─► decrypt ├─────────────────────────────►│                   │
//! └──────────────────┘   completed / failed         └─────────┬─────────┘
//!                                                             │ merge
//!                                                   ┌─────────▼─────────┐
//!                                                   │  ffmpeg / concat  │
//!                                                   └───────────────────┘
//! ```

pub mod completion;
pub mod config;
pub mod decrypt;
pub mod download;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod job;
pub mod merge;
pub mod notify;
pub mod progress;
pub mod segment;
pub mod store;
pub mod util;

pub use config::DownloadConfig;
pub use download::{JobOrchestrator, JobOrchestratorBuilder};
pub use error::{SegdlError, SegdlResult};
pub use job::{DownloadJob, JobId, JobRequest, JobStatus};
pub use util::http::HttpClient;
