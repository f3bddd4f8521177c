//! # graphsync
//!
//! Synchronization layer for the Meta Marketing Graph API and for
//! media-generation job APIs that follow the same "create, then poll" shape.
//! It presents slow, rate-limited, eventually consistent remote services
//! through a small, retry-safe interface:
//!
//! - every response is classified once into a closed [`SyncError`] taxonomy;
//! - reads are served from a five-minute [`TtlCache`] that any successful
//!   write clears;
//! - large videos go up through a resumable, chunked [`ChunkedUpload`];
//! - long-running jobs are watched by a [`JobPoller`];
//! - irreversible repeated actions (comments) run through an
//!   [`ActionSequencer`] guarded by a persisted rolling quota.
//!
//! ## Quick start
//!
//! ```no_run
//! use graphsync::{DateRange, Gateway, EntityStatus};
//!
//! #[tokio::main]
//! async fn main() -> graphsync::Result<()> {
//!     let gateway = Gateway::new("EAAB...")?;
//!
//!     for campaign in gateway.campaigns("1234567890").await? {
//!         let metrics = gateway.insights(&campaign.id, &DateRange::default()).await?;
//!         println!("{}: spent {:.2}, {} purchases", campaign.name, metrics.spend, metrics.purchases());
//!     }
//!
//!     // Any successful write clears the read cache.
//!     gateway.set_status("120200000000000001", EntityStatus::Paused).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Uploading and waiting for a video
//!
//! ```no_run
//! use graphsync::{ChunkedUpload, Gateway, JobKind, JobPoller, VideoReadiness};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(gateway: Gateway) -> graphsync::Result<()> {
//! let video_id = ChunkedUpload::new(gateway.clone(), "1234567890")
//!     .upload_file("promo.mp4", None)
//!     .await?;
//!
//! let ready = JobPoller::for_kind(JobKind::VideoTranscode)
//!     .poll_until_done(
//!         &VideoReadiness::new(gateway),
//!         &video_id,
//!         JobKind::VideoTranscode,
//!         None,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("playable at {:?}", ready.url);
//! # Ok(())
//! # }
//! ```

mod cache;
mod classifier;
mod errors;
mod gateway;
mod media;
mod poller;
mod rate_window;
mod resources;
mod retry;
mod sequencer;
mod upload;

pub use cache::{cache_key, TtlCache, DEFAULT_TTL};
pub use classifier::{classify, classify_response};
pub use errors::{Result, SyncError, UploadPhase};
pub use gateway::{AuthPlacement, Gateway, GatewayBuilder, TokenRefresher};
pub use media::{MediaJobs, VideoReadiness};
pub use poller::{
    JobKind, JobPoller, JobResult, JobState, JobStatus, PollConfig, PollEvent, StatusSource,
};
pub use rate_window::{RateWindow, RateWindowStore};
pub use resources::{
    account_path, ActionCount, Ad, AdSet, Campaign, CreativeRef, DateRange, EntityStatus, Metrics,
};
pub use retry::{retry, RetryFailure, RetryPolicy};
pub use sequencer::{
    ActionSequencer, BatchEvent, BatchOutcome, ExecutedAction, RemoteAction, SequencerConfig,
};
pub use upload::{ChunkedUpload, UploadProgress};
