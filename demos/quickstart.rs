//! End-to-end walkthrough of the synchronization layer.
//!
//! Run with:
//!   META_ACCESS_TOKEN=EAAB... META_AD_ACCOUNT=1234567890 \
//!   RUST_LOG=graphsync=debug cargo run --example quickstart -- promo.mp4 123_456

use std::time::Duration;

use graphsync::{
    ActionSequencer, ChunkedUpload, DateRange, GatewayBuilder, JobKind, JobPoller, PollEvent,
    RateWindowStore, RemoteAction, SequencerConfig, SyncError, VideoReadiness,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> graphsync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let account = std::env::var("META_AD_ACCOUNT").unwrap_or_else(|_| "1234567890".into());
    let mut args = std::env::args().skip(1);
    let video_path = args.next();
    let post_id = args.next();

    // -----------------------------------------------------------------------
    // 1. Build a gateway (reads META_ACCESS_TOKEN from the environment)
    // -----------------------------------------------------------------------
    let gateway = GatewayBuilder::new()
        .timeout(Duration::from_secs(90))
        .build()?;

    // -----------------------------------------------------------------------
    // 2. Cached reads down the campaign hierarchy
    // -----------------------------------------------------------------------
    let range = DateRange::Preset("last_30d".into());
    for campaign in gateway.campaigns(&account).await? {
        let metrics = gateway.insights(&campaign.id, &range).await?;
        println!(
            "{} [{}] spend {:.2} | purchases {} | leads {}",
            campaign.name,
            campaign.status,
            metrics.spend,
            metrics.purchases(),
            metrics.leads()
        );
        for ad_set in gateway.ad_sets(&campaign.id).await? {
            println!("  {} ({} ads)", ad_set.name, gateway.ads(&ad_set.id).await?.len());
        }
    }

    // -----------------------------------------------------------------------
    // 3. Upload a video and wait until it is playable
    // -----------------------------------------------------------------------
    if let Some(path) = video_path {
        let (tx, mut rx) = mpsc::unbounded_channel::<graphsync::UploadProgress>();
        let progress = tokio::spawn(async move {
            while let Some(p) = rx.recv().await {
                println!("  uploaded {:.0}%", p.percent);
            }
        });

        let video_id = ChunkedUpload::new(gateway.clone(), &account)
            .upload_file(&path, Some(&tx))
            .await?;
        drop(tx);
        let _ = progress.await;
        println!("Uploaded as video {video_id}");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let PollEvent::Progress { percent, .. } = event {
                    println!("  processing {percent:.0}%");
                }
            }
        });

        let ready = JobPoller::for_kind(JobKind::VideoTranscode)
            .poll_until_done(
                &VideoReadiness::new(gateway.clone()),
                &video_id,
                JobKind::VideoTranscode,
                Some(&tx),
                &CancellationToken::new(),
            )
            .await?;
        drop(tx);
        let _ = events.await;
        println!("Ready: {:?}", ready.url);
    }

    // -----------------------------------------------------------------------
    // 4. Post a short comment thread under the daily quota
    // -----------------------------------------------------------------------
    if let Some(post_id) = post_id {
        let sequencer = ActionSequencer::new(
            gateway.clone(),
            RateWindowStore::new(".graphsync/comment-window.json"),
            SequencerConfig::default(),
        );
        println!("{} comment(s) left today", sequencer.remaining_quota().await?);

        let actions = vec![
            RemoteAction::comment(&post_id, "Thanks for all the questions!"),
            RemoteAction::comment(&post_id, "Free shipping ends Sunday."),
        ];

        let (tx, mut rx) = mpsc::unbounded_channel();
        let status = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                println!("  {event}");
            }
        });

        match sequencer.run(actions, Some(&tx), &CancellationToken::new()).await {
            Ok(outcome) => println!("Posted {} of {}", outcome.executed.len(), outcome.total),
            Err(e @ SyncError::QuotaExceeded { .. }) => println!("{}", e.user_message()),
            Err(e) => return Err(e),
        }
        drop(tx);
        let _ = status.await;
    }

    Ok(())
}
