//! clip-probe - plays a clip on the background decoder and reports frame timing
//!
//! Usage: clip-probe <clip> [frames] [output-dir]

use clipdeck::{
    notification_channel, now_ms, ClipConfig, ClipEvent, ClipMode, ClipScheduler, ClipSource,
    ClipState, FrameRequest, ReaderOptions,
};

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Give up if no notification arrives for this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let Some(path) = args.get(1).map(PathBuf::from) else {
        bail!("Usage: clip-probe <clip> [frames] [output-dir]");
    };
    let frames: u64 = match args.get(2) {
        Some(count) => count.parse().context("Frame count must be a number")?,
        None => 10,
    };
    let output = args.get(3).map(PathBuf::from);
    if let Some(dir) = &output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Could not create {}", dir.display()))?;
    }

    smol::block_on(probe(path, frames, output))
}

async fn probe(path: PathBuf, frames: u64, output: Option<PathBuf>) -> Result<()> {
    let scheduler = ClipScheduler::new(ClipConfig::default().with_threads(1));
    let (notifier, notifications) = notification_channel();
    let options = ReaderOptions {
        autoplay: true,
        mode: if std::env::var_os("CLIP_PROBE_VIDEO").is_some() {
            ClipMode::Video
        } else {
            ClipMode::Gif
        },
    };

    let start = Instant::now();
    let reader = scheduler.open(ClipSource::File(path.clone()), options, notifier)?;
    let mut request = None;
    let mut painted = 0;
    let mut last_paint = Instant::now();

    while painted < frames {
        let notification = smol::future::or(async { notifications.recv().await.ok() }, async {
            smol::Timer::after(IDLE_TIMEOUT).await;
            None
        })
        .await
        .context("Timed out waiting for the clip")?;

        match notification.event {
            ClipEvent::Reinit => {
                if reader.state() == ClipState::Error {
                    bail!("Could not play {}", path.display());
                }
                if request.is_none() && reader.ready() {
                    log::info!(
                        "{}: {}x{} after {:?}",
                        path.display(),
                        reader.width(),
                        reader.height(),
                        start.elapsed()
                    );
                    let (width, height) = (reader.width(), reader.height());
                    let frame_request = FrameRequest::new(width, height, width, height, false);
                    reader.start(frame_request);
                    request = Some(frame_request);
                }
            }
            ClipEvent::Repaint => {
                let Some(request) = &request else {
                    continue;
                };
                let Some(frame) = reader.current(request, now_ms()) else {
                    continue;
                };

                let info = reader.frame_info();
                println!(
                    "frame {:>4}  sequence {:>4}  {:>6.1} ms since last",
                    painted,
                    info.map_or(0, |info| info.sequence),
                    last_paint.elapsed().as_secs_f64() * 1000.0
                );
                last_paint = Instant::now();

                if let Some(dir) = &output {
                    let file = dir.join(format!("frame-{painted:04}.png"));
                    frame
                        .save(&file)
                        .with_context(|| format!("Could not write {}", file.display()))?;
                }
                painted += 1;
            }
        }
    }

    println!("{} frames in {:?}", painted, start.elapsed());
    reader.stop();
    Ok(())
}
