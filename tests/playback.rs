use clipdeck::{
    notification_channel, now_ms, ClipConfig, ClipEvent, ClipNotification, ClipReader,
    ClipScheduler, ClipSource, ClipState, DecodeBackend, FrameRequest, ReaderOptions,
};

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, Rgba, RgbaImage};
use smol::channel::Receiver;

use std::sync::Arc;
use std::time::Duration;

const PALETTE: [[u8; 4]; 4] = [
    [255, 0, 0, 255],
    [0, 255, 0, 255],
    [0, 0, 255, 255],
    [255, 255, 255, 255],
];

fn build_gif(width: u32, height: u32, delays_ms: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        let frames = delays_ms.iter().enumerate().map(|(index, delay_ms)| {
            let rgba = RgbaImage::from_pixel(width, height, Rgba(PALETTE[index % PALETTE.len()]));
            Frame::from_parts(rgba, 0, 0, Delay::from_numer_denom_ms(*delay_ms, 1))
        });
        encoder.encode_frames(frames).unwrap();
    }
    out
}

/// Palette index of a (possibly quantized) solid frame
fn classify(frame: &RgbaImage) -> usize {
    let [r, g, b, _] = frame.get_pixel(frame.width() / 2, frame.height() / 2).0;
    if r > 200 && g > 200 && b > 200 {
        3
    } else if r >= g && r >= b {
        0
    } else if g >= b {
        1
    } else {
        2
    }
}

fn next_event(notifications: &Receiver<ClipNotification>) -> ClipNotification {
    smol::block_on(smol::future::or(
        async { notifications.recv().await.ok() },
        async {
            smol::Timer::after(Duration::from_secs(10)).await;
            None
        },
    ))
    .expect("timed out waiting for a clip notification")
}

fn wait_for(notifications: &Receiver<ClipNotification>, event: ClipEvent) {
    while next_event(notifications).event != event {}
}

fn request(reader: &ClipReader) -> FrameRequest {
    FrameRequest::new(reader.width(), reader.height(), reader.width(), reader.height(), false)
}

#[test]
fn gif_plays_frames_in_order_and_loops() {
    let scheduler = ClipScheduler::new(ClipConfig::default().with_threads(2));
    let (notifier, notifications) = notification_channel();
    let gif = build_gif(32, 24, &[40, 40, 40, 40]);

    let reader = scheduler
        .open(ClipSource::from_bytes(gif), ReaderOptions::default(), notifier)
        .unwrap();
    wait_for(&notifications, ClipEvent::Reinit);
    assert!(reader.ready());
    assert_eq!((reader.width(), reader.height()), (32, 24));

    let request = request(&reader);
    reader.start(request);

    let mut seen = Vec::new();
    while seen.len() < 10 {
        wait_for(&notifications, ClipEvent::Repaint);
        let frame = reader.current(&request, now_ms()).unwrap();
        assert_eq!(frame.dimensions(), (32, 24));
        seen.push(classify(&frame));
    }

    assert_eq!(seen[0], 0);
    for pair in seen.windows(2) {
        assert!(
            pair[1] == pair[0] || pair[1] == (pair[0] + 1) % 4,
            "frames out of order: {seen:?}"
        );
    }
    assert!(seen.contains(&3), "never reached the last frame: {seen:?}");
    assert_eq!(reader.state(), ClipState::Reading);
}

#[test]
fn file_sources_stream_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.gif");
    std::fs::write(&path, build_gif(16, 16, &[50, 50])).unwrap();

    // A zero in-memory limit forces streaming
    let config = ClipConfig {
        in_memory_limit: 0,
        ..ClipConfig::default()
    };
    let scheduler = ClipScheduler::new(config);
    let (notifier, notifications) = notification_channel();
    let reader = scheduler
        .open(ClipSource::File(path), ReaderOptions::default(), notifier)
        .unwrap();

    wait_for(&notifications, ClipEvent::Reinit);
    let request = FrameRequest::new(8, 8, 12, 8, true).with_factor(2);
    reader.start(request);
    wait_for(&notifications, ClipEvent::Repaint);

    let frame = reader.current(&request, now_ms()).unwrap();
    assert_eq!(frame.dimensions(), (24, 16));
    assert_eq!(classify(&frame), 0);
    let info = reader.frame_info().unwrap();
    assert_eq!(info.sequence, 0);
    assert!(info.display_at > 0);
}

#[test]
fn undecodable_clip_moves_to_error() {
    let scheduler = ClipScheduler::new(ClipConfig::default());
    let (notifier, notifications) = notification_channel();
    let reader = scheduler
        .open(
            ClipSource::from_bytes(b"definitely not a clip".to_vec()),
            ReaderOptions::default(),
            notifier,
        )
        .unwrap();

    let notification = next_event(&notifications);
    assert_eq!(notification.reader, reader.id());
    assert_eq!(notification.event, ClipEvent::Reinit);
    assert_eq!(reader.state(), ClipState::Error);
    assert!(reader.current(&FrameRequest::new(4, 4, 4, 4, false), now_ms()).is_none());
    assert_eq!(scheduler.reader_counts(), vec![0]);
}

#[test]
fn stopped_readers_leave_the_registry() {
    let scheduler = ClipScheduler::new(ClipConfig::default().with_threads(1));
    let (notifier, _notifications) = notification_channel();
    let gif = build_gif(8, 8, &[30, 30]);

    let first = scheduler
        .open(ClipSource::from_bytes(gif.clone()), ReaderOptions::default(), notifier.clone())
        .unwrap();
    let second = scheduler
        .open(ClipSource::from_bytes(gif), ReaderOptions::default(), notifier)
        .unwrap();
    assert_eq!(scheduler.reader_counts(), vec![2]);

    first.stop();
    assert_eq!(first.state(), ClipState::Stopped);
    drop(second);
    assert_eq!(scheduler.reader_counts(), vec![0]);
}

/// Backend counting up forever, one gray level per frame
struct Ramp {
    level: u8,
    decoded: bool,
}

impl DecodeBackend for Ramp {
    fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn read_next_frame(&mut self) -> anyhow::Result<()> {
        if self.decoded {
            self.level = self.level.wrapping_add(1);
        }
        self.decoded = true;
        Ok(())
    }

    fn render_frame(&mut self, to: &mut RgbaImage, size: (u32, u32)) -> anyhow::Result<bool> {
        *to = RgbaImage::from_pixel(size.0, size.1, Rgba([self.level, self.level, self.level, 255]));
        Ok(false)
    }

    fn frame_size(&self) -> (u32, u32) {
        (4, 4)
    }

    fn next_frame_delay(&self) -> u32 {
        20
    }

    fn name(&self) -> &'static str {
        "ramp"
    }
}

#[test]
fn custom_backends_honor_manual_pause() {
    let scheduler = ClipScheduler::with_factory(
        ClipConfig::default(),
        Arc::new(|_, _, _| Ok(Box::new(Ramp { level: 0, decoded: false }) as Box<dyn DecodeBackend>)),
    );
    let (notifier, notifications) = notification_channel();
    let reader = scheduler
        .open(
            ClipSource::from_bytes(Vec::new()),
            ReaderOptions {
                autoplay: false,
                ..ReaderOptions::default()
            },
            notifier,
        )
        .unwrap();

    wait_for(&notifications, ClipEvent::Reinit);
    let request = request(&reader);
    reader.start(request);
    wait_for(&notifications, ClipEvent::Repaint);
    let first = reader.current(&request, now_ms()).unwrap();
    assert_eq!(first.get_pixel(0, 0).0[0], 0);

    // Paused readers publish nothing past the first frame
    std::thread::sleep(Duration::from_millis(100));
    assert!(notifications.try_recv().is_err());

    reader.resume();
    wait_for(&notifications, ClipEvent::Repaint);
    let next = reader.current(&request, now_ms()).unwrap();
    assert_eq!(next.get_pixel(0, 0).0[0], 1);
}
