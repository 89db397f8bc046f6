use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shmframe::{CanonicalFrame, FrameExchange};

const GEOMETRIES: [(u32, u32); 4] = [(1, 1), (4, 2), (3, 5), (16, 9)];

/// Frame whose every byte and timestamp encode its sequence number.
fn numbered_frame(sequence: u64) -> CanonicalFrame {
    let (width, height) = GEOMETRIES[(sequence % GEOMETRIES.len() as u64) as usize];
    let len = (width * height * 3) as usize;
    CanonicalFrame::from_rgb(width, height, vec![(sequence % 251) as u8; len])
        .expect("frame")
        .with_timestamp(sequence)
}

fn assert_whole(frame: &CanonicalFrame) {
    assert_eq!(
        frame.as_bytes().len(),
        (frame.width() * frame.height() * 3) as usize
    );
    let expected = (frame.timestamp() % 251) as u8;
    assert!(frame.as_bytes().iter().all(|byte| *byte == expected));
}

#[test]
fn interleaved_publish_and_take_follow_publish_order() {
    let exchange = FrameExchange::new();
    let mut last_seen = None;
    let mut sequence = 0u64;

    // Producer bursts of varying size between consumer reads.
    for burst in [1usize, 3, 0, 2, 5, 1, 0, 4] {
        for _ in 0..burst {
            sequence += 1;
            exchange.publish(numbered_frame(sequence));
        }
        match exchange.take_if_updated() {
            Some(frame) => {
                assert_whole(&frame);
                assert_eq!(frame.timestamp(), sequence);
                assert!(last_seen.map_or(true, |last| frame.timestamp() > last));
                last_seen = Some(frame.timestamp());
            }
            None => assert_eq!(burst, 0),
        }
    }
    assert!(exchange.take_if_updated().is_none());
}

#[test]
fn swap_recycles_consumer_frames() {
    let exchange = FrameExchange::new();
    let mut current = None;

    exchange.publish(numbered_frame(1));
    assert!(exchange.swap_if_updated(&mut current));
    assert!(exchange.take_spare().is_none());

    exchange.publish(numbered_frame(2));
    assert!(exchange.swap_if_updated(&mut current));
    let spare = exchange.take_spare().expect("previous frame recycled");
    assert_eq!(spare.timestamp(), 1);
    assert_eq!(current.as_ref().map(|f| f.timestamp()), Some(2));
    assert!(!exchange.swap_if_updated(&mut current));
}

#[test]
fn threaded_consumer_sees_whole_frames_in_order() {
    let exchange = Arc::new(FrameExchange::new());
    let done = Arc::new(AtomicBool::new(false));
    const FRAMES: u64 = 5_000;

    let producer = {
        let exchange = exchange.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            for sequence in 1..=FRAMES {
                exchange.publish(numbered_frame(sequence));
                if sequence % 512 == 0 {
                    std::thread::yield_now();
                }
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut current = None;
    let mut last = 0u64;
    let mut seen = 0u64;
    loop {
        let finished = done.load(Ordering::SeqCst);
        if exchange.swap_if_updated(&mut current) {
            let frame = current.as_ref().expect("swapped frame");
            assert_whole(frame);
            assert!(frame.timestamp() > last, "{} after {}", frame.timestamp(), last);
            last = frame.timestamp();
            seen += 1;
        }
        if finished && !exchange.has_update() {
            break;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    producer.join().expect("producer thread");

    assert_eq!(last, FRAMES);
    let stats = exchange.stats();
    assert_eq!(stats.published, FRAMES);
    assert_eq!(stats.delivered, seen);
    assert_eq!(stats.delivered + stats.superseded, FRAMES);
}
