mod common;

use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

use broxeen_watch::capture::backoff_delay;
use broxeen_watch::mailbox::FrameMailbox;
use broxeen_watch::producer::{ProducerExit, ProducerSettings, ProducerState, StreamProducer};

use common::{camera, fast_settings, EventCapture, FakeConnector, ReadMode};

fn producer(
    connector: Arc<FakeConnector>,
    settings: ProducerSettings,
) -> (StreamProducer, Arc<FrameMailbox>, watch::Sender<bool>) {
    let mailbox = Arc::new(FrameMailbox::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let p = StreamProducer::new(
        camera("GATE", "rtsp://gate/stream1", "", Duration::ZERO),
        connector,
        mailbox.clone(),
        settings,
        stop_rx,
    );
    (p, mailbox, stop_tx)
}

#[test]
fn broken_stream_exhausts_budget_without_publishing() {
    let connector = Arc::new(FakeConnector::broken_stream());
    let (p, mailbox, _stop) = producer(connector.clone(), fast_settings(10, 5));
    let state = p.subscribe();
    let logs = EventCapture::default();

    let subscriber = tracing_subscriber::registry().with(logs.clone());
    let exit = tracing::subscriber::with_default(subscriber, || p.run());

    assert_eq!(exit, ProducerExit::Exhausted { failures: 11 });
    assert_eq!(logs.count(Level::ERROR, "exhausted retries"), 1);
    assert_eq!(logs.count(Level::WARN, "frame read failed"), 11);
    assert_eq!(mailbox.published(), 0);
    assert!(mailbox.take().is_none());
    assert_eq!(*state.borrow(), ProducerState::Stopped);
    // 11 reads: reconnect after reads 5 and 10, then the 11th exceeds the budget
    assert_eq!(connector.counters.reads.load(Ordering::SeqCst), 11);
    assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 3);
    assert_eq!(connector.counters.releases.load(Ordering::SeqCst), 3);
}

#[test]
fn unreachable_source_exhausts_on_connect_failures() {
    let connector = Arc::new(FakeConnector::unreachable());
    let (p, mailbox, _stop) = producer(connector.clone(), fast_settings(3, 5));

    assert_eq!(p.run(), ProducerExit::Exhausted { failures: 4 });
    assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 4);
    assert_eq!(mailbox.published(), 0);
}

#[test]
fn healthy_stream_publishes_until_stopped() {
    let connector = Arc::new(FakeConnector::healthy(Duration::from_millis(2)));
    let settings = ProducerSettings {
        discard_frames: 2,
        ..fast_settings(10, 5)
    };
    let (p, mailbox, stop) = producer(connector.clone(), settings);

    let worker = std::thread::spawn(move || p.run());
    let deadline = Instant::now() + Duration::from_secs(5);
    while mailbox.published() < 5 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    stop.send(true).unwrap();
    let exit = worker.join().unwrap();

    assert_eq!(exit, ProducerExit::StopRequested);
    assert!(mailbox.published() >= 5);
    let frame = mailbox.take().unwrap();
    assert_eq!(frame.seq, mailbox.published());
    assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.counters.releases.load(Ordering::SeqCst), 1);

    // two buffered frames dropped before every published read
    let reads = connector.counters.reads.load(Ordering::SeqCst);
    let grabs = connector.counters.grabs.load(Ordering::SeqCst);
    assert!(grabs >= 2 * (reads - 1), "grabs={grabs} reads={reads}");
}

#[test]
fn stop_interrupts_long_backoff() {
    let connector = Arc::new(FakeConnector::unreachable());
    let settings = ProducerSettings {
        base_backoff: Duration::from_secs(30),
        backoff_cap: Duration::from_secs(60),
        ..fast_settings(10, 5)
    };
    let (p, _mailbox, stop) = producer(connector, settings);

    let started = Instant::now();
    let worker = std::thread::spawn(move || p.run());
    std::thread::sleep(Duration::from_millis(50));
    stop.send(true).unwrap();

    assert_eq!(worker.join().unwrap(), ProducerExit::StopRequested);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn connect_retries_wait_the_backoff_delay() {
    let connector = Arc::new(FakeConnector::unreachable());
    let settings = ProducerSettings {
        base_backoff: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(80),
        ..fast_settings(4, 5)
    };
    let (base, cap) = (settings.base_backoff, settings.backoff_cap);
    let (p, _mailbox, _stop) = producer(connector.clone(), settings);

    assert_eq!(p.run(), ProducerExit::Exhausted { failures: 5 });

    // 20, 40, 80, then held at the cap; no wait after the final attempt
    let gaps = connector.counters.connect_gaps();
    assert_eq!(gaps.len(), 4);
    for (k, gap) in gaps.iter().enumerate() {
        let expected = backoff_delay(base, cap, k as u32);
        assert!(*gap >= expected, "attempt {k}: waited {gap:?}, expected {expected:?}");
        assert!(*gap < expected + Duration::from_millis(250), "attempt {k}: waited {gap:?}");
    }
}

#[test]
fn successful_connect_resets_backoff() {
    // fail, fail, connect (read fails, reconnect), fail, fail
    let connector = Arc::new(FakeConnector::scripted(
        &[false, false, true, false, false],
        ReadMode::Broken,
    ));
    let settings = ProducerSettings {
        base_backoff: Duration::from_millis(50),
        backoff_cap: Duration::from_secs(1),
        ..fast_settings(4, 1)
    };
    let (p, _mailbox, _stop) = producer(connector.clone(), settings);

    assert_eq!(p.run(), ProducerExit::Exhausted { failures: 5 });
    assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 5);

    let gaps = connector.counters.connect_gaps();
    assert!(gaps[0] >= Duration::from_millis(50));
    assert!(gaps[1] >= Duration::from_millis(100));
    // back to the base delay, not 200ms
    assert!(gaps[3] >= Duration::from_millis(50));
    assert!(gaps[3] < Duration::from_millis(175), "waited {:?}", gaps[3]);
}

#[test]
fn end_of_stream_reconnects_without_pausing() {
    let connector = Arc::new(FakeConnector::with_reads(ReadMode::Ended));
    let settings = ProducerSettings {
        read_retry: Duration::from_secs(10),
        ..fast_settings(6, 5)
    };
    let (p, _mailbox, _stop) = producer(connector.clone(), settings);

    let started = Instant::now();
    assert_eq!(p.run(), ProducerExit::Exhausted { failures: 7 });
    assert!(started.elapsed() < Duration::from_secs(2));

    // every ended read drops the source and opens a new one
    assert_eq!(connector.counters.reads.load(Ordering::SeqCst), 7);
    assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 7);
    assert_eq!(connector.counters.releases.load(Ordering::SeqCst), 7);
}

#[test]
fn failed_reads_pause_before_retrying() {
    let connector = Arc::new(FakeConnector::broken_stream());
    let settings = ProducerSettings {
        read_retry: Duration::from_millis(60),
        ..fast_settings(3, 10)
    };
    let (p, _mailbox, _stop) = producer(connector.clone(), settings);

    let started = Instant::now();
    assert_eq!(p.run(), ProducerExit::Exhausted { failures: 4 });
    assert!(started.elapsed() >= Duration::from_millis(180));
    assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.counters.reads.load(Ordering::SeqCst), 4);
}

#[test]
fn stop_cuts_off_a_stalled_read() {
    let connector = Arc::new(FakeConnector::with_reads(ReadMode::Stalled));
    // zero budget: an interrupted read counted as a failure would exhaust
    let (p, _mailbox, stop) = producer(connector.clone(), fast_settings(0, 5));
    let interrupt = p.interrupt();

    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(p.run());
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while connector.counters.reads.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(20));
    assert!(done_rx.try_recv().is_err(), "read should still be blocked");

    stop.send(true).unwrap();
    interrupt.fire();

    let exit = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(exit, ProducerExit::StopRequested);
    assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.counters.releases.load(Ordering::SeqCst), 1);
}
