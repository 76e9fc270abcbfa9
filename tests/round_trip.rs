//! Publisher/subscriber rounds with both roles in one process, one thread each

use shm_rendezvous::{
    ChannelConfig, ChannelError, ChannelHandle, ChannelState, Payload, Publisher, Result,
    Subscriber,
};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn unique(tag: &str) -> String {
    format!("rdv_it_{}_{}", tag, std::process::id())
}

fn create<D: Payload, R: Payload>(name: &str) -> Publisher<D, R> {
    Publisher::create(name, &ChannelConfig::default()).unwrap()
}

/// Subscriber loop answering each request with `f(request)`; returns every
/// request it saw
fn spawn_subscriber<D, R, F>(name: &str, f: F) -> thread::JoinHandle<Result<Vec<D>>>
where
    D: Payload,
    R: Payload,
    F: Fn(D) -> R + Send + 'static,
{
    let name = name.to_string();
    thread::spawn(move || {
        let mut subscriber = Subscriber::<D, R>::attach(&name)?;
        let mut seen = Vec::new();
        while let Some(request) = subscriber.subscribe()? {
            seen.push(request);
            subscriber.send_result(f(request))?;
        }
        subscriber.destroy()?;
        Ok(seen)
    })
}

fn wait_for_state<D: Payload, R: Payload>(publisher: &Publisher<D, R>, state: ChannelState) {
    for _ in 0..2000 {
        if publisher.state().unwrap() == state {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("channel never reached {:?}", state);
}

#[test]
fn test_five_rounds_increment() -> Result<()> {
    let name = unique("five_rounds");
    let mut publisher = create::<i64, i64>(&name);
    let subscriber = spawn_subscriber(&name, |x: i64| x + 1);

    let mut results = Vec::new();
    for i in 1..=5 {
        publisher.publish(i * 13)?;
        results.push(publisher.wait_for_result()?);
    }
    assert_eq!(results, [14, 27, 40, 53, 66]);

    publisher.stop()?;
    let seen = subscriber.join().unwrap()?;
    assert_eq!(seen, [13, 26, 39, 52, 65]);

    publisher.destroy()?;
    assert!(!Publisher::<i64, i64>::remove(&name)?);
    Ok(())
}

#[test]
fn test_many_rounds_strict_pairing() -> Result<()> {
    let name = unique("pairing");
    let mut publisher = create::<u64, f64>(&name);
    let subscriber = spawn_subscriber(&name, |x: u64| x as f64 * 0.5);

    for i in 0..500u64 {
        publisher.publish(i)?;
        assert_eq!(publisher.wait_for_result()?, i as f64 * 0.5);
    }

    publisher.stop()?;
    let seen = subscriber.join().unwrap()?;
    assert_eq!(seen, (0..500).collect::<Vec<_>>());
    publisher.destroy()
}

#[test]
fn test_state_cycle_observed_by_publisher() -> Result<()> {
    let name = unique("state_cycle");
    let mut publisher = create::<u32, u32>(&name);
    assert_eq!(publisher.state()?, ChannelState::Init);

    let (got_tx, got_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let sub_name = name.clone();
    let subscriber = thread::spawn(move || -> Result<()> {
        let mut subscriber = Subscriber::<u32, u32>::attach(&sub_name)?;
        let request = subscriber.subscribe()?.unwrap();
        got_tx.send(request).unwrap();
        go_rx.recv().unwrap();
        subscriber.send_result(request * 2)?;
        done_tx.send(()).unwrap();
        assert!(subscriber.subscribe()?.is_none());
        subscriber.destroy()
    });

    publisher.publish(21)?;
    assert_eq!(publisher.state()?, ChannelState::Published);

    // Subscriber holds the request; nothing may advance yet.
    assert_eq!(got_rx.recv().unwrap(), 21);
    assert_eq!(publisher.state()?, ChannelState::Published);

    go_tx.send(()).unwrap();
    wait_for_state(&publisher, ChannelState::Subscribed);

    assert_eq!(publisher.wait_for_result()?, 42);
    done_rx.recv().unwrap();
    assert_eq!(publisher.state()?, ChannelState::Init);

    publisher.stop()?;
    subscriber.join().unwrap()?;
    publisher.destroy()
}

#[test]
fn test_send_result_out_of_turn_is_noop() -> Result<()> {
    let name = unique("noop");
    let mut publisher = create::<i32, i32>(&name);
    let mut subscriber = Subscriber::<i32, i32>::attach(&name)?;

    subscriber.send_result(99)?;
    assert_eq!(subscriber.state()?, ChannelState::Init);

    // The stray result must not leak into the next round.
    let worker = thread::spawn(move || -> Result<Vec<i32>> {
        let mut seen = Vec::new();
        while let Some(request) = subscriber.subscribe()? {
            seen.push(request);
            subscriber.send_result(-request)?;
        }
        subscriber.destroy()?;
        Ok(seen)
    });

    publisher.publish(7)?;
    assert_eq!(publisher.wait_for_result()?, -7);
    publisher.stop()?;
    assert_eq!(worker.join().unwrap()?, [7]);
    publisher.destroy()
}

#[test]
fn test_subscribe_reports_shutdown_repeatedly() -> Result<()> {
    let name = unique("shutdown");
    let mut publisher = create::<u8, u8>(&name);
    let mut subscriber = Subscriber::<u8, u8>::attach(&name)?;

    let worker = thread::spawn(move || -> Result<()> {
        assert!(subscriber.subscribe()?.is_none());
        assert!(subscriber.subscribe()?.is_none());
        subscriber.destroy()
    });

    publisher.stop()?;
    worker.join().unwrap()?;

    // Second stop is a no-op and does not block.
    publisher.stop()?;
    assert!(matches!(publisher.publish(1), Err(ChannelError::Stopped)));
    publisher.destroy()
}

#[test]
fn test_stop_mid_round_drains_pending_request() -> Result<()> {
    let name = unique("drain");
    let mut publisher = create::<i64, i64>(&name);
    let subscriber = spawn_subscriber(&name, |x: i64| x * 10);

    publisher.publish(1)?;
    assert_eq!(publisher.wait_for_result()?, 10);

    publisher.publish(2)?;
    publisher.stop()?;

    assert_eq!(subscriber.join().unwrap()?, [1, 2]);
    publisher.destroy()
}

#[test]
fn test_publisher_misuse_is_reported() -> Result<()> {
    let name = unique("misuse");
    let mut publisher = create::<i32, i32>(&name);

    assert!(matches!(
        publisher.wait_for_result(),
        Err(ChannelError::NothingPublished)
    ));

    publisher.publish(1)?;
    assert!(matches!(publisher.publish(2), Err(ChannelError::RoundInFlight)));

    // No subscriber ever attached: destroy must not block.
    publisher.destroy()?;
    assert!(!Publisher::<i32, i32>::remove(&name)?);
    Ok(())
}

#[test]
fn test_publisher_requires_owner_handle() -> Result<()> {
    let name = unique("owner");
    let publisher = create::<u16, u16>(&name);

    let attached = ChannelHandle::<u16, u16>::attach(&name)?;
    assert!(matches!(
        Publisher::new(attached),
        Err(ChannelError::NotOwner { .. })
    ));

    publisher.destroy()
}

#[test]
fn test_create_twice_fails_until_removed() -> Result<()> {
    let name = unique("twice");
    let publisher = create::<u8, u8>(&name);

    let second = Publisher::<u8, u8>::create(&name, &ChannelConfig::default());
    assert!(matches!(second, Err(ChannelError::ShmCreate { .. })));

    publisher.destroy()?;
    let again = create::<u8, u8>(&name);
    again.destroy()
}

#[test]
fn test_drop_without_destroy_removes_channel() -> Result<()> {
    let name = unique("drop");
    {
        let _publisher = create::<u8, u8>(&name);
    }
    assert!(!Publisher::<u8, u8>::remove(&name)?);
    assert!(matches!(
        Subscriber::<u8, u8>::attach(&name),
        Err(ChannelError::ShmOpen { .. })
    ));
    Ok(())
}

#[test]
fn test_dropped_publisher_releases_waiting_subscriber() -> Result<()> {
    let name = unique("drop_wakes");
    let mut publisher = create::<u32, u32>(&name);
    let mut subscriber = Subscriber::<u32, u32>::attach(&name)?;

    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || -> Result<()> {
        let request = subscriber.subscribe()?.unwrap();
        subscriber.send_result(request + 1)?;
        tx.send(subscriber.subscribe()).unwrap();
        subscriber.destroy()
    });

    publisher.publish(1)?;
    assert_eq!(publisher.wait_for_result()?, 2);

    // Give the subscriber time to block on the next request.
    thread::sleep(Duration::from_millis(50));
    drop(publisher);

    let next = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("subscriber still blocked after the publisher went away");
    assert!(matches!(next, Ok(None)));
    worker.join().unwrap()?;

    assert!(!Publisher::<u32, u32>::remove(&name)?);
    Ok(())
}

#[test]
fn test_invalid_name_rejected() {
    assert!(matches!(
        Publisher::<u8, u8>::create("", &ChannelConfig::default()),
        Err(ChannelError::InvalidName { .. })
    ));
    assert!(matches!(
        Subscriber::<u8, u8>::attach("a/b"),
        Err(ChannelError::InvalidName { .. })
    ));
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    id: u32,
    values: [f32; 4],
}

unsafe impl Payload for Sample {}

#[test]
fn test_struct_payloads() -> Result<()> {
    let name = unique("struct");
    let mut publisher = create::<Sample, [u8; 8]>(&name);
    let subscriber = spawn_subscriber(&name, |s: Sample| {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&s.id.to_le_bytes());
        out[4] = s.values.len() as u8;
        out
    });

    let sample = Sample {
        id: 0xDEAD_BEEF,
        values: [1.0, 2.0, 3.0, 4.0],
    };
    publisher.publish(sample)?;
    assert_eq!(
        publisher.wait_for_result()?,
        [0xEF, 0xBE, 0xAD, 0xDE, 4, 0, 0, 0]
    );

    publisher.stop()?;
    assert_eq!(subscriber.join().unwrap()?, [sample]);
    publisher.destroy()
}
