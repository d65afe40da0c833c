//! End-to-end scenarios across whole endpoints.

use std::time::{Duration, Instant};

use magnetite::{
    BackendSpec, Config, Data, Endpoint, ErrorCode, PeerStatus, RecordReader, StatusEvent,
    Timespan, Timestamp, Topic,
};

fn test_config() -> Config {
    Config {
        disable_ssl: true,
        ..Config::default()
    }
}

/// Polls `check` until it passes or the deadline expires.
fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn peer_then_publish() {
    let a = Endpoint::new(test_config()).expect("endpoint a");
    let b = Endpoint::new(test_config()).expect("endpoint b");

    let port = a.listen("127.0.0.1", 0).expect("listen");
    b.peer("127.0.0.1", port, Timespan::from_secs(5)).expect("peer");

    let mut sub = b.make_subscriber(vec![Topic::from("/x")], 64);
    eventually("filter propagation", || {
        a.peer_subscriptions().contains(&Topic::from("/x"))
    });

    a.publish(Topic::from("/x/y"), Data::Count(42));

    let (topic, data) = sub
        .get_timeout(Duration::from_secs(10))
        .expect("exactly one message");
    assert_eq!(topic, Topic::from("/x/y"));
    assert_eq!(data, Data::Count(42));
    assert!(sub.get_timeout(Duration::from_millis(250)).is_none());
}

#[test]
fn clone_convergence() {
    let a = Endpoint::new(test_config()).expect("endpoint a");
    let b = Endpoint::new(test_config()).expect("endpoint b");

    let port = a.listen("127.0.0.1", 0).expect("listen");
    b.peer("127.0.0.1", port, Timespan::from_secs(5)).expect("peer");

    let master = a.attach_master("s", BackendSpec::Memory).expect("master");
    let clone = b.attach_clone("s").expect("clone");

    eventually("store subscription exchange", || {
        a.peer_subscriptions().contains(&Topic::store_clone("s"))
            && b.peer_subscriptions().contains(&Topic::store_master("s"))
    });

    master.put("k1", 1i64, None).expect("put k1");
    master.put("k2", "v", None).expect("put k2");
    master.add("k1", 2i64, None).expect("add k1");
    master.erase("k2").expect("erase k2");

    eventually("clone convergence", || {
        clone.get("k1") == Ok(Data::Integer(3))
            && clone.exists("k2") == Ok(false)
            && clone.size() == Ok(1)
    });
}

#[test]
fn virtual_clock_expiry() {
    let config = Config {
        use_real_time: false,
        ..test_config()
    };
    let endpoint = Endpoint::new(config).expect("endpoint");
    endpoint.advance_time(Timestamp::from_nanos(1_000));

    let store = endpoint
        .attach_master("s", BackendSpec::Memory)
        .expect("master");
    store
        .put("k", 1i64, Some(Timestamp::from_nanos(2_000)))
        .expect("put");

    endpoint.advance_time(Timestamp::from_nanos(1_500));
    assert_eq!(store.get("k"), Ok(Data::Integer(1)));

    endpoint.advance_time(Timestamp::from_nanos(2_500));
    assert_eq!(store.get("k"), Err(ErrorCode::NoSuchKey));
}

#[test]
fn type_clash_on_add() {
    let endpoint = Endpoint::new(test_config()).expect("endpoint");
    let store = endpoint
        .attach_master("s", BackendSpec::Memory)
        .expect("master");

    store.put("k", "hello", None).expect("put");
    assert_eq!(store.add("k", 5i64, None), Err(ErrorCode::TypeClash));
    assert_eq!(store.get("k"), Ok(Data::from("hello")));
}

#[test]
fn recording_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recording_dir = dir.path().join("recording");
    let config = Config {
        recording_directory: recording_dir.clone(),
        ..test_config()
    };

    {
        let mut endpoint = Endpoint::new(config).expect("endpoint");
        endpoint.publish_batch([
            (Topic::from("/a"), Data::Count(1)),
            (Topic::from("/b"), Data::Count(2)),
            (Topic::from("/a"), Data::Count(3)),
        ]);
        // Publishing is asynchronous. The request channel is FIFO, so a
        // synchronous round-trip guarantees the core routed (and thus
        // recorded) everything queued before it.
        let _ = endpoint.peers();
        endpoint.shutdown();
    }

    assert!(recording_dir.join("magnetite.conf").exists());

    let mut reader = RecordReader::open(recording_dir.join("messages.dat")).expect("reader");
    let mut messages = Vec::new();
    while !reader.at_end() {
        messages.push(reader.read().expect("read"));
    }
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].topic(), &Topic::from("/a"));
    assert_eq!(messages[1].topic(), &Topic::from("/b"));
    assert_eq!(messages[2].topic(), &Topic::from("/a"));
    assert_eq!(
        reader.topics(),
        &[Topic::from("/a"), Topic::from("/b")]
    );
    assert_eq!(reader.data_entries(), 3);
    assert_eq!(reader.command_entries(), 0);
}

#[test]
fn virtual_time_barrier_orders_deferred_messages() {
    let config = Config {
        use_real_time: false,
        ..test_config()
    };
    let endpoint = Endpoint::new(config).expect("endpoint");
    let mut sub = endpoint.make_subscriber(vec![Topic::from("/t")], 64);

    let start = endpoint.now();
    endpoint.publish_later(Topic::from("/t"), Data::Count(1), Timespan::from_nanos(100));
    endpoint.publish_later(Topic::from("/t"), Data::Count(2), Timespan::from_nanos(100));

    // FIFO round-trip: the core has armed both timers before we advance.
    let _ = endpoint.peers();

    // Nothing may arrive before the clock reaches the deadline.
    assert!(sub.try_get().is_none());

    endpoint.advance_time(start + Timespan::from_nanos(100));

    // advance_time returned only after the core acknowledged the sync
    // point, so both messages are already queued, in FIFO order.
    assert_eq!(sub.try_get(), Some((Topic::from("/t"), Data::Count(1))));
    assert_eq!(sub.try_get(), Some((Topic::from("/t"), Data::Count(2))));
}

#[test]
fn status_events_track_peer_lifecycle() {
    let a = Endpoint::new(test_config()).expect("endpoint a");
    let b = Endpoint::new(test_config()).expect("endpoint b");
    let mut status = b.make_status_subscriber();

    let port = a.listen("127.0.0.1", 0).expect("listen");
    b.peer_nosync("127.0.0.1", port, Timespan::from_secs(5));

    eventually("peer added event", || {
        matches!(
            status.get_timeout(Duration::from_secs(1)),
            Some(StatusEvent::PeerAdded { .. })
        )
    });

    let peers = b.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].status, PeerStatus::Peered);
    assert_eq!(peers[0].id, a.id());

    b.unpeer("127.0.0.1", port).expect("unpeer");
    assert!(b.peers().is_empty());
}

#[test]
fn unreachable_peer_reports_status_event() {
    let endpoint = Endpoint::new(test_config()).expect("endpoint");
    let mut status = endpoint.make_status_subscriber();

    // Nothing listens on this port.
    let dead_port = {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        sock.local_addr().expect("addr").port()
    };
    endpoint.peer_nosync("127.0.0.1", dead_port, Timespan::ZERO);

    eventually("unreachable event", || {
        matches!(
            status.get_timeout(Duration::from_secs(1)),
            Some(StatusEvent::PeerUnreachable { .. })
        )
    });
}

#[test]
fn durable_store_survives_endpoint_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("s.sqlite");

    {
        let endpoint = Endpoint::new(test_config()).expect("endpoint");
        let store = endpoint
            .attach_master("s", BackendSpec::Sqlite { path: db.clone() })
            .expect("master");
        store.put("persisted", 7u64, None).expect("put");
    }

    let endpoint = Endpoint::new(test_config()).expect("endpoint");
    let store = endpoint
        .attach_master("s", BackendSpec::Sqlite { path: db })
        .expect("master");
    assert_eq!(store.get("persisted"), Ok(Data::Count(7)));
}
