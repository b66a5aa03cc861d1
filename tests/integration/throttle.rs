use crate::*;

/// B asks for more than its bucket allows: A serves what the bucket covers,
/// names B in its next advert, and B holds back further requests.
#[test]
fn test_throttle_list_suppresses_requests() {
    let mut config = test_config();
    config.peers.client_burst = 2;
    config.peers.client_rate_ms = 600_000;
    let mut mesh = Mesh::new(&[A, B], &config);
    for id in 1..=4 {
        mesh.node(A).engine.adopt(&traffic(id, Priority::DEFAULT));
    }

    let log = mesh.tick(mesh.at(20), lossless);
    let requested = messages_from(&log, B)
        .into_iter()
        .find_map(|m| match m {
            Message::RequestPackets { slots, .. } => Some(slots.count()),
            _ => None,
        });
    assert_eq!(requested, Some(4));
    {
        let a = mesh.node(A);
        assert_eq!(a.engine.metrics().requests_throttled, 1);
        assert_eq!(a.engine.tracker().wanted.count() + data_from(&log, A).len(), 2);
        assert_eq!(a.engine.clients().get(B).unwrap().served, 2);
    }

    mesh.node(A).engine.adopt(&traffic(5, Priority::DEFAULT));
    let log = mesh.tick(mesh.at(40), lossless);

    let advert = messages_from(&log, A)
        .into_iter()
        .find_map(|m| match m {
            Message::Available(adv) => Some(adv),
            _ => None,
        })
        .expect("A advertised");
    assert_eq!(advert.throttled, vec![B.0 as u8]);
    assert!(!messages_from(&log, B)
        .iter()
        .any(|m| matches!(m, Message::RequestPackets { .. })));

    // still missing, just not asked for
    let server = mesh.node(B).engine.servers().get(A).unwrap();
    assert!(server.missing.test(4));
}

/// A client that keeps to the refill rate is never named.
#[test]
fn test_polite_client_is_not_throttled() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    for round in 0..5u32 {
        mesh.node(A).engine.adopt(&traffic(round, Priority::DEFAULT));
        let log = mesh.tick(mesh.at(20 * u64::from(round + 1)), lossless);
        for msg in messages_from(&log, A) {
            if let Message::Available(adv) = msg {
                assert!(adv.throttled.is_empty());
            }
        }
    }
    assert_eq!(mesh.node(A).engine.metrics().requests_throttled, 0);
    assert!((0..5).all(|id| mesh.node(B).engine.is_known(fp(id))));
}
