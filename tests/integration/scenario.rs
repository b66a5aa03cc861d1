use crate::*;

/// A caches two packets and advertises them; B, which never heard either,
/// requests both and receives both replays, high priority first.
#[test]
fn test_advertise_request_replay() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    mesh.node(A).engine.adopt(&traffic(1, Priority::HIGH));
    mesh.node(A).engine.adopt(&traffic(2, Priority::DEFAULT));

    let log = mesh.tick(mesh.at(20), lossless);

    let adverts = messages_from(&log, A);
    let Some(Message::Available(advert)) = adverts.first() else {
        panic!("A did not advertise: {adverts:?}");
    };
    let advertised: Vec<Fingerprint> = advert.entries.iter().map(|e| e.fingerprint).collect();
    assert_eq!(advertised, vec![fp(1), fp(2)]);
    assert!(advert.header.boot);
    assert!(advert.entries[0].priority && !advert.entries[1].priority);

    let requests = messages_from(&log, B);
    let Some(Message::RequestPackets { slots, .. }) = requests
        .iter()
        .find(|m| matches!(m, Message::RequestPackets { .. }))
    else {
        panic!("B did not request: {requests:?}");
    };
    assert_eq!(slots.ones().collect::<Vec<_>>(), vec![0, 1]);

    // one replay per wake, high priority first
    let replayed = data_from(&log, A);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].id, 1);

    let log = mesh.tick(mesh.at(21), lossless);
    let replayed = data_from(&log, A);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].id, 2);

    let b = mesh.node(B);
    assert!(b.engine.is_known(fp(1)) && b.engine.is_known(fp(2)));
    assert!(b.engine.servers().get(A).unwrap().missing.none());

    let a = mesh.node(A);
    assert!(a.engine.tracker().wanted.none());
    assert_eq!(a.engine.metrics().packets_replayed, 2);
    assert_eq!(a.engine.metrics().priority_replayed, 1);
}

/// A prunes P2 before B's request arrives: A answers with an expiry notice,
/// B drops P2 from its missing set and never asks for it again.
#[test]
fn test_pruned_packet_is_expired_not_replayed() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    mesh.node(A).engine.adopt(&traffic(1, Priority::HIGH));
    mesh.node(A).engine.adopt(&traffic(2, Priority::DEFAULT));

    // B's request is lost on the way to A
    let log = mesh.tick(mesh.at(20), |_, frame| frame.sender == B);
    let request = log
        .iter()
        .find(|f| f.sender == B && matches!(f.message(), Some(Message::RequestPackets { .. })))
        .cloned()
        .expect("B requested");
    assert!(mesh.node(B).engine.servers().get(A).unwrap().missing.test(1));

    // priority pruning takes the DEFAULT packet
    assert_eq!(mesh.node(A).engine.prune_cache(1), 1);
    assert!(mesh.node(A).engine.cache().body_at(1).is_none());

    // the request finally arrives
    let t = mesh.at(21);
    mesh.deliver(&request, t, lossless);
    let log = mesh.pump(t, lossless);
    let expired = messages_from(&log, A)
        .into_iter()
        .find_map(|m| match m {
            Message::Expired { slots, .. } => Some(slots),
            _ => None,
        })
        .expect("A sent an expiry advertisement");
    assert!(expired.test(1) && !expired.test(0));

    let server = mesh.node(B).engine.servers().get(A).unwrap().clone();
    assert!(!server.missing.test(1) && !server.available.test(1));

    let log = mesh.tick(mesh.at(22), lossless);
    assert_eq!(data_from(&log, A).iter().map(|p| p.id).collect::<Vec<_>>(), vec![1]);
    assert!(!messages_from(&log, B)
        .iter()
        .any(|m| matches!(m, Message::RequestPackets { .. })));

    let b = mesh.node(B);
    assert!(b.engine.is_known(fp(1)));
    assert!(!b.engine.is_known(fp(2)));
    assert_eq!(mesh.node(A).engine.metrics().expiry_adverts_sent, 1);
}

/// A packet both nodes already heard is never requested.
#[test]
fn test_known_packets_are_not_requested() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    let p = traffic(5, Priority::DEFAULT);
    mesh.node(A).engine.adopt(&p);
    mesh.node(B).engine.remember(p.fingerprint());

    let log = mesh.tick(mesh.at(20), lossless);
    assert!(messages_from(&log, B).is_empty());
    assert!(mesh.node(B).engine.servers().get(A).unwrap().missing.none());
}

/// Under congestion only high priority packets are advertised, and B asks
/// only for those.
#[test]
fn test_congestion_limits_to_high_priority() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    mesh.node(A).chutil.store(60, std::sync::atomic::Ordering::Relaxed);
    mesh.node(A).engine.adopt(&traffic(1, Priority::DEFAULT));
    mesh.node(A).engine.adopt(&traffic(2, Priority::ALERT));

    let log = mesh.tick(mesh.at(20), lossless);
    let Some(Message::Available(advert)) = messages_from(&log, A).into_iter().next() else {
        panic!("A did not advertise");
    };
    assert!(advert.header.priority);
    assert_eq!(advert.entries.len(), 1);
    assert_eq!(advert.entries[0].fingerprint, fp(2));
    assert_eq!(data_from(&log, A).iter().map(|p| p.id).collect::<Vec<_>>(), vec![2]);
}
