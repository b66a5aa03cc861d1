use crate::*;

/// A reboots: its first advert carries the boot flag and B discards what
/// it knew about A's old cache.
#[test]
fn test_boot_flag_wipes_server_state() {
    let config = test_config();
    let mut mesh = Mesh::new(&[A, B], &config);
    for id in 1..=3 {
        mesh.node(A).engine.adopt(&traffic(id, Priority::DEFAULT));
    }
    mesh.tick(mesh.at(20), lossless);
    assert_eq!(mesh.node(B).engine.servers().get(A).unwrap().available.count(), 3);

    let rebooted = Node::new(A, &config, mesh.at(30));
    *mesh.node(A) = rebooted;
    mesh.node(A).engine.adopt(&traffic(10, Priority::DEFAULT));

    let log = mesh.tick(mesh.at(50), lossless);
    let Some(Message::Available(advert)) = messages_from(&log, A).into_iter().next() else {
        panic!("rebooted A did not advertise");
    };
    assert!(advert.header.boot);
    assert_eq!(advert.header.sequence, 0);

    let b = mesh.node(B);
    assert_eq!(b.engine.metrics().resyncs, 1);
    let server = b.engine.servers().get(A).unwrap();
    assert_eq!(server.available.ones().collect::<Vec<_>>(), vec![0]);
    assert_eq!(server.fingerprints[0], fp(10));
}

/// A server silent for longer than the staleness window is invalidated, and
/// picked up from scratch when it speaks again.
#[test]
fn test_stale_server_is_invalidated() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    mesh.node(A).engine.adopt(&traffic(1, Priority::DEFAULT));
    mesh.tick(mesh.at(20), lossless);
    assert!(mesh.node(B).engine.is_known(fp(1)));

    mesh.tick(mesh.at(321), lossless);
    {
        let b = mesh.node(B);
        assert_eq!(b.engine.metrics().resyncs, 1);
        let server = b.engine.servers().get(A).unwrap();
        assert!(server.available.none());
        assert!(!server.sequence.is_started());
    }

    mesh.node(A).engine.adopt(&traffic(2, Priority::DEFAULT));
    mesh.tick(mesh.at(341), lossless);
    let b = mesh.node(B);
    assert_eq!(b.engine.metrics().resyncs, 2);
    assert!(b.engine.servers().get(A).unwrap().available.test(1));
    assert!(b.engine.is_known(fp(2)));
}
