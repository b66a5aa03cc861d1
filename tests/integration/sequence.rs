use crate::*;

fn is_advert_from_a(receiver: NodeId, frame: &Frame) -> bool {
    receiver == B && frame.sender == A && matches!(frame.message(), Some(Message::Available(_)))
}

fn advert_requests(log: &[Frame]) -> usize {
    messages_from(log, B)
        .iter()
        .filter(|m| matches!(m, Message::RequestAdvertisement { .. }))
        .count()
}

/// Adverts 0, 1, 2 in order: nothing to resend.
#[test]
fn test_in_order_adverts_need_no_resend() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    for (i, secs) in [20, 40, 60].into_iter().enumerate() {
        mesh.node(A).engine.adopt(&traffic(i as u32, Priority::DEFAULT));
        let log = mesh.tick(mesh.at(secs), lossless);
        assert_eq!(advert_requests(&log), 0);
    }
    let b = mesh.node(B);
    assert_eq!(b.engine.metrics().advert_requests_sent, 0);
    assert!(!b.engine.servers().get(A).unwrap().sequence.has_gaps());
}

/// Adverts 0, 1, 3 arrive and 2 is lost: B asks for 2, A answers with an
/// aggregate, the gap closes and the packet advert 2 carried is replayed.
#[test]
fn test_missed_advert_is_resent_as_aggregate() {
    let mut mesh = Mesh::new(&[A, B], &test_config());
    for (id, secs) in [(1, 20), (2, 40)] {
        mesh.node(A).engine.adopt(&traffic(id, Priority::DEFAULT));
        mesh.tick(mesh.at(secs), lossless);
    }

    mesh.node(A).engine.adopt(&traffic(3, Priority::DEFAULT));
    mesh.tick(mesh.at(60), is_advert_from_a);
    assert!(!mesh.node(B).engine.is_known(fp(3)));

    mesh.node(A).engine.adopt(&traffic(4, Priority::DEFAULT));
    let log = mesh.tick(mesh.at(80), lossless);

    let Some(Message::RequestAdvertisement { header, missing }) = messages_from(&log, B)
        .into_iter()
        .find(|m| matches!(m, Message::RequestAdvertisement { .. }))
    else {
        panic!("B did not ask for the missed advert");
    };
    assert_eq!(header.sequence, 1);
    assert_eq!(missing, 0b10);

    let aggregate = messages_from(&log, A)
        .into_iter()
        .find_map(|m| match m {
            Message::Available(adv) if adv.aggregate_mask.is_some() => Some(adv),
            _ => None,
        })
        .expect("A resent the advert");
    assert_eq!(aggregate.aggregate_mask, Some(0b10));
    assert_eq!(aggregate.header.sequence, 1);
    assert_eq!(aggregate.entries.len(), 1);
    assert_eq!(aggregate.entries[0].fingerprint, fp(3));

    mesh.tick(mesh.at(81), lossless);
    let b = mesh.node(B);
    assert!(!b.engine.servers().get(A).unwrap().sequence.has_gaps());
    assert!(b.engine.is_known(fp(3)) && b.engine.is_known(fp(4)));
    assert_eq!(mesh.node(A).engine.metrics().aggregate_adverts_sent, 1);
}

/// More adverts lost than the resend window covers: B resyncs instead of
/// asking for them.
#[test]
fn test_long_gap_forces_resync() {
    let mut config = test_config();
    config.advert.flush_secs = 5;
    let mut mesh = Mesh::new(&[A, B], &config);
    mesh.node(A).engine.adopt(&traffic(0, Priority::DEFAULT));
    mesh.tick(mesh.at(5), lossless);

    for i in 1..=16u32 {
        mesh.node(A).engine.adopt(&traffic(i, Priority::DEFAULT));
        mesh.tick(mesh.at(5 + 5 * u64::from(i)), is_advert_from_a);
    }
    mesh.node(A).engine.adopt(&traffic(17, Priority::DEFAULT));
    let log = mesh.tick(mesh.at(90), lossless);

    assert_eq!(advert_requests(&log), 0);
    let b = mesh.node(B);
    assert_eq!(b.engine.metrics().resyncs, 1);
    let server = b.engine.servers().get(A).unwrap();
    assert!(!server.sequence.has_gaps());
    assert_eq!(server.sequence.last_wire(), 17);
}
