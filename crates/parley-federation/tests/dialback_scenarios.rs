//! End-to-end dialback between federations on an in-memory network.

mod common;

use std::{sync::Arc, time::Duration};

use common::{
    b_example_tls, federation, serve, serve_after_first, server, settings, system_roots_tls, trusting_test_ca,
    wait_incoming, wait_outgoing_gone, MemoryNetwork, RecordingSink,
};
use parley_federation::{
    discovery::{Connector, Endpoint},
    session::AuthMethod,
    stanza::{
        parse_stream_error, DialbackResult, DialbackVerify, Element, StreamFeatures, StreamHeader, Verdict, NS_SASL,
        NS_TLS,
    },
    stream::{BoxedTransport, XmlStream},
    DialbackSecret, Federation, FederationError, SessionState, StreamErrorCondition,
};
use tokio::{io::DuplexStream, sync::mpsc};

/// Answer a responder-side stream header the way a version 1.0 server does.
async fn respond_header(stream: &XmlStream, local: &str, id: &str) {
    let header = stream.read_header().await.unwrap();
    stream
        .send_header(&StreamHeader::responding(local, header.from.as_deref(), id, Some("1.0")))
        .await
        .unwrap();
    stream
        .send(&StreamFeatures { dialback: true, ..Default::default() }.to_element())
        .await
        .unwrap();
}

/// Play a b.example that offers STARTTLS and answers `<proceed/>`. Returns
/// the transport, ready for the TLS handshake.
async fn proceed_to_tls(conn: DuplexStream) -> BoxedTransport {
    let stream = XmlStream::new(Box::new(conn), false, "tls-peer");
    let header = stream.read_header().await.unwrap();
    stream
        .send_header(&StreamHeader::responding("b.example", header.from.as_deref(), "S-plain", Some("1.0")))
        .await
        .unwrap();
    stream
        .send(&StreamFeatures { starttls: true, ..Default::default() }.to_element())
        .await
        .unwrap();
    let starttls = stream.expect_element(Duration::from_secs(5)).await.unwrap();
    assert_eq!(starttls.name, "starttls");
    stream.send(&Element::new("proceed").with_attr("xmlns", NS_TLS)).await.unwrap();
    stream.into_transport().unwrap()
}

/// A b.example that authenticates a.example with SASL EXTERNAL, advertises
/// dialback afterwards and accepts every further result-offer unchecked.
/// Reports the domain of each offer.
async fn sasl_peer(conn: DuplexStream, offers: mpsc::UnboundedSender<String>) {
    let transport = proceed_to_tls(conn).await;
    let secured = b_example_tls().accept(transport, Duration::from_secs(5)).await.unwrap();
    let stream = XmlStream::new(secured, true, "sasl-peer");

    let header = stream.read_header().await.unwrap();
    stream
        .send_header(&StreamHeader::responding("b.example", header.from.as_deref(), "S-tls", Some("1.0")))
        .await
        .unwrap();
    let mechanisms = StreamFeatures { mechanisms: vec!["EXTERNAL".into()], ..Default::default() };
    stream.send(&mechanisms.to_element()).await.unwrap();
    let auth = stream.expect_element(Duration::from_secs(5)).await.unwrap();
    assert_eq!(auth.attr("mechanism"), Some("EXTERNAL"));
    // base64("a.example")
    assert_eq!(auth.text, "YS5leGFtcGxl");
    stream.send(&Element::new("success").with_attr("xmlns", NS_SASL)).await.unwrap();

    let header = stream.read_header().await.unwrap();
    stream
        .send_header(&StreamHeader::responding("b.example", header.from.as_deref(), "S-sasl", Some("1.0")))
        .await
        .unwrap();
    stream
        .send(&StreamFeatures { dialback: true, ..Default::default() }.to_element())
        .await
        .unwrap();
    while let Ok(Some(el)) = stream.read_element().await {
        if let Some(offer) = DialbackResult::parse(&el) {
            let _ = offers.send(offer.from.clone());
            let answer = DialbackResult::answer(&offer.to, &offer.from, Verdict::Valid);
            if stream.send(&answer.to_element()).await.is_err() {
                break;
            }
        }
    }
}

/// Play a.example's authoritative server, answering every verify-request
/// with `respond(request)`. Reports the stream error each verify connection
/// is closed with.
fn rogue_authority(
    net: &MemoryNetwork,
    respond: fn(&DialbackVerify) -> DialbackVerify,
) -> mpsc::UnboundedReceiver<StreamErrorCondition> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut rogue = net.listen("a.example");
    tokio::spawn(async move {
        while let Some(conn) = rogue.recv().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let stream = XmlStream::new(Box::new(conn), false, "rogue");
                respond_header(&stream, "a.example", "R1").await;
                let el = stream.expect_element(Duration::from_secs(5)).await.unwrap();
                let request = DialbackVerify::parse(&el).unwrap();
                stream.send(&respond(&request).to_element()).await.unwrap();
                if let Ok(Some(el)) = stream.read_element().await {
                    if el.name == "stream:error" {
                        let _ = tx.send(parse_stream_error(&el));
                    }
                }
            });
        }
    });
    rx
}

/// Offer a.example to b.example while a rogue answers for a.example. Checks
/// what the originating side sees and returns the condition b.example closed
/// the verify connection with.
async fn offer_with_rogue_authority(respond: fn(&DialbackVerify) -> DialbackVerify) -> StreamErrorCondition {
    let net = MemoryNetwork::new();
    let mut verify_closed = rogue_authority(&net, respond);
    let b = server(&net, "b.example", &[], "secret-b");

    let (stream, _header) = open_raw(&net, "a.example", "b.example").await;
    stream
        .send(&DialbackResult::offer("a.example", "b.example", "some-key").to_element())
        .await
        .unwrap();

    let el = stream.expect_element(Duration::from_secs(5)).await.unwrap();
    assert_eq!(DialbackResult::parse(&el).unwrap().verdict, Some(Verdict::Invalid));
    let err = stream.expect_element(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(
        err,
        FederationError::PeerStreamError(StreamErrorCondition::RemoteConnectionFailed)
    ));
    assert!(b.registry().incoming("a.example").await.is_empty());
    verify_closed.recv().await.unwrap()
}

async fn open_raw(net: &MemoryNetwork, from: &str, to: &str) -> (XmlStream, StreamHeader) {
    let transport = net.connect(&Endpoint::new(to, 5269)).await.unwrap();
    let stream = XmlStream::new(transport, false, to);
    stream.send_header(&StreamHeader::initiating(from, to)).await.unwrap();
    let header = stream.read_header().await.unwrap();
    let features = stream.expect_element(Duration::from_secs(5)).await.unwrap();
    assert_eq!(features.name, "stream:features");
    (stream, header)
}

#[tokio::test]
async fn originating_server_gains_an_outgoing_session() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");
    let b = server(&net, "b.example", &[], "secret-b");

    assert!(a.authenticate_domain("a.example", "b.example").await);

    let outgoing = a.registry().outgoing("b.example").await.expect("outgoing session");
    assert!(outgoing.is_authenticated("a.example").await);
    assert_eq!(outgoing.state().await, SessionState::Trusted(1));
    assert!(outgoing.uses_dialback());

    assert!(wait_incoming(&b, "a.example", true).await);
    let incoming = b.registry().incoming("a.example").await;
    assert_eq!(incoming.len(), 1);
    assert!(incoming[0].is_validated_pair("a.example", "b.example").await);
    assert_eq!(incoming[0].stream_id(), outgoing.stream_id());

    // One connection each way: ours, and B's call back to our authority.
    assert_eq!(net.dials("b.example"), 1);
    assert_eq!(net.dials("a.example"), 1);

    // Already trusted: no new connection.
    assert!(a.authenticate_domain("a.example", "b.example").await);
    assert_eq!(net.dials("b.example"), 1);
}

#[tokio::test]
async fn mismatched_authority_id_is_rejected() {
    let net = MemoryNetwork::new();
    // Claims a.example but does not accept connections for it.
    let a = federation(&net, settings("a.example", &[]), "secret-a");
    let b = server(&net, "b.example", &[], "secret-b");

    let mut rogue = net.listen("a.example");
    tokio::spawn(async move {
        while let Some(conn) = rogue.recv().await {
            tokio::spawn(async move {
                let stream = XmlStream::new(Box::new(conn), false, "rogue");
                respond_header(&stream, "a.example", "R1").await;
                let el = stream.expect_element(Duration::from_secs(5)).await.unwrap();
                let request = DialbackVerify::parse(&el).unwrap();
                let response = DialbackVerify::response(&request.to, &request.from, "not-the-stream", Verdict::Valid);
                let _ = stream.send(&response.to_element()).await;
                let _ = stream.read_element().await;
            });
        }
    });

    assert!(!a.authenticate_domain("a.example", "b.example").await);
    assert!(a.registry().outgoing("b.example").await.is_none());
    assert!(b.registry().incoming("a.example").await.is_empty());
}

#[tokio::test]
async fn duplicate_pairing_is_not_authorized() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");
    let b = server(&net, "b.example", &[], "secret-b");
    assert!(a.authenticate_domain("a.example", "b.example").await);
    assert!(wait_incoming(&b, "a.example", true).await);

    let (stream, header) = open_raw(&net, "a.example", "b.example").await;
    let key = a.secret().derive(header.id.as_deref().unwrap());
    stream
        .send(&DialbackResult::offer("a.example", "b.example", &key).to_element())
        .await
        .unwrap();

    let err = stream.expect_element(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, FederationError::PeerStreamError(StreamErrorCondition::NotAuthorized)));
    // The original session is untouched.
    assert_eq!(b.registry().incoming("a.example").await.len(), 1);
}

#[tokio::test]
async fn silent_remote_times_out_and_is_abandoned() {
    let net = MemoryNetwork::new();
    let mut cfg = settings("a.example", &[]);
    cfg.read_timeout = Duration::from_millis(300);
    let a = federation(&net, cfg, "secret-a");
    serve(&net, &a, &["a.example"]);

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let mut silent = net.listen("b.example");
    tokio::spawn(async move {
        let conn = silent.recv().await.unwrap();
        let stream = XmlStream::new(Box::new(conn), false, "silent");
        respond_header(&stream, "b.example", "S-silent").await;
        while let Ok(Some(el)) = stream.read_element().await {
            let _ = seen_tx.send(el.name);
        }
        let _ = seen_tx.send("closed".to_string());
    });

    assert!(!a.authenticate_domain("a.example", "b.example").await);
    assert!(a.registry().outgoing("b.example").await.is_none());
    assert_eq!(seen.recv().await.as_deref(), Some("db:result"));
    assert_eq!(seen.recv().await.as_deref(), Some("closed"));
    assert_eq!(net.dials("b.example"), 1);
}

#[tokio::test]
async fn concurrent_callers_share_one_connection() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &["muc.a.example"], "secret-a");
    let _b = server(&net, "b.example", &[], "secret-b");

    let attempts: Vec<_> = (0..5)
        .map(|_| {
            let a = a.clone();
            tokio::spawn(async move { a.authenticate_domain("a.example", "b.example").await })
        })
        .collect();
    for attempt in attempts {
        assert!(attempt.await.unwrap());
    }
    assert_eq!(net.dials("b.example"), 1);

    // A second local domain rides the same connection with another round.
    assert!(a.authenticate_domain("muc.a.example", "b.example").await);
    assert_eq!(net.dials("b.example"), 1);
    let outgoing = a.registry().outgoing("b.example").await.unwrap();
    assert_eq!(outgoing.authenticated_domains().await, vec!["a.example", "muc.a.example"]);
    assert_eq!(outgoing.hostnames().await, vec!["b.example"]);
    assert_eq!(a.registry().outgoing_hostnames().await, vec!["b.example"]);
}

#[tokio::test]
async fn unreachable_subdomain_falls_back_to_parent() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");
    let _b = server(&net, "b.example", &[], "secret-b");

    assert!(a.authenticate_domain("a.example", "xmpp.b.example").await);

    let via_sub = a.registry().outgoing("xmpp.b.example").await.unwrap();
    let via_parent = a.registry().outgoing("b.example").await.unwrap();
    assert_eq!(via_sub.id(), via_parent.id());
    assert_eq!(via_sub.hostnames().await, vec!["b.example", "xmpp.b.example"]);
}

#[tokio::test]
async fn missing_starttls_falls_back_to_plain_dialback() {
    let net = MemoryNetwork::new();
    let a = Federation::builder(settings("a.example", &[]), DialbackSecret::new("secret-a"))
        .resolver(net.clone())
        .connector(net.clone())
        .tls(system_roots_tls())
        .build();
    serve(&net, &a, &["a.example"]);
    let _b = server(&net, "b.example", &[], "secret-b");

    assert!(a.authenticate_domain("a.example", "b.example").await);
    // The STARTTLS attempt and the fresh plain connection.
    assert_eq!(net.dials("b.example"), 2);
    assert!(a.registry().outgoing("b.example").await.unwrap().uses_dialback());
}

#[tokio::test]
async fn stanzas_pass_the_gate_only_from_validated_domains() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");
    let (tx, mut delivered) = mpsc::unbounded_channel();
    let b = Federation::builder(settings("b.example", &[]), DialbackSecret::new("secret-b"))
        .resolver(net.clone())
        .connector(net.clone())
        .sink(Arc::new(RecordingSink(tx)))
        .build();
    serve(&net, &b, &["b.example"]);

    assert!(a.authenticate_domain("a.example", "b.example").await);
    let outgoing = a.registry().outgoing("b.example").await.unwrap();

    let hello = Element::new("message")
        .with_attr("from", "juliet@a.example/balcony")
        .with_attr("to", "romeo@b.example")
        .with_child(Element::new("body").with_text("hello"));
    outgoing.deliver("a.example", &hello).await.unwrap();
    let got = delivered.recv().await.unwrap();
    assert_eq!(got.attr("to"), Some("romeo@b.example"));
    assert_eq!(got.child("body").unwrap().text, "hello");

    // A spoofed sender closes the whole session.
    let spoofed = Element::new("message")
        .with_attr("from", "mallory@c.example")
        .with_attr("to", "romeo@b.example");
    outgoing.connection().send(&spoofed).await.unwrap();
    assert!(wait_incoming(&b, "a.example", false).await);
    assert!(wait_outgoing_gone(&a, "b.example").await);
}

#[tokio::test]
async fn blocked_remote_is_refused_before_connecting() {
    use parley_common::config::PermissionPolicy;
    use parley_federation::access::ListAccessPolicy;

    let net = MemoryNetwork::new();
    let a = Federation::builder(settings("a.example", &[]), DialbackSecret::new("secret-a"))
        .resolver(net.clone())
        .connector(net.clone())
        .access(Arc::new(ListAccessPolicy::new(
            PermissionPolicy::Blacklist,
            vec!["b.example".to_string()],
            Vec::new(),
        )))
        .build();
    let _b = server(&net, "b.example", &[], "secret-b");

    assert!(!a.authenticate_domain("a.example", "b.example").await);
    assert_eq!(net.dials("b.example"), 0);
}

#[tokio::test]
async fn verify_request_on_fresh_stream_is_answered_then_closed() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");

    let (stream, _header) = open_raw(&net, "b.example", "a.example").await;
    let key = a.secret().derive("S-elsewhere");
    stream
        .send(&DialbackVerify::request("b.example", "a.example", "S-elsewhere", &key).to_element())
        .await
        .unwrap();

    let el = stream.expect_element(Duration::from_secs(5)).await.unwrap();
    let response = DialbackVerify::parse(&el).unwrap();
    assert_eq!(response.verdict, Some(Verdict::Valid));
    assert_eq!(response.id, "S-elsewhere");
    assert!(stream.read_element().await.unwrap().is_none());
    // The authority never creates sessions.
    assert!(a.registry().incoming("b.example").await.is_empty());
}

#[tokio::test]
async fn verify_response_with_wrong_id_fails_the_offer() {
    let condition =
        offer_with_rogue_authority(|r| DialbackVerify::response(&r.to, &r.from, "not-the-stream", Verdict::Valid))
            .await;
    assert_eq!(condition, StreamErrorCondition::InvalidId);
}

#[tokio::test]
async fn verify_response_from_another_domain_fails_the_offer() {
    let condition =
        offer_with_rogue_authority(|r| DialbackVerify::response("c.example", &r.from, &r.id, Verdict::Valid)).await;
    assert_eq!(condition, StreamErrorCondition::InvalidFrom);
}

#[tokio::test]
async fn verify_response_to_another_domain_fails_the_offer() {
    let condition =
        offer_with_rogue_authority(|r| DialbackVerify::response(&r.to, "c.example", &r.id, Verdict::Valid)).await;
    assert_eq!(condition, StreamErrorCondition::HostUnknown);
}

#[tokio::test]
async fn offers_from_blocked_domains_are_host_unknown() {
    use parley_common::config::PermissionPolicy;
    use parley_federation::access::ListAccessPolicy;

    let net = MemoryNetwork::new();
    let b = Federation::builder(settings("b.example", &[]), DialbackSecret::new("secret-b"))
        .resolver(net.clone())
        .connector(net.clone())
        .access(Arc::new(ListAccessPolicy::new(
            PermissionPolicy::Blacklist,
            vec!["a.example".to_string()],
            Vec::new(),
        )))
        .build();
    serve(&net, &b, &["b.example"]);

    let (stream, _header) = open_raw(&net, "a.example", "b.example").await;
    stream
        .send(&DialbackResult::offer("a.example", "b.example", "some-key").to_element())
        .await
        .unwrap();
    let err = stream.expect_element(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, FederationError::PeerStreamError(StreamErrorCondition::HostUnknown)));
    assert_eq!(net.dials("a.example"), 0);
}

#[tokio::test]
async fn offers_for_foreign_domains_are_host_unknown() {
    let net = MemoryNetwork::new();
    let _a = server(&net, "a.example", &[], "secret-a");
    let _b = server(&net, "b.example", &[], "secret-b");

    let (stream, _header) = open_raw(&net, "a.example", "b.example").await;
    stream
        .send(&DialbackResult::offer("a.example", "c.example", "some-key").to_element())
        .await
        .unwrap();
    let err = stream.expect_element(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, FederationError::PeerStreamError(StreamErrorCondition::HostUnknown)));
    assert_eq!(net.dials("a.example"), 0);
}

#[tokio::test]
async fn overlapping_offers_for_one_pair_validate_once() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");
    let b = server(&net, "b.example", &[], "secret-b");

    let (first, first_header) = open_raw(&net, "a.example", "b.example").await;
    let (second, second_header) = open_raw(&net, "a.example", "b.example").await;
    for (stream, header) in [(&first, &first_header), (&second, &second_header)] {
        let key = a.secret().derive(header.id.as_deref().unwrap());
        stream
            .send(&DialbackResult::offer("a.example", "b.example", &key).to_element())
            .await
            .unwrap();
    }

    let (r1, r2) = tokio::join!(
        first.expect_element(Duration::from_secs(5)),
        second.expect_element(Duration::from_secs(5))
    );
    let outcomes = [r1, r2];
    let valid = outcomes
        .iter()
        .filter(|r| matches!(r, Ok(el) if el.attr("type") == Some("valid")))
        .count();
    let refused = outcomes
        .iter()
        .filter(|r| matches!(r, Err(FederationError::PeerStreamError(StreamErrorCondition::NotAuthorized))))
        .count();
    assert_eq!((valid, refused), (1, 1));
    assert_eq!(b.registry().incoming("a.example").await.len(), 1);
}

#[tokio::test]
async fn stanza_to_a_domain_not_validated_for_the_sender_closes_the_session() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");
    let b = server(&net, "b.example", &["muc.b.example"], "secret-b");

    assert!(a.authenticate_domain("a.example", "b.example").await);
    assert!(wait_incoming(&b, "a.example", true).await);
    let outgoing = a.registry().outgoing("b.example").await.unwrap();

    // muc.b.example is local to b, but a.example was only validated for b.example.
    let misaddressed = Element::new("message")
        .with_attr("from", "juliet@a.example")
        .with_attr("to", "room@muc.b.example");
    outgoing.deliver("a.example", &misaddressed).await.unwrap();
    assert!(wait_incoming(&b, "a.example", false).await);
}

#[tokio::test]
async fn reciprocal_session_is_aliased_for_the_peers_other_domain() {
    let net = MemoryNetwork::new();
    let a = server(&net, "a.example", &[], "secret-a");
    let b = server(&net, "b.example", &["muc.b.example"], "secret-b");

    // b.example's server connects to us as both of its domains.
    assert!(b.authenticate_domain("b.example", "a.example").await);
    assert!(b.authenticate_domain("muc.b.example", "a.example").await);
    assert!(wait_incoming(&a, "muc.b.example", true).await);

    assert!(a.authenticate_domain("a.example", "b.example").await);
    let dials = net.dials("muc.b.example");

    // Same peer server under another name: reuse, no new connection.
    assert!(a.authenticate_domain("a.example", "muc.b.example").await);
    assert_eq!(net.dials("muc.b.example"), dials);
    let to_b = a.registry().outgoing("b.example").await.unwrap();
    let to_muc = a.registry().outgoing("muc.b.example").await.unwrap();
    assert_eq!(to_b.id(), to_muc.id());
    assert_eq!(to_b.hostnames().await, vec!["b.example", "muc.b.example"]);
}

#[tokio::test]
async fn sasl_external_session_takes_further_domains_by_dialback() {
    let net = MemoryNetwork::new();
    let a = Federation::builder(settings("a.example", &["muc.a.example"]), DialbackSecret::new("secret-a"))
        .resolver(net.clone())
        .connector(net.clone())
        .tls(trusting_test_ca())
        .build();
    let (tx, mut offers) = mpsc::unbounded_channel();
    let mut listener = net.listen("b.example");
    tokio::spawn(async move {
        let conn = listener.recv().await.unwrap();
        sasl_peer(conn, tx).await;
    });

    assert!(a.authenticate_domain("a.example", "b.example").await);
    let outgoing = a.registry().outgoing("b.example").await.unwrap();
    assert_eq!(outgoing.method(), AuthMethod::SaslExternal);
    assert_eq!(outgoing.stream_id(), "S-sasl");
    assert!(outgoing.connection().is_secure());
    assert!(outgoing.uses_dialback());

    assert!(a.authenticate_domain("muc.a.example", "b.example").await);
    assert_eq!(offers.recv().await.as_deref(), Some("muc.a.example"));
    assert_eq!(outgoing.authenticated_domains().await, vec!["a.example", "muc.a.example"]);
    assert_eq!(net.dials("b.example"), 1);
}

#[tokio::test]
async fn untrusted_certificate_falls_back_to_plain_dialback() {
    let net = MemoryNetwork::new();
    let a = Federation::builder(settings("a.example", &[]), DialbackSecret::new("secret-a"))
        .resolver(net.clone())
        .connector(net.clone())
        .tls(system_roots_tls())
        .build();
    serve(&net, &a, &["a.example"]);
    let b = federation(&net, settings("b.example", &[]), "secret-b");
    serve_after_first(&net, &b, "b.example", |conn| async move {
        let transport = proceed_to_tls(conn).await;
        let _ = b_example_tls().accept(transport, Duration::from_secs(5)).await;
    });

    assert!(a.authenticate_domain("a.example", "b.example").await);
    assert_eq!(net.dials("b.example"), 2);
    let outgoing = a.registry().outgoing("b.example").await.unwrap();
    assert_eq!(outgoing.method(), AuthMethod::Dialback);
    assert!(!outgoing.connection().is_secure());
}

#[tokio::test]
async fn silent_tls_handshake_times_out_and_falls_back() {
    let net = MemoryNetwork::new();
    let mut cfg = settings("a.example", &[]);
    cfg.read_timeout = Duration::from_millis(300);
    let a = Federation::builder(cfg, DialbackSecret::new("secret-a"))
        .resolver(net.clone())
        .connector(net.clone())
        .tls(system_roots_tls())
        .build();
    serve(&net, &a, &["a.example"]);
    let b = federation(&net, settings("b.example", &[]), "secret-b");
    serve_after_first(&net, &b, "b.example", |conn| async move {
        // Answer <proceed/>, then never speak TLS.
        let _transport = proceed_to_tls(conn).await;
        std::future::pending::<()>().await;
    });

    let attempt = a.authenticate_domain("a.example", "b.example");
    let authenticated = tokio::time::timeout(Duration::from_secs(10), attempt)
        .await
        .expect("authentication must not hang on the TLS handshake");
    assert!(authenticated);
    assert_eq!(net.dials("b.example"), 2);
    assert!(a.registry().outgoing("b.example").await.unwrap().uses_dialback());
}
