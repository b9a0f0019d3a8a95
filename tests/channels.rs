//! End-to-end tests over real loopback sockets, per channel discipline, with and
//!  without packet loss.

mod support;

use lattice::{ChannelKind, ClientContext, Config, Connection, ServerContext};
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use support::{Collector, LossyRelay};
use tokio::time::{sleep, timeout, Instant};

const COUNT: i32 = 1000;
const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const OUTER_TIMEOUT: Duration = Duration::from_secs(60);

fn config_with(kind: ChannelKind) -> Config {
    Config::new(vec![kind])
}

async fn send_integers(conn: &Arc<Connection>, count: i32) {
    for i in 0..count {
        conn.send(0, |msg| msg.write_all(&i.to_le_bytes()))
            .await
            .unwrap();
    }
}

/// polls both contexts until the client-side predicate holds or the deadline passes
async fn poll_until(
    server: &ServerContext,
    client: &ClientContext,
    server_handler: &mut Collector,
    client_handler: &mut Collector,
    mut done: impl FnMut(&Collector, &Collector) -> bool,
) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        server.poll_events(server_handler);
        client.poll_events(client_handler);
        if done(server_handler, client_handler) {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("test did not reach its goal within {:?}", TEST_TIMEOUT);
}

async fn shutdown(
    server: ServerContext,
    client: ClientContext,
    server_handler: &mut Collector,
    client_handler: &mut Collector,
) {
    client.stop().await;
    server.stop().await;

    // drain the final disconnect events
    sleep(Duration::from_millis(50)).await;
    server.poll_events(server_handler);
    client.poll_events(client_handler);

    server_handler.assert_no_error_disconnects();
    client_handler.assert_no_error_disconnects();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reliable_ordered_perfect_conditions() {
    timeout(OUTER_TIMEOUT, async {
        let config = config_with(ChannelKind::ReliableOrdered);
        let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client =
            ClientContext::connect(config, "127.0.0.1:0".parse().unwrap(), server.local_addr())
                .await
                .unwrap();

        let mut server_handler = Collector::default();
        let mut client_handler = Collector::default();

        // wait for the server to see the connection, then blast the integers
        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |s, _| !s.connections.is_empty(),
        )
        .await;
        send_integers(&server_handler.connections[0], COUNT).await;

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |_, c| c.received.len() >= COUNT as usize,
        )
        .await;

        assert_eq!(
            client_handler.received_i32s(),
            (0..COUNT).collect::<Vec<_>>()
        );

        shutdown(server, client, &mut server_handler, &mut client_handler).await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reliable_ordered_under_loss() {
    timeout(OUTER_TIMEOUT, async {
        let config = config_with(ChannelKind::ReliableOrdered);
        let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let relay = LossyRelay::start(server.local_addr(), 0.25, 7).await;
        let client = ClientContext::connect(config, "127.0.0.1:0".parse().unwrap(), relay.addr())
            .await
            .unwrap();

        let mut server_handler = Collector::default();
        let mut client_handler = Collector::default();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |s, _| !s.connections.is_empty(),
        )
        .await;
        send_integers(&server_handler.connections[0], COUNT).await;

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |_, c| c.received.len() >= COUNT as usize,
        )
        .await;

        // no gaps, no duplicates, in order, despite 25% loss in each direction
        assert_eq!(
            client_handler.received_i32s(),
            (0..COUNT).collect::<Vec<_>>()
        );

        shutdown(server, client, &mut server_handler, &mut client_handler).await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reliable_unordered_under_loss() {
    timeout(OUTER_TIMEOUT, async {
        let config = config_with(ChannelKind::ReliableUnordered);
        let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let relay = LossyRelay::start(server.local_addr(), 0.25, 11).await;
        let client = ClientContext::connect(config, "127.0.0.1:0".parse().unwrap(), relay.addr())
            .await
            .unwrap();

        let mut server_handler = Collector::default();
        let mut client_handler = Collector::default();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |_, c| !c.connections.is_empty(),
        )
        .await;
        send_integers(&client_handler.connections[0], COUNT).await;

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |s, _| s.received.len() >= COUNT as usize,
        )
        .await;

        // every integer exactly once, in no particular order
        let received = server_handler.received_i32s();
        assert_eq!(received.len(), COUNT as usize);
        let distinct: BTreeSet<i32> = received.iter().copied().collect();
        assert_eq!(distinct, (0..COUNT).collect::<BTreeSet<_>>());

        shutdown(server, client, &mut server_handler, &mut client_handler).await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reliable_sequenced_delivers_strictly_increasing() {
    timeout(OUTER_TIMEOUT, async {
        let config = config_with(ChannelKind::ReliableSequenced);
        let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client =
            ClientContext::connect(config, "127.0.0.1:0".parse().unwrap(), server.local_addr())
                .await
                .unwrap();

        let mut server_handler = Collector::default();
        let mut client_handler = Collector::default();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |_, c| !c.connections.is_empty(),
        )
        .await;
        send_integers(&client_handler.connections[0], COUNT).await;

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |s, _| s.received_i32s().last() == Some(&(COUNT - 1)),
        )
        .await;

        let received = server_handler.received_i32s();
        assert!(
            received.windows(2).all(|w| w[0] < w[1]),
            "sequence not strictly increasing: {:?}",
            received
        );
        assert_eq!(*received.last().unwrap(), COUNT - 1);

        shutdown(server, client, &mut server_handler, &mut client_handler).await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreliable_sequenced_under_loss() {
    timeout(OUTER_TIMEOUT, async {
        let config = config_with(ChannelKind::UnreliableSequenced);
        let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let relay = LossyRelay::start(server.local_addr(), 0.25, 13).await;
        let client = ClientContext::connect(config, "127.0.0.1:0".parse().unwrap(), relay.addr())
            .await
            .unwrap();

        let mut server_handler = Collector::default();
        let mut client_handler = Collector::default();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |_, c| !c.connections.is_empty(),
        )
        .await;

        let conn = client_handler.connections[0].clone();
        for i in 0..COUNT {
            conn.send(0, |msg| msg.write_all(&i.to_le_bytes()))
                .await
                .unwrap();
            // pace the datagrams a little so the loopback does not reorder wildly
            if i % 50 == 0 {
                sleep(Duration::from_millis(1)).await;
            }
        }

        // give the tail time to arrive, then evaluate whatever got through
        sleep(Duration::from_millis(500)).await;
        server.poll_events(&mut server_handler);

        let received = server_handler.received_i32s();
        assert!(!received.is_empty(), "nothing survived the relay");
        assert!(
            received.windows(2).all(|w| w[0] < w[1]),
            "subsequence not strictly increasing: {:?}",
            received
        );

        shutdown(server, client, &mut server_handler, &mut client_handler).await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reliable_ordered_large_message() {
    timeout(OUTER_TIMEOUT, async {
        // a 200 KB message needs a run of 172 fragments
        let payload: Vec<u8> = (0..200 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();

        let config = config_with(ChannelKind::ReliableOrdered);
        let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client =
            ClientContext::connect(config, "127.0.0.1:0".parse().unwrap(), server.local_addr())
                .await
                .unwrap();

        let mut server_handler = Collector::default();
        let mut client_handler = Collector::default();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |s, _| !s.connections.is_empty(),
        )
        .await;

        let conn = server_handler.connections[0].clone();
        let to_send = payload.clone();
        conn.send(0, move |msg| msg.write_all(&to_send))
            .await
            .unwrap();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |_, c| !c.received.is_empty(),
        )
        .await;

        assert_eq!(client_handler.received.len(), 1);
        assert_eq!(client_handler.received[0].0, 0);
        assert_eq!(client_handler.received[0].1, payload);

        shutdown(server, client, &mut server_handler, &mut client_handler).await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_and_multi_channel_roundtrip() {
    timeout(OUTER_TIMEOUT, async {
        let config = Config::new(vec![
            ChannelKind::ReliableOrdered,
            ChannelKind::UnreliableUnordered,
        ]);
        let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client =
            ClientContext::connect(config, "127.0.0.1:0".parse().unwrap(), server.local_addr())
                .await
                .unwrap();

        let mut server_handler = Collector::default();
        let mut client_handler = Collector::default();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |_, c| !c.connections.is_empty(),
        )
        .await;

        let conn = client_handler.connections[0].clone();
        conn.send(0, |_| Ok(())).await.unwrap();
        conn.send(1, |msg| msg.write_all(b"datagram"))
            .await
            .unwrap();
        conn.send(0, |msg| msg.write_all(b"stream")).await.unwrap();

        poll_until(
            &server,
            &client,
            &mut server_handler,
            &mut client_handler,
            |s, _| s.received.iter().filter(|(ch, _)| *ch == 0).count() >= 2,
        )
        .await;

        let reliable: Vec<&(u8, Vec<u8>)> = server_handler
            .received
            .iter()
            .filter(|(ch, _)| *ch == 0)
            .collect();
        assert_eq!(reliable[0].1, Vec::<u8>::new());
        assert_eq!(reliable[1].1, b"stream".to_vec());

        shutdown(server, client, &mut server_handler, &mut client_handler).await;
    })
    .await
    .unwrap();
}
