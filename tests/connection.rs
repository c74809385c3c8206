//! End-to-end tests running two engines over an in-memory network.

use elvis_tcp::{
    tcp::ParseError, Connection, ConnectionId, Datagram, DemuxError, Endpoint, Ipv4Address,
    Message, NotifyType, ReadFlags, Route, Router, SocketEvents, State, Tcp, TcpConfig, TcpError,
    TransmitError,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedSender};

const CLIENT: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
const NOWHERE: Ipv4Address = Ipv4Address::new([192, 168, 7, 7]);
const SERVICE: Endpoint = Endpoint::new(SERVER, 80);

/// One host's attachment to the shared wire.
struct Link {
    address: Ipv4Address,
    wire: UnboundedSender<Datagram>,
}

impl Router for Link {
    fn resolve_route(&self, destination: Ipv4Address) -> Option<Route> {
        (destination != NOWHERE).then_some(Route::new(self.address, 1500))
    }

    fn is_local(&self, address: Ipv4Address) -> bool {
        address == self.address
    }

    fn transmit(&self, _route: &Route, datagram: Datagram) -> Result<(), TransmitError> {
        self.wire
            .send(datagram)
            .map_err(|_| TransmitError::Unreachable)
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(ConnectionId, NotifyType)>>);

impl SocketEvents for Recorder {
    fn notify(&self, id: ConnectionId, notification: NotifyType) {
        self.0.lock().unwrap().push((id, notification));
    }
}

struct Hosts {
    client: Arc<Tcp>,
    server: Arc<Tcp>,
    server_events: Arc<Recorder>,
}

/// Connects a client and a server engine. With `loss`, that fraction of
/// datagrams is dropped, chosen by a seeded generator.
fn hosts(config: TcpConfig, loss: Option<f64>) -> Hosts {
    let (wire, mut rx) = mpsc::unbounded_channel::<Datagram>();
    let server_events = Arc::new(Recorder::default());
    let client = Tcp::new(
        Arc::new(Link {
            address: CLIENT,
            wire: wire.clone(),
        }),
        config.clone(),
    )
    .shared();
    let server = Tcp::new(
        Arc::new(Link {
            address: SERVER,
            wire,
        }),
        config,
    )
    .with_events(server_events.clone())
    .shared();
    client.start();
    server.start();

    let destinations: HashMap<_, _> = [(CLIENT, client.clone()), (SERVER, server.clone())]
        .into_iter()
        .collect();
    tokio::spawn(async move {
        let mut rng = SmallRng::seed_from_u64(0xfeed);
        while let Some(datagram) = rx.recv().await {
            if loss.is_some_and(|loss| rng.gen_bool(loss)) {
                continue;
            }
            if let Some(tcp) = destinations.get(&datagram.destination) {
                let _ = tcp.receive(datagram.source, datagram.destination, datagram.message);
            }
        }
    });

    Hosts {
        client,
        server,
        server_events,
    }
}

fn listener(tcp: &Arc<Tcp>, backlog: usize) -> Arc<Connection> {
    let listener = tcp.open();
    listener.bind(SERVICE).unwrap();
    listener.listen(backlog).unwrap();
    listener
}

async fn wait_for_state(connection: &Connection, state: State) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while connection.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stuck in {:?}, expected {state:?}", connection.state()));
}

async fn read_to_end(connection: &Arc<Connection>) -> Vec<u8> {
    let mut received = Vec::new();
    loop {
        let message = connection
            .read_data(4096, ReadFlags::default())
            .await
            .unwrap();
        if message.is_empty() {
            return received;
        }
        received.extend(message.iter());
    }
}

#[tokio::test(start_paused = true)]
async fn connect_send_read_close() -> anyhow::Result<()> {
    let hosts = hosts(TcpConfig::default(), None);
    let listener = listener(&hosts.server, 4);

    let client = hosts.client.open();
    client.connect(SERVICE).await?;
    assert_eq!(client.state(), State::Established);
    assert_eq!(client.local().address, CLIENT);
    assert!(hosts.client.config().ephemeral_ports.contains(&client.local().port));

    let server = listener.accept().await?;
    assert_eq!(server.peer(), client.local());
    assert_eq!(server.local(), SERVICE);

    client.send_data(Message::new(b"hello ")).await?;
    client.send_data(Message::new(b"world")).await?;
    client.close();

    assert_eq!(read_to_end(&server).await, b"hello world");
    assert_eq!(server.state(), State::FinishReceived);

    server.send_data(Message::new(b"goodbye")).await?;
    server.close();
    assert_eq!(read_to_end(&client).await, b"goodbye");

    wait_for_state(&client, State::TimeWait).await;
    wait_for_state(&server, State::Closed).await;
    assert_eq!(server.error(), None);
    // Only the listener is left on the server
    assert_eq!(hosts.server.connections(), 1);
    assert_eq!(hosts.client.connections(), 0);
    assert_eq!(hosts.client.time_wait_connections(), 1);

    tokio::time::sleep(hosts.client.config().time_wait() + Duration::from_secs(1)).await;
    assert_eq!(hosts.client.time_wait_connections(), 0);

    let events = hosts.server_events.0.lock().unwrap().clone();
    assert!(events
        .iter()
        .any(|(id, event)| id.local == SERVICE && *event == NotifyType::NewConnection));
    assert!(events.iter().any(|(_, event)| *event == NotifyType::Closed));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lossy_transfer_arrives_intact() -> anyhow::Result<()> {
    let config = TcpConfig {
        initial_rto: Duration::from_millis(200),
        max_retransmissions: 12,
        tick: Duration::from_millis(10),
        ..Default::default()
    };
    let hosts = hosts(config, Some(0.1));
    let listener = listener(&hosts.server, 1);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 251) as u8).collect();
    let client = hosts.client.open();
    let sender = {
        let client = client.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            client.connect(SERVICE).await?;
            for chunk in payload.chunks(3000) {
                client.send_data(Message::new(chunk)).await?;
            }
            client.shutdown(elvis_tcp::Direction::Write)?;
            Ok::<_, TcpError>(())
        })
    };

    let server = listener.accept().await?;
    let received = read_to_end(&server).await;
    sender.await??;
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connection_refused() {
    let hosts = hosts(TcpConfig::default(), None);
    let client = hosts.client.open();
    assert_eq!(
        client.connect(Endpoint::new(SERVER, 81)).await,
        Err(TcpError::ConnectionRefused)
    );
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.error(), Some(TcpError::ConnectionRefused));
    assert_eq!(hosts.client.connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn no_route_to_host() {
    let hosts = hosts(TcpConfig::default(), None);
    let client = hosts.client.open();
    assert_eq!(
        client.connect(Endpoint::new(NOWHERE, 80)).await,
        Err(TcpError::NoRoute)
    );
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test(start_paused = true)]
async fn accept_waits_are_bounded() {
    let hosts = hosts(TcpConfig::default(), None);
    let listener = listener(&hosts.server, 1);
    assert_eq!(listener.read_available(), Ok(0));

    listener.set_blocking(false);
    assert_eq!(listener.accept().await.unwrap_err(), TcpError::WouldBlock);

    listener.set_blocking(true);
    listener.set_receive_timeout(Some(Duration::from_secs(1)));
    assert_eq!(listener.accept().await.unwrap_err(), TcpError::TimedOut);

    // Closing the listener releases anyone waiting on it
    listener.set_receive_timeout(None);
    let waiter = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    listener.close();
    assert_eq!(
        waiter.await.unwrap().unwrap_err(),
        TcpError::ConnectionAborted
    );
    assert_eq!(hosts.server.connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn non_blocking_connection() {
    let hosts = hosts(TcpConfig::default(), None);
    let _listener = listener(&hosts.server, 1);

    let client = hosts.client.open();
    client.set_blocking(false);
    assert_eq!(client.connect(SERVICE).await, Err(TcpError::InProgress));
    assert_eq!(client.connect(SERVICE).await, Err(TcpError::AlreadyConnected));
    wait_for_state(&client, State::Established).await;

    assert_eq!(client.read_available(), Ok(0));
    assert_eq!(
        client.read_data(10, ReadFlags::default()).await,
        Err(TcpError::WouldBlock)
    );
    client.set_blocking(true);
    let flags = ReadFlags {
        dont_wait: true,
        ..Default::default()
    };
    assert_eq!(client.read_data(10, flags).await, Err(TcpError::WouldBlock));
}

#[tokio::test(start_paused = true)]
async fn backlog_limits_pending_connections() {
    let hosts = hosts(TcpConfig::default(), None);
    let listener = listener(&hosts.server, 1);

    let first = hosts.client.open();
    first.connect(SERVICE).await.unwrap();

    // The listener's only slot is taken until the first is accepted
    let second = hosts.client.open();
    second.set_send_timeout(Some(Duration::from_secs(2)));
    assert_eq!(second.connect(SERVICE).await, Err(TcpError::TimedOut));
    assert_eq!(listener.read_available(), Ok(1));

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.peer(), first.local());
}

#[tokio::test(start_paused = true)]
async fn reads_see_peer_data_and_peeks() {
    let hosts = hosts(TcpConfig::default(), None);
    let listener = listener(&hosts.server, 1);
    let client = hosts.client.open();
    client.connect(SERVICE).await.unwrap();
    let server = listener.accept().await.unwrap();

    client.send_data(Message::new(b"abcdef")).await.unwrap();
    let peek = ReadFlags {
        peek: true,
        wait_all: true,
        ..Default::default()
    };
    assert_eq!(server.read_data(6, peek).await.unwrap().to_vec(), b"abcdef");
    assert_eq!(server.read_available(), Ok(6));
    assert_eq!(
        server
            .read_data(4, ReadFlags::default())
            .await
            .unwrap()
            .to_vec(),
        b"abcd"
    );
    assert_eq!(server.read_available(), Ok(2));

    server.shutdown(elvis_tcp::Direction::Write).unwrap();
    assert_eq!(
        server.send_data(Message::new(b"late")).await,
        Err(TcpError::BrokenPipe)
    );
    assert_eq!(read_to_end(&client).await, b"");
}

#[tokio::test(start_paused = true)]
async fn send_preconditions() {
    let hosts = hosts(TcpConfig::default(), None);
    let listener = listener(&hosts.server, 1);
    assert_eq!(
        listener.send_data(Message::new(b"x")).await,
        Err(TcpError::NotSupported)
    );

    let client = hosts.client.open();
    assert_eq!(
        client.send_data(Message::new(b"x")).await,
        Err(TcpError::NotConnected)
    );
    client.connect(SERVICE).await.unwrap();
    let too_big = vec![0u8; hosts.client.config().send_buffer_size + 1];
    assert_eq!(
        client.send_data(Message::new(too_big)).await,
        Err(TcpError::MessageTooLong)
    );
    assert_eq!(
        client.send_available(),
        Ok(hosts.client.config().send_buffer_size)
    );
}

#[tokio::test(start_paused = true)]
async fn binding_rules() {
    let hosts = hosts(TcpConfig::default(), None);
    let first = hosts.server.open();
    let second = hosts.server.open();

    first.bind(SERVICE).unwrap();
    assert_eq!(first.bind(SERVICE), Err(TcpError::BadValue));
    assert_eq!(second.bind(SERVICE), Err(TcpError::AddressInUse));
    assert_eq!(
        second.bind(Endpoint::new(CLIENT, 80)),
        Err(TcpError::AddressNotAvailable)
    );
    assert_eq!(second.listen(1), Err(TcpError::DestinationRequired));

    second.bind(Endpoint::UNSPECIFIED).unwrap();
    assert!(hosts
        .server
        .config()
        .ephemeral_ports
        .contains(&second.local().port));

    first.unbind().unwrap();
    assert_eq!(first.unbind(), Err(TcpError::NotBound));
    second.unbind().unwrap();
    assert_eq!(hosts.server.connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn wildcard_listener_accepts() {
    let hosts = hosts(TcpConfig::default(), None);
    let listener = hosts.server.open();
    listener
        .bind(Endpoint::new(Ipv4Address::UNSPECIFIED, 80))
        .unwrap();
    listener.listen(2).unwrap();

    let client = hosts.client.open();
    client.connect(SERVICE).await.unwrap();
    let server = listener.accept().await.unwrap();
    assert_eq!(server.local(), SERVICE);
}

#[tokio::test(start_paused = true)]
async fn malformed_segments_are_rejected() {
    let hosts = hosts(TcpConfig::default(), None);
    assert_eq!(
        hosts
            .server
            .receive(CLIENT, SERVER, Message::new(vec![0u8; 5])),
        Err(DemuxError::Header(ParseError::HeaderTooShort))
    );
}
