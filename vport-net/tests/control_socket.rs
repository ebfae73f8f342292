//! Control socket integration tests
//!
//! Drive the daemon over a real Unix datagram socket, the way the `vport`
//! command does.

mod harness;

use std::time::{Duration, Instant};

use harness::daemon::TestDaemon;
use tempfile::TempDir;
use tokio::net::UnixDatagram;
use vport_net::Frame;
use vport_net::client::{ClientError, ControlClient};
use vport_net::protocol::{REQUEST_LEN, Reply, ResultCode};

#[tokio::test]
async fn test_round_trip_over_socket() {
    let _ = tracing_subscriber::fmt::try_init();
    let daemon = TestDaemon::start();
    let mut client = daemon.client();

    assert_eq!(client.add("veth0").await.unwrap(), Reply::ok());
    assert_eq!(client.add("veth1").await.unwrap(), Reply::ok());
    assert_eq!(
        client.connect_ports("veth0", "veth1").await.unwrap(),
        Reply::ok()
    );

    let reply = client.dump("veth0").await.unwrap();
    assert_eq!(reply.result, ResultCode::Ok);
    assert_eq!(reply.port, "veth1");

    assert_eq!(client.disconnect("veth0").await.unwrap(), Reply::ok());

    let reply = client.dump("veth0").await.unwrap();
    assert_eq!(reply.result, ResultCode::Ok);
    assert_eq!(reply.port, "");

    assert_eq!(client.remove("veth0").await.unwrap(), Reply::ok());
    assert_eq!(client.remove("veth1").await.unwrap(), Reply::ok());

    assert!(daemon.links.registry().is_empty());
    daemon.stop().await;
}

#[tokio::test]
async fn test_error_codes_over_socket() {
    let daemon = TestDaemon::start_with_max_ports(3);
    let mut client = daemon.client();

    client.add("a").await.unwrap();
    assert_eq!(
        client.add("a").await.unwrap().result,
        ResultCode::PortAlreadyExists
    );
    assert_eq!(
        client.remove("nope").await.unwrap().result,
        ResultCode::NoSuchDevice
    );
    assert_eq!(
        client.dump("nope").await.unwrap().result,
        ResultCode::NoSuchDevice
    );

    client.add("b").await.unwrap();
    client.add("c").await.unwrap();
    assert_eq!(client.add("d").await.unwrap().result, ResultCode::NoMemory);

    client.connect_ports("a", "b").await.unwrap();
    assert_eq!(
        client.connect_ports("a", "c").await.unwrap().result,
        ResultCode::DeviceBusy
    );
    assert_eq!(
        client.remove("a").await.unwrap().result,
        ResultCode::DeviceBusy
    );
    assert_eq!(client.dump("a").await.unwrap().port, "b");

    daemon.host.refuse_registrations(true);
    client.remove("c").await.unwrap();
    assert_eq!(
        client.add("c").await.unwrap().result,
        ResultCode::CannotRegisterDevice
    );
    // names the host cannot represent
    assert_eq!(
        client.add("bad/name").await.unwrap().result,
        ResultCode::CannotRegisterDevice
    );

    daemon.stop().await;
}

#[tokio::test]
async fn test_unknown_action_over_socket() {
    let daemon = TestDaemon::start();
    let mut client = daemon.client();

    for action in [5u32, 99, u32::MAX] {
        let mut datagram = [0u8; REQUEST_LEN];
        datagram[..4].copy_from_slice(&action.to_ne_bytes());
        datagram[4..9].copy_from_slice(b"veth0");

        let reply = client.send_raw(&datagram).await.unwrap();
        assert_eq!(reply, Reply::with_code(ResultCode::UnknownAction));
    }

    // a truncated datagram still gets exactly one reply
    let reply = client.send_raw(&[0u8; 3]).await.unwrap();
    assert_eq!(reply.result, ResultCode::UnknownAction);

    assert!(daemon.links.registry().is_empty());
    daemon.stop().await;
}

#[tokio::test]
async fn test_long_name_rejected_before_sending() {
    let daemon = TestDaemon::start();
    let mut client = daemon.client();

    let err = client.add("abcdefghijklmnop").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidName { .. }));

    let err = client
        .connect_ports("veth0", "abcdefghijklmnop")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidName { .. }));

    // the socket is still in sync: the next reply belongs to the next request
    assert_eq!(client.add("abcdefghijklmno").await.unwrap(), Reply::ok());
    daemon.stop().await;
}

#[tokio::test]
async fn test_frames_follow_links() {
    let daemon = TestDaemon::start();
    let mut client = daemon.client();

    client.add("a").await.unwrap();
    client.add("b").await.unwrap();
    client.connect_ports("a", "b").await.unwrap();

    let a = daemon.host.device("a").unwrap();
    let b = daemon.host.device("b").unwrap();
    assert!(a.carrier());
    assert!(b.carrier());

    a.send(Frame::new(b"hello from a".to_vec())).unwrap();
    b.send(Frame::new(b"hello from b".to_vec())).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while daemon.engine.stats().forwarded < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        b.take_received(),
        vec![Frame::new(b"hello from a".to_vec())]
    );
    assert_eq!(
        a.take_received(),
        vec![Frame::new(b"hello from b".to_vec())]
    );

    client.disconnect("b").await.unwrap();
    assert!(!a.carrier());
    assert!(!b.carrier());

    daemon.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients() {
    let daemon = TestDaemon::start();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let mut client = daemon.client();
        tasks.push(tokio::spawn(async move {
            let (left, right) = (format!("l{i}"), format!("r{i}"));
            client.add(&left).await.unwrap();
            client.add(&right).await.unwrap();
            client.connect_ports(&left, &right).await.unwrap();
            client.dump(&left).await.unwrap()
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let reply = task.await.unwrap();
        assert_eq!(reply.result, ResultCode::Ok);
        assert_eq!(reply.port, format!("r{i}"));
    }

    assert_eq!(daemon.links.registry().len(), 16);
    daemon.stop().await;
}

#[tokio::test]
async fn test_socket_removed_on_shutdown() {
    let daemon = TestDaemon::start();
    let path = daemon.socket_path().to_path_buf();
    let mut client = daemon.client();
    client.add("a").await.unwrap();
    client.add("b").await.unwrap();
    client.connect_ports("a", "b").await.unwrap();
    let host = std::sync::Arc::clone(&daemon.host);

    assert!(path.exists());
    daemon.stop().await;

    assert!(!path.exists());
    assert_eq!(host.device_count(), 0);
}

#[tokio::test]
async fn test_late_reply_not_taken_for_next() {
    let tmp_dir = TempDir::new().unwrap();
    let server_path = tmp_dir.path().join("silent.sock");
    let server = UnixDatagram::bind(&server_path).unwrap();
    let mut client = ControlClient::connect(&server_path, Duration::from_millis(50)).unwrap();

    // first request goes unanswered until the client gives up
    let err = client.add("veth0").await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    let mut buf = [0u8; REQUEST_LEN];
    let (_, addr) = server.recv_from(&mut buf).await.unwrap();
    let client_path = addr.as_pathname().unwrap().to_path_buf();
    server
        .send_to(
            &Reply::with_code(ResultCode::PortAlreadyExists).encode(),
            &client_path,
        )
        .await
        .unwrap();

    let answer = async {
        server.recv_from(&mut buf).await.unwrap();
        server
            .send_to(&Reply::with_code(ResultCode::NoSuchDevice).encode(), &client_path)
            .await
            .unwrap();
    };
    let (reply, ()) = tokio::join!(client.dump("veth0"), answer);
    assert_eq!(reply.unwrap(), Reply::with_code(ResultCode::NoSuchDevice));
}
