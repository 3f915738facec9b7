//! Integration tests for the provisioning pipeline
//!
//! These drive the public API end to end: DHCP packets in, leases and
//! nodes out; mirror requests against a local upstream archive; TFTP
//! transfers over loopback.

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode};
use dhcproto::Encodable;
use netboot_store::{MacAddress, MemoryStore, NewKernel, Node, NodeStage, Repository};
use pxe_server::commands::CommandExecutor;
use pxe_server::config::Config;
use pxe_server::dhcp::{self, DhcpServer};
use pxe_server::tftp::{ErrorCode, Packet, TftpServer};
use pxe_server::{PxeError, PxeServer};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tower::ServiceExt;

/// Command channel for nodes that are never reached
struct OfflineExecutor;

#[async_trait::async_trait]
impl CommandExecutor for OfflineExecutor {
    async fn exec(&self, node: &Node, command: &str) -> Result<String, PxeError> {
        Err(PxeError::Command(format!("{} is offline ({})", node.hostname, command)))
    }
}

fn server(config: Config, store: Arc<MemoryStore>) -> PxeServer {
    PxeServer::with_executor(config, store, Arc::new(OfflineExecutor)).expect("Failed to create server")
}

fn dhcp_packet(message_type: MessageType, mac: &MacAddress) -> Vec<u8> {
    let mut msg = Message::new_with_id(
        0x1234_5678,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        &mac.octets(),
    );
    msg.set_opcode(Opcode::BootRequest);
    msg.opts_mut().insert(DhcpOption::MessageType(message_type));
    msg.to_vec().expect("Failed to encode packet")
}

#[tokio::test]
async fn test_discover_then_request_for_unseen_mac() {
    let store = Arc::new(MemoryStore::new());
    let server = server(Config::default(), store.clone());
    let dhcp = DhcpServer::new(server.leases().clone(), server.metrics().clone());
    let mac: MacAddress = "aa:bb:cc:dd:ee:01".parse().unwrap();
    let peer: SocketAddr = "0.0.0.0:68".parse().unwrap();

    let offer = dhcp
        .handle_datagram(&dhcp_packet(MessageType::Discover, &mac), peer)
        .await
        .expect("DISCOVER must be answered");
    assert_eq!(offer.opts().msg_type(), Some(MessageType::Offer));
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(10, 1, 10, 10));

    let ack = dhcp
        .handle_datagram(&dhcp_packet(MessageType::Request, &mac), peer)
        .await
        .expect("REQUEST must be answered");
    assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr(), Ipv4Addr::new(10, 1, 10, 10));

    let lease = store.find_lease_by_mac(&mac).await.unwrap().unwrap();
    assert_eq!(lease.ip, Ipv4Addr::new(10, 1, 10, 10));
    assert!(lease.request_time.is_some());

    let node = server.nodes().lookup(lease.ip).await.unwrap();
    assert_eq!(node.mac, Some(mac));
    assert_eq!(node.lease, Some(lease.id));
}

#[tokio::test]
async fn test_removed_node_releases_its_lease() {
    let store = Arc::new(MemoryStore::new());
    let server = server(Config::default(), store.clone());
    let watcher = tokio::spawn(dhcp::watch_node_events(
        server.leases().clone(),
        server.nodes().subscribe(),
    ));
    let mac: MacAddress = "aa:bb:cc:dd:ee:02".parse().unwrap();

    let lease = server.leases().allocate(mac).await.unwrap();
    let node = server.nodes().lookup(lease.ip).await.unwrap();
    server.nodes().remove(node.id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.find_lease_by_mac(&mac).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("lease was not released");
    watcher.abort();
}

#[tokio::test]
async fn test_mirror_downloads_kernel_artifact() {
    const PATH: &str = "/alpine/netboot/3.14.0/vmlinuz-lts";
    let payload: Vec<u8> = (0..65_536u32).map(|i| (i % 253) as u8).collect();

    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = {
        let hits = hits.clone();
        let payload = payload.clone();
        Router::new().route(
            PATH,
            get(move || {
                let hits = hits.clone();
                let payload = payload.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    payload
                }
            }),
        )
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let archive = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, upstream).await.unwrap() });

    let root = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.http.root = root.path().to_path_buf();
    config.kernels.seed = vec![NewKernel {
        name: "alpine".to_string(),
        version: "3.14.0".to_string(),
        vmlinuz: PATH.to_string(),
        initramfs: "/alpine/netboot/3.14.0/initramfs-lts".to_string(),
        archive: Some(archive),
        ..Default::default()
    }];
    let store = Arc::new(MemoryStore::new());
    let server = server(config, store);
    assert_eq!(server.seed_kernels().await.unwrap(), 1);
    assert_eq!(server.seed_kernels().await.unwrap(), 0);

    let app = pxe_server::http::router(server.http_state())
        .layer(MockConnectInfo(SocketAddr::from(([10, 1, 10, 10], 50000))));
    let response = app
        .oneshot(Request::builder().uri(PATH).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], payload.len().to_string().as_str());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), payload.as_slice());

    let entry = server.mirror().get(PATH).expect("cache entry");
    assert!(entry.is_downloaded);
    assert_eq!(entry.size, payload.len() as u64);
    assert_eq!(std::fs::read(root.path().join("alpine/netboot/3.14.0/vmlinuz-lts")).unwrap(), payload);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tftp_missing_file_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.tftp.address = Ipv4Addr::LOCALHOST;
    config.tftp.root = root.path().to_path_buf();
    let store = Arc::new(MemoryStore::new());
    let pxe = server(config.clone(), store.clone());
    let tftp = Arc::new(TftpServer::new(
        config.tftp,
        store,
        pxe.nodes().clone(),
        pxe.generator(),
        pxe.metrics().clone(),
    ));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client.local_addr().unwrap();
    let transfer = {
        let tftp = tftp.clone();
        tokio::spawn(async move { tftp.read_request(client_addr, "ipxe.efi", &Vec::new()).await })
    };

    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("server answered")
        .unwrap();
    match Packet::decode(&buf[..len]).unwrap() {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("expected an error packet, got {:?}", other),
    }
    assert!(matches!(transfer.await.unwrap(), Err(PxeError::FileNotFound(_))));
}

#[tokio::test]
async fn test_provisioned_node_gets_no_boot_file() {
    let store = Arc::new(MemoryStore::new());
    let server = server(Config::default(), store);
    let dhcp = DhcpServer::new(server.leases().clone(), server.metrics().clone());
    let mac: MacAddress = "aa:bb:cc:dd:ee:03".parse().unwrap();
    let peer: SocketAddr = "0.0.0.0:68".parse().unwrap();

    let offer = dhcp
        .handle_datagram(&dhcp_packet(MessageType::Discover, &mac), peer)
        .await
        .unwrap();
    assert!(offer.opts().get(dhcproto::v4::OptionCode::BootfileName).is_some());

    let node = server.nodes().lookup(offer.yiaddr()).await.unwrap();
    server.nodes().advance_stage(node.id, NodeStage::Provisioned).await.unwrap();

    let ack = dhcp
        .handle_datagram(&dhcp_packet(MessageType::Request, &mac), peer)
        .await
        .unwrap();
    assert!(ack.opts().get(dhcproto::v4::OptionCode::BootfileName).is_none());
    assert!(ack.opts().get(dhcproto::v4::OptionCode::TFTPServerName).is_none());
}
