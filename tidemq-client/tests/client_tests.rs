use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tidemq::protocol::{response_code, RemotingCommand};
use tidemq::remoting::{RemotingServer, RequestHandler};
use tidemq::transport::ConnectionContext;
use tidemq::{RemotingConfig, Result};
use tidemq_client::{ClientConfig, RemotingClient};

const ECHO_CODE: i32 = 100;

struct EchoHandler;

#[async_trait::async_trait]
impl RequestHandler for EchoHandler {
    async fn process(
        &self,
        _ctx: &Arc<ConnectionContext>,
        request: &RemotingCommand,
    ) -> Result<Option<RemotingCommand>> {
        let mut response = RemotingCommand::create_response(response_code::SUCCESS, None);
        response.body = request.body.clone();
        Ok(Some(response))
    }
}

async fn start_server() -> (RemotingServer, String) {
    let config = RemotingConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        idle_timeout_secs: 0,
        ..RemotingConfig::default()
    };
    let server = RemotingServer::new(config).unwrap();
    server.register_handler(ECHO_CODE, Arc::new(EchoHandler));
    let addr = server.start().await.unwrap();
    (server, addr.to_string())
}

fn start_client() -> RemotingClient {
    let client = RemotingClient::new(ClientConfig::default()).unwrap();
    client.start();
    client
}

#[tokio::test]
async fn explicit_address_round_trip() {
    let (server, addr) = start_server().await;
    let client = start_client();

    let mut request = RemotingCommand::create_request(ECHO_CODE);
    request.body = Bytes::from_static(b"hello broker");
    let response = client.invoke_sync(&addr, request, 3000).await.unwrap();
    assert_eq!(response.code, response_code::SUCCESS);
    assert_eq!(response.body, Bytes::from_static(b"hello broker"));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn choose_address_tracks_live_connections() {
    let (server, addr) = start_server().await;
    let client = start_client();
    client.update_server_addresses(&[addr.clone()]);

    // Known but not yet connected: nothing is choosable.
    assert_eq!(client.choose_address(), None);

    // An explicit invoke establishes the connection...
    client
        .invoke_sync(&addr, RemotingCommand::create_request(ECHO_CODE), 3000)
        .await
        .unwrap();

    // ...after which the rotation finds it, and empty destinations resolve.
    assert_eq!(client.choose_address(), Some(addr.clone()));
    let response = client
        .invoke_sync("", RemotingCommand::create_request(ECHO_CODE), 3000)
        .await
        .unwrap();
    assert_eq!(response.code, response_code::SUCCESS);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn choose_address_prefers_the_last_used_live_address() {
    let (server_a, addr_a) = start_server().await;
    let (server_b, addr_b) = start_server().await;
    let client = start_client();
    client.update_server_addresses(&[addr_a.clone(), addr_b.clone()]);

    client
        .invoke_sync(&addr_a, RemotingCommand::create_request(ECHO_CODE), 3000)
        .await
        .unwrap();
    client
        .invoke_sync(&addr_b, RemotingCommand::create_request(ECHO_CODE), 3000)
        .await
        .unwrap();

    // Force a choice, then make sure it is sticky while the connection lives.
    let first = client.choose_address().unwrap();
    for _ in 0..5 {
        assert_eq!(client.choose_address(), Some(first.clone()));
    }

    client.shutdown().await;
    server_a.shutdown().await;
    server_b.shutdown().await;
}

#[tokio::test]
async fn choose_address_rotates_to_a_live_server_after_eviction() {
    let (server_a, addr_a) = start_server().await;
    let (server_b, addr_b) = start_server().await;
    let client = start_client();
    client.update_server_addresses(&[addr_a.clone(), addr_b.clone()]);

    client
        .invoke_sync(&addr_a, RemotingCommand::create_request(ECHO_CODE), 3000)
        .await
        .unwrap();
    client
        .invoke_sync(&addr_b, RemotingCommand::create_request(ECHO_CODE), 3000)
        .await
        .unwrap();
    let first = client.choose_address().unwrap();

    // Kill the chosen server; its connection drains out of the client table.
    let (dead, alive_server, alive_addr) = if first == addr_a {
        (server_a, server_b, addr_b.clone())
    } else {
        (server_b, server_a, addr_a.clone())
    };
    dead.shutdown().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.has_connection(&first));

    // The rotation skips the dead address and lands on the live one.
    assert_eq!(client.choose_address(), Some(alive_addr.clone()));
    let response = client
        .invoke_sync("", RemotingCommand::create_request(ECHO_CODE), 3000)
        .await
        .unwrap();
    assert_eq!(response.code, response_code::SUCCESS);

    client.shutdown().await;
    alive_server.shutdown().await;
}
