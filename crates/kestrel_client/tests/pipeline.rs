//! End-to-end pipeline tests against an in-process wire server.
//!
//! The server speaks the real protocol over TCP: it parses auth frames and
//! request items and answers from a scripted response queue, so these tests
//! exercise dialing, pooled reuse, lazy authentication, the error frame
//! path and connection-fate decisions exactly as production traffic would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel_codec::{CborReader, CborWriter, CodecResult};
use kestrel_common::error::ERR_CODE_RESOURCE_NOT_FOUND;
use kestrel_common::{Config, Credentials, Fault, KestrelError, StaticCredentialsProvider};
use kestrel_client::node::{NodeApi, NodeClient, RequestOptions};
use kestrel_client::pool::TubePoolOptions;
use kestrel_client::service::{
    self, encode_endpoints_response, encode_error_frame, encode_success_marker, ServiceEndpoint,
    METHOD_AUTH, OP_GET_ITEM,
};
use kestrel_client::ClusterClient;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

enum ParsedRequest {
    Auth { access_key_id: String },
    Op,
}

fn skip_item(r: &mut CborReader<'_>) -> CodecResult<()> {
    kestrel_codec::decode_attribute_value(r).map(|_| ())
}

fn parse_request(r: &mut CborReader<'_>) -> CodecResult<ParsedRequest> {
    let len = r.read_array_len()?;
    let method = r.read_u64()?;
    if method == METHOD_AUTH {
        let access_key_id = r.read_string()?;
        if !r.try_read_null()? {
            r.read_string()?; // session token
        }
        r.read_string()?; // string to sign
        r.read_string()?; // signature
        r.read_string()?; // user agent
        return Ok(ParsedRequest::Auth { access_key_id });
    }
    for _ in 1..len {
        skip_item(r)?;
    }
    Ok(ParsedRequest::Op)
}

struct WireServer {
    addr: String,
    auth_frames: Arc<AtomicU32>,
    connections: Arc<AtomicU32>,
    seen_access_keys: Arc<Mutex<Vec<String>>>,
}

/// Serve scripted responses: each parsed operation consumes the next entry.
async fn spawn_wire_server(responses: Vec<Vec<u8>>) -> WireServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve_on(listener, responses)
}

fn serve_on(listener: TcpListener, responses: Vec<Vec<u8>>) -> WireServer {
    let addr = listener.local_addr().unwrap().to_string();
    let auth_frames = Arc::new(AtomicU32::new(0));
    let connections = Arc::new(AtomicU32::new(0));
    let seen_access_keys = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(Mutex::new(VecDeque::from(responses)));

    {
        let auth_frames = Arc::clone(&auth_frames);
        let connections = Arc::clone(&connections);
        let seen_access_keys = Arc::clone(&seen_access_keys);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                connections.fetch_add(1, Ordering::SeqCst);
                let auth_frames = Arc::clone(&auth_frames);
                let seen_access_keys = Arc::clone(&seen_access_keys);
                let responses = Arc::clone(&responses);
                tokio::spawn(async move {
                    let mut buf: Vec<u8> = Vec::new();
                    loop {
                        let parsed = {
                            let mut r = CborReader::new(&buf);
                            match parse_request(&mut r) {
                                Ok(req) => Some((r.consumed(), req)),
                                Err(e) if e.is_incomplete() => None,
                                Err(_) => return,
                            }
                        };
                        match parsed {
                            Some((consumed, req)) => {
                                buf.drain(..consumed);
                                match req {
                                    ParsedRequest::Auth { access_key_id } => {
                                        auth_frames.fetch_add(1, Ordering::SeqCst);
                                        seen_access_keys.lock().push(access_key_id);
                                    }
                                    ParsedRequest::Op => {
                                        // an exhausted script goes silent so
                                        // deadline tests see a stuck server
                                        let response = responses.lock().pop_front();
                                        if let Some(response) = response {
                                            if stream.write_all(&response).await.is_err() {
                                                return;
                                            }
                                        }
                                    }
                                }
                            }
                            None => {
                                let mut tmp = [0u8; 4096];
                                match stream.read(&mut tmp).await {
                                    Ok(0) | Err(_) => return,
                                    Ok(n) => buf.extend_from_slice(&tmp[..n]),
                                }
                            }
                        }
                    }
                });
            }
        });
    }

    WireServer { addr, auth_frames, connections, seen_access_keys }
}

fn success_response(body: impl FnOnce(&mut CborWriter)) -> Vec<u8> {
    let mut w = CborWriter::new();
    encode_success_marker(&mut w);
    body(&mut w);
    w.as_slice().to_vec()
}

fn error_response(codes: &[i32]) -> Vec<u8> {
    let mut w = CborWriter::new();
    encode_error_frame(&mut w, codes, "empty", "Message", Some("rid"), 500, Fault::Server, None);
    w.as_slice().to_vec()
}

fn credentials() -> Arc<StaticCredentialsProvider> {
    Arc::new(StaticCredentialsProvider::new(Credentials::new("AKIDEXAMPLE", "secret", None)))
}

fn node_client(addr: &str) -> Arc<NodeClient> {
    NodeClient::new(
        addr.to_string(),
        "us-east-1",
        credentials(),
        TubePoolOptions::default(),
        None,
    )
}

async fn invoke_reading_int(client: &NodeClient, opt: RequestOptions) -> Result<i64, KestrelError> {
    let enc = |w: &mut CborWriter| -> CodecResult<()> {
        w.write_array_header(2);
        w.write_u64(100);
        w.write_string("item-key");
        Ok(())
    };
    let mut out = 0i64;
    let mut dec = |r: &mut CborReader<'_>| -> CodecResult<()> {
        out = r.read_int()?;
        Ok(())
    };
    client
        .execute_with_retries(OP_GET_ITEM, opt, &enc, &mut dec)
        .await?;
    Ok(out)
}

#[tokio::test]
async fn test_execute_success_and_connection_reuse() {
    let server = spawn_wire_server(vec![
        success_response(|w| w.write_int(42)),
        success_response(|w| w.write_int(43)),
    ])
    .await;
    let client = node_client(&server.addr);

    assert_eq!(invoke_reading_int(&client, RequestOptions::default()).await.unwrap(), 42);
    assert_eq!(invoke_reading_int(&client, RequestOptions::default()).await.unwrap(), 43);

    assert_eq!(server.connections.load(Ordering::SeqCst), 1, "tube must be reused");
    assert_eq!(server.auth_frames.load(Ordering::SeqCst), 1, "auth must be cached per tube");
    assert_eq!(server.seen_access_keys.lock().as_slice(), ["AKIDEXAMPLE"]);
    client.close().await;
}

#[tokio::test]
async fn test_server_error_recycles_connection() {
    let server = spawn_wire_server(vec![
        error_response(&[4, 23, 24]),
        success_response(|w| w.write_int(7)),
    ])
    .await;
    let client = node_client(&server.addr);

    let err = invoke_reading_int(&client, RequestOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), Some(ERR_CODE_RESOURCE_NOT_FOUND), "translated on exhaustion");
    assert_eq!(err.code_sequence(), Some(&[4, 23, 24][..]));

    assert_eq!(invoke_reading_int(&client, RequestOptions::default()).await.unwrap(), 7);
    assert_eq!(
        server.connections.load(Ordering::SeqCst),
        1,
        "a drained server failure must not cost the connection"
    );
    client.close().await;
}

#[tokio::test]
async fn test_auth_failure_forces_reauthentication() {
    let server = spawn_wire_server(vec![
        error_response(&[4, 23, 31, 33]),
        success_response(|w| w.write_int(1)),
    ])
    .await;
    let client = node_client(&server.addr);

    let err = invoke_reading_int(&client, RequestOptions::default()).await.unwrap_err();
    assert!(err.auth_error());

    invoke_reading_int(&client, RequestOptions::default()).await.unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 1, "tube is recycled");
    assert_eq!(
        server.auth_frames.load(Ordering::SeqCst),
        2,
        "rejected credentials must re-authenticate on next use"
    );
    client.close().await;
}

#[tokio::test]
async fn test_malformed_response_discards_connection() {
    let server = spawn_wire_server(vec![
        // an integer where the error frame should be
        {
            let mut w = CborWriter::new();
            w.write_int(9);
            w.as_slice().to_vec()
        },
        success_response(|w| w.write_int(5)),
    ])
    .await;
    let client = node_client(&server.addr);

    let err = invoke_reading_int(&client, RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err, KestrelError::Deserialization(_)), "got {err:?}");

    assert_eq!(invoke_reading_int(&client, RequestOptions::default()).await.unwrap(), 5);
    assert_eq!(
        server.connections.load(Ordering::SeqCst),
        2,
        "a malformed response must discard the connection"
    );
    client.close().await;
}

#[tokio::test]
async fn test_deadline_expires_waiting_for_response() {
    // the server never answers: no scripted responses
    let server = spawn_wire_server(Vec::new()).await;
    let client = node_client(&server.addr);

    let opt = RequestOptions {
        deadline: Some(Instant::now() + Duration::from_millis(50)),
        ..Default::default()
    };
    let started = Instant::now();
    let err = invoke_reading_int(&client, opt).await.unwrap_err();
    assert!(err.is_canceled(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    client.close().await;
}

#[tokio::test]
async fn test_node_endpoints_rpc() {
    let roster = vec![ServiceEndpoint {
        node_id: 1,
        hostname: "node-1".into(),
        address: vec![127, 0, 0, 1],
        port: 8111,
        role: 1,
        availability_zone: "us-east-1a".into(),
        leader_session_id: 3,
    }];
    let roster_c = roster.clone();
    let server = spawn_wire_server(vec![success_response(move |w| {
        encode_endpoints_response(w, &roster_c)
    })])
    .await;
    let client = node_client(&server.addr);

    let got = NodeApi::endpoints(client.as_ref(), RequestOptions::default()).await.unwrap();
    assert_eq!(got, roster);
    client.close().await;
}

#[tokio::test]
async fn test_control_plane_lookups_are_cached() {
    let server = spawn_wire_server(vec![success_response(|w| {
        w.write_map_header(2);
        w.write_string("pk");
        w.write_string("S");
        w.write_string("sk");
        w.write_string("N");
    })])
    .await;
    let client = node_client(&server.addr);

    let schema = client.key_schema("orders", None).await.unwrap();
    assert_eq!(schema.len(), 2);
    assert_eq!(schema[0].name, "pk");

    // served from cache: the server has no more scripted responses
    let schema = client.key_schema("orders", None).await.unwrap();
    assert_eq!(schema[1].attribute_type, "N");

    // the empty attribute list never hits the wire
    assert_eq!(client.attribute_list_id(&[], None).await.unwrap(), 1);
    assert_eq!(client.attribute_list(1, None).await.unwrap().len(), 0);
    client.close().await;
}

#[tokio::test]
async fn test_cluster_client_end_to_end() {
    // bind first so the discovery response can advertise the server's own
    // address as the single cluster node
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let roster = vec![ServiceEndpoint {
        node_id: 1,
        hostname: "127.0.0.1".into(),
        address: vec![127, 0, 0, 1],
        port,
        role: 1,
        availability_zone: "us-east-1a".into(),
        leader_session_id: 1,
    }];
    let roster_c = roster.clone();
    let endpoints_response = success_response(move |w| {
        service::encode_endpoints_response(w, &roster_c)
    });

    // script: the discovery pull, then the routed data operation
    let server = serve_on(
        listener,
        vec![endpoints_response, success_response(|w| w.write_int(42))],
    );

    let config = Config {
        host_ports: vec![format!("dax://{}", server.addr)],
        region: "us-east-1".into(),
        credentials: Some(credentials()),
        ..Config::default()
    };
    let client = ClusterClient::new(config).await.unwrap();

    let enc = |w: &mut CborWriter| -> CodecResult<()> {
        w.write_array_header(2);
        w.write_u64(100);
        w.write_string("item-key");
        Ok(())
    };
    let mut out = 0i64;
    let mut dec = |r: &mut CborReader<'_>| -> CodecResult<()> {
        out = r.read_int()?;
        Ok(())
    };
    client
        .execute(OP_GET_ITEM, RequestOptions::default(), &enc, &mut dec)
        .await
        .unwrap();
    assert_eq!(out, 42);

    // discovery client plus the routed node client
    assert!(server.connections.load(Ordering::SeqCst) >= 2);
    client.close().await;
}
