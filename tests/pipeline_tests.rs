//! Pipeline integration tests
//!
//! Exercises the full three-stage pipeline against a simulated SSR server
//! built from the crate's own cipher contexts, without sockets.

use std::sync::Arc;

use ssrlocal::config::{Config, LocalConfig, RemoteConfig, TimeoutsConfig};
use ssrlocal::crypto::{CipherEnv, CipherMethod, DecryptCtx, EncryptCtx};
use ssrlocal::pipeline::CipherPipeline;
use ssrlocal::server::env::ServerEnv;

fn gateway_config(method: &str, obfs: &str) -> Config {
    Config {
        local: LocalConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 1080,
            udp: false,
            workers: 0,
        },
        server: RemoteConfig {
            remote_host: "203.0.113.9".to_string(),
            remote_port: 8388,
            password: "pipeline-pw".to_string(),
            method: method.to_string(),
            protocol: "origin".to_string(),
            protocol_param: String::new(),
            obfs: obfs.to_string(),
            obfs_param: String::new(),
        },
        timeouts: TimeoutsConfig::default(),
        metrics: Default::default(),
        logging: Default::default(),
    }
}

const INIT_PACKAGE: &[u8] = &[0x01, 1, 2, 3, 4, 0x1F, 0x90];

#[test]
fn test_plain_pipeline_against_simulated_server() {
    let env = ServerEnv::new(Arc::new(gateway_config("aes-128-ctr", "plain"))).unwrap();
    let mut pipeline = CipherPipeline::new(&env, INIT_PACKAGE).unwrap();

    // Egress decrypts on the server side.
    let wire = pipeline.encrypt(INIT_PACKAGE).unwrap();
    let server_env = CipherEnv::new(CipherMethod::Aes128Ctr, "pipeline-pw");
    let mut server_dec = DecryptCtx::new(&server_env);
    let plain = server_dec.decrypt(&wire).unwrap();
    assert_eq!(plain.as_slice(), INIT_PACKAGE);

    // Server response decrypts on our side, at awkward chunk boundaries.
    let mut server_enc = EncryptCtx::new(&server_env).unwrap();
    let response = server_enc.encrypt(b"HTTP/1.0 204 No Content\r\n\r\n");
    let mut collected = Vec::new();
    for chunk in response.chunks(5) {
        let (plain, feedback) = pipeline.decrypt(chunk).unwrap();
        assert!(feedback.is_none());
        collected.extend_from_slice(&plain);
    }
    assert_eq!(collected, b"HTTP/1.0 204 No Content\r\n\r\n");
}

#[test]
fn test_http_simple_pipeline_against_simulated_server() {
    let env = ServerEnv::new(Arc::new(gateway_config("aes-128-ctr", "http_simple"))).unwrap();
    let mut pipeline = CipherPipeline::new(&env, INIT_PACKAGE).unwrap();

    // The first egress packet is wrapped in a GET request; the encrypted
    // stream rides partly in the percent-encoded path.
    let wire = pipeline.encrypt(INIT_PACKAGE).unwrap();
    assert!(wire.starts_with(b"GET /%"));
    let header_end = wire
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("request header terminator")
        + 4;

    // Recover the percent-encoded lead bytes plus the trailing raw bytes.
    let text = std::str::from_utf8(&wire[..header_end]).unwrap();
    let path = text
        .strip_prefix("GET /")
        .unwrap()
        .split(" HTTP/1.1")
        .next()
        .unwrap();
    let mut stream_bytes: Vec<u8> = path
        .split('%')
        .filter(|piece| !piece.is_empty())
        .map(|piece| u8::from_str_radix(&piece[..2], 16).unwrap())
        .collect();
    stream_bytes.extend_from_slice(&wire[header_end..]);

    let server_env = CipherEnv::new(CipherMethod::Aes128Ctr, "pipeline-pw");
    let mut server_dec = DecryptCtx::new(&server_env);
    let plain = server_dec.decrypt(&stream_bytes).unwrap();
    assert_eq!(plain.as_slice(), INIT_PACKAGE);

    // Later packets are not wrapped again.
    let wire2 = pipeline.encrypt(b"follow-up").unwrap();
    assert!(!wire2.starts_with(b"GET /"));
    assert_eq!(server_dec.decrypt(&wire2).unwrap().as_slice(), b"follow-up");

    // Ingress strips the server's response header before decrypting.
    let mut server_enc = EncryptCtx::new(&server_env).unwrap();
    let mut response = b"HTTP/1.1 200 OK\r\nServer: nginx\r\n\r\n".to_vec();
    response.extend_from_slice(&server_enc.encrypt(b"tunneled reply"));

    let mut collected = Vec::new();
    for chunk in response.chunks(9) {
        let (plain, _) = pipeline.decrypt(chunk).unwrap();
        collected.extend_from_slice(&plain);
    }
    assert_eq!(collected, b"tunneled reply");
}

#[test]
fn test_auth_aes128_pipeline_wire_is_framed() {
    let env = ServerEnv::new(Arc::new(Config {
        server: RemoteConfig {
            protocol: "auth_aes128_md5".to_string(),
            protocol_param: "17:user-pw".to_string(),
            ..gateway_config("aes-128-ctr", "plain").server
        },
        ..gateway_config("aes-128-ctr", "plain")
    }))
    .unwrap();
    let mut pipeline = CipherPipeline::new(&env, INIT_PACKAGE).unwrap();

    // The auth frame inflates the initial package: IV plus at least the
    // 35-byte auth envelope.
    let wire = pipeline.encrypt(INIT_PACKAGE).unwrap();
    assert!(wire.len() >= 16 + 35 + INIT_PACKAGE.len());

    // A second chunk grows by at most IV-free framing overhead plus the
    // maximum padding budget.
    let wire2 = pipeline.encrypt(&[0x42; 600]).unwrap();
    assert!(wire2.len() > 600 + 8);
    assert!(wire2.len() <= 600 + 8 + 0x1FF + 1);
}
