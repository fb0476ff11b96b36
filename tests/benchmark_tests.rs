//! Performance benchmarks for the hot paths of the session layer

use server::admin::parse;
use server::registry::{next_connection_id, NewSession, SessionHandle, SessionRegistry};
use shared::{FrameDecoder, Packet, PacketCodec, Role, ServerIdentity, SessionKey, TransportKind};
use std::net::SocketAddr;
use std::time::Instant;

/// Client and server codecs sharing one session key, negotiated the same
/// way a real connection does it.
fn codec_pair() -> (PacketCodec, PacketCodec) {
    let identity = ServerIdentity::generate();
    let key = SessionKey::generate();
    let envelope = key.seal(&identity.public_key()).unwrap();
    let opened = identity.open(&envelope).unwrap();
    (
        PacketCodec::new(key, Role::Client),
        PacketCodec::new(opened, Role::Server),
    )
}

/// Benchmarks encrypting and decrypting chat packets
#[test]
fn benchmark_packet_codec() {
    let (mut client, mut server) = codec_pair();
    let packet = Packet::Chat {
        message: "The quick brown fox jumps over the lazy dog".into(),
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = client.encode(&packet).unwrap();
        // Skip the length prefix, as the frame decoder would.
        let decoded = server.decode(&frame[4..]).unwrap();
        assert_eq!(decoded.code(), packet.code());
    }

    let duration = start.elapsed();
    println!(
        "Packet codec: {} round trips in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds even in debug builds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks reassembling frames from small, unaligned chunks
#[test]
fn benchmark_frame_reassembly() {
    let (mut client, _server) = codec_pair();
    let mut stream = Vec::new();
    let frames = 2_000;
    for i in 0..frames {
        stream.extend(client.encode(&Packet::Heartbeat { timestamp: i }).unwrap());
    }

    let start = Instant::now();
    let mut decoder = FrameDecoder::new();
    let mut recovered = 0;

    for chunk in stream.chunks(7) {
        decoder.extend(chunk);
        while decoder.next_frame().unwrap().is_some() {
            recovered += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Frame reassembly: {} frames from {} bytes in {:?}",
        recovered,
        stream.len(),
        duration
    );

    assert_eq!(recovered, frames);
    assert!(!decoder.has_partial());
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks the asymmetric half of the handshake
#[test]
fn benchmark_key_exchange() {
    let identity = ServerIdentity::generate();
    let public_key = identity.public_key();

    let iterations = 500;
    let start = Instant::now();

    for _ in 0..iterations {
        let key = SessionKey::generate();
        let envelope = key.seal(&public_key).unwrap();
        let opened = identity.open(&envelope).unwrap();
        assert_eq!(opened.fingerprint(), key.fingerprint());
    }

    let duration = start.elapsed();
    println!(
        "Key exchange: {} seal/open pairs in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 10);
}

/// Benchmarks slot allocation and broadcast fan-out on a full registry
#[test]
fn benchmark_registry_broadcast() {
    let capacity = 1_000;
    let registry = SessionRegistry::new(capacity);
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

    let start = Instant::now();
    let mut mailboxes = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        let (handle, mailbox) = SessionHandle::new();
        registry
            .allocate(NewSession {
                connection_id: next_connection_id(),
                kind: TransportKind::Stream,
                addr,
                key_fingerprint: String::new(),
                handle,
            })
            .unwrap();
        mailboxes.push(mailbox);
    }
    let allocated = start.elapsed();

    let rounds = 50;
    let packet = Packet::GlobalMessage {
        message: "Server restarting soon".into(),
    };
    let start = Instant::now();
    for _ in 0..rounds {
        assert_eq!(registry.broadcast(&packet, None), capacity);
    }
    let broadcast = start.elapsed();

    println!(
        "Registry: {} allocations in {:?}, {} broadcasts to {} sessions in {:?}",
        capacity, allocated, rounds, capacity, broadcast
    );

    assert_eq!(registry.len(), capacity);
    assert!(allocated.as_millis() < 1000);
    assert!(broadcast.as_secs() < 5);
}

/// Benchmarks console command parsing
#[test]
fn benchmark_command_parsing() {
    let lines = [
        "ban Alice 60 true griefing in the town square",
        "mute Bob 15 false spam",
        "announcement Restart in five minutes",
        "kick Carol",
        "poweracc dave 3",
    ];

    let iterations = 20_000;
    let start = Instant::now();

    for i in 0..iterations {
        assert!(parse(lines[i % lines.len()]).is_ok());
    }

    let duration = start.elapsed();
    println!(
        "Command parsing: {} lines in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}
