//! Session engine tests over the in-memory network.
//!
//! These run under paused virtual time, so retransmission timeouts elapse
//! instantly and deterministically.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{MemoryTransport, Network, patterned};
use tftpx::packet::Packet;
use tftpx::session::{Role, Session};
use tftpx::transport::Transport;
use tftpx::{TftpError, TftpOptions};

/// Tight timeout so retransmission paths run fast under virtual time.
fn fast(block_size: usize) -> TftpOptions {
    TftpOptions {
        block_size,
        timeout: Duration::from_millis(100),
        ..TftpOptions::default()
    }
}

fn data_packet(block: u16, payload: &[u8]) -> Bytes {
    Packet::Data {
        block,
        payload: Bytes::copy_from_slice(payload),
    }
    .encode()
    .unwrap()
}

fn ack_packet(block: u16) -> Bytes {
    Packet::Ack { block }.encode().unwrap()
}

async fn expect_ack(transport: &MemoryTransport, block: u16) {
    let mut buf = vec![0u8; tftpx::MAX_PACKET_SIZE];
    let (n, _) = transport.recv(&mut buf).await.unwrap();
    match Packet::decode(&buf[..n]).unwrap() {
        Packet::Ack { block: acked } => assert_eq!(acked, block),
        other => panic!("expected ACK {block}, got {other:?}"),
    }
}

/// Writer and reader sessions wired together; returns (sent, received, data).
async fn run_transfer(net: &Network, payload: Vec<u8>, block_size: usize) -> (u64, u64, Vec<u8>) {
    let writer_end = net.endpoint();
    let reader_end = net.endpoint();
    let writer_addr = writer_end.addr();
    let reader_addr = reader_end.addr();

    let reader = tokio::spawn(async move {
        let mut session = Session::new(
            reader_end,
            writer_addr,
            Role::ServerWriter,
            fast(block_size),
        );
        let mut sink: Vec<u8> = Vec::new();
        let total = session
            .recv_blocks(&mut sink, ack_packet(0), None)
            .await
            .unwrap();
        (total, sink)
    });

    let mut session = Session::new(
        writer_end,
        reader_addr,
        Role::ServerReader,
        fast(block_size),
    );
    let mut source: &[u8] = &payload;
    let sent = session.send_blocks(&mut source).await.unwrap();
    let (received, data) = reader.await.unwrap();
    (sent, received, data)
}

fn data_payload_lens(net: &Network, from: std::net::SocketAddr) -> Vec<usize> {
    net.sent_from(from)
        .iter()
        .filter_map(|wire| match Packet::decode(wire).unwrap() {
            Packet::Data { payload, .. } => Some(payload.len()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn lockstep_transfer_delivers_all_bytes() {
    let net = Network::new();
    let payload = patterned(1500);
    let (sent, received, data) = run_transfer(&net, payload.clone(), 512).await;
    assert_eq!(sent, 1500);
    assert_eq!(received, 1500);
    assert_eq!(data, payload);

    // 1500 bytes at blksize 512 is exactly three blocks: 512, 512, 476,
    // acknowledged as 1, 2, 3
    let log = net.sent_log();
    let writer_addr = log[0].0;
    assert_eq!(data_payload_lens(&net, writer_addr), vec![512, 512, 476]);
    let reader_addr = log
        .iter()
        .find(|(src, _, _)| *src != writer_addr)
        .unwrap()
        .0;
    let acks: Vec<u16> = net
        .sent_from(reader_addr)
        .iter()
        .filter_map(|wire| match Packet::decode(wire).unwrap() {
            Packet::Ack { block } => Some(block),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn empty_stream_sends_single_empty_terminal_block() {
    let net = Network::new();
    let (sent, received, data) = run_transfer(&net, Vec::new(), 512).await;
    assert_eq!(sent, 0);
    assert_eq!(received, 0);
    assert!(data.is_empty());

    let log = net.sent_log();
    let writer_addr = log[0].0;
    assert_eq!(data_payload_lens(&net, writer_addr), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn exact_multiple_of_block_size_terminates_with_empty_block() {
    let net = Network::new();
    let payload = patterned(1024);
    let (sent, received, data) = run_transfer(&net, payload.clone(), 512).await;
    assert_eq!(sent, 1024);
    assert_eq!(received, 1024);
    assert_eq!(data, payload);

    // The terminal condition is a short block, so a 2-block payload needs a
    // third, empty DATA
    let log = net.sent_log();
    let writer_addr = log[0].0;
    assert_eq!(data_payload_lens(&net, writer_addr), vec![512, 512, 0]);
}

#[tokio::test(start_paused = true)]
async fn block_numbers_wrap_and_transfer_continues() {
    let net = Network::new();
    // 66_000 full blocks of 8 bytes runs the block counter past 65535
    let payload = patterned(8 * 66_000);
    let (sent, received, data) = run_transfer(&net, payload.clone(), 8).await;
    assert_eq!(sent, payload.len() as u64);
    assert_eq!(received, payload.len() as u64);
    assert_eq!(data, payload);
}

#[tokio::test(start_paused = true)]
async fn lost_ack_is_recovered_by_retransmission() {
    let net = Network::new();
    // Drop the first ACK{1} exactly once
    let mut dropped = false;
    net.set_filter(move |payload, _, _| {
        if !dropped
            && let Ok(Packet::Ack { block: 1 }) = Packet::decode(payload)
        {
            dropped = true;
            return false;
        }
        true
    });

    let payload = patterned(600);
    let (sent, received, data) = run_transfer(&net, payload.clone(), 512).await;
    assert_eq!(sent, 600);
    assert_eq!(received, 600);
    assert_eq!(data, payload);

    // The writer emitted DATA{1} twice and never pipelined: every DATA before
    // the first delivered ACK carries block 1
    let log = net.sent_log();
    let writer_addr = log[0].0;
    let blocks: Vec<u16> = net
        .sent_from(writer_addr)
        .iter()
        .filter_map(|wire| match Packet::decode(wire).unwrap() {
            Packet::Data { block, .. } => Some(block),
            _ => None,
        })
        .collect();
    assert_eq!(blocks, vec![1, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn writer_gives_up_after_retry_budget() {
    let net = Network::new();
    let writer_end = net.endpoint();
    let writer_addr = writer_end.addr();
    // Nothing is listening on the peer address; every DATA vanishes
    let peer_addr = "127.0.0.1:2000".parse().unwrap();

    let mut options = fast(512);
    options.retries = 2;
    let mut session = Session::new(writer_end, peer_addr, Role::ServerReader, options);
    let mut source: &[u8] = b"doomed";
    let err = session.send_blocks(&mut source).await.unwrap_err();
    assert!(matches!(err, TftpError::Timeout(_)));

    // One original transmission plus exactly `retries` retransmissions
    assert_eq!(data_payload_lens(&net, writer_addr).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn duplicate_data_is_reacked_but_not_reconsumed() {
    let net = Network::new();
    let peer = net.endpoint();
    let reader_end = net.endpoint();
    let peer_addr = peer.addr();
    let reader_addr = reader_end.addr();

    let reader = tokio::spawn(async move {
        let mut session = Session::new(reader_end, peer_addr, Role::ServerWriter, fast(512));
        let mut sink: Vec<u8> = Vec::new();
        let total = session
            .recv_blocks(&mut sink, ack_packet(0), None)
            .await
            .unwrap();
        (total, sink)
    });

    let first = patterned(512);
    let second = patterned(100);
    peer.send(reader_addr, &data_packet(1, &first)).await.unwrap();
    expect_ack(&peer, 1).await;
    // Redeliver block 1: the reader must repeat ACK{1} without a second
    // consumer call
    peer.send(reader_addr, &data_packet(1, &first)).await.unwrap();
    expect_ack(&peer, 1).await;
    peer.send(reader_addr, &data_packet(2, &second)).await.unwrap();
    expect_ack(&peer, 2).await;

    let (total, sink) = reader.await.unwrap();
    assert_eq!(total, 612);
    assert_eq!(sink, [first, second].concat());
}

#[tokio::test(start_paused = true)]
async fn stray_datagram_answered_with_error_5_without_disturbing_state() {
    let net = Network::new();
    let peer = net.endpoint();
    let stray = net.endpoint();
    let reader_end = net.endpoint();
    let peer_addr = peer.addr();
    let reader_addr = reader_end.addr();

    let reader = tokio::spawn(async move {
        let mut session = Session::new(reader_end, peer_addr, Role::ServerWriter, fast(512));
        let mut sink: Vec<u8> = Vec::new();
        let total = session
            .recv_blocks(&mut sink, ack_packet(0), None)
            .await
            .unwrap();
        (total, sink)
    });

    let first = patterned(512);
    let second = patterned(40);
    peer.send(reader_addr, &data_packet(1, &first)).await.unwrap();
    expect_ack(&peer, 1).await;

    // A datagram from a foreign TID must be answered with ERROR(5) and the
    // session must carry on as if nothing happened
    stray
        .send(reader_addr, &data_packet(7, b"intruder"))
        .await
        .unwrap();
    let mut buf = vec![0u8; tftpx::MAX_PACKET_SIZE];
    let (n, from) = stray.recv(&mut buf).await.unwrap();
    assert_eq!(from, reader_addr);
    match Packet::decode(&buf[..n]).unwrap() {
        Packet::Error { code, message } => {
            assert_eq!(code, 5);
            assert_eq!(message, "Unknown transfer ID");
        }
        other => panic!("expected ERROR(5), got {other:?}"),
    }

    peer.send(reader_addr, &data_packet(2, &second)).await.unwrap();
    expect_ack(&peer, 2).await;

    let (total, sink) = reader.await.unwrap();
    assert_eq!(total, 552);
    assert_eq!(sink, [first, second].concat());
}

#[tokio::test(start_paused = true)]
async fn peer_error_aborts_the_session() {
    let net = Network::new();
    let peer = net.endpoint();
    let reader_end = net.endpoint();
    let peer_addr = peer.addr();
    let reader_addr = reader_end.addr();

    let reader = tokio::spawn(async move {
        let mut session = Session::new(reader_end, peer_addr, Role::ServerWriter, fast(512));
        let mut sink: Vec<u8> = Vec::new();
        session.recv_blocks(&mut sink, ack_packet(0), None).await
    });

    peer.send(reader_addr, &data_packet(1, &patterned(512)))
        .await
        .unwrap();
    expect_ack(&peer, 1).await;
    let error = Packet::Error {
        code: 2,
        message: "Access violation".to_string(),
    }
    .encode()
    .unwrap();
    peer.send(reader_addr, &error).await.unwrap();

    match reader.await.unwrap() {
        Err(TftpError::Peer { code, message }) => {
            assert_eq!(code, 2);
            assert_eq!(message, "Access violation");
        }
        other => panic!("expected peer error, got {other:?}"),
    }

    // Nothing was sent after the ACK; an ERROR is never acknowledged
    assert_eq!(net.sent_from(reader_addr).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_acks_neither_advance_nor_retransmit() {
    let net = Network::new();
    let peer = net.endpoint();
    let writer_end = net.endpoint();
    let peer_addr = peer.addr();
    let writer_addr = writer_end.addr();

    let writer = tokio::spawn(async move {
        let mut session = Session::new(writer_end, peer_addr, Role::ServerReader, fast(512));
        let mut source: &[u8] = b"one hundred bytes would be overkill";
        session.send_blocks(&mut source).await
    });

    let mut buf = vec![0u8; tftpx::MAX_PACKET_SIZE];
    let (n, _) = peer.recv(&mut buf).await.unwrap();
    assert!(matches!(
        Packet::decode(&buf[..n]).unwrap(),
        Packet::Data { block: 1, .. }
    ));

    // A stale ACK{0} must be discarded silently, not answered with a
    // retransmission (the Sorcerer's Apprentice trap)
    peer.send(writer_addr, &ack_packet(0)).await.unwrap();
    peer.send(writer_addr, &ack_packet(1)).await.unwrap();

    let sent = writer.await.unwrap().unwrap();
    assert_eq!(sent, 35);
    assert_eq!(data_payload_lens(&net, writer_addr), vec![35]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_fires_at_the_receive_boundary() {
    use tokio_util::sync::CancellationToken;

    let net = Network::new();
    let peer = net.endpoint();
    let reader_end = net.endpoint();
    let peer_addr = peer.addr();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let reader = tokio::spawn(async move {
        let mut session =
            Session::new(reader_end, peer_addr, Role::ServerWriter, fast(512)).with_cancel(token);
        let mut sink: Vec<u8> = Vec::new();
        session.recv_blocks(&mut sink, ack_packet(0), None).await
    });

    cancel.cancel();
    assert!(matches!(
        reader.await.unwrap(),
        Err(TftpError::Cancelled)
    ));
}

#[tokio::test(start_paused = true)]
async fn consumer_rejection_sends_error_2_and_fails() {
    struct RefusingSink;
    impl tftpx::session::BlockSink for RefusingSink {
        async fn accept(&mut self, _block: &[u8]) -> tftpx::Result<()> {
            Err(TftpError::Rejected("disk quota exceeded".to_string()))
        }
    }

    let net = Network::new();
    let peer = net.endpoint();
    let reader_end = net.endpoint();
    let peer_addr = peer.addr();
    let reader_addr = reader_end.addr();

    let reader = tokio::spawn(async move {
        let mut session = Session::new(reader_end, peer_addr, Role::ServerWriter, fast(512));
        let mut sink = RefusingSink;
        session.recv_blocks(&mut sink, ack_packet(0), None).await
    });

    peer.send(reader_addr, &data_packet(1, b"payload")).await.unwrap();
    let mut buf = vec![0u8; tftpx::MAX_PACKET_SIZE];
    let (n, _) = peer.recv(&mut buf).await.unwrap();
    match Packet::decode(&buf[..n]).unwrap() {
        Packet::Error { code, message } => {
            assert_eq!(code, 2);
            assert_eq!(message, "Access violation");
        }
        other => panic!("expected ERROR(2), got {other:?}"),
    }
    assert!(matches!(reader.await.unwrap(), Err(TftpError::Rejected(_))));
}
