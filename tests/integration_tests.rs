//! End-to-end transfer tests over a simulated channel.
//!
//! A client engine and a server engine exchange encoded chunks through
//! [`SimulatedLink`], which can drop chunks and advances a simulated clock,
//! so loss and timeout scenarios run deterministically.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skiff_core::{
    BufferHandler, ChunkType, Event, MemoryReader, MemoryWriter, ProtocolVersion, SharedBuffer, Status,
    ThreadConfig, TransferConfig, TransferState, shared,
};
use skiff_integration_tests::{Direction, SimulatedLink, fast_config, pattern};
use std::sync::{Arc, Mutex};

const MAX_STEPS: usize = 100_000;

fn legacy_config() -> TransferConfig {
    TransferConfig {
        protocol_version: ProtocolVersion::Legacy,
        ..fast_config()
    }
}

// ============================================================================
// Handshake and Basic Transfers
// ============================================================================

#[test]
fn test_read_32_bytes() {
    let data = pattern(32);
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(3, data.clone())));

    let buffer = SharedBuffer::new();
    let (_, outcome) = link.read(3, 1, MemoryWriter::new(buffer.clone()), fast_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    link.run(MAX_STEPS);

    assert_eq!(buffer.contents(), data);
    assert_eq!(outcome.count(), 1);
    assert_eq!(
        link.chunk_types(Direction::ToServer),
        vec![ChunkType::Start, ChunkType::StartAckConfirmation, ChunkType::Completion]
    );
    assert_eq!(
        link.chunk_types(Direction::ToClient),
        vec![ChunkType::StartAck, ChunkType::Data, ChunkType::CompletionAck]
    );
    assert_eq!(link.client.active_transfers(), 0);
}

#[test]
fn test_write_64_kib() {
    let data = pattern(64 * 1024);
    let mut link = SimulatedLink::new(fast_config());
    let buffer = SharedBuffer::new();
    link.add_handler(shared(BufferHandler::write_only(5, buffer.clone())));

    let (_, outcome) = link.write(5, 9, MemoryReader::new(data.clone()), fast_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);
}

#[test]
fn test_empty_resource() {
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(4, Vec::new())));

    let buffer = SharedBuffer::new();
    let (_, outcome) = link.read(4, 2, MemoryWriter::new(buffer.clone()), fast_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert!(buffer.is_empty());
}

#[test]
fn test_concurrent_transfers() {
    let mut link = SimulatedLink::new(fast_config());
    let mut expected = Vec::new();
    for resource in 1..=3u32 {
        let data = pattern(3000 * resource as usize);
        link.add_handler(shared(BufferHandler::read_only(resource, data.clone())));
        let buffer = SharedBuffer::new();
        let (_, outcome) = link.read(
            resource,
            resource + 100,
            MemoryWriter::new(buffer.clone()),
            fast_config(),
            0,
        );
        expected.push((data, buffer, outcome));
    }

    link.run(MAX_STEPS);

    for (data, buffer, outcome) in expected {
        assert_eq!(outcome.status(), Some(Status::Ok));
        assert_eq!(buffer.contents(), data);
    }
}

// ============================================================================
// Flow Control
// ============================================================================

#[test]
fn test_data_stays_within_window() {
    let data = pattern(4096);
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(6, data.clone())));

    let config = TransferConfig {
        max_window_size_bytes: 256,
        max_chunk_size_bytes: 64,
        ..fast_config()
    };
    let buffer = SharedBuffer::new();
    let (_, outcome) = link.read(6, 3, MemoryWriter::new(buffer.clone()), config, 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);

    let mut window_end = 0;
    let mut data_chunks = 0;
    for (direction, chunk) in &link.log {
        match direction {
            Direction::ToServer => {
                if let Some(end) = chunk.window_end_offset() {
                    window_end = window_end.max(end);
                }
            }
            Direction::ToClient if chunk.chunk_type() == ChunkType::Data => {
                data_chunks += 1;
                assert!(chunk.payload().len() <= 64);
                assert!(chunk.offset() + chunk.payload().len() as u64 <= window_end);
            }
            Direction::ToClient => {}
        }
    }
    assert!(data_chunks >= 4096 / 64);
}

#[test]
fn test_writer_capacity_limits_window() {
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(7, pattern(1000))));

    let buffer = SharedBuffer::new();
    let (_, outcome) = link.read(
        7,
        4,
        MemoryWriter::with_capacity_limit(buffer.clone(), 100),
        fast_config(),
        0,
    );

    assert_eq!(
        link.run_until_complete(&outcome, MAX_STEPS),
        Some(Status::ResourceExhausted)
    );
    assert_eq!(buffer.len(), 100);
}

// ============================================================================
// Loss and Recovery
// ============================================================================

#[test]
fn test_lost_data_chunk_is_retransmitted() {
    let data = pattern(8 * 1024);
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(8, data.clone())));

    let mut dropped = false;
    link.drop_when(move |direction, chunk| {
        let hit = !dropped
            && direction == Direction::ToClient
            && chunk.chunk_type() == ChunkType::Data
            && chunk.offset() == 2048;
        dropped |= hit;
        hit
    });

    let buffer = SharedBuffer::new();
    let (_, outcome) = link.read(8, 5, MemoryWriter::new(buffer.clone()), fast_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);
    assert!(link.log.iter().any(|(direction, chunk)| {
        *direction == Direction::ToServer
            && chunk.chunk_type() == ChunkType::ParametersRetransmit
            && chunk.offset() == 2048
    }));
}

#[test]
fn test_random_loss_both_directions() {
    let config = TransferConfig {
        max_retries: 10,
        max_lifetime_retries: 10_000,
        ..fast_config()
    };

    for (seed, write) in [(1u64, false), (2, true), (3, false), (4, true)] {
        let data = pattern(32 * 1024);
        let mut link = SimulatedLink::new(config);
        let buffer = SharedBuffer::new();

        let mut rng = StdRng::seed_from_u64(seed);
        link.drop_when(move |_, _| rng.gen_bool(0.1));

        let outcome = if write {
            link.add_handler(shared(BufferHandler::write_only(10, buffer.clone())));
            link.write(10, 20, MemoryReader::new(data.clone()), config, 0).1
        } else {
            link.add_handler(shared(BufferHandler::read_only(10, data.clone())));
            link.read(10, 20, MemoryWriter::new(buffer.clone()), config, 0).1
        };

        assert_eq!(
            link.run_until_complete(&outcome, MAX_STEPS),
            Some(Status::Ok),
            "seed {seed}"
        );
        assert_eq!(buffer.contents(), data, "seed {seed}");
    }
}

#[test]
fn test_unresponsive_server_times_out() {
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(11, pattern(100))));
    link.drop_when(|direction, _| direction == Direction::ToClient);

    let started = link.now;
    let (handle, outcome) = link.read(11, 6, MemoryWriter::new(SharedBuffer::new()), fast_config(), 0);

    assert_eq!(
        link.run_until_complete(&outcome, MAX_STEPS),
        Some(Status::DeadlineExceeded)
    );
    let starts = link
        .chunk_types(Direction::ToServer)
        .into_iter()
        .filter(|t| *t == ChunkType::Start)
        .count();
    assert!(starts >= 2, "start was retried ({starts} sent)");
    assert!(link.now - started >= fast_config().initial_chunk_timeout());
    assert_eq!(link.client.client_transfer_state(handle), Some(TransferState::Completed));
}

// ============================================================================
// Legacy Interoperability
// ============================================================================

#[test]
fn test_legacy_client_reads_from_current_server() {
    let data = pattern(5000);
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(12, data.clone())));

    let buffer = SharedBuffer::new();
    let (_, outcome) = link.read(12, 12, MemoryWriter::new(buffer.clone()), legacy_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);
    assert!(link.log.iter().all(|(_, chunk)| chunk.is_legacy()));
}

#[test]
fn test_sequential_legacy_reads_of_same_resource() {
    let data = pattern(4000);
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(12, data.clone())));

    let first_buffer = SharedBuffer::new();
    let (_, first) = link.read(12, 12, MemoryWriter::new(first_buffer.clone()), legacy_config(), 0);
    assert_eq!(link.run_until_complete(&first, MAX_STEPS), Some(Status::Ok));
    link.run(MAX_STEPS);

    let second_buffer = SharedBuffer::new();
    let (_, second) = link.read(12, 12, MemoryWriter::new(second_buffer.clone()), legacy_config(), 0);
    assert_eq!(link.run_until_complete(&second, MAX_STEPS), Some(Status::Ok));

    assert_eq!(first_buffer.contents(), data);
    assert_eq!(second_buffer.contents(), data);
    assert_eq!(first.count(), 1);
}

#[test]
fn test_overlapping_legacy_reads_abort_the_older() {
    let data = pattern(4000);
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(12, data.clone())));

    let (_, first) = link.read(12, 12, MemoryWriter::new(SharedBuffer::new()), legacy_config(), 0);
    let buffer = SharedBuffer::new();
    let (_, second) = link.read(12, 12, MemoryWriter::new(buffer.clone()), legacy_config(), 0);
    assert_eq!(first.status(), Some(Status::Aborted));

    assert_eq!(link.run_until_complete(&second, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);
    assert_eq!(first.count(), 1);
}

#[test]
fn test_legacy_client_writes_to_current_server() {
    let data = pattern(5000);
    let mut link = SimulatedLink::new(fast_config());
    let buffer = SharedBuffer::new();
    link.add_handler(shared(BufferHandler::write_only(13, buffer.clone())));

    let (_, outcome) = link.write(13, 13, MemoryReader::new(data.clone()), legacy_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);
}

#[test]
fn test_current_client_falls_back_to_legacy_server() {
    let data = pattern(3000);
    let mut link = SimulatedLink::new(legacy_config());
    let buffer = SharedBuffer::new();
    link.add_handler(shared(BufferHandler::write_only(14, buffer.clone())));

    let (_, outcome) = link.write(14, 300, MemoryReader::new(data.clone()), fast_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);
    // Only the opening start chunk uses the current protocol.
    let current: Vec<_> = link
        .log
        .iter()
        .filter(|(_, chunk)| !chunk.is_legacy())
        .map(|(_, chunk)| chunk.chunk_type())
        .collect();
    assert!(current.iter().all(|t| *t == ChunkType::Start));
}

// ============================================================================
// Resumption
// ============================================================================

#[test]
fn test_resume_read_from_offset() {
    let data = pattern(1000);
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(15, data.clone())));

    let buffer = SharedBuffer::new();
    let (_, outcome) = link.read(15, 7, MemoryWriter::new(buffer.clone()), fast_config(), 100);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), &data[100..]);
    let first_data = link
        .log
        .iter()
        .find(|(_, chunk)| chunk.chunk_type() == ChunkType::Data)
        .map(|(_, chunk)| chunk.offset());
    assert_eq!(first_data, Some(100));
}

#[test]
fn test_resume_write_keeps_prefix() {
    let data = pattern(2000);
    let mut link = SimulatedLink::new(fast_config());
    let buffer = SharedBuffer::new();
    link.add_handler(shared(BufferHandler::write_only(16, buffer.clone())));

    // First attempt stores only the prefix.
    let (_, first) = link.write(16, 8, MemoryReader::new(data[..500].to_vec()), fast_config(), 0);
    assert_eq!(link.run_until_complete(&first, MAX_STEPS), Some(Status::Ok));
    link.run(MAX_STEPS);

    let (_, second) = link.write(16, 9, MemoryReader::new(data.clone()), fast_config(), 500);
    assert_eq!(link.run_until_complete(&second, MAX_STEPS), Some(Status::Ok));
    assert_eq!(buffer.contents(), data);
}

#[test]
fn test_legacy_resume_unimplemented() {
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(17, pattern(100))));

    let (_, outcome) = link.read(17, 17, MemoryWriter::new(SharedBuffer::new()), legacy_config(), 10);

    assert_eq!(
        link.run_until_complete(&outcome, MAX_STEPS),
        Some(Status::Unimplemented)
    );
}

// ============================================================================
// Server-Side Failures
// ============================================================================

#[test]
fn test_missing_handler_not_found() {
    let mut link = SimulatedLink::new(fast_config());
    let (_, outcome) = link.read(99, 10, MemoryWriter::new(SharedBuffer::new()), fast_config(), 0);

    assert_eq!(link.run_until_complete(&outcome, MAX_STEPS), Some(Status::NotFound));
}

#[test]
fn test_permission_denied() {
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(18, pattern(10))));

    let (_, outcome) = link.write(18, 11, MemoryReader::new(pattern(10)), fast_config(), 0);

    assert_eq!(
        link.run_until_complete(&outcome, MAX_STEPS),
        Some(Status::PermissionDenied)
    );
}

#[test]
fn test_server_pool_exhausted() {
    let server = ThreadConfig {
        server_capacity: 1,
        ..ThreadConfig::default()
    };
    let mut link = SimulatedLink::with_thread_config(ThreadConfig::default(), server, fast_config());
    link.add_handler(shared(BufferHandler::read_only(19, pattern(4000))));
    link.add_handler(shared(BufferHandler::read_only(20, pattern(4000))));

    let (_, first) = link.read(19, 12, MemoryWriter::new(SharedBuffer::new()), fast_config(), 0);
    let (_, second) = link.read(20, 13, MemoryWriter::new(SharedBuffer::new()), fast_config(), 0);

    link.run(MAX_STEPS);
    assert_eq!(first.status(), Some(Status::Ok));
    assert_eq!(second.status(), Some(Status::ResourceExhausted));
}

#[test]
fn test_removed_handler_aborts_server_side() {
    let mut link = SimulatedLink::new(fast_config());
    let handler = Arc::new(Mutex::new(BufferHandler::read_only(21, pattern(64 * 1024))));
    link.add_handler(handler.clone());

    let (_, outcome) = link.read(21, 14, MemoryWriter::new(SharedBuffer::new()), fast_config(), 0);
    link.deliver_pending();
    link.deliver_pending();

    let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
    link.server.handle_event(
        Event::RemoveTransferHandler {
            resource_id: 21,
            ack: ack_tx,
        },
        link.now,
    );
    assert!(ack_rx.try_recv().is_ok());
    assert_eq!(handler.lock().unwrap().last_status(), Some(Status::Aborted));

    // The server forgot the session, so the client eventually gives up.
    assert_eq!(
        link.run_until_complete(&outcome, MAX_STEPS),
        Some(Status::DeadlineExceeded)
    );
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_cancel_notifies_server() {
    let mut link = SimulatedLink::new(fast_config());
    let handler = Arc::new(Mutex::new(BufferHandler::read_only(22, pattern(64 * 1024))));
    link.add_handler(handler.clone());

    let (handle, outcome) = link.read(22, 15, MemoryWriter::new(SharedBuffer::new()), fast_config(), 0);
    link.deliver_pending();
    link.deliver_pending();

    link.client.handle_event(
        Event::EndClientTransfer {
            handle_id: handle,
            status: Status::Cancelled,
            send_status_chunk: true,
        },
        link.now,
    );
    assert_eq!(outcome.status(), Some(Status::Cancelled));

    link.run(MAX_STEPS);
    assert_eq!(outcome.count(), 1);
    assert_eq!(handler.lock().unwrap().last_status(), Some(Status::Cancelled));
    assert!(link.chunk_types(Direction::ToClient).contains(&ChunkType::CompletionAck));
}

#[test]
fn test_silent_end_sends_nothing() {
    let mut link = SimulatedLink::new(fast_config());
    link.add_handler(shared(BufferHandler::read_only(23, pattern(64 * 1024))));

    let (handle, outcome) = link.read(23, 16, MemoryWriter::new(SharedBuffer::new()), fast_config(), 0);
    link.deliver_pending();
    link.deliver_pending();
    let sent_before = link.chunk_types(Direction::ToServer).len();

    link.client.handle_event(
        Event::EndClientTransfer {
            handle_id: handle,
            status: Status::Aborted,
            send_status_chunk: false,
        },
        link.now,
    );
    assert_eq!(outcome.status(), Some(Status::Aborted));

    link.deliver_pending();
    assert!(
        !link.chunk_types(Direction::ToServer)[sent_before..].contains(&ChunkType::Completion)
    );
}
