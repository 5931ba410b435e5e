//! Capture and replay for a multiplexed text/binary byte stream.
//!
//! This crate provides the core types and logic used by the `stream-capture`
//! recorder binary and the `replay` validator:
//!
//! - `demux`: resumable scanner that splits the stream into text frames
//!   (`$...;`) and length-prefixed binary frames (`0xAA`/`0xBB`), with
//!   truncation and resync handling
//! - `sequencer`: one arrival-index counter shared by both message kinds
//! - `sink`/`store`/`record`: raw log, message tables and binary payload
//!   store written with CRC-framed records
//! - `session`: the live reader loop with stop command and drain timeout
//! - `replay`: re-scans the raw log and diffs it against the tables
//!
//! The binaries in this repository (`src/main.rs` and `src/bin/replay.rs`)
//! wire these modules to a TCP connection and a capture directory.
pub mod assemble;
pub mod demux;
pub mod error;
pub mod message;
pub mod record;
pub mod replay;
pub mod sequencer;
pub mod session;
pub mod sink;
pub mod store;
