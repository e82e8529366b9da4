//! # Skiff Files
//!
//! File-backed streams and resource handlers for skiff transfers.
//!
//! This crate provides:
//! - [`FileReader`] / [`FileWriter`]: seekable file streams for client transfers
//! - [`FileHandler`]: a server resource backed by a file, supporting resume
//! - BLAKE3 hashing of files for end-to-end verification

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handler;
pub mod hasher;
pub mod stream;

pub use handler::FileHandler;
pub use hasher::{hash_file, hash_file_prefix};
pub use stream::{FileReader, FileWriter, io_status};
