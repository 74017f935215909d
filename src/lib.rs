//! RTP/H.265 UDP ingest feeding a KMS overlay decoder, with optional MP4
//! recording.
//!
//! # Architecture
//!
//! A dedicated UDP receive thread filters datagrams by RTP payload type and
//! pushes them into a live `appsrc`. The streaming graph
//! (`queue → rtpjitterbuffer → rtph265depay → h265parse → capsfilter →
//! appsink`) turns the packets into byte-stream, AU-aligned H.265. A consumer
//! thread pulls access units from the `appsink` and hands each one to the
//! hardware decoder and, while recording is enabled, to the MP4 writer. A bus
//! thread watches for errors and end-of-stream, and a signal watcher turns
//! process signals into supervisor intents (exit, restart, recording on/off).
//!
//! Back-pressure never reaches the receive thread: the `appsrc` level gates
//! incoming datagrams, the head queue leaks its oldest buffers, and the
//! `appsink` drops its oldest access unit when full.

#![warn(missing_docs, unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown, clippy::missing_errors_doc, clippy::missing_panics_doc)]

pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod ingress;
pub mod instance;
pub mod logger;
pub mod pipeline;
pub mod signals;
pub mod video;
