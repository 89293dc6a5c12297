//! Frame relay between a capture node and a broadcast node.
//!
//! ```text
//!   capture supervisor ──► RelayServer consumer ══ TCP ══► RelayClient ──► broadcast supervisor
//!                     └──► LocalLink consumer ─── channel ──► LocalLink ──┘   (mode: both)
//! ```
//!
//! Records on the wire are `[u32 big-endian length][frame bytes]`. Both link
//! flavours are [`FrameSource`](frame_source::FrameSource)s, so the broadcast
//! supervisor drives them exactly like a camera: they connect when the first
//! viewer arrives and disconnect when the last one leaves.

mod client;
mod codec;
mod local;
mod server;

pub use client::RelayClient;
pub use local::LocalLink;
pub use server::RelayServer;
