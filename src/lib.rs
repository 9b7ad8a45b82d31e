//! SecureGuard - WireGuard handshake engine
//!
//! The Noise IKpsk2 handshake of WireGuard as a synchronous, thread-safe
//! library: message codec, key derivation, per-peer handshake state, the
//! index table and the MAC1/MAC2 cookie layer. A completed handshake yields
//! a [`Keypair`] for the transport layer.
//!
//! # Usage
//!
//! ```no_run
//! use secureguard_handshake::{Device, HandshakeOutcome};
//! use secureguard_handshake::crypto::{PresharedKey, StaticPrivateKey};
//!
//! fn main() -> anyhow::Result<()> {
//!     let alice = Device::new(StaticPrivateKey::generate()?);
//!     let bob = Device::new(StaticPrivateKey::generate()?);
//!     let bob_at_alice = alice.add_peer(bob.public_key(), PresharedKey::default())?;
//!     bob.add_peer(alice.public_key(), PresharedKey::default())?;
//!
//!     let src = "192.0.2.1:51820".parse()?;
//!     let init = alice.create_initiation(&bob_at_alice)?;
//!     if let HandshakeOutcome::Response { response, .. } =
//!         bob.receive_handshake_packet(&init.to_bytes(), &src, false)?
//!     {
//!         alice.receive_handshake_packet(&response.to_bytes(), &src, false)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod protocol;

pub use config::DeviceConfig;
pub use device::{Device, HandshakeOutcome};
pub use error::SecureGuardError;
pub use protocol::{Keypair, Peer};
