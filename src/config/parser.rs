//! WireGuard configuration file parser
//!
//! Parses the key material of standard WireGuard `.conf` files. Only the
//! settings the handshake needs are kept; routing and endpoint keys such as
//! `Address`, `AllowedIPs` or `Endpoint` are accepted and skipped so stock
//! configs load unchanged.

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

use crate::crypto::x25519;
use crate::error::ConfigError;

/// Complete device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Clone)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: Zeroizing<[u8; 32]>,
    /// Listen port (optional)
    pub listen_port: Option<u16>,
}

impl fmt::Debug for InterfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceConfig")
            .field("private_key", &"<redacted>")
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

/// Peer configuration
#[derive(Clone)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<Zeroizing<[u8; 32]>>,
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("public_key", &BASE64.encode(self.public_key))
            .field("preshared_key", &self.preshared_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DeviceConfig {
    /// Parse a WireGuard configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a WireGuard configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(|| InterfaceConfig {
                        private_key: Zeroizing::new([0u8; 32]),
                        listen_port: None,
                    });

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = Zeroizing::new(parse_key(value, "PrivateKey")?);
                        }
                        "listenport" => {
                            iface.listen_port = Some(value.parse().map_err(|_| {
                                ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid ListenPort: {}", value),
                                }
                            })?);
                        }
                        _ => {
                            tracing::debug!("Ignoring interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(parse_key(value, "PublicKey")?);
                        }
                        "presharedkey" => {
                            peer.preshared_key =
                                Some(Zeroizing::new(parse_key(value, "PresharedKey")?));
                        }
                        _ => {
                            tracing::debug!("Ignoring peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;

        if x25519::is_zero(&interface.private_key[..]) {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }

        for (i, peer) in peers.iter().enumerate() {
            if peers[..i].iter().any(|p| p.public_key == peer.public_key) {
                return Err(ConfigError::DuplicatePeer {
                    public_key: BASE64.encode(peer.public_key),
                });
            }
        }

        Ok(DeviceConfig { interface, peers })
    }

    /// Get our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        x25519::public_key(&self.interface.private_key)
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// Builder for PeerConfig during parsing
#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<Zeroizing<[u8; 32]>>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
        })
    }
}

/// Parse a base64-encoded 32-byte key
pub fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = Zeroizing::new(BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?);

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
