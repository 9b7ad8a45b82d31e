//! SecureGuard handshake CLI
//!
//! Key generation, an in-memory handshake between two configured devices,
//! and a decoder for captured handshake messages.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use secureguard_handshake::config::parse_key;
use secureguard_handshake::crypto::{blake2s, StaticPrivateKey};
use secureguard_handshake::error::{ConfigError, HandshakeError, ProtocolError};
use secureguard_handshake::protocol::{
    get_message_type, MessageCookieReply, MessageInitiation, MessageResponse, MessageTransport,
    MessageType,
};
use secureguard_handshake::{Device, DeviceConfig, HandshakeOutcome, Keypair, SecureGuardError};

/// SecureGuard - WireGuard handshake engine
#[derive(Parser, Debug)]
#[command(name = "secureguard-handshake")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a private key and print it as base64
    Genkey,

    /// Read a base64 private key from stdin and print its public key
    Pubkey,

    /// Run a full handshake between two configured devices in memory
    Handshake {
        /// Configuration of the initiating device
        #[arg(short, long)]
        config: PathBuf,

        /// Configuration of the responding device
        #[arg(short, long)]
        peer_config: PathBuf,

        /// Make the responder demand a cookie before answering
        #[arg(long)]
        under_load: bool,
    },

    /// Decode a hex-encoded WireGuard message
    Inspect {
        /// Message bytes as hex
        hex: String,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            exit_code(&e)
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Genkey => {
            let key = StaticPrivateKey::generate()?;
            println!("{}", BASE64.encode(key.as_bytes()));
            Ok(())
        }
        Command::Pubkey => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read private key from stdin")?;
            let private = StaticPrivateKey::from(parse_key(input.trim(), "PrivateKey")?);
            println!("{}", BASE64.encode(private.public_key()));
            Ok(())
        }
        Command::Handshake {
            config,
            peer_config,
            under_load,
        } => run_handshake(&config, &peer_config, under_load),
        Command::Inspect { hex } => inspect(&hex),
    }
}

/// Drive initiation, optional cookie round, response and key split
fn run_handshake(config: &Path, peer_config: &Path, under_load: bool) -> anyhow::Result<()> {
    tracing::info!("Loading configuration from: {}", config.display());
    let initiator = Device::from_config(&DeviceConfig::from_file(config)?)?;
    tracing::info!("Loading configuration from: {}", peer_config.display());
    let responder = Device::from_config(&DeviceConfig::from_file(peer_config)?)?;

    let peer = initiator
        .lookup_peer(&responder.public_key())
        .with_context(|| {
            format!(
                "{} has no [Peer] entry for {}",
                config.display(),
                BASE64.encode(responder.public_key())
            )
        })?;

    // Both sides are in-process; the address only feeds the cookie binding
    let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 51820);

    let mut init = initiator.create_initiation(&peer)?;
    println!("initiation   {} bytes, sender {:08x}", MessageInitiation::SIZE, init.sender);

    let mut outcome = responder.receive_handshake_packet(&init.to_bytes(), &src, under_load)?;
    if let HandshakeOutcome::CookieReply(reply) = &outcome {
        println!("cookie reply {} bytes", MessageCookieReply::SIZE);
        initiator.receive_handshake_packet(&reply.to_bytes(), &src, false)?;
        init = initiator.create_initiation(&peer)?;
        println!(
            "initiation   {} bytes, sender {:08x} (with cookie)",
            MessageInitiation::SIZE,
            init.sender
        );
        outcome = responder.receive_handshake_packet(&init.to_bytes(), &src, under_load)?;
    }

    let HandshakeOutcome::Response {
        response,
        keypair: responder_keys,
        ..
    } = outcome
    else {
        bail!("Responder did not answer the initiation");
    };
    println!(
        "response     {} bytes, sender {:08x}, receiver {:08x}",
        MessageResponse::SIZE,
        response.sender,
        response.receiver
    );

    let HandshakeOutcome::Established {
        keypair: initiator_keys,
        ..
    } = initiator.receive_handshake_packet(&response.to_bytes(), &src, false)?
    else {
        bail!("Initiator did not complete the handshake");
    };

    print_keys("initiator", &initiator_keys);
    print_keys("responder", &responder_keys);

    if initiator_keys.send_key() != responder_keys.receive_key()
        || initiator_keys.receive_key() != responder_keys.send_key()
    {
        bail!("Derived transport keys do not match");
    }
    println!("transport keys match");
    Ok(())
}

/// Print short hashes of the transport keys, never the keys themselves
fn print_keys(role: &str, keypair: &Keypair) {
    println!(
        "{:<12} send {} receive {} (local {:08x}, remote {:08x})",
        role,
        hex::encode(&blake2s::hash(keypair.send_key())[..8]),
        hex::encode(&blake2s::hash(keypair.receive_key())[..8]),
        keypair.local_index,
        keypair.remote_index
    );
}

fn inspect(input: &str) -> anyhow::Result<()> {
    let data = hex::decode(input.trim()).context("Input is not valid hex")?;

    match get_message_type(&data).map_err(SecureGuardError::from)? {
        MessageType::HandshakeInitiation => {
            let msg = MessageInitiation::from_bytes(&data)?;
            println!("type       handshake initiation");
            println!("sender     {:08x}", msg.sender);
            println!("ephemeral  {}", hex::encode(msg.ephemeral));
            println!("mac1       {}", hex::encode(msg.mac1));
            println!("mac2       {}", hex::encode(msg.mac2));
        }
        MessageType::HandshakeResponse => {
            let msg = MessageResponse::from_bytes(&data)?;
            println!("type       handshake response");
            println!("sender     {:08x}", msg.sender);
            println!("receiver   {:08x}", msg.receiver);
            println!("ephemeral  {}", hex::encode(msg.ephemeral));
            println!("mac1       {}", hex::encode(msg.mac1));
            println!("mac2       {}", hex::encode(msg.mac2));
        }
        MessageType::CookieReply => {
            let msg = MessageCookieReply::from_bytes(&data)?;
            println!("type       cookie reply");
            println!("receiver   {:08x}", msg.receiver);
            println!("nonce      {}", hex::encode(msg.nonce));
        }
        MessageType::TransportData => {
            let (header, content) = MessageTransport::parse(&data)?;
            println!("type       transport data");
            println!("receiver   {:08x}", header.receiver);
            println!("counter    {}", header.counter);
            println!("content    {} bytes", content.len());
        }
    }

    Ok(())
}

/// Get user-friendly error message
fn user_message(error: &anyhow::Error) -> String {
    match error.downcast_ref::<SecureGuardError>() {
        Some(SecureGuardError::Config(ConfigError::FileNotFound { path })) => {
            format!("Configuration file not found: {}\n  \
                    Check the path and try again.", path)
        }

        Some(SecureGuardError::Config(ConfigError::InvalidKey { field })) => {
            format!("Invalid {} in configuration.\n  \
                    Expected 32-byte base64-encoded key.", field)
        }

        Some(SecureGuardError::Protocol(ProtocolError::MacVerificationFailed)) => {
            "MAC verification failed.\n  \
             The peer's public key may be incorrect.".to_string()
        }

        Some(SecureGuardError::Handshake(HandshakeError::UnknownPeer)) => {
            "The responder has no [Peer] entry for the initiator's public key.".to_string()
        }

        Some(SecureGuardError::Handshake(HandshakeError::AuthenticationFailure)) => {
            "Handshake authentication failed.\n  \
             Check that both sides use the same PresharedKey.".to_string()
        }

        _ => format!("{:#}", error),
    }
}

/// Get exit code for error
fn exit_code(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<SecureGuardError>() {
        Some(SecureGuardError::Config(_)) => ExitCode::from(1),
        Some(SecureGuardError::Protocol(_)) => ExitCode::from(4),
        Some(SecureGuardError::Crypto(_)) => ExitCode::from(5),
        Some(SecureGuardError::Handshake(_)) => ExitCode::from(6),
        None => match error.downcast_ref::<ConfigError>() {
            Some(_) => ExitCode::from(1),
            None => ExitCode::from(255),
        },
    }
}
