//! # dmtp-server - Reference Server Entry Point
//!
//! Accepts DMTP client connections on a TCP port and drives one protocol
//! session per connection: identification capture, event decode and
//! acknowledgement, speak-freely arbitration, and optional file uploads
//! pushed at client initialization.
//!
//! ## Exit codes
//!
//! - `0`: normal termination
//! - `1`: usage error (bad arguments, unsupported port name)
//! - `2`: fatal transport error (cannot bind the listen port)

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use opendmtp::cli::Args;
use opendmtp::event::TemplateRegistry;
use opendmtp::logging::ColorizedFormatter;
use opendmtp::session::{ServerConfig, ServerHooks, ServerSession};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap renders its own message; usage problems exit 1
            use clap::error::ErrorKind;
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let _log_guard = match init_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logging setup failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let Some(port) = args.tcp_port() else {
        error!(
            "'{}' is not a TCP port; serial ports are served by an external bridge",
            args.port
        );
        return ExitCode::from(1);
    };

    match serve(port, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal transport error: {}", e);
            ExitCode::from(2)
        }
    }
}

/// Set up the layered tracing subscriber: a detailed file (or stderr) layer
/// plus the colorized stdout layer unless `--quiet`.
fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_layer;
    match args.log_file.as_deref() {
        Some("stderr") => {
            detailed_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed();
            guard = None;
        }
        Some(path_str) => {
            let path = std::path::Path::new(path_str);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("dmtp-server.log"));
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            detailed_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            guard = Some(file_guard);
        }
        None => {
            detailed_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(LevelFilter::WARN)
                .boxed();
            guard = None;
        }
    }

    let stdout_layer = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();
    Ok(guard)
}

/// Accept-and-serve loop. Each accepted connection gets its own session
/// task; templates learned from one client do not leak into another.
async fn serve(port: u16, args: &Args) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("dmtp-server {} listening on port {}", opendmtp::VERSION, port);

    let config = ServerConfig {
        keep_alive: args.keep_alive,
        client_speaks_first: args.client_speaks_first,
        speak_freely: args.speak_freely,
        speak_freely_max_events: args.max_events,
        ..Default::default()
    };

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("client connected: {}", peer);
        let config = config.clone();
        let args = args.clone();
        tokio::spawn(async move {
            let hooks = session_hooks();
            let mut session = ServerSession::new(stream, config, hooks)
                .with_registry(Arc::new(TemplateRegistry::new()));
            queue_client_files(&mut session, &args);
            match session.run().await {
                Ok(summary) => info!(
                    "client session ended: {} ({}/{}, {} events, {}B in / {}B out)",
                    peer,
                    summary.account_id,
                    summary.device_id,
                    summary.events_received,
                    summary.bytes_read,
                    summary.bytes_written,
                ),
                Err(e) => warn!("client session failed: {}: {}", peer, e),
            }
        });
    }
}

/// The reference hooks just log what arrives; a real service would persist
/// events and route property values here.
fn session_hooks() -> ServerHooks {
    ServerHooks {
        on_event: Some(Box::new(|pkt, ev| {
            let point = ev.gps_point[0];
            info!(
                "event {} status=0x{:04X} time={} lat={:.5} lon={:.5} speed={:.1}km/h seq=0x{:02X}",
                pkt.packet_type,
                ev.status_code,
                ev.timestamp[0],
                point.latitude,
                point.longitude,
                ev.speed_kph.max(0.0),
                ev.sequence,
            );
        })),
        on_property: Some(Box::new(|key, data| {
            info!(
                "property 0x{:04X} = 0x{}",
                key,
                opendmtp::codec::ascii::encode_hex(data)
            );
        })),
        on_diagnostic: Some(Box::new(|key, data| {
            info!(
                "diagnostic 0x{:04X} [{} bytes]",
                key,
                data.len()
            );
        })),
        on_error: Some(Box::new(|key, _| {
            warn!("client reported error 0x{:04X}", key);
        })),
        on_client_init: Some(Box::new(|| info!("client initialized"))),
        on_unique_id: None,
    }
}

/// Queue any configured upload/geozone files for delivery at client init.
fn queue_client_files<S>(session: &mut ServerSession<S>, args: &Args)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    if let Some(path) = &args.upload_file {
        let client_name = args
            .upload_name
            .clone()
            .or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "upload.dat".to_string());
        match std::fs::read(path) {
            Ok(data) => session.queue_upload(client_name, data),
            Err(e) => warn!("upload skipped, cannot read {}: {}", path.display(), e),
        }
    }

    if let Some(path) = &args.geozone_file {
        // geozone content is opaque here; it travels the upload channel and
        // the client's geozone loader interprets it
        match std::fs::read(path) {
            Ok(data) => session.queue_upload("geozone.dat", data),
            Err(e) => warn!("geozone upload skipped, cannot read {}: {}", path.display(), e),
        }
    }
}
