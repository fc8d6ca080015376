//! # Command-Line Interface Module
//!
//! Argument parsing for the `dmtp-server` reference binary, using the
//! `clap` derive API. One positional argument names the port to serve on;
//! flags select the session policy (keep-alive, who speaks first,
//! speak-freely) and optional files to push to connecting clients.
//!
//! ## Usage Examples
//!
//! ```bash
//! # listen on TCP port 31000, closing each session after its block
//! dmtp-server 31000
//!
//! # keep clients connected, let them speak freely, four events per block
//! dmtp-server 31000 --keep-alive --speak-freely --max-events 4
//!
//! # push a geozone file to every client that connects
//! dmtp-server 31000 --keep-alive --geozone-file zones.dat
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Replicate the classic two-color help styling.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "OpenDMTP reference server", styles = styles())]
pub struct Args {
    /// Port to serve on: a TCP port number. Serial port names belong to an
    /// external serial bridge and are rejected here.
    pub port: String,

    /// Keep client connections alive after their first block
    ///
    /// Without this flag each session ends with an EOT once the client has
    /// said everything it had queued.
    #[arg(short = 'k', long, help_heading = "Session Policy")]
    pub keep_alive: bool,

    /// Wait for the client to speak first instead of nudging it
    #[arg(long, help_heading = "Session Policy")]
    pub client_speaks_first: bool,

    /// Grant connecting clients speak-freely permission
    #[arg(long, help_heading = "Session Policy")]
    pub speak_freely: bool,

    /// Cap the events a speak-freely client may send per ack block
    #[arg(long, default_value_t = -1, help_heading = "Session Policy")]
    pub max_events: i32,

    /// Local file to upload to each client at session start
    #[arg(long, value_name = "FILE", help_heading = "Client Files")]
    pub upload_file: Option<PathBuf>,

    /// File name the client should store the upload under
    #[arg(long, value_name = "NAME", help_heading = "Client Files")]
    pub upload_name: Option<String>,

    /// Geozone file to push to each client through the upload channel
    #[arg(long, value_name = "FILE", help_heading = "Client Files")]
    pub geozone_file: Option<PathBuf>,

    /// Silence informational stdout output
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Log file path, or "stderr" for console-only logging
    #[arg(long, value_name = "FILE", help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

impl Args {
    /// Resolve the positional port argument to a TCP port number.
    pub fn tcp_port(&self) -> Option<u16> {
        self.port.parse::<u16>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_invocation() {
        let args = Args::parse_from(["dmtp-server", "31000"]);
        assert_eq!(args.tcp_port(), Some(31000));
        assert!(!args.keep_alive);
        assert_eq!(args.max_events, -1);
    }

    #[test]
    fn test_serial_port_name_is_not_tcp() {
        let args = Args::parse_from(["dmtp-server", "/dev/ttyS0"]);
        assert_eq!(args.tcp_port(), None);
    }

    #[test]
    fn test_policy_flags() {
        let args = Args::parse_from([
            "dmtp-server",
            "31000",
            "--keep-alive",
            "--speak-freely",
            "--max-events",
            "4",
            "-vv",
        ]);
        assert!(args.keep_alive);
        assert!(args.speak_freely);
        assert_eq!(args.max_events, 4);
        assert_eq!(args.verbose, 2);
    }
}
