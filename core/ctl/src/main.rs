//! camstreamctl: command-line client for the camstream daemon.
//!
//! Every subcommand maps to one daemon method. Results are printed as JSON
//! on stdout; failures go to stderr with a non-zero exit code.

mod daemon_client;
mod logging;

use camstream_protocol::{
    DevicesResult, ListResult, Method, PingResult, SessionResult, ShutdownResult, StartParams,
    StartResult, StatusResult,
};
use clap::{Parser, Subcommand};
use daemon_client::{ClientError, DaemonClient};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::path::PathBuf;
use std::thread;

#[derive(Parser)]
#[command(name = "camstreamctl")]
#[command(about = "Control camera encoder sessions run by camstream-daemon")]
#[command(version)]
struct Cli {
    /// Daemon socket (defaults to $CAMSTREAM_SOCKET or ~/.camstream/daemon.sock)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch an encoder for a capture device
    Start {
        /// Human label for the session
        #[arg(long)]
        alias: String,

        /// Capture device path (e.g., /dev/video0)
        #[arg(long)]
        device: String,

        #[arg(long, default_value_t = 30)]
        frame_rate: u32,

        /// WIDTHxHEIGHT
        #[arg(long, default_value = "1280x720")]
        frame_size: String,

        #[arg(long, default_value = "mjpeg")]
        input_format: String,

        /// Output stream name (defaults to the alias)
        #[arg(long)]
        stream_name: Option<String>,

        /// Extra encoder arguments, passed after `--`
        #[arg(last = true, value_name = "ARGS")]
        extra_args: Vec<String>,
    },

    /// Stop a session's encoder
    Stop { id: String },

    /// Stop and relaunch a session with its stored settings
    Restart { id: String },

    /// List every known session
    List,

    /// Show one session and its status history
    Status { id: String },

    /// Print a session's log
    Logs {
        id: String,

        /// Number of trailing lines to print first
        #[arg(long, short = 'n')]
        tail: Option<usize>,

        /// Keep printing new lines until the session ends
        #[arg(long, short = 'f')]
        follow: bool,
    },

    /// Connect the terminal to a running encoder (Ctrl-D detaches)
    Attach { id: String },

    /// Check that the daemon is up
    Ping,

    /// Show which session holds each device
    Devices,

    /// Ask the daemon to exit
    Shutdown,
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    let client = match cli.socket {
        Some(path) => DaemonClient::new(path),
        None => match DaemonClient::from_env() {
            Ok(client) => client,
            Err(err) => {
                report(&err);
                std::process::exit(1);
            }
        },
    };

    if let Err(err) = run(&client, cli.command) {
        report(&err);
        std::process::exit(1);
    }
}

fn run(client: &DaemonClient, command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Start {
            alias,
            device,
            frame_rate,
            frame_size,
            input_format,
            stream_name,
            extra_args,
        } => {
            let params = StartParams {
                alias,
                device,
                frame_rate,
                frame_size,
                input_format,
                stream_name,
                extra_args,
            };
            let params = serde_json::to_value(params).map_err(ClientError::Encode)?;
            print_json(&client.call::<StartResult>(Method::Start, Some(params))?)
        }
        Commands::Stop { id } => {
            print_json(&client.call::<SessionResult>(Method::Stop, Some(id_params(&id)))?)
        }
        Commands::Restart { id } => {
            print_json(&client.call::<SessionResult>(Method::Restart, Some(id_params(&id)))?)
        }
        Commands::List => print_json(&client.call::<ListResult>(Method::List, None)?),
        Commands::Status { id } => {
            print_json(&client.call::<StatusResult>(Method::Status, Some(id_params(&id)))?)
        }
        Commands::Logs { id, tail, follow } => {
            let stdout = io::stdout();
            client.stream_logs(&id, tail, follow, |chunk| {
                let mut out = stdout.lock();
                for line in chunk.lines {
                    writeln!(out, "{}", line)?;
                }
                out.flush()
            })
        }
        Commands::Attach { id } => attach(client, &id),
        Commands::Ping => print_json(&client.call::<PingResult>(Method::Ping, None)?),
        Commands::Devices => print_json(&client.call::<DevicesResult>(Method::Devices, None)?),
        Commands::Shutdown => print_json(&client.call::<ShutdownResult>(Method::Shutdown, None)?),
    }
}

fn attach(client: &DaemonClient, id: &str) -> Result<(), ClientError> {
    let (attached, stream, leftover) = client.attach(id)?;
    eprintln!(
        "attached to {} (pid {}); Ctrl-D detaches",
        attached.id, attached.pid
    );

    let mut input = stream.try_clone()?;
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input.write_all(&buffer[..n]).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = input.shutdown(Shutdown::Write);
    });

    let mut stdout = io::stdout().lock();
    stdout.write_all(&leftover)?;
    stdout.flush()?;
    let mut output = stream;
    let mut buffer = [0u8; 4096];
    loop {
        let read = output.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        stdout.write_all(&buffer[..read])?;
        stdout.flush()?;
    }
    eprintln!("detached from {}", attached.id);
    Ok(())
}

fn id_params(id: &str) -> Value {
    json!({ "id": id })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ClientError> {
    let rendered = serde_json::to_string_pretty(value).map_err(ClientError::Encode)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", rendered)?;
    Ok(())
}

fn report(err: &ClientError) {
    eprintln!("camstreamctl: {}", err);
    if let ClientError::Daemon(info) = err {
        let tail = info
            .data
            .as_ref()
            .and_then(|data| data.get("log_tail"))
            .and_then(Value::as_array);
        if let Some(lines) = tail.filter(|lines| !lines.is_empty()) {
            eprintln!("last encoder output:");
            for line in lines.iter().filter_map(Value::as_str) {
                eprintln!("  {}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_collects_extra_args_after_separator() {
        let cli = Cli::try_parse_from([
            "camstreamctl",
            "start",
            "--alias",
            "front",
            "--device",
            "/dev/video0",
            "--frame-size",
            "1920x1080",
            "--",
            "-b:v",
            "4000k",
        ])
        .expect("parse");

        match cli.command {
            Commands::Start {
                alias,
                frame_rate,
                frame_size,
                extra_args,
                ..
            } => {
                assert_eq!(alias, "front");
                assert_eq!(frame_rate, 30);
                assert_eq!(frame_size, "1920x1080");
                assert_eq!(extra_args, vec!["-b:v", "4000k"]);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn logs_flags_and_global_socket() {
        let cli = Cli::try_parse_from([
            "camstreamctl",
            "logs",
            "ses-1",
            "-n",
            "20",
            "--follow",
            "--socket",
            "/tmp/d.sock",
        ])
        .expect("parse");

        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/d.sock")));
        match cli.command {
            Commands::Logs { id, tail, follow } => {
                assert_eq!(id, "ses-1");
                assert_eq!(tail, Some(20));
                assert!(follow);
            }
            _ => panic!("expected logs"),
        }
    }

    #[test]
    fn session_commands_require_an_id() {
        assert!(Cli::try_parse_from(["camstreamctl", "stop"]).is_err());
        assert!(Cli::try_parse_from(["camstreamctl", "attach"]).is_err());
    }
}
