use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod keygen;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a demo service answering requests from canned responses.
    Serve(ServeArgs),
    /// Connect, establish trust, send one request and print the reply.
    Send(SendArgs),
    /// Generate a key pair for the trust challenge.
    Keygen(KeygenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args)),
        Command::Send(args) => block_on(send::run(args, format)),
        Command::Keygen(args) => keygen::run(args),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F: std::future::Future<Output = CliResult<i32>>>(future: F) -> CliResult<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("failed to start runtime: {err}")))?;
    runtime.block_on(future)
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Pipe name (or socket path on Unix) to listen on.
    pub name: String,
    /// PKCS#8 PEM private key used to answer trust challenges.
    #[arg(long, value_name = "PEM", env = "TRUSTPIPE_PRIVATE_KEY")]
    pub private_key: Option<PathBuf>,
    /// JSON file with canned handler responses.
    #[arg(long, value_name = "FILE")]
    pub responses: Option<PathBuf>,
    /// Socket file mode in octal (Unix only, e.g. 600).
    #[arg(long, value_name = "MODE")]
    pub socket_mode: Option<String>,
}

/// How the client judges the service process before any message flows.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Assume {
    /// Check the peer's OS credentials against `--expected-uid`.
    #[default]
    Check,
    /// Treat the peer as verified.
    Valid,
    /// Treat the check as impossible and run the key challenge.
    Indeterminate,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Pipe name (or socket path on Unix) to connect to.
    pub name: String,
    /// Request type, e.g. GetLaunchArguments.
    #[arg(long = "type", short = 't', value_name = "TYPE")]
    pub request_type: String,
    /// Request argument as KEY=VALUE (repeatable, order preserved).
    #[arg(long = "arg", short = 'a', value_name = "KEY=VALUE", value_parser = parse_argument)]
    pub args: Vec<(String, String)>,
    /// SPKI PEM public key of the service, for the trust challenge.
    #[arg(long, value_name = "PEM", env = "TRUSTPIPE_PUBLIC_KEY")]
    pub public_key: Option<PathBuf>,
    /// Peer trust policy.
    #[arg(long, value_enum, default_value_t = Assume::Check)]
    pub assume: Assume,
    /// Expected uid of the service process when checking credentials.
    #[arg(long, value_name = "UID", default_value_t = 0)]
    pub expected_uid: u32,
    /// Time allowed to reach the service (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
    /// Time allowed for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Directory to write private.pem and public.pem into.
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,
    /// RSA modulus size in bits.
    #[arg(long, default_value_t = 2048)]
    pub bits: usize,
    /// Overwrite existing key files.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_argument(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {input:?}")),
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}
