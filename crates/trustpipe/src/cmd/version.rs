use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("trustpipe {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: trustpipe");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("TRUSTPIPE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "transport: {}",
        if cfg!(windows) {
            "named-pipe"
        } else {
            "unix-domain-socket"
        }
    );
    println!(
        "handshake: nonce_len={}, timeout={:?}",
        trustpipe_channel::NONCE_LEN,
        trustpipe_channel::DEFAULT_HANDSHAKE_TIMEOUT
    );

    Ok(SUCCESS)
}
