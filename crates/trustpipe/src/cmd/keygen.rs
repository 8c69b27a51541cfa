use std::fs;
use std::path::Path;

use trustpipe_channel::StaticKeySource;

use crate::cmd::KeygenArgs;
use crate::exit::{channel_error, io_error, CliError, CliResult, SUCCESS, USAGE};

pub const PRIVATE_KEY_FILE: &str = "private.pem";
pub const PUBLIC_KEY_FILE: &str = "public.pem";

const MIN_BITS: usize = 1024;

pub fn run(args: KeygenArgs) -> CliResult<i32> {
    if args.bits < MIN_BITS {
        return Err(CliError::new(
            USAGE,
            format!("--bits must be at least {MIN_BITS}"),
        ));
    }

    let private_path = args.out.join(PRIVATE_KEY_FILE);
    let public_path = args.out.join(PUBLIC_KEY_FILE);
    if !args.force {
        for path in [&private_path, &public_path] {
            if path.exists() {
                return Err(CliError::new(
                    USAGE,
                    format!("{} exists (use --force to overwrite)", path.display()),
                ));
            }
        }
    }

    fs::create_dir_all(&args.out).map_err(|err| {
        io_error(&format!("failed creating {}", args.out.display()), err)
    })?;

    tracing::info!(bits = args.bits, "generating key pair");
    let keys = StaticKeySource::generate(args.bits)
        .map_err(|err| channel_error("key generation failed", err))?;
    let private_pem = keys
        .private_pem()
        .map_err(|err| channel_error("key encoding failed", err))?;
    let public_pem = keys
        .public_pem()
        .map_err(|err| channel_error("key encoding failed", err))?;

    write_private(&private_path, private_pem.as_bytes())?;
    fs::write(&public_path, public_pem.as_bytes()).map_err(|err| {
        io_error(&format!("failed writing {}", public_path.display()), err)
    })?;

    println!("{}", private_path.display());
    println!("{}", public_path.display());
    Ok(SUCCESS)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> CliResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let context = || format!("failed writing {}", path.display());
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| io_error(&context(), err))?;
    file.write_all(contents)
        .map_err(|err| io_error(&context(), err))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> CliResult<()> {
    fs::write(path, contents)
        .map_err(|err| io_error(&format!("failed writing {}", path.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_tiny_keys() {
        let err = run(KeygenArgs {
            out: std::env::temp_dir(),
            bits: 512,
            force: false,
        })
        .unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = std::env::temp_dir().join(format!("trustpipe-keygen-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PRIVATE_KEY_FILE), b"existing").unwrap();

        let err = run(KeygenArgs {
            out: dir.clone(),
            bits: 1024,
            force: false,
        })
        .unwrap_err();
        assert_eq!(err.code, USAGE);
        assert_eq!(fs::read(dir.join(PRIVATE_KEY_FILE)).unwrap(), b"existing");
        let _ = fs::remove_dir_all(&dir);
    }
}
